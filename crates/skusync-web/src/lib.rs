//! Axum HTTP surface: health check, on-demand SKU sweep and the paid-order webhook.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use skusync_adapters::{BsaleClient, ShopifyAdminClient};
use skusync_http::HttpFetcher;
use skusync_orders::{
    DocumentTypeIds, OrderEventHandler, OrderOutcome, WebhookRejection, WebhookVerifier,
    SIGNATURE_HEADER,
};
use skusync_sync::{
    maybe_build_scheduler, MissingConfig, SweepOutcome, SweepRunner, SyncConfig, TriggerKind,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "skusync-web";

#[derive(Clone)]
pub struct AppState {
    pub sweep: Arc<SweepRunner>,
    /// Absent credentials make the webhook answer 503 instead of failing startup.
    pub orders: Result<Arc<OrderEventHandler>, MissingConfig>,
}

impl AppState {
    pub fn new(
        sweep: Arc<SweepRunner>,
        orders: Result<Arc<OrderEventHandler>, MissingConfig>,
    ) -> Self {
        Self { sweep, orders }
    }
}

pub fn order_handler_from_config(
    config: &SyncConfig,
    http: &HttpFetcher,
) -> Result<Arc<OrderEventHandler>, MissingConfig> {
    let credentials = config.order_credentials()?;
    let bsale = Arc::new(BsaleClient::new(http.clone(), credentials.bsale));
    let shopify = Arc::new(ShopifyAdminClient::new(http.clone(), credentials.shopify));
    let handler = OrderEventHandler::new(WebhookVerifier::new(credentials.webhook_secret), bsale, shopify)
        .with_signature_enforcement(config.enforce_webhook_signature)
        .with_document_types(DocumentTypeIds {
            invoice: config.invoice_document_type_id,
            receipt: config.receipt_document_type_id,
        });
    Ok(Arc::new(handler))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/sync/skus", post(sync_skus_handler))
        .route("/webhooks/orders-paid", post(orders_paid_handler))
        .with_state(Arc::new(state))
}

/// Starts the scheduler (when enabled) and serves until Ctrl-C.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let sweep = Arc::new(SweepRunner::from_config(&config, &http));
    if !sweep.is_configured() {
        warn!("catalog credentials missing; sweeps will be skipped");
    }

    let orders = order_handler_from_config(&config, &http);
    if let Err(missing) = &orders {
        warn!(missing = missing.key, "order webhook disabled");
    }

    let mut scheduler = maybe_build_scheduler(&config, sweep.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sweep scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "skusync listening");

    axum::serve(listener, app(AppState::new(sweep, orders)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for ctrl-c");
        return;
    }
    info!("shutdown signal received");
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn sync_skus_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.sweep.trigger(TriggerKind::OnDemand).await {
        Ok(SweepOutcome::Completed(result)) => Json(json!({
            "processed": result.processed,
            "updated": result.updated,
        }))
        .into_response(),
        Ok(SweepOutcome::Skipped { reason }) => {
            Json(json!({ "skipped": true, "reason": reason })).into_response()
        }
        Ok(SweepOutcome::AlreadyRunning) => {
            ApiError::new(StatusCode::CONFLICT, "a sweep is already running").into_response()
        }
        Err(err) => {
            error!(
                error = %err,
                processed = err.processed,
                updated = err.updated,
                "on-demand sweep failed"
            );
            ApiError::new(StatusCode::BAD_GATEWAY, err.source.to_string()).into_response()
        }
    }
}

async fn orders_paid_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let handler = match &state.orders {
        Ok(handler) => handler,
        Err(missing) => {
            warn!(missing = missing.key, "order webhook received without order credentials");
            return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, missing.to_string()).into_response();
        }
    };
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match handler.handle(&body, signature).await {
        Ok(OrderOutcome::Issued { .. }) | Ok(OrderOutcome::IssueFailed { .. }) => {
            (StatusCode::OK, "OK").into_response()
        }
        Err(WebhookRejection::InvalidSignature) => {
            ApiError::new(StatusCode::UNAUTHORIZED, "invalid webhook signature").into_response()
        }
        Err(err @ WebhookRejection::MalformedPayload(_)) => {
            warn!(error = %err, "order webhook body rejected");
            ApiError::new(StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use skusync_adapters::{
        CatalogReader, DocumentIssuer, OrderNoteWriter, Platform, RemoteError, VariantLookup,
        VariantWriter,
    };
    use skusync_core::{
        CatalogPage, CatalogRecord, CommerceVariant, DocumentRequest, IssuedDocument,
    };
    use skusync_sync::ReconciliationSweep;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const SECRET: &str = "shpss_test";

    /// In-memory stand-in for both platforms.
    #[derive(Default)]
    struct FakeShop {
        catalog: Vec<CatalogRecord>,
        variants: Vec<CommerceVariant>,
        reject_writes: bool,
        fail_documents: bool,
        gate: Option<(Notify, Notify)>,
        documents: Mutex<Vec<DocumentRequest>>,
        notes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CatalogReader for FakeShop {
        async fn fetch_page(&self, offset: usize, limit: usize) -> Result<CatalogPage, RemoteError> {
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(CatalogPage {
                items: self.catalog.iter().skip(offset).take(limit).cloned().collect(),
                count: self.catalog.len(),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl VariantLookup for FakeShop {
        async fn find_by_primary(&self, sku: &str) -> Result<Vec<CommerceVariant>, RemoteError> {
            Ok(self.variants.iter().filter(|v| v.has_sku(sku)).cloned().collect())
        }

        async fn find_by_secondary(&self, barcode: &str) -> Result<Vec<CommerceVariant>, RemoteError> {
            Ok(self
                .variants
                .iter()
                .filter(|v| v.barcode.as_deref() == Some(barcode))
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl VariantWriter for FakeShop {
        async fn update_primary_identifier(
            &self,
            variant_id: &str,
            new_value: &str,
        ) -> Result<CommerceVariant, RemoteError> {
            if self.reject_writes {
                return Err(RemoteError::rejected(Platform::Shopify, "SKU has already been taken"));
            }
            Ok(CommerceVariant {
                id: variant_id.to_string(),
                sku: Some(new_value.to_string()),
                barcode: None,
                product: None,
            })
        }
    }

    #[async_trait]
    impl DocumentIssuer for FakeShop {
        async fn issue_document(&self, request: &DocumentRequest) -> Result<IssuedDocument, RemoteError> {
            self.documents.lock().unwrap().push(request.clone());
            if self.fail_documents {
                return Err(RemoteError::upstream(Platform::Bsale, "http status 500"));
            }
            Ok(IssuedDocument {
                id: Some(555),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl OrderNoteWriter for FakeShop {
        async fn save_order_note(&self, _order_id: u64, note: &str) -> Result<(), RemoteError> {
            self.notes.lock().unwrap().push(note.to_string());
            Ok(())
        }
    }

    fn shop_with_barcode_match() -> FakeShop {
        FakeShop {
            catalog: vec![
                CatalogRecord {
                    code: Some("TZ-350".into()),
                    bar_code: Some("7800000000101".into()),
                    ..Default::default()
                },
                CatalogRecord::default(),
            ],
            variants: vec![CommerceVariant {
                id: "gid://shopify/ProductVariant/1".into(),
                sku: Some("OLD".into()),
                barcode: Some("7800000000101".into()),
                product: None,
            }],
            ..Default::default()
        }
    }

    fn state(shop: Arc<FakeShop>) -> AppState {
        let sweep = ReconciliationSweep::new(shop.clone(), shop.clone(), shop.clone());
        let orders = OrderEventHandler::new(WebhookVerifier::new(SECRET), shop.clone(), shop);
        AppState::new(Arc::new(SweepRunner::new(sweep)), Ok(Arc::new(orders)))
    }

    fn unconfigured_state() -> AppState {
        AppState::new(
            Arc::new(SweepRunner::unconfigured(MissingConfig { key: "SHOPIFY_SHOP" })),
            Err(MissingConfig { key: "SHOPIFY_WEBHOOK_SECRET" }),
        )
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    fn webhook(body: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/webhooks/orders-paid");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_vec())).unwrap()
    }

    fn signed(body: &[u8]) -> Option<String> {
        WebhookVerifier::new(SECRET).sign(body)
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    const ORDER: &[u8] = br##"{"id":42,"name":"#1001","line_items":[{"quantity":1,"price":"1000","title":"Mug","sku":"A1"}]}"##;

    #[tokio::test]
    async fn health_check_answers_ok() {
        let resp = app(unconfigured_state())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn sync_reports_counters() {
        let resp = app(state(Arc::new(shop_with_barcode_match())))
            .oneshot(post("/sync/skus"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({ "processed": 2, "updated": 1 }));
    }

    #[tokio::test]
    async fn sync_without_credentials_is_skipped() {
        let resp = app(unconfigured_state()).oneshot(post("/sync/skus")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["skipped"], true);
        assert!(body["reason"].as_str().unwrap().contains("SHOPIFY_SHOP"));
    }

    #[tokio::test]
    async fn failed_sweep_maps_to_bad_gateway() {
        let shop = FakeShop {
            reject_writes: true,
            ..shop_with_barcode_match()
        };
        let resp = app(state(Arc::new(shop))).oneshot(post("/sync/skus")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("already been taken"));
    }

    #[tokio::test]
    async fn concurrent_sync_is_refused() {
        let shop = Arc::new(FakeShop {
            gate: Some((Notify::new(), Notify::new())),
            ..Default::default()
        });
        let router = app(state(shop.clone()));

        let first = tokio::spawn(router.clone().oneshot(post("/sync/skus")));
        let (entered, release) = shop.gate.as_ref().unwrap();
        entered.notified().await;

        let second = router.oneshot(post("/sync/skus")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn signed_webhook_issues_document() {
        let shop = Arc::new(FakeShop::default());
        let resp = app(state(shop.clone()))
            .oneshot(webhook(ORDER, signed(ORDER)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(shop.documents.lock().unwrap()[0].reference, "Shopify #1001");
        assert_eq!(shop.notes.lock().unwrap().clone(), vec!["Bsale OK: ID 555".to_string()]);
    }

    #[tokio::test]
    async fn unsigned_webhook_is_unauthorized() {
        let shop = Arc::new(FakeShop::default());
        let resp = app(state(shop.clone())).oneshot(webhook(ORDER, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(shop.documents.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_webhook_is_bad_request() {
        let body = b"[1,2";
        let resp = app(state(Arc::new(FakeShop::default())))
            .oneshot(webhook(body, signed(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn issuance_failure_still_answers_ok() {
        let shop = Arc::new(FakeShop {
            fail_documents: true,
            ..Default::default()
        });
        let resp = app(state(shop.clone()))
            .oneshot(webhook(ORDER, signed(ORDER)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(shop.notes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn webhook_without_credentials_is_unavailable() {
        let resp = app(unconfigured_state())
            .oneshot(webhook(ORDER, Some("x".into())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
