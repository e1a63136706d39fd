//! Remote platform contracts and their Bsale / Shopify implementations.
//!
//! The sweep and the order flow only see the traits below; the concrete
//! clients translate them into Bsale REST and Shopify Admin GraphQL/REST calls.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use skusync_core::{CatalogPage, CommerceVariant, DocumentRequest, IssuedDocument};
use skusync_http::{FetchError, FetchedResponse, HttpFetcher, Method};
use thiserror::Error;

pub const CRATE_NAME: &str = "skusync-adapters";

/// Page size of the variant search query; only the first candidate is ever used.
const VARIANT_SEARCH_FIRST: usize = 50;

const BSALE_VARIANT_FIELDS: &str = "[id,code,barCode,description,product]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Bsale,
    Shopify,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Bsale => "bsale",
            Platform::Shopify => "shopify",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{platform} unavailable: {message}")]
    UpstreamUnavailable { platform: Platform, message: String },
    #[error("{platform} rejected the update: {message}")]
    ValidationRejected { platform: Platform, message: String },
}

impl RemoteError {
    pub fn upstream(platform: Platform, message: impl Into<String>) -> Self {
        RemoteError::UpstreamUnavailable {
            platform,
            message: message.into(),
        }
    }

    pub fn rejected(platform: Platform, message: impl Into<String>) -> Self {
        RemoteError::ValidationRejected {
            platform,
            message: message.into(),
        }
    }

    fn from_fetch(platform: Platform, context: &str, err: FetchError) -> Self {
        Self::upstream(platform, format!("{context}: {err}"))
    }
}

/// Pages through the accounting catalog.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<CatalogPage, RemoteError>;
}

/// Exact-match variant lookups against the commerce platform, candidates in remote order.
#[async_trait]
pub trait VariantLookup: Send + Sync {
    async fn find_by_primary(&self, sku: &str) -> Result<Vec<CommerceVariant>, RemoteError>;
    async fn find_by_secondary(&self, barcode: &str) -> Result<Vec<CommerceVariant>, RemoteError>;
}

#[async_trait]
pub trait VariantWriter: Send + Sync {
    async fn update_primary_identifier(
        &self,
        variant_id: &str,
        new_value: &str,
    ) -> Result<CommerceVariant, RemoteError>;
}

#[async_trait]
pub trait DocumentIssuer: Send + Sync {
    async fn issue_document(&self, request: &DocumentRequest) -> Result<IssuedDocument, RemoteError>;
}

#[async_trait]
pub trait OrderNoteWriter: Send + Sync {
    async fn save_order_note(&self, order_id: u64, note: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
pub struct BsaleConfig {
    pub api_base: String,
    pub access_token: String,
}

/// Bsale REST client: variant catalog reads and document issuance.
#[derive(Debug, Clone)]
pub struct BsaleClient {
    http: HttpFetcher,
    api_base: String,
    access_token: String,
}

impl BsaleClient {
    pub fn new(http: HttpFetcher, config: BsaleConfig) -> Self {
        Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            access_token: config.access_token,
        }
    }

    pub fn variants_url(&self, offset: usize, limit: usize) -> String {
        format!(
            "{}/variants.json?limit={limit}&offset={offset}&fields={BSALE_VARIANT_FIELDS}",
            self.api_base
        )
    }

    pub fn documents_url(&self) -> String {
        format!("{}/documents.json", self.api_base)
    }

    fn headers(&self) -> [(&str, &str); 1] {
        [("access_token", self.access_token.as_str())]
    }
}

#[async_trait]
impl CatalogReader for BsaleClient {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<CatalogPage, RemoteError> {
        let url = self.variants_url(offset, limit.max(1));
        let resp = self
            .http
            .get(Platform::Bsale.as_str(), &url, &self.headers())
            .await
            .map_err(|err| RemoteError::from_fetch(Platform::Bsale, "fetching variants", err))?;
        resp.json::<CatalogPage>()
            .map_err(|err| RemoteError::from_fetch(Platform::Bsale, "fetching variants", err))
    }
}

#[async_trait]
impl DocumentIssuer for BsaleClient {
    async fn issue_document(&self, request: &DocumentRequest) -> Result<IssuedDocument, RemoteError> {
        let resp = self
            .http
            .send_json(
                Platform::Bsale.as_str(),
                Method::POST,
                &self.documents_url(),
                &self.headers(),
                request,
            )
            .await
            .map_err(|err| {
                if let FetchError::HttpStatus { status, body, .. } = &err {
                    tracing::error!(status, body = %body, "bsale rejected document");
                }
                RemoteError::from_fetch(Platform::Bsale, "creating document", err)
            })?;
        resp.json::<IssuedDocument>()
            .map_err(|err| RemoteError::from_fetch(Platform::Bsale, "creating document", err))
    }
}

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub shop: String,
    pub access_token: String,
    pub api_version: String,
}

/// Shopify Admin API client: variant search/update over GraphQL, order notes over REST.
#[derive(Debug, Clone)]
pub struct ShopifyAdminClient {
    http: HttpFetcher,
    config: ShopifyConfig,
}

const VARIANT_SEARCH_QUERY: &str = r#"
query($q: String!, $first: Int!) {
  productVariants(first: $first, query: $q) {
    edges { node { id sku barcode product { id title } } }
  }
}"#;

const VARIANT_SKU_UPDATE_MUTATION: &str = r#"
mutation($id: ID!, $sku: String!) {
  productVariantUpdate(input: {id: $id, sku: $sku}) {
    productVariant { id sku }
    userErrors { field message }
  }
}"#;

impl ShopifyAdminClient {
    pub fn new(http: HttpFetcher, config: ShopifyConfig) -> Self {
        Self { http, config }
    }

    pub fn graphql_url(&self) -> String {
        format!(
            "https://{}/admin/api/{}/graphql.json",
            self.config.shop, self.config.api_version
        )
    }

    pub fn order_url(&self, order_id: u64) -> String {
        format!(
            "https://{}/admin/api/{}/orders/{order_id}.json",
            self.config.shop, self.config.api_version
        )
    }

    fn headers(&self) -> [(&str, &str); 1] {
        [("X-Shopify-Access-Token", self.config.access_token.as_str())]
    }

    async fn graphql(&self, query: &str, variables: JsonValue) -> Result<FetchedResponse, RemoteError> {
        self.http
            .send_json(
                Platform::Shopify.as_str(),
                Method::POST,
                &self.graphql_url(),
                &self.headers(),
                &json!({ "query": query, "variables": variables }),
            )
            .await
            .map_err(|err| RemoteError::from_fetch(Platform::Shopify, "graphql request", err))
    }

    async fn search_variants(&self, field: &str, value: &str) -> Result<Vec<CommerceVariant>, RemoteError> {
        let variables = json!({
            "q": variant_search_query(field, value),
            "first": VARIANT_SEARCH_FIRST,
        });
        let resp = self.graphql(VARIANT_SEARCH_QUERY, variables).await?;
        parse_variant_search(&resp.body)
    }
}

#[async_trait]
impl VariantLookup for ShopifyAdminClient {
    async fn find_by_primary(&self, sku: &str) -> Result<Vec<CommerceVariant>, RemoteError> {
        self.search_variants("sku", sku).await
    }

    async fn find_by_secondary(&self, barcode: &str) -> Result<Vec<CommerceVariant>, RemoteError> {
        self.search_variants("barcode", barcode).await
    }
}

#[async_trait]
impl VariantWriter for ShopifyAdminClient {
    async fn update_primary_identifier(
        &self,
        variant_id: &str,
        new_value: &str,
    ) -> Result<CommerceVariant, RemoteError> {
        if new_value.trim().is_empty() {
            return Err(RemoteError::rejected(Platform::Shopify, "sku must not be empty"));
        }
        let variables = json!({ "id": variant_id, "sku": new_value });
        let resp = self.graphql(VARIANT_SKU_UPDATE_MUTATION, variables).await?;
        parse_variant_update(&resp.body)
    }
}

#[async_trait]
impl OrderNoteWriter for ShopifyAdminClient {
    async fn save_order_note(&self, order_id: u64, note: &str) -> Result<(), RemoteError> {
        self.http
            .send_json(
                Platform::Shopify.as_str(),
                Method::PUT,
                &self.order_url(order_id),
                &self.headers(),
                &json!({ "order": { "id": order_id, "note": note } }),
            )
            .await
            .map_err(|err| RemoteError::from_fetch(Platform::Shopify, "saving order note", err))?;
        Ok(())
    }
}

/// Shopify search syntax for an exact field match, e.g. `sku:"AB-1"`.
pub fn variant_search_query(field: &str, value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""));
    format!("{field}:{quoted}")
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantSearchData {
    product_variants: Connection<CommerceVariant>,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantUpdateData {
    product_variant_update: VariantUpdatePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariantUpdatePayload {
    #[serde(default)]
    product_variant: Option<CommerceVariant>,
    #[serde(default)]
    user_errors: Vec<UserError>,
}

#[derive(Debug, Deserialize)]
struct UserError {
    #[serde(default)]
    #[allow(dead_code)]
    field: Option<Vec<String>>,
    message: String,
}

fn decode_graphql<T: DeserializeOwned>(body: &[u8]) -> Result<T, RemoteError> {
    let envelope: GraphqlResponse<T> = serde_json::from_slice(body).map_err(|err| {
        RemoteError::upstream(Platform::Shopify, format!("decoding graphql response: {err}"))
    })?;
    if let Some(errors) = envelope.errors.filter(|e| !e.is_null()) {
        return Err(RemoteError::upstream(Platform::Shopify, errors.to_string()));
    }
    envelope
        .data
        .ok_or_else(|| RemoteError::upstream(Platform::Shopify, "graphql response carried no data"))
}

pub fn parse_variant_search(body: &[u8]) -> Result<Vec<CommerceVariant>, RemoteError> {
    let data: VariantSearchData = decode_graphql(body)?;
    Ok(data
        .product_variants
        .edges
        .into_iter()
        .map(|edge| edge.node)
        .collect())
}

pub fn parse_variant_update(body: &[u8]) -> Result<CommerceVariant, RemoteError> {
    let data: VariantUpdateData = decode_graphql(body)?;
    let payload = data.product_variant_update;
    if !payload.user_errors.is_empty() {
        let message = payload
            .user_errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RemoteError::rejected(Platform::Shopify, message));
    }
    payload
        .product_variant
        .ok_or_else(|| RemoteError::upstream(Platform::Shopify, "variant update returned no variant"))
}
