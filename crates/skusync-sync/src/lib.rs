//! SKU reconciliation sweep: Bsale catalog → Shopify variant SKUs.
//!
//! The sweep pages through the accounting catalog, resolves each record to a
//! commerce variant (SKU first, barcode as fallback, first candidate wins) and
//! writes the SKU back only when it differs. Any remote failure aborts the
//! whole sweep. [`SweepRunner`] is the trigger surface shared by the HTTP
//! endpoint, the cron job and the CLI; it allows one sweep in flight at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use skusync_adapters::{
    BsaleClient, BsaleConfig, CatalogReader, RemoteError, ShopifyAdminClient, ShopifyConfig,
    VariantLookup, VariantWriter,
};
use skusync_core::{CatalogRecord, CommerceVariant, SweepResult, DEFAULT_PAGE_SIZE};
use skusync_http::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "skusync-sync";

pub const DEFAULT_SYNC_CRON: &str = "0 */2 * * * *";
pub const DEFAULT_SHOPIFY_API_VERSION: &str = "2025-07";
pub const DEFAULT_BSALE_API_BASE: &str = "https://api.bsale.cl/v1";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub shopify_shop: Option<String>,
    pub shopify_token: Option<String>,
    pub shopify_webhook_secret: Option<String>,
    pub shopify_api_version: String,
    pub bsale_token: Option<String>,
    pub bsale_api_base: String,
    pub page_size: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub user_agent: String,
    pub enforce_webhook_signature: bool,
    pub invoice_document_type_id: u32,
    pub receipt_document_type_id: u32,
    pub port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; blank values count as absent.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(default)
        };

        Self {
            shopify_shop: get("SHOPIFY_SHOP"),
            shopify_token: get("SHOPIFY_TOKEN"),
            shopify_webhook_secret: get("SHOPIFY_WEBHOOK_SECRET"),
            shopify_api_version: get("SHOPIFY_API_VERSION")
                .unwrap_or_else(|| DEFAULT_SHOPIFY_API_VERSION.to_string()),
            bsale_token: get("BSALE_TOKEN"),
            bsale_api_base: get("BSALE_API_BASE").unwrap_or_else(|| DEFAULT_BSALE_API_BASE.to_string()),
            page_size: get("SKUSYNC_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            scheduler_enabled: flag("SKUSYNC_SCHEDULER_ENABLED", true),
            sync_cron: get("SKUSYNC_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            http_timeout_secs: get("SKUSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u64| *n > 0)
                .unwrap_or(20),
            http_max_retries: get("SKUSYNC_HTTP_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            user_agent: get("SKUSYNC_USER_AGENT").unwrap_or_else(|| "skusync/0.1".to_string()),
            enforce_webhook_signature: flag("SKUSYNC_ENFORCE_WEBHOOK_SIGNATURE", true),
            invoice_document_type_id: get("BSALE_INVOICE_DOCUMENT_TYPE_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(33),
            receipt_document_type_id: get("BSALE_RECEIPT_DOCUMENT_TYPE_ID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(39),
            port: get("PORT").and_then(|v| v.parse().ok()).unwrap_or(10000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }

    pub fn catalog_credentials(&self) -> Result<CatalogCredentials, MissingConfig> {
        Ok(CatalogCredentials {
            shopify: self.shopify_config()?,
            bsale: self.bsale_config()?,
        })
    }

    pub fn order_credentials(&self) -> Result<OrderCredentials, MissingConfig> {
        let shopify = self.shopify_config()?;
        let bsale = self.bsale_config()?;
        let webhook_secret = required(&self.shopify_webhook_secret, "SHOPIFY_WEBHOOK_SECRET")?;
        Ok(OrderCredentials {
            shopify,
            bsale,
            webhook_secret,
        })
    }

    fn shopify_config(&self) -> Result<ShopifyConfig, MissingConfig> {
        Ok(ShopifyConfig {
            shop: required(&self.shopify_shop, "SHOPIFY_SHOP")?,
            access_token: required(&self.shopify_token, "SHOPIFY_TOKEN")?,
            api_version: self.shopify_api_version.clone(),
        })
    }

    fn bsale_config(&self) -> Result<BsaleConfig, MissingConfig> {
        Ok(BsaleConfig {
            api_base: self.bsale_api_base.clone(),
            access_token: required(&self.bsale_token, "BSALE_TOKEN")?,
        })
    }
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, MissingConfig> {
    value.clone().ok_or(MissingConfig { key })
}

/// A required credential or endpoint is absent; triggers skip instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing configuration: {key}")]
pub struct MissingConfig {
    pub key: &'static str,
}

#[derive(Debug, Clone)]
pub struct CatalogCredentials {
    pub bsale: BsaleConfig,
    pub shopify: ShopifyConfig,
}

#[derive(Debug, Clone)]
pub struct OrderCredentials {
    pub bsale: BsaleConfig,
    pub shopify: ShopifyConfig,
    pub webhook_secret: String,
}

/// Abort error of one sweep. The counters are the progress made strictly before
/// the failure and are only reported for diagnostics.
#[derive(Debug, Error)]
#[error("sweep aborted after {processed} records ({updated} updated): {source}")]
pub struct SweepError {
    #[source]
    pub source: RemoteError,
    pub processed: usize,
    pub updated: usize,
}

impl SweepError {
    fn at(source: RemoteError, progress: SweepResult) -> Self {
        Self {
            source,
            processed: progress.processed,
            updated: progress.updated,
        }
    }
}

pub struct ReconciliationSweep {
    reader: Arc<dyn CatalogReader>,
    lookup: Arc<dyn VariantLookup>,
    writer: Arc<dyn VariantWriter>,
    page_size: usize,
}

impl ReconciliationSweep {
    pub fn new(
        reader: Arc<dyn CatalogReader>,
        lookup: Arc<dyn VariantLookup>,
        writer: Arc<dyn VariantWriter>,
    ) -> Self {
        Self {
            reader,
            lookup,
            writer,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn from_credentials(http: HttpFetcher, credentials: CatalogCredentials) -> Self {
        let bsale = Arc::new(BsaleClient::new(http.clone(), credentials.bsale));
        let shopify = Arc::new(ShopifyAdminClient::new(http, credentials.shopify));
        Self::new(bsale, shopify.clone(), shopify)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// One full pass over the catalog, starting at offset 0.
    ///
    /// Termination uses the `count` reported by the latest page; an empty page
    /// always ends the sweep even if the reported total was not reached.
    pub async fn run(&self) -> Result<SweepResult, SweepError> {
        let mut offset = 0usize;
        let mut progress = SweepResult::default();

        loop {
            let page = self
                .reader
                .fetch_page(offset, self.page_size)
                .await
                .map_err(|err| SweepError::at(err, progress))?;
            let fetched = page.items.len();

            for record in &page.items {
                let wrote = self
                    .reconcile(record)
                    .await
                    .map_err(|err| SweepError::at(err, progress))?;
                if wrote {
                    progress.updated += 1;
                }
                progress.processed += 1;
            }

            offset += fetched;
            debug!(offset, fetched, total = page.count, "catalog page reconciled");

            if fetched == 0 {
                if offset < page.count {
                    warn!(offset, total = page.count, "empty catalog page before reported total");
                }
                break;
            }
            if offset >= page.count {
                break;
            }
        }

        Ok(progress)
    }

    /// Reconciles one record; returns whether a SKU write was issued.
    async fn reconcile(&self, record: &CatalogRecord) -> Result<bool, RemoteError> {
        let sku = record.primary_key();
        let barcode = record.secondary_key();
        if sku.is_empty() && barcode.is_empty() {
            return Ok(false);
        }

        let mut variant: Option<CommerceVariant> = None;
        if !sku.is_empty() {
            variant = self.lookup.find_by_primary(sku).await?.into_iter().next();
        }
        if variant.is_none() && !barcode.is_empty() {
            variant = self.lookup.find_by_secondary(barcode).await?.into_iter().next();
        }

        let Some(variant) = variant else {
            return Ok(false);
        };
        if sku.is_empty() || variant.has_sku(sku) {
            return Ok(false);
        }

        self.writer.update_primary_identifier(&variant.id, sku).await?;
        info!(
            variant_id = %variant.id,
            previous_sku = variant.sku.as_deref().unwrap_or_default(),
            sku,
            "variant sku updated"
        );
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    OnDemand,
    Scheduled,
    Cli,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::OnDemand => "on_demand",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepResult),
    Skipped { reason: String },
    AlreadyRunning,
}

/// Runs sweeps on behalf of every trigger, one at a time.
pub struct SweepRunner {
    sweep: Result<ReconciliationSweep, MissingConfig>,
    in_flight: Mutex<()>,
}

impl SweepRunner {
    pub fn new(sweep: ReconciliationSweep) -> Self {
        Self {
            sweep: Ok(sweep),
            in_flight: Mutex::new(()),
        }
    }

    pub fn unconfigured(missing: MissingConfig) -> Self {
        Self {
            sweep: Err(missing),
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(config: &SyncConfig, http: &HttpFetcher) -> Self {
        match config.catalog_credentials() {
            Ok(credentials) => Self::new(
                ReconciliationSweep::from_credentials(http.clone(), credentials)
                    .with_page_size(config.page_size),
            ),
            Err(missing) => Self::unconfigured(missing),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.sweep.is_ok()
    }

    pub async fn trigger(&self, kind: TriggerKind) -> Result<SweepOutcome, SweepError> {
        let sweep = match &self.sweep {
            Ok(sweep) => sweep,
            Err(missing) => {
                warn!(trigger = kind.as_str(), missing = missing.key, "sweep skipped");
                return Ok(SweepOutcome::Skipped {
                    reason: missing.to_string(),
                });
            }
        };

        let Ok(_in_flight) = self.in_flight.try_lock() else {
            warn!(trigger = kind.as_str(), "sweep already in flight; not starting another");
            return Ok(SweepOutcome::AlreadyRunning);
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("sweep_run", %run_id, trigger = kind.as_str());
        async {
            let started = Instant::now();
            info!(page_size = sweep.page_size(), "sweep started");
            let result = sweep.run().await?;
            info!(
                processed = result.processed,
                updated = result.updated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sweep finished"
            );
            Ok::<_, SweepError>(SweepOutcome::Completed(result))
        }
        .instrument(span)
        .await
    }

    /// Timer entry point: failures end up in the log only.
    pub async fn run_scheduled(&self) {
        if let Err(err) = self.trigger(TriggerKind::Scheduled).await {
            error!(
                error = %err,
                processed = err.processed,
                updated = err.updated,
                "scheduled sweep failed"
            );
        }
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    runner: Arc<SweepRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            runner.run_scheduled().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sweep_once(config: &SyncConfig) -> Result<SweepOutcome> {
    let http = HttpFetcher::new(config.http_client_config())?;
    let runner = SweepRunner::from_config(config, &http);
    let outcome = runner.trigger(TriggerKind::Cli).await?;
    Ok(outcome)
}
