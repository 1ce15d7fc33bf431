//! Run pipeline: per-source scrape → reconcile, then the cross-source
//! storefront pass over everything that opted in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shelfwatch_adapters::{source_for_id, ListingSource};
use shelfwatch_core::{normalize_handle, RetirementPolicy};
use shelfwatch_storage::{HttpClientConfig, HttpFetcher, ListingStore};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod aggregate;
pub mod notify;
pub mod reconcile;
pub mod storefront;
pub mod translate;

pub use aggregate::{reconcile_storefront, AggregateSummary, SourceBatch};
pub use notify::{DiscordWebhook, NotificationSink, NullSink};
pub use reconcile::{ReconcileEngine, ReconcileSummary};
pub use storefront::{StorefrontApi, StorefrontClient, StorefrontConfig};

pub const CRATE_NAME: &str = "shelfwatch-sync";

/// Pause between uploaded products, to stay polite with the storefront API.
const UPLOAD_PACING: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

/// One entry in `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub retirement: RetirementPolicy,
    /// Name of the environment variable holding this source's webhook URL.
    #[serde(default)]
    pub webhook_env: Option<String>,
    /// Whether this source's listings feed the storefront aggregation pass.
    #[serde(default)]
    pub storefront_sync: bool,
    /// Whether unknown products get detail-scraped and uploaded.
    #[serde(default)]
    pub upload_new_products: bool,
    /// Storefront brand the uploads belong to.
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Minimum delay after each delivered notification.
    pub pacing: Duration,
    pub storefront: Option<StorefrontConfig>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let storefront = match (
            std::env::var("STOREFRONT_BASE_URL"),
            std::env::var("STOREFRONT_USERNAME"),
            std::env::var("STOREFRONT_PASSWORD"),
        ) {
            (Ok(base_url), Ok(username), Ok(password)) => Some(StorefrontConfig {
                base_url,
                username,
                password,
            }),
            _ => None,
        };

        Self {
            database_path: std::env::var("SHELFWATCH_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/listings.db")),
            sources_path: std::env::var("SHELFWATCH_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            user_agent: std::env::var("SHELFWATCH_USER_AGENT")
                .unwrap_or_else(|_| HttpClientConfig::default().user_agent),
            http_timeout_secs: std::env::var("SHELFWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            pacing: std::env::var("SHELFWATCH_PACING_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(notify::DEFAULT_PACING),
            storefront,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_run: usize,
    pub sources_failed: usize,
    pub listings_seen: usize,
    pub new: usize,
    pub updated: usize,
    pub retired: usize,
    pub storefront: Option<AggregateSummary>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: ListingStore,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let store = ListingStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            store,
            http,
        })
    }

    fn sink_for(&self, source: &SourceConfig) -> Box<dyn NotificationSink> {
        let Some(env_name) = &source.webhook_env else {
            return Box::new(NullSink);
        };
        match std::env::var(env_name) {
            Ok(url) if !url.is_empty() => {
                Box::new(DiscordWebhook::new(url, self.config.pacing))
            }
            _ => {
                warn!(source = %source.source_id, env = %env_name, "webhook env var not set");
                Box::new(NullSink)
            }
        }
    }

    /// One full pass: every enabled source sequentially, then the storefront
    /// aggregation over the sources that participate.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = load_source_registry(&self.config.sources_path).await?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            sources_run: 0,
            sources_failed: 0,
            listings_seen: 0,
            new: 0,
            updated: 0,
            retired: 0,
            storefront: None,
        };
        let mut batches: Vec<SourceBatch> = Vec::new();

        for source in registry.sources.iter().filter(|s| s.enabled) {
            let Some(adapter) = source_for_id(&source.source_id) else {
                warn!(source = %source.source_id, "no adapter registered, skipping");
                continue;
            };

            info!(source = %source.source_id, name = %source.display_name, "scraping source");
            let listings = match adapter.fetch(&self.http).await {
                Ok(listings) => listings,
                Err(err) => {
                    error!(source = %source.source_id, error = %err, "scrape failed, skipping source");
                    summary.sources_failed += 1;
                    continue;
                }
            };
            let fetched_at = Utc::now();
            summary.listings_seen += listings.len();

            let sink = self.sink_for(source);
            let engine = ReconcileEngine::new(
                &source.source_id,
                source.retirement,
                &self.store,
                sink.as_ref(),
            );
            match engine.run(&listings).await {
                Ok(source_summary) => {
                    summary.new += source_summary.new;
                    summary.updated += source_summary.updated;
                    summary.retired += source_summary.retired;
                    summary.sources_run += 1;
                }
                Err(err) => {
                    error!(source = %source.source_id, error = %err, "reconciliation failed");
                    summary.sources_failed += 1;
                    continue;
                }
            }

            if source.upload_new_products {
                if let Err(err) = self.upload_new_products(adapter.as_ref(), source, &listings).await
                {
                    warn!(source = %source.source_id, error = %err, "new-product upload pass failed");
                }
            }

            if source.storefront_sync {
                batches.push(SourceBatch {
                    source: source.source_id.clone(),
                    fetched_at,
                    listings,
                });
            }
        }

        if !batches.is_empty() {
            match &self.config.storefront {
                Some(storefront_config) => {
                    let client = StorefrontClient::new(storefront_config.clone());
                    match reconcile_storefront(&client, &batches).await {
                        Ok(aggregate) => summary.storefront = Some(aggregate),
                        Err(err) => error!(error = %err, "storefront aggregation aborted"),
                    }
                }
                None => {
                    info!("storefront credentials not configured, skipping aggregation");
                }
            }
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Upload path: detail-scrape products the storefront has never seen and
    /// upsert them with re-hosted images and a converted USD price.
    async fn upload_new_products(
        &self,
        adapter: &dyn ListingSource,
        source: &SourceConfig,
        listings: &[shelfwatch_core::RawListing],
    ) -> Result<()> {
        let Some(storefront_config) = &self.config.storefront else {
            info!(source = %source.source_id, "storefront credentials not configured, skipping uploads");
            return Ok(());
        };
        let client = StorefrontClient::new(storefront_config.clone());
        let token = client.login().await?;

        let brand_id = match &source.brand {
            Some(brand) => match client.brand_id(&token, brand).await? {
                Some(id) => id,
                None => {
                    warn!(source = %source.source_id, brand = %brand, "brand not found, skipping uploads");
                    return Ok(());
                }
            },
            None => {
                warn!(source = %source.source_id, "upload_new_products set without a brand");
                return Ok(());
            }
        };

        let existing: HashSet<String> = client
            .products_status(&token)
            .await?
            .into_iter()
            .map(|product| normalize_handle(&product.product_url))
            .collect();

        let new_urls: Vec<&str> = listings
            .iter()
            .filter(|listing| !existing.contains(&normalize_handle(&listing.url)))
            .map(|listing| listing.url.as_str())
            .collect();
        if new_urls.is_empty() {
            return Ok(());
        }
        info!(source = %source.source_id, count = new_urls.len(), "uploading new products");

        let rate = match client.jpy_to_usd_rate().await {
            Ok(rate) => Some(rate),
            Err(err) => {
                warn!(error = %err, "exchange rate unavailable, fixed price points only");
                None
            }
        };

        for url in new_urls {
            let detail = match adapter.fetch_detail(&self.http, url).await {
                Ok(Some(detail)) => detail,
                Ok(None) => continue,
                Err(err) => {
                    warn!(url, error = %err, "detail scrape failed");
                    continue;
                }
            };

            let images = match client.upload_images(&token, &detail.image_urls).await {
                Ok(images) => images,
                Err(err) => {
                    warn!(url, error = %err, "image upload failed");
                    Vec::new()
                }
            };

            let product = storefront::UpsertProduct {
                product_url: detail.product_url.clone(),
                name: translate::clean_product_name(&detail.name),
                description: detail.description.clone(),
                sku: detail.sku.clone(),
                msrp: detail.msrp,
                price: storefront::usd_price_from_jpy(detail.msrp, rate),
                is_active: detail.is_active,
                brand_id,
                images,
            };
            if let Err(err) = client.upsert_product(&token, &product).await {
                warn!(url, error = %err, "upsert failed");
                continue;
            }
            tokio::time::sleep(UPLOAD_PACING).await;
        }

        Ok(())
    }
}

/// Convenience entry point used by the CLI.
pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_registry_parses_with_defaults() {
        let yaml = r#"
sources:
  - source_id: ohora-jp
    display_name: Ohora Japan
    enabled: true
    retirement: mark-sold-out
    webhook_env: OHORA_JP_WEBHOOK_URL
    storefront_sync: true
  - source_id: poshmark
    display_name: Poshmark search
    enabled: false
    retirement: counter-threshold
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);

        let ohora = &registry.sources[0];
        assert_eq!(ohora.retirement, RetirementPolicy::MarkSoldOut);
        assert!(ohora.storefront_sync);
        assert!(!ohora.upload_new_products);

        let poshmark = &registry.sources[1];
        assert_eq!(poshmark.retirement, RetirementPolicy::CounterThreshold);
        assert!(poshmark.webhook_env.is_none());
        assert!(!poshmark.enabled);
    }
}
