//! Persisted listing store (one SQLite table per source) + shared HTTP fetch
//! utilities for shelfwatch.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use shelfwatch_core::{RawListing, StoredListing};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "shelfwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Map a source id to its table name. Anything outside `[a-z0-9_]` collapses
/// to `_` so source ids can never smuggle SQL into the interpolated name.
pub fn table_name(source: &str) -> String {
    let sanitized: String = source
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{sanitized}_results")
}

/// Durable key-value store of last-known listings, one table per source,
/// keyed by listing URL.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Idempotent schema creation for one source's table.
    pub async fn ensure_table(&self, source: &str) -> Result<(), StoreError> {
        let table = table_name(source);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                url TEXT PRIMARY KEY,
                title TEXT,
                price TEXT,
                status TEXT,
                photo TEXT,
                stock INTEGER,
                failed_parse INTEGER NOT NULL DEFAULT 0
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a transaction scope for one source's reconciliation run. All
    /// mutations for the run go through this handle; a crash before commit
    /// leaves the previous snapshot intact.
    pub async fn begin(&self, source: &str) -> Result<SourceTx, StoreError> {
        Ok(SourceTx {
            table: table_name(source),
            tx: self.pool.begin().await?,
        })
    }
}

fn listing_from_row(row: &SqliteRow) -> Result<StoredListing, sqlx::Error> {
    Ok(StoredListing {
        url: row.try_get("url")?,
        title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
        price: row.try_get::<Option<String>, _>("price")?.unwrap_or_default(),
        status: row.try_get("status")?,
        photo: row.try_get("photo")?,
        stock: row.try_get("stock")?,
        failed_parse: row.try_get("failed_parse")?,
    })
}

/// One source's table, bound to an open transaction.
pub struct SourceTx {
    table: String,
    tx: Transaction<'static, Sqlite>,
}

impl SourceTx {
    pub async fn all_urls(&mut self) -> Result<std::collections::HashSet<String>, StoreError> {
        let rows = sqlx::query(&format!("SELECT url FROM {}", self.table))
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("url").map_err(StoreError::from))
            .collect()
    }

    pub async fn get(&mut self, url: &str) -> Result<Option<StoredListing>, StoreError> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE url = ?", self.table))
            .bind(url)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|row| listing_from_row(&row).map_err(StoreError::from))
            .transpose()
    }

    /// Insert a new row or overwrite every tracked field of an existing one.
    /// The failure counter is left untouched; resetting it on re-observation
    /// is the reconciliation engine's call.
    pub async fn upsert(&mut self, listing: &RawListing) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO {} (url, title, price, status, photo, stock)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                price = excluded.price,
                status = excluded.status,
                photo = excluded.photo,
                stock = excluded.stock",
            self.table
        ))
        .bind(&listing.url)
        .bind(&listing.title)
        .bind(&listing.price)
        .bind(&listing.status)
        .bind(&listing.photo)
        .bind(listing.stock)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn delete(&mut self, url: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {} WHERE url = ?", self.table))
            .bind(url)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn set_status(&mut self, url: &str, status: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("UPDATE {} SET status = ? WHERE url = ?", self.table))
            .bind(status)
            .bind(url)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn increment_failed_parse(&mut self, url: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE {} SET failed_parse = failed_parse + 1 WHERE url = ?",
            self.table
        ))
        .bind(url)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn reset_failed_parse(&mut self, url: &str) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "UPDATE {} SET failed_parse = 0 WHERE url = ?",
            self.table
        ))
        .bind(url)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Cleanup pass: delete every row whose failure counter reached the
    /// retirement threshold. Returns the number of retired rows.
    pub async fn delete_failed(&mut self, threshold: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE failed_parse >= ?",
            self.table
        ))
        .bind(threshold)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body was not valid UTF-8 for {0}")]
    NotText(String),
    #[error("invalid JSON from {url}: {source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },
}

/// Shared GET client for source adapters: browser-like headers, one timeout,
/// transport-level retry with exponential backoff. Retrying here is adapter
/// plumbing; the reconciliation core above it never retries anything.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.fetch_bytes(url).await?;
        String::from_utf8(response.body).map_err(|_| FetchError::NotText(url.to_string()))
    }

    pub async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Json {
            url: url.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfwatch_core::RawListing;
    use tempfile::tempdir;

    fn listing(url: &str, price: &str) -> RawListing {
        RawListing {
            url: url.into(),
            title: "Gel Set".into(),
            price: price.into(),
            status: Some("in stock".into()),
            photo: Some("https://cdn.example.com/set.jpg".into()),
            stock: None,
        }
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(table_name("ohora-jp"), "ohora_jp_results");
        assert_eq!(table_name("x; DROP TABLE y"), "x__drop_table_y_results");
    }

    #[tokio::test]
    async fn upsert_get_roundtrip_and_overwrite() {
        let store = ListingStore::in_memory().await.unwrap();
        store.ensure_table("ohora_jp").await.unwrap();

        let mut tx = store.begin("ohora_jp").await.unwrap();
        tx.upsert(&listing("https://x/products/a", "¥2,300")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("ohora_jp").await.unwrap();
        let row = tx.get("https://x/products/a").await.unwrap().unwrap();
        assert_eq!(row.price, "¥2,300");
        assert_eq!(row.failed_parse, 0);

        tx.upsert(&listing("https://x/products/a", "¥1,980")).await.unwrap();
        let row = tx.get("https://x/products/a").await.unwrap().unwrap();
        assert_eq!(row.price, "¥1,980");
        assert_eq!(tx.all_urls().await.unwrap().len(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn upsert_preserves_failure_counter() {
        let store = ListingStore::in_memory().await.unwrap();
        store.ensure_table("poshmark").await.unwrap();

        let mut tx = store.begin("poshmark").await.unwrap();
        tx.upsert(&listing("https://x/listing/1", "$12")).await.unwrap();
        tx.increment_failed_parse("https://x/listing/1").await.unwrap();
        tx.increment_failed_parse("https://x/listing/1").await.unwrap();
        tx.upsert(&listing("https://x/listing/1", "$14")).await.unwrap();
        let row = tx.get("https://x/listing/1").await.unwrap().unwrap();
        assert_eq!(row.failed_parse, 2);

        tx.reset_failed_parse("https://x/listing/1").await.unwrap();
        let row = tx.get("https://x/listing/1").await.unwrap().unwrap();
        assert_eq!(row.failed_parse, 0);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn delete_failed_retires_only_rows_at_threshold() {
        let store = ListingStore::in_memory().await.unwrap();
        store.ensure_table("poshmark").await.unwrap();

        let mut tx = store.begin("poshmark").await.unwrap();
        tx.upsert(&listing("https://x/listing/stale", "$5")).await.unwrap();
        tx.upsert(&listing("https://x/listing/fresh", "$5")).await.unwrap();
        for _ in 0..10 {
            tx.increment_failed_parse("https://x/listing/stale").await.unwrap();
        }
        let retired = tx
            .delete_failed(shelfwatch_core::RETIRE_AFTER_FAILED_PARSES)
            .await
            .unwrap();
        assert_eq!(retired, 1);
        assert!(tx.get("https://x/listing/stale").await.unwrap().is_none());
        assert!(tx.get("https://x/listing/fresh").await.unwrap().is_some());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = ListingStore::open(dir.path().join("listings.db")).await.unwrap();
        store.ensure_table("ohora_us").await.unwrap();

        let mut tx = store.begin("ohora_us").await.unwrap();
        tx.upsert(&listing("https://x/products/kept", "$19")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("ohora_us").await.unwrap();
        tx.upsert(&listing("https://x/products/dropped", "$21")).await.unwrap();
        drop(tx); // rollback

        let mut tx = store.begin("ohora_us").await.unwrap();
        let urls = tx.all_urls().await.unwrap();
        assert!(urls.contains("https://x/products/kept"));
        assert!(!urls.contains("https://x/products/dropped"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
