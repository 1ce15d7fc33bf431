//! Authenticated client for the internal storefront API: token auth, product
//! status snapshot, batched activation updates, and the new-product upload
//! path (image re-hosting, JPY→USD pricing).

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const ECB_DAILY_RATES_URL: &str =
    "https://www.ecb.europa.eu/stats/eurofxref/eurofxref-daily.xml";

#[derive(Debug, Clone)]
pub struct StorefrontConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum StorefrontError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("unexpected response from {url}: {message}")]
    Protocol { url: String, message: String },
}

fn bool_from_int_or_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    // The snapshot endpoint serves is_active as 0/1 in some deployments and
    // as a native boolean in others.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrBool {
        Int(i64),
        Bool(bool),
    }
    Ok(match IntOrBool::deserialize(deserializer)? {
        IntOrBool::Int(n) => n != 0,
        IntOrBool::Bool(b) => b,
    })
}

/// One product as the storefront reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct StorefrontProduct {
    pub product_url: String,
    #[serde(default, deserialize_with = "bool_from_int_or_bool")]
    pub is_active: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// One queued activation change. `is_active` goes over the wire as an
/// integer 0/1; the endpoint rejects native booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub product_url: String,
    pub is_active: u8,
    pub name: String,
}

impl StatusUpdate {
    pub fn new(product_url: impl Into<String>, active: bool, name: impl Into<String>) -> Self {
        Self {
            product_url: product_url.into(),
            is_active: u8::from(active),
            name: name.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusUpdateBatch<'a> {
    #[serde(rename = "productsToUpdate")]
    products_to_update: &'a [StatusUpdate],
}

/// New-product payload for the upsert endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpsertProduct {
    pub product_url: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(rename = "MSRP")]
    pub msrp: f64,
    /// Final USD price, already converted and rounded.
    pub price: i64,
    pub is_active: bool,
    #[serde(rename = "brandId")]
    pub brand_id: i64,
    pub images: Vec<String>,
}

/// The slice of the storefront API the aggregation pass depends on. A trait
/// seam so the aggregator is testable against a fake.
#[async_trait]
pub trait StorefrontApi: Send + Sync {
    async fn login(&self) -> Result<String, StorefrontError>;
    async fn products_status(&self, token: &str)
        -> Result<Vec<StorefrontProduct>, StorefrontError>;
    async fn update_statuses(
        &self,
        token: &str,
        updates: &[StatusUpdate],
    ) -> Result<(), StorefrontError>;
}

pub struct StorefrontClient {
    config: StorefrontConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Brand {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "imageUrls", default)]
    image_urls: Vec<String>,
}

impl StorefrontClient {
    pub fn new(config: StorefrontConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    pub async fn brand_id(&self, token: &str, name: &str) -> Result<Option<i64>, StorefrontError> {
        let url = self.url("/api/brands");
        let brands: Vec<Brand> = self
            .client
            .get(&url)
            .header("x-access-token", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(brands.into_iter().find(|b| b.name == name).map(|b| b.id))
    }

    pub async fn upsert_product(
        &self,
        token: &str,
        product: &UpsertProduct,
    ) -> Result<(), StorefrontError> {
        self.client
            .post(self.url("/api/scrape/upsert"))
            .header("x-access-token", token)
            .json(product)
            .send()
            .await?
            .error_for_status()?;
        info!(name = %product.name, "upserted storefront product");
        Ok(())
    }

    /// Download each source image and re-upload it to the storefront CDN.
    /// GIFs are skipped; a single failed download skips that image only.
    pub async fn upload_images(
        &self,
        token: &str,
        image_urls: &[String],
    ) -> Result<Vec<String>, StorefrontError> {
        let mut form = reqwest::multipart::Form::new();
        let mut attached = 0usize;

        for (index, image_url) in image_urls.iter().enumerate() {
            let path = image_url.split('?').next().unwrap_or(image_url);
            if path.ends_with(".gif") {
                info!(url = %image_url, "skipping .gif image");
                continue;
            }

            let bytes = match self
                .client
                .get(image_url)
                .send()
                .await
                .and_then(|resp| resp.error_for_status())
            {
                Ok(resp) => resp.bytes().await?,
                Err(err) => {
                    warn!(url = %image_url, error = %err, "failed to download image");
                    continue;
                }
            };

            let extension = path.rsplit('.').next().unwrap_or("jpg");
            let part = reqwest::multipart::Part::bytes(bytes.to_vec())
                .file_name(format!("image-{index}.{extension}"))
                .mime_str("image/jpeg")?;
            form = form.part("images", part);
            attached += 1;
        }

        if attached == 0 {
            return Ok(Vec::new());
        }

        let response: UploadResponse = self
            .client
            .post(self.url("/api/upload/image"))
            .header("x-access-token", token)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(count = response.image_urls.len(), "uploaded images");
        Ok(response.image_urls)
    }

    /// JPY→USD via the ECB daily reference rates (EUR crosses).
    pub async fn jpy_to_usd_rate(&self) -> Result<f64, StorefrontError> {
        let url = ECB_DAILY_RATES_URL;
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_jpy_to_usd(&body).ok_or_else(|| StorefrontError::Protocol {
            url: url.to_string(),
            message: "USD or JPY rate missing from ECB reference data".to_string(),
        })
    }
}

#[async_trait]
impl StorefrontApi for StorefrontClient {
    async fn login(&self) -> Result<String, StorefrontError> {
        let url = self.url("/api/auth/login");
        let response: LoginResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .access_token
            .ok_or_else(|| StorefrontError::Auth("accessToken not found in response".to_string()))
    }

    async fn products_status(
        &self,
        token: &str,
    ) -> Result<Vec<StorefrontProduct>, StorefrontError> {
        let products: Vec<StorefrontProduct> = self
            .client
            .get(self.url("/api/scrape/products-status"))
            .header("x-access-token", token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(count = products.len(), "fetched storefront product snapshot");
        Ok(products)
    }

    async fn update_statuses(
        &self,
        token: &str,
        updates: &[StatusUpdate],
    ) -> Result<(), StorefrontError> {
        self.client
            .post(self.url("/api/scrape/update-statuses"))
            .header("x-access-token", token)
            .json(&StatusUpdateBatch {
                products_to_update: updates,
            })
            .send()
            .await?
            .error_for_status()?;
        info!(count = updates.len(), "submitted storefront status updates");
        Ok(())
    }
}

fn ecb_rate(xml: &str, currency: &str) -> Option<f64> {
    let pattern = format!(r#"currency=['"]{currency}['"]\s+rate=['"]([0-9.]+)['"]"#);
    let regex = Regex::new(&pattern).ok()?;
    regex.captures(xml)?.get(1)?.as_str().parse().ok()
}

/// Extract the direct JPY→USD rate from the ECB daily XML (both legs are
/// quoted against EUR).
pub fn parse_jpy_to_usd(xml: &str) -> Option<f64> {
    let usd = ecb_rate(xml, "USD")?;
    let jpy = ecb_rate(xml, "JPY")?;
    Some(usd / jpy)
}

/// USD sticker price for a JPY MSRP: a few fixed price points for the common
/// SKUs, otherwise convert, round up, and add the $3 margin. A missing rate
/// yields 0 so the caller can refuse to upload rather than mis-price.
pub fn usd_price_from_jpy(jpy_msrp: f64, jpy_to_usd_rate: Option<f64>) -> i64 {
    if jpy_msrp == 2300.0 || jpy_msrp == 2200.0 {
        return 19;
    }
    if jpy_msrp == 2068.0 {
        return 18;
    }
    if jpy_msrp == 1826.0 {
        return 16;
    }

    let Some(rate) = jpy_to_usd_rate else {
        warn!("cannot calculate dynamic price, exchange rate not available");
        return 0;
    };

    (jpy_msrp * rate).ceil() as i64 + 3
}
