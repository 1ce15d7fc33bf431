//! Core domain model for shelfwatch: listing records, change detection,
//! retirement policies, and the normalized-handle join key.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shelfwatch-core";

/// Stock levels that trigger an alert line when crossed downward.
/// Scanned in descending order; only the first crossing fires.
pub const STOCK_ALERT_THRESHOLDS: [i64; 6] = [50, 40, 30, 20, 10, 5];

/// Consecutive absent runs before a counter-retired listing is deleted.
pub const RETIRE_AFTER_FAILED_PARSES: i64 = 10;

/// One freshly scraped listing, as handed over by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    /// Stable identifier for the item on its source site.
    pub url: String,
    pub title: String,
    /// Currency-formatted display price. Compared by exact string equality:
    /// a formatting-only change counts as a price change.
    pub price: String,
    /// `"in stock"` / `"sold out"`; `None` for sources without availability.
    pub status: Option<String>,
    pub photo: Option<String>,
    /// Inventory count, for sources that expose one.
    pub stock: Option<i64>,
}

/// The last-known attributes of a listing, as persisted in its source table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredListing {
    pub url: String,
    pub title: String,
    pub price: String,
    pub status: Option<String>,
    pub photo: Option<String>,
    pub stock: Option<i64>,
    /// Consecutive runs this listing was absent from the scrape.
    pub failed_parse: i64,
}

impl StoredListing {
    pub fn from_raw(raw: &RawListing) -> Self {
        Self {
            url: raw.url.clone(),
            title: raw.title.clone(),
            price: raw.price.clone(),
            status: raw.status.clone(),
            photo: raw.photo.clone(),
            stock: raw.stock,
            failed_parse: 0,
        }
    }
}

/// Detailed product data scraped from a single product page, used by the
/// new-product upload path. Image URLs are raw source URLs; re-hosting
/// happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetail {
    pub product_url: String,
    pub name: String,
    pub description: String,
    pub sku: Option<String>,
    /// MSRP in the source currency (JPY for the Japanese storefronts).
    pub msrp: f64,
    pub is_active: bool,
    pub image_urls: Vec<String>,
}

/// How a source retires listings that stop appearing in its scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetirementPolicy {
    /// Increment `failed_parse` per absent run; delete at the threshold.
    /// Used by sources without a reliable "removed" signal.
    CounterThreshold,
    /// Flip the stored status to `sold out` and notify, once.
    MarkSoldOut,
}

/// One detected difference between a stored listing and its re-scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingDelta {
    Price { old: String, new: String },
    Status { old: String, new: String },
    StockAlert { current: i64 },
}

impl fmt::Display for ListingDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Price { old, new } => write!(f, "Price changed from {old} to {new}"),
            Self::Status { old, new } => write!(f, "Status changed from {old} to {new}"),
            Self::StockAlert { current } => write!(f, "STOCK ALERT! Current: {current}"),
        }
    }
}

/// Compare every tracked field between a stored row and its re-scrape.
///
/// An empty result means Unchanged: no store mutation, no notification.
/// A stock decrease only registers when it crosses one of the alert
/// thresholds; drift between thresholds is not an update.
pub fn diff_listing(stored: &StoredListing, raw: &RawListing) -> Vec<ListingDelta> {
    let mut deltas = Vec::new();

    if stored.price != raw.price {
        deltas.push(ListingDelta::Price {
            old: stored.price.clone(),
            new: raw.price.clone(),
        });
    }

    if let Some(new_status) = &raw.status {
        let old_status = stored.status.as_deref().unwrap_or("unknown");
        if old_status != new_status {
            deltas.push(ListingDelta::Status {
                old: old_status.to_string(),
                new: new_status.clone(),
            });
        }
    }

    if let (Some(old_stock), Some(new_stock)) = (stored.stock, raw.stock) {
        if new_stock < old_stock {
            for threshold in STOCK_ALERT_THRESHOLDS {
                if old_stock > threshold && new_stock <= threshold {
                    deltas.push(ListingDelta::StockAlert { current: new_stock });
                    break;
                }
            }
        }
    }

    deltas
}

/// A status that means the listing is already retired and should not be
/// flipped or re-notified.
pub fn is_terminal_status(status: &str) -> bool {
    let status = status.to_lowercase();
    status.contains("sold out") || status.contains("inactive")
}

/// Whether a scraped status counts as active for storefront reconciliation.
pub fn status_is_active(status: Option<&str>) -> bool {
    status
        .map(|s| s.to_lowercase().contains("in stock"))
        .unwrap_or(false)
}

/// Normalize a product URL to its handle: the last non-empty path segment,
/// query and fragment stripped.
///
/// Two URLs with the same trailing segment are the same product for
/// aggregation purposes, even across domains. Lossy by design.
pub fn normalize_handle(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let path = without_query
        .strip_prefix("https://")
        .or_else(|| without_query.strip_prefix("http://"))
        .unwrap_or(without_query);
    path.trim_end_matches('/')
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
        .to_string()
}
