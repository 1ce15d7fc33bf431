//! Cross-source storefront reconciliation.
//!
//! Runs once, after every participating source has finished: one login, one
//! product snapshot, one batched status write. Unlike per-source
//! reconciliation this pass is fail-fast — an auth or snapshot failure aborts
//! the whole thing with nothing partially applied.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use shelfwatch_core::{normalize_handle, status_is_active, RawListing};
use tracing::{error, info};

use crate::storefront::{StatusUpdate, StorefrontApi};

/// One source's reconciled output, tagged with when it was fetched.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub listings: Vec<RawListing>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub scraped_handles: usize,
    pub storefront_products: usize,
    /// Updates queued because a scraped status disagreed with the storefront.
    pub status_changes: usize,
    /// Deactivations queued because no source observed the product at all.
    pub missing_deactivations: usize,
    /// Whether a non-empty batch was submitted successfully.
    pub submitted: bool,
}

/// Merge all sources' listings by normalized handle.
///
/// The tie-break is deterministic: batches apply in ascending
/// `(fetched_at, source)` order, so for a handle seen by several sources the
/// most recently fetched one wins, never map iteration order.
fn dedup_by_handle(batches: &[SourceBatch]) -> HashMap<String, &RawListing> {
    let mut ordered: Vec<&SourceBatch> = batches.iter().collect();
    ordered.sort_by(|a, b| {
        a.fetched_at
            .cmp(&b.fetched_at)
            .then_with(|| a.source.cmp(&b.source))
    });

    let mut by_handle = HashMap::new();
    for batch in ordered {
        for listing in &batch.listings {
            by_handle.insert(normalize_handle(&listing.url), listing);
        }
    }
    by_handle
}

pub async fn reconcile_storefront(
    api: &dyn StorefrontApi,
    batches: &[SourceBatch],
) -> anyhow::Result<AggregateSummary> {
    let token = api
        .login()
        .await
        .context("storefront authentication failed, skipping store updates")?;

    let products = api
        .products_status(&token)
        .await
        .context("failed to fetch storefront product snapshot")?;
    let existing_by_handle: HashMap<String, _> = products
        .into_iter()
        .map(|product| (normalize_handle(&product.product_url), product))
        .collect();

    let scraped_by_handle = dedup_by_handle(batches);

    let mut summary = AggregateSummary {
        scraped_handles: scraped_by_handle.len(),
        storefront_products: existing_by_handle.len(),
        ..Default::default()
    };
    let mut updates = Vec::new();

    for (handle, listing) in &scraped_by_handle {
        let Some(existing) = existing_by_handle.get(handle) else {
            continue;
        };
        let scraped_active = status_is_active(listing.status.as_deref());
        if scraped_active != existing.is_active {
            updates.push(StatusUpdate::new(
                // The storefront's own URL, not the scraped one.
                existing.product_url.clone(),
                scraped_active,
                if listing.title.is_empty() {
                    handle.clone()
                } else {
                    listing.title.clone()
                },
            ));
            summary.status_changes += 1;
        }
    }

    for (handle, existing) in &existing_by_handle {
        if scraped_by_handle.contains_key(handle) || !existing.is_active {
            continue;
        }
        updates.push(StatusUpdate::new(
            existing.product_url.clone(),
            false,
            format!("(Removed) {handle}"),
        ));
        summary.missing_deactivations += 1;
    }

    if updates.is_empty() {
        info!("storefront already consistent, nothing to submit");
        return Ok(summary);
    }

    updates.sort_by(|a, b| a.product_url.cmp(&b.product_url));

    match api.update_statuses(&token, &updates).await {
        Ok(()) => {
            info!(count = updates.len(), "storefront batch update applied");
            summary.submitted = true;
        }
        Err(err) => {
            // One unit: the whole batch failed, nothing is retried.
            error!(count = updates.len(), error = %err, "storefront batch update failed");
        }
    }

    Ok(summary)
}
