//! Per-source reconciliation: diff a fresh scrape against the persisted
//! snapshot, apply store mutations, and emit one notification per detected
//! change.
//!
//! Every per-listing step is fault-isolated: a bad row or a failed write is
//! logged and the rest of the batch still processes. Store mutations for one
//! run share a single transaction, so a crash mid-run leaves either the
//! previous or the fully-updated snapshot.

use shelfwatch_core::{
    diff_listing, is_terminal_status, ListingDelta, RawListing, RetirementPolicy,
    RETIRE_AFTER_FAILED_PARSES,
};
use shelfwatch_storage::{ListingStore, SourceTx};
use tracing::{info, warn};

use crate::notify::{listing_embed, NotificationSink};

const REMOVED_CHANGE_LINE: &str = "Product no longer available on website - marked as sold out";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub retired: usize,
    pub errors: usize,
}

enum Outcome {
    New,
    Updated,
    Unchanged,
}

pub struct ReconcileEngine<'a> {
    source: &'a str,
    policy: RetirementPolicy,
    store: &'a ListingStore,
    sink: &'a dyn NotificationSink,
}

impl<'a> ReconcileEngine<'a> {
    pub fn new(
        source: &'a str,
        policy: RetirementPolicy,
        store: &'a ListingStore,
        sink: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            source,
            policy,
            store,
            sink,
        }
    }

    /// Reconcile one freshly scraped batch. An empty batch is a no-op: it is
    /// indistinguishable from a broken scrape, and treating it as "everything
    /// vanished" would retire the whole table.
    pub async fn run(&self, scraped: &[RawListing]) -> anyhow::Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        if scraped.is_empty() {
            info!(source = self.source, "no results to process");
            return Ok(summary);
        }

        self.store.ensure_table(self.source).await?;
        let mut tx = self.store.begin(self.source).await?;

        let known_urls = tx.all_urls().await?;
        let current_urls: std::collections::HashSet<&str> =
            scraped.iter().map(|r| r.url.as_str()).collect();

        for listing in scraped {
            match self.apply_one(&mut tx, listing).await {
                Ok(Outcome::New) => summary.new += 1,
                Ok(Outcome::Updated) => summary.updated += 1,
                Ok(Outcome::Unchanged) => summary.unchanged += 1,
                Err(err) => {
                    warn!(
                        source = self.source,
                        url = %listing.url,
                        error = %err,
                        "failed to process listing"
                    );
                    summary.errors += 1;
                }
            }
        }

        let mut missing_urls: Vec<&String> = known_urls
            .iter()
            .filter(|url| !current_urls.contains(url.as_str()))
            .collect();
        missing_urls.sort();

        if !missing_urls.is_empty() {
            info!(
                source = self.source,
                count = missing_urls.len(),
                "listings missing from current scrape"
            );
        }

        match self.policy {
            RetirementPolicy::CounterThreshold => {
                for url in &missing_urls {
                    if let Err(err) = tx.increment_failed_parse(url).await {
                        warn!(source = self.source, url = %url, error = %err, "failed to flag missing listing");
                        summary.errors += 1;
                    }
                }
                // Cleanup is a separate pass over the whole table, not just
                // this run's missing set.
                summary.retired = tx.delete_failed(RETIRE_AFTER_FAILED_PARSES).await? as usize;
            }
            RetirementPolicy::MarkSoldOut => {
                for url in &missing_urls {
                    match self.mark_missing(&mut tx, url).await {
                        Ok(true) => summary.retired += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(source = self.source, url = %url, error = %err, "failed to retire missing listing");
                            summary.errors += 1;
                        }
                    }
                }
            }
        }

        tx.commit().await?;

        info!(
            source = self.source,
            new = summary.new,
            updated = summary.updated,
            unchanged = summary.unchanged,
            retired = summary.retired,
            errors = summary.errors,
            "reconciliation complete"
        );
        Ok(summary)
    }

    async fn apply_one(
        &self,
        tx: &mut SourceTx,
        listing: &RawListing,
    ) -> anyhow::Result<Outcome> {
        let Some(stored) = tx.get(&listing.url).await? else {
            tx.upsert(listing).await?;
            self.sink
                .send(listing_embed("New Listing", listing, &[]))
                .await;
            return Ok(Outcome::New);
        };

        let deltas = diff_listing(&stored, listing);
        if deltas.is_empty() {
            // Re-observation clears the absence counter even when nothing
            // else changed.
            if self.policy == RetirementPolicy::CounterThreshold && stored.failed_parse > 0 {
                tx.reset_failed_parse(&listing.url).await?;
            }
            return Ok(Outcome::Unchanged);
        }

        tx.upsert(listing).await?;
        if self.policy == RetirementPolicy::CounterThreshold {
            tx.reset_failed_parse(&listing.url).await?;
        }

        let changes: Vec<String> = deltas.iter().map(ListingDelta::to_string).collect();
        self.sink
            .send(listing_embed("Listing Updated", listing, &changes))
            .await;
        Ok(Outcome::Updated)
    }

    /// Flip one absent listing to sold out. Returns whether a flip happened;
    /// rows already terminal are skipped without a second notification.
    async fn mark_missing(&self, tx: &mut SourceTx, url: &str) -> anyhow::Result<bool> {
        let Some(stored) = tx.get(url).await? else {
            return Ok(false);
        };

        if stored
            .status
            .as_deref()
            .map(is_terminal_status)
            .unwrap_or(false)
        {
            return Ok(false);
        }

        tx.set_status(url, "sold out").await?;

        let retired = RawListing {
            url: stored.url,
            title: stored.title,
            price: stored.price,
            status: Some("sold out".to_string()),
            photo: stored.photo,
            stock: stored.stock,
        };
        self.sink
            .send(listing_embed(
                "Product Removed",
                &retired,
                &[REMOVED_CHANGE_LINE.to_string()],
            ))
            .await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Embed;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        embeds: Mutex<Vec<Embed>>,
    }

    impl RecordingSink {
        fn titles(&self) -> Vec<String> {
            self.embeds
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.title.clone())
                .collect()
        }

        fn descriptions(&self) -> Vec<String> {
            self.embeds
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.description.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.embeds.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, embed: Embed) {
            self.embeds.lock().unwrap().push(embed);
        }
    }

    fn listing(url: &str, price: &str, status: Option<&str>) -> RawListing {
        RawListing {
            url: url.into(),
            title: format!("Listing {url}"),
            price: price.into(),
            status: status.map(Into::into),
            photo: None,
            stock: None,
        }
    }

    async fn store() -> ListingStore {
        ListingStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn new_listing_inserts_once_and_notifies_once() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        let batch = vec![listing("https://x/products/a", "¥2,300", Some("in stock"))];
        let summary = engine.run(&batch).await.unwrap();

        assert_eq!(summary.new, 1);
        assert_eq!(sink.titles(), vec!["New Listing: Listing https://x/products/a"]);

        let mut tx = store.begin("ohora-jp").await.unwrap();
        assert_eq!(tx.all_urls().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_rescrape_is_idempotent() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        let batch = vec![listing("https://x/products/a", "¥2,300", Some("in stock"))];
        engine.run(&batch).await.unwrap();
        let summary = engine.run(&batch).await.unwrap();

        assert_eq!(summary.new, 0);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(sink.count(), 1); // only the original New Listing
    }

    #[tokio::test]
    async fn price_change_notifies_with_price_line_only() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        engine
            .run(&[listing("https://x/products/a", "¥2,300", Some("in stock"))])
            .await
            .unwrap();
        let summary = engine
            .run(&[listing("https://x/products/a", "¥1,980", Some("in stock"))])
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        let descriptions = sink.descriptions();
        let update = &descriptions[1];
        assert!(update.contains("Price changed from ¥2,300 to ¥1,980"));
        assert!(!update.contains("Status changed"));
    }

    #[tokio::test]
    async fn price_formatting_only_change_still_notifies() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        engine
            .run(&[listing("https://x/products/a", "¥1,000", Some("in stock"))])
            .await
            .unwrap();
        let summary = engine
            .run(&[listing("https://x/products/a", "¥1000", Some("in stock"))])
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
    }

    #[tokio::test]
    async fn stock_threshold_crossing_fires_single_alert() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine =
            ReconcileEngine::new("seven-nana-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        let mut first = listing("https://x/products/a", "¥1,826", Some("in stock"));
        first.stock = Some(60);
        engine.run(&[first.clone()]).await.unwrap();

        let mut second = first.clone();
        second.stock = Some(45);
        let summary = engine.run(&[second]).await.unwrap();

        assert_eq!(summary.updated, 1);
        let update = &sink.descriptions()[1];
        assert_eq!(update.matches("STOCK ALERT").count(), 1);
        assert!(update.contains("STOCK ALERT! Current: 45"));
    }

    #[tokio::test]
    async fn missing_listing_marked_sold_out_exactly_once() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        engine
            .run(&[
                listing("https://x/products/gone", "¥2,300", Some("in stock")),
                listing("https://x/products/here", "¥2,300", Some("in stock")),
            ])
            .await
            .unwrap();

        let still_here = vec![listing("https://x/products/here", "¥2,300", Some("in stock"))];
        let summary = engine.run(&still_here).await.unwrap();
        assert_eq!(summary.retired, 1);
        assert_eq!(
            sink.titles().last().unwrap(),
            "Product Removed: Listing https://x/products/gone"
        );

        let mut tx = store.begin("ohora-jp").await.unwrap();
        let row = tx.get("https://x/products/gone").await.unwrap().unwrap();
        assert_eq!(row.status.as_deref(), Some("sold out"));
        drop(tx);

        // Second absent run: already terminal, silent.
        let notifications_before = sink.count();
        let summary = engine.run(&still_here).await.unwrap();
        assert_eq!(summary.retired, 0);
        assert_eq!(sink.count(), notifications_before);
    }

    #[tokio::test]
    async fn counter_policy_increments_resets_and_retires() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine =
            ReconcileEngine::new("poshmark", RetirementPolicy::CounterThreshold, &store, &sink);

        let tracked = listing("https://x/listing/gone", "$18", None);
        let anchor = listing("https://x/listing/here", "$12", None);
        engine.run(&[tracked.clone(), anchor.clone()]).await.unwrap();

        // Three absent runs, then re-observation resets the counter.
        for _ in 0..3 {
            engine.run(&[anchor.clone()]).await.unwrap();
        }
        let mut tx = store.begin("poshmark").await.unwrap();
        assert_eq!(tx.get(&tracked.url).await.unwrap().unwrap().failed_parse, 3);
        drop(tx);

        engine.run(&[tracked.clone(), anchor.clone()]).await.unwrap();
        let mut tx = store.begin("poshmark").await.unwrap();
        assert_eq!(tx.get(&tracked.url).await.unwrap().unwrap().failed_parse, 0);
        drop(tx);

        // Ten consecutive absences retire the row outright.
        let mut retired_total = 0;
        for _ in 0..10 {
            retired_total += engine.run(&[anchor.clone()]).await.unwrap().retired;
        }
        assert_eq!(retired_total, 1);
        let mut tx = store.begin("poshmark").await.unwrap();
        assert!(tx.get(&tracked.url).await.unwrap().is_none());

        // Absence under the counter policy never notifies.
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test]
    async fn empty_scrape_is_a_noop() {
        let store = store().await;
        let sink = RecordingSink::default();
        let engine = ReconcileEngine::new("ohora-jp", RetirementPolicy::MarkSoldOut, &store, &sink);

        engine
            .run(&[listing("https://x/products/a", "¥2,300", Some("in stock"))])
            .await
            .unwrap();
        let summary = engine.run(&[]).await.unwrap();

        assert_eq!(summary, ReconcileSummary::default());
        let mut tx = store.begin("ohora-jp").await.unwrap();
        let row = tx.get("https://x/products/a").await.unwrap().unwrap();
        assert_eq!(row.status.as_deref(), Some("in stock"));
    }
}
