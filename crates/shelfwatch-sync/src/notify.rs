//! Messaging-webhook notification sink.
//!
//! One embed per notification, posted one at a time. Failures are logged and
//! swallowed; a lost notification never blocks or rolls back a store
//! mutation. Each successful send is followed by a fixed pacing delay to
//! stay under the sink's rate limit.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use shelfwatch_core::RawListing;
use tracing::{info, warn};

pub const EMBED_COLOR_GREEN: u32 = 0x00ff00;
pub const DEFAULT_PACING: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    pub url: String,
    pub color: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    embeds: [&'a Embed; 1],
}

/// Build the standard listing embed: `"<prefix>: <title>"`, Price/Status
/// fields, optional Stock field, change list in the description.
pub fn listing_embed(prefix: &str, listing: &RawListing, changes: &[String]) -> Embed {
    let description = if changes.is_empty() {
        String::new()
    } else {
        format!("**Changes:**\n{}", changes.join("\n"))
    };

    let mut fields = vec![
        EmbedField {
            name: "Price".to_string(),
            value: listing.price.clone(),
            inline: true,
        },
        EmbedField {
            name: "Status".to_string(),
            value: listing.status.clone().unwrap_or_else(|| "N/A".to_string()),
            inline: true,
        },
    ];
    if let Some(stock) = listing.stock {
        fields.push(EmbedField {
            name: "Stock".to_string(),
            value: stock.to_string(),
            inline: true,
        });
    }

    Embed {
        title: format!("{prefix}: {}", listing.title),
        url: listing.url.clone(),
        color: EMBED_COLOR_GREEN,
        description,
        fields,
        thumbnail: listing.photo.clone().map(|url| Thumbnail { url }),
    }
}

/// Where notifications go. Sending never fails from the caller's point of
/// view; delivery problems are the sink's to log.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, embed: Embed);
}

/// Sink for sources with no configured webhook.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn send(&self, embed: Embed) {
        info!(title = %embed.title, "no webhook configured, dropping notification");
    }
}

#[derive(Debug)]
pub struct DiscordWebhook {
    client: reqwest::Client,
    webhook_url: String,
    pacing: Duration,
}

impl DiscordWebhook {
    pub fn new(webhook_url: impl Into<String>, pacing: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            pacing,
        }
    }
}

#[async_trait]
impl NotificationSink for DiscordWebhook {
    async fn send(&self, embed: Embed) {
        let payload = WebhookPayload { embeds: [&embed] };
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => {
                tokio::time::sleep(self.pacing).await;
            }
            Err(err) => {
                warn!(title = %embed.title, error = %err, "failed to deliver notification");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> RawListing {
        RawListing {
            url: "https://ohora.co.jp/products/set-134-j".into(),
            title: "N Blossom Bloom".into(),
            price: "¥2,300".into(),
            status: Some("in stock".into()),
            photo: Some("https://cdn.ohora.example/set-134.jpg".into()),
            stock: None,
        }
    }

    #[test]
    fn embed_matches_webhook_wire_format() {
        let embed = listing_embed("New Listing", &listing(), &[]);
        let payload = serde_json::to_value(WebhookPayload { embeds: [&embed] }).unwrap();

        assert_eq!(
            payload["embeds"][0]["title"],
            "New Listing: N Blossom Bloom"
        );
        assert_eq!(payload["embeds"][0]["color"], 0x00ff00);
        assert_eq!(payload["embeds"][0]["fields"][0]["name"], "Price");
        assert_eq!(payload["embeds"][0]["fields"][0]["inline"], true);
        assert_eq!(payload["embeds"][0]["fields"][1]["value"], "in stock");
        assert_eq!(
            payload["embeds"][0]["thumbnail"]["url"],
            "https://cdn.ohora.example/set-134.jpg"
        );
        // Empty change list leaves the description off the wire entirely.
        assert!(payload["embeds"][0].get("description").is_none());
    }

    #[test]
    fn changes_render_as_description_lines() {
        let embed = listing_embed(
            "Listing Updated",
            &listing(),
            &["Price changed from ¥2,300 to ¥1,980".to_string()],
        );
        assert_eq!(
            embed.description,
            "**Changes:**\nPrice changed from ¥2,300 to ¥1,980"
        );
    }

    #[test]
    fn missing_status_renders_as_na_and_stock_gets_a_field() {
        let mut listing = listing();
        listing.status = None;
        listing.stock = Some(45);
        let embed = listing_embed("New Listing", &listing, &[]);
        assert_eq!(embed.fields[1].value, "N/A");
        assert_eq!(embed.fields[2].name, "Stock");
        assert_eq!(embed.fields[2].value, "45");
    }
}
