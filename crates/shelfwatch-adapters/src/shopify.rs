//! Shopify-style `/products.json` feed adapter.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use shelfwatch_core::{ProductDetail, RawListing};
use shelfwatch_storage::HttpFetcher;
use tracing::{debug, warn};

use crate::{AdapterError, ListingSource};

const PAGE_SIZE: usize = 250;
const MAX_PAGES: usize = 100;

/// One storefront serving the standard paginated product feed. The feed is
/// public and stable across Shopify shops; only the base URL, the product
/// path, and an optional handle/SKU prefix filter vary per site.
#[derive(Debug, Clone, Copy)]
pub struct ShopifyFeedSource {
    pub source_id: &'static str,
    pub base_url: &'static str,
    /// Path prefix product URLs are built under, e.g. `/products` or a
    /// collection-scoped variant.
    pub product_path_prefix: &'static str,
    /// Keep only products whose handle or first-variant SKU starts with this.
    pub handle_prefix: Option<&'static str>,
    /// Surface summed variant inventory as a stock count when exposed.
    pub track_stock: bool,
    /// Whether this source supports detail-page scraping for uploads.
    pub detail_pages: bool,
}

#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    products: Vec<FeedProduct>,
}

#[derive(Debug, Deserialize)]
struct FeedProduct {
    handle: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    variants: Vec<FeedVariant>,
    #[serde(default)]
    images: Vec<FeedImage>,
}

#[derive(Debug, Deserialize)]
struct FeedVariant {
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    inventory_quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FeedImage {
    src: String,
}

fn absolutize_photo(src: &str) -> String {
    if src.starts_with("http") {
        src.to_string()
    } else {
        format!("https:{src}")
    }
}

impl ShopifyFeedSource {
    fn keeps(&self, product: &FeedProduct) -> bool {
        let Some(prefix) = self.handle_prefix else {
            return true;
        };
        if product.handle.to_lowercase().starts_with(prefix) {
            return true;
        }
        product
            .variants
            .first()
            .and_then(|v| v.sku.as_deref())
            .map(|sku| sku.to_lowercase().starts_with(prefix))
            .unwrap_or(false)
    }

    fn listing_from(&self, product: &FeedProduct) -> Option<RawListing> {
        let main_variant = product.variants.first()?;
        let available = product
            .variants
            .iter()
            .any(|v| v.available.unwrap_or(false));
        let photo = product
            .images
            .first()
            .map(|image| absolutize_photo(&image.src));
        let stock = if self.track_stock {
            let quantities: Vec<i64> = product
                .variants
                .iter()
                .filter_map(|v| v.inventory_quantity)
                .collect();
            if quantities.is_empty() {
                None
            } else {
                Some(quantities.iter().sum())
            }
        } else {
            None
        };

        Some(RawListing {
            url: format!(
                "{}{}/{}",
                self.base_url, self.product_path_prefix, product.handle
            ),
            title: product.title.clone(),
            price: format!("¥{}", main_variant.price.as_deref().unwrap_or("0")),
            status: Some(if available { "in stock" } else { "sold out" }.to_string()),
            photo,
            stock,
        })
    }

    fn parse_feed(&self, page: &FeedPage) -> Vec<RawListing> {
        page.products
            .iter()
            .filter(|product| self.keeps(product))
            .filter_map(|product| self.listing_from(product))
            .collect()
    }
}

#[async_trait]
impl ListingSource for ShopifyFeedSource {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawListing>, AdapterError> {
        let mut results = Vec::new();

        for page_no in 1..=MAX_PAGES {
            let url = format!(
                "{}/products.json?limit={PAGE_SIZE}&page={page_no}",
                self.base_url
            );
            let page: FeedPage = http.fetch_json(&url).await?;
            if page.products.is_empty() {
                break;
            }
            let parsed = self.parse_feed(&page);
            debug!(
                source = self.source_id,
                page = page_no,
                kept = parsed.len(),
                "scraped feed page"
            );
            results.extend(parsed);
        }

        Ok(results)
    }

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        url: &str,
    ) -> Result<Option<ProductDetail>, AdapterError> {
        if !self.detail_pages {
            return Ok(None);
        }
        let body = http.fetch_text(url).await?;
        match parse_detail_page(url, &body) {
            Some(detail) => Ok(Some(detail)),
            None => {
                warn!(source = self.source_id, url, "detail page had no usable product data");
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonLdProduct {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    sku: Option<String>,
    #[serde(default)]
    offers: Vec<JsonLdOffer>,
}

#[derive(Debug, Deserialize)]
struct JsonLdOffer {
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    availability: Option<String>,
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text: String = document.select(&sel).next()?.text().collect();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn select_attrs(document: &Html, selector: &str, attr: &str) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|node| node.value().attr(attr))
        .map(absolutize_photo)
        .collect()
}

fn price_number(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

/// Pull product details out of a Shopify product page: direct CSS selectors
/// first, JSON-LD as the fallback for anything missing.
pub fn parse_detail_page(url: &str, body: &str) -> Option<ProductDetail> {
    let document = Html::parse_document(body);

    let json_ld: Option<JsonLdProduct> = Selector::parse("script[type=\"application/ld+json\"]")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .filter_map(|node| {
                    serde_json::from_str::<JsonLdProduct>(&node.text().collect::<String>()).ok()
                })
                .next()
        });

    let name = select_text(&document, "h1.product-single__title")
        .or_else(|| json_ld.as_ref().and_then(|p| p.name.clone()))?;

    let description = select_text(&document, "div.rte[itemprop=\"description\"]")
        .or_else(|| json_ld.as_ref().and_then(|p| p.description.clone()))
        .unwrap_or_default();

    let sku = select_text(&document, "span[data-sku-id]")
        .or_else(|| json_ld.as_ref().and_then(|p| p.sku.clone()));

    let msrp = select_text(&document, "span.product__price")
        .and_then(|text| price_number(&text))
        .or_else(|| {
            json_ld
                .as_ref()
                .and_then(|p| p.offers.first())
                .and_then(|offer| match &offer.price {
                    Some(serde_json::Value::Number(n)) => n.as_f64(),
                    Some(serde_json::Value::String(s)) => price_number(s),
                    _ => None,
                })
        })
        .unwrap_or(0.0);

    let is_active = json_ld
        .as_ref()
        .and_then(|p| p.offers.first())
        .and_then(|offer| offer.availability.as_deref())
        .map(|availability| availability.contains("InStock"))
        .unwrap_or_else(|| {
            // No add-to-cart button marked sold out means purchasable.
            Selector::parse("button[data-add-to-cart-text=\"Sold out\"]")
                .map(|sel| document.select(&sel).next().is_none())
                .unwrap_or(true)
        });

    let mut image_urls = select_attrs(&document, "div.product__main-photos img", "src");
    if image_urls.is_empty() {
        image_urls = select_attrs(&document, "a.product__thumb", "href");
    }

    Some(ProductDetail {
        product_url: url.to_string(),
        name,
        description,
        sku,
        msrp,
        is_active,
        image_urls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_page(json: &str) -> FeedPage {
        serde_json::from_str(json).unwrap()
    }

    const FEED: &str = r#"{
        "products": [
            {
                "handle": "gmp-petaly-05",
                "title": "Gel Me Petaly 05",
                "variants": [
                    {"price": "1826", "available": false, "sku": "GMP05", "inventory_quantity": 0},
                    {"price": "1826", "available": true, "sku": "GMP05-B", "inventory_quantity": 12}
                ],
                "images": [{"src": "//cdn.shop.example/petaly-05.jpg"}]
            },
            {
                "handle": "other-brand-set",
                "title": "Unrelated Set",
                "variants": [{"price": "2300", "available": true, "sku": "XX-1"}],
                "images": []
            }
        ]
    }"#;

    #[test]
    fn feed_parse_builds_listing_from_first_variant() {
        let source = crate::esshimo_jp_source();
        let listings = source.parse_feed(&feed_page(FEED));
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].url, "https://esshimo.jp/products/gmp-petaly-05");
        assert_eq!(listings[0].price, "¥1826");
        assert_eq!(listings[0].status.as_deref(), Some("in stock"));
        assert_eq!(
            listings[0].photo.as_deref(),
            Some("https://cdn.shop.example/petaly-05.jpg")
        );
        assert_eq!(listings[0].stock, None);
    }

    #[test]
    fn availability_considers_every_variant() {
        let source = crate::esshimo_jp_source();
        let page = feed_page(
            r#"{"products": [{"handle": "a", "title": "A",
                "variants": [{"price": "100", "available": false}], "images": []}]}"#,
        );
        let listings = source.parse_feed(&page);
        assert_eq!(listings[0].status.as_deref(), Some("sold out"));
    }

    #[test]
    fn handle_prefix_filter_checks_handle_and_sku() {
        let source = crate::cosme_jp_source();
        let listings = source.parse_feed(&feed_page(FEED));
        assert_eq!(listings.len(), 1);
        assert!(listings[0].url.ends_with("gmp-petaly-05"));

        let by_sku = feed_page(
            r#"{"products": [{"handle": "spring-sale-12", "title": "S",
                "variants": [{"price": "100", "available": true, "sku": "GMP12"}], "images": []}]}"#,
        );
        assert_eq!(source.parse_feed(&by_sku).len(), 1);
    }

    #[test]
    fn stock_tracking_sums_variant_inventory() {
        let source = crate::seven_nana_jp_source();
        let listings = source.parse_feed(&feed_page(FEED));
        assert_eq!(listings[0].stock, Some(12));
    }

    #[test]
    fn products_without_variants_are_skipped() {
        let source = crate::esshimo_jp_source();
        let page = feed_page(r#"{"products": [{"handle": "x", "title": "X", "variants": [], "images": []}]}"#);
        assert!(source.parse_feed(&page).is_empty());
    }

    const DETAIL_HTML: &str = r#"
        <html><body>
        <h1 class="product-single__title">ジェルミーペタリー L5 ココマンゴー</h1>
        <span class="product__price"><span aria-hidden="true">¥1,826</span></span>
        <div class="rte" itemprop="description"><p>Semi-cured gel nail strips.</p></div>
        <span data-sku-id>GMP-L5</span>
        <div class="product__main-photos">
            <img src="//cdn.shop.example/l5-main.jpg">
            <img src="//cdn.shop.example/l5-alt.jpg">
        </div>
        <script type="application/ld+json">
            {"name": "Gel Me Petaly L5", "description": "fallback", "sku": "GMP-L5",
             "offers": [{"price": "1826", "availability": "http://schema.org/InStock"}]}
        </script>
        </body></html>
    "#;

    #[test]
    fn detail_page_prefers_css_and_falls_back_to_json_ld() {
        let detail = parse_detail_page("https://shop-cosmedebeaute.com/products/gmp-l5", DETAIL_HTML)
            .unwrap();
        assert_eq!(detail.name, "ジェルミーペタリー L5 ココマンゴー");
        assert_eq!(detail.sku.as_deref(), Some("GMP-L5"));
        assert_eq!(detail.msrp, 1826.0);
        assert!(detail.is_active);
        assert_eq!(detail.image_urls.len(), 2);
        assert_eq!(detail.description, "Semi-cured gel nail strips.");
    }

    #[test]
    fn detail_page_without_name_is_rejected() {
        assert!(parse_detail_page("https://x/products/y", "<html><body></body></html>").is_none());
    }
}
