//! Source adapter contract and the per-site adapter registry.
//!
//! Each site is a configured instance of one of two adapter families:
//! Shopify-style JSON product feeds and HTML search/collection grids.
//! Parsing is deliberately adapter-local; everything downstream speaks
//! `RawListing`.

use async_trait::async_trait;
use shelfwatch_core::{ProductDetail, RawListing};
use shelfwatch_storage::{FetchError, HttpFetcher};
use thiserror::Error;

mod html;
mod shopify;

pub use html::{GridSelectors, HtmlGridSource, Paging};
pub use shopify::ShopifyFeedSource;

pub const CRATE_NAME: &str = "shelfwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A scrapeable site: fetch its current listings, and optionally the full
/// product page behind one listing (for the storefront upload path).
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawListing>, AdapterError>;

    /// Detail scrape for one product URL. Sources that only feed
    /// notifications return `None`.
    async fn fetch_detail(
        &self,
        _http: &HttpFetcher,
        _url: &str,
    ) -> Result<Option<ProductDetail>, AdapterError> {
        Ok(None)
    }
}

pub fn ohora_us_source() -> HtmlGridSource {
    HtmlGridSource {
        source_id: "ohora-us",
        origin: "https://ohora.com",
        paging: Paging::Numbered {
            template: "https://ohora.com/collections/all-products?sort_by=created-descending&page={page}",
        },
        selectors: GridSelectors {
            item: ".grid div.grid__item",
            title: "a.product-grid-item__title",
            price: ".product-grid-item__price__new",
            price_fallback: Some(".product-grid-item__price"),
            link: "a.product__media__holder",
            image: "img",
            image_attr: "src",
            sold_out: None,
        },
    }
}

pub fn ohora_jp_source() -> HtmlGridSource {
    HtmlGridSource {
        source_id: "ohora-jp",
        origin: "https://ohora.co.jp",
        paging: Paging::Numbered {
            template: "https://ohora.co.jp/collections/all-products?page={page}",
        },
        selectors: GridSelectors {
            item: ".boost-pfs-filter-products div.boost-pfs-filter-product-item",
            title: "a.boost-pfs-filter-product-item-title",
            price: ".boost-pfs-filter-product-item-price span",
            price_fallback: None,
            link: "a.boost-pfs-filter-product-item-title",
            image: "img.boost-pfs-filter-product-item-main-image",
            image_attr: "data-src",
            sold_out: Some(".sold-out"),
        },
    }
}

pub fn ohora_disney_jp_source() -> HtmlGridSource {
    HtmlGridSource {
        source_id: "ohora-disney-jp",
        origin: "https://shopdisney.disney.co.jp",
        paging: Paging::Fixed(&["https://shopdisney.disney.co.jp/special/ohora?sz=100"]),
        selectors: GridSelectors {
            item: "div.product-tile",
            title: "a.product-tile__name",
            price: "span.product-tile__price",
            price_fallback: None,
            link: "a.product-tile__name",
            image: "img.product-tile__image",
            image_attr: "src",
            sold_out: Some(".product-tile__soldout"),
        },
    }
}

pub fn poshmark_source() -> HtmlGridSource {
    HtmlGridSource {
        source_id: "poshmark",
        origin: "https://poshmark.com",
        paging: Paging::Fixed(&[
            "https://poshmark.com/search?query=ohora%20gel%20nail&sort_by=added_desc",
            "https://poshmark.com/search?query=semi%20cured%20gel%20nail&sort_by=added_desc",
            "https://poshmark.com/search?query=ohora&sort_by=added_desc",
        ]),
        selectors: GridSelectors {
            item: "div[data-et-name=\"listing\"]",
            title: "a.tile__title",
            price: "span.p--t--1",
            price_fallback: None,
            link: "a.tile__covershot",
            image: "a.tile__covershot img",
            image_attr: "data-src",
            sold_out: None,
        },
    }
}

pub fn seven_nana_jp_source() -> ShopifyFeedSource {
    ShopifyFeedSource {
        source_id: "seven-nana-jp",
        base_url: "https://7na.jp",
        product_path_prefix: "/products",
        handle_prefix: None,
        track_stock: true,
        detail_pages: false,
    }
}

pub fn dashingdiva_jp_source() -> ShopifyFeedSource {
    ShopifyFeedSource {
        source_id: "dashingdiva-jp",
        base_url: "https://dashingdiva.jp",
        product_path_prefix: "/collections/glaze/products",
        handle_prefix: None,
        track_stock: false,
        detail_pages: false,
    }
}

pub fn cosme_jp_source() -> ShopifyFeedSource {
    ShopifyFeedSource {
        source_id: "cosme-jp",
        base_url: "https://shop-cosmedebeaute.com",
        product_path_prefix: "/products",
        handle_prefix: Some("gmp"),
        track_stock: false,
        detail_pages: true,
    }
}

pub fn esshimo_jp_source() -> ShopifyFeedSource {
    ShopifyFeedSource {
        source_id: "esshimo-jp",
        base_url: "https://esshimo.jp",
        product_path_prefix: "/products",
        handle_prefix: None,
        track_stock: false,
        detail_pages: false,
    }
}

/// Look up the configured adapter for a registry entry.
pub fn source_for_id(source_id: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        "ohora-us" => Some(Box::new(ohora_us_source())),
        "ohora-jp" => Some(Box::new(ohora_jp_source())),
        "ohora-disney-jp" => Some(Box::new(ohora_disney_jp_source())),
        "poshmark" => Some(Box::new(poshmark_source())),
        "seven-nana-jp" => Some(Box::new(seven_nana_jp_source())),
        "dashingdiva-jp" => Some(Box::new(dashingdiva_jp_source())),
        "cosme-jp" => Some(Box::new(cosme_jp_source())),
        "esshimo-jp" => Some(Box::new(esshimo_jp_source())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_known_source() {
        for id in [
            "ohora-us",
            "ohora-jp",
            "ohora-disney-jp",
            "poshmark",
            "seven-nana-jp",
            "dashingdiva-jp",
            "cosme-jp",
            "esshimo-jp",
        ] {
            let adapter = source_for_id(id).unwrap();
            assert_eq!(adapter.source_id(), id);
        }
        assert!(source_for_id("mercari").is_none());
    }
}
