//! HTML search/collection-grid adapter.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use shelfwatch_core::RawListing;
use shelfwatch_storage::HttpFetcher;
use tracing::{debug, warn};

use crate::{AdapterError, ListingSource};

const MAX_PAGES: usize = 100;

/// CSS selectors describing one site's listing grid.
#[derive(Debug, Clone, Copy)]
pub struct GridSelectors {
    /// One listing card.
    pub item: &'static str,
    /// Text of the listing title, inside a card.
    pub title: &'static str,
    /// Text of the display price.
    pub price: &'static str,
    /// Tried when `price` matches nothing (sale vs regular price markup).
    pub price_fallback: Option<&'static str>,
    /// Element whose `href` is the listing URL.
    pub link: &'static str,
    /// Element carrying the listing image.
    pub image: &'static str,
    /// Attribute the image URL lives in (`src`, `data-src`, ...).
    pub image_attr: &'static str,
    /// Badge present when the item is sold out. `None` means the site
    /// exposes no availability at all and listings carry no status.
    pub sold_out: Option<&'static str>,
}

/// How a site's listing pages are enumerated.
#[derive(Debug, Clone, Copy)]
pub enum Paging {
    /// `{page}` in the template is replaced with 1, 2, ... until a page
    /// parses to nothing.
    Numbered { template: &'static str },
    /// A fixed set of URLs, fetched once each (search-phrase sites).
    Fixed(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct HtmlGridSource {
    pub source_id: &'static str,
    /// Origin prepended to relative listing hrefs.
    pub origin: &'static str,
    pub paging: Paging,
    pub selectors: GridSelectors,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|err| AdapterError::Message(err.to_string()))
}

fn element_text(card: &ElementRef, selector: &Selector) -> Option<String> {
    let text: String = card.select(selector).next()?.text().collect();
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl HtmlGridSource {
    fn absolutize(&self, href: &str) -> String {
        if href.starts_with("http") {
            href.to_string()
        } else if href.starts_with("//") {
            format!("https:{href}")
        } else {
            format!("{}{href}", self.origin)
        }
    }

    fn listing_from_card(&self, card: &ElementRef) -> Result<Option<RawListing>, AdapterError> {
        let title_sel = parse_selector(self.selectors.title)?;
        let link_sel = parse_selector(self.selectors.link)?;
        let image_sel = parse_selector(self.selectors.image)?;
        let price_sel = parse_selector(self.selectors.price)?;

        let Some(href) = card
            .select(&link_sel)
            .next()
            .and_then(|node| node.value().attr("href"))
        else {
            return Ok(None);
        };
        // Anchor fragments would split one listing into many keys.
        let url = self.absolutize(href.split('#').next().unwrap_or(href));

        let Some(title) = element_text(card, &title_sel) else {
            return Ok(None);
        };

        let mut price = element_text(card, &price_sel);
        if price.is_none() {
            if let Some(fallback) = self.selectors.price_fallback {
                price = element_text(card, &parse_selector(fallback)?);
            }
        }
        let Some(price) = price else {
            return Ok(None);
        };

        let photo = card
            .select(&image_sel)
            .next()
            .and_then(|node| {
                node.value()
                    .attr(self.selectors.image_attr)
                    .or_else(|| node.value().attr("src"))
            })
            .map(|src| self.absolutize(src.trim()));

        let status = match self.selectors.sold_out {
            Some(badge) => {
                let badge_sel = parse_selector(badge)?;
                Some(
                    if card.select(&badge_sel).next().is_some() {
                        "sold out"
                    } else {
                        "in stock"
                    }
                    .to_string(),
                )
            }
            None => None,
        };

        Ok(Some(RawListing {
            url,
            title,
            price,
            status,
            photo,
            stock: None,
        }))
    }

    pub fn parse_page(&self, body: &str) -> Result<Vec<RawListing>, AdapterError> {
        let document = Html::parse_document(body);
        let item_sel = parse_selector(self.selectors.item)?;

        let mut listings = Vec::new();
        for card in document.select(&item_sel) {
            match self.listing_from_card(&card) {
                Ok(Some(listing)) => listings.push(listing),
                Ok(None) => {}
                Err(err) => {
                    warn!(source = self.source_id, error = %err, "skipping unparseable card");
                }
            }
        }
        Ok(listings)
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        url: &str,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let body = http.fetch_text(url).await?;
        let listings = self.parse_page(&body)?;
        debug!(source = self.source_id, url, count = listings.len(), "scraped page");
        Ok(listings)
    }
}

#[async_trait]
impl ListingSource for HtmlGridSource {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch(&self, http: &HttpFetcher) -> Result<Vec<RawListing>, AdapterError> {
        let mut results = Vec::new();

        match self.paging {
            Paging::Numbered { template } => {
                for page in 1..=MAX_PAGES {
                    let url = template.replace("{page}", &page.to_string());
                    let listings = self.fetch_page(http, &url).await?;
                    if listings.is_empty() {
                        break;
                    }
                    results.extend(listings);
                }
            }
            Paging::Fixed(urls) => {
                for url in urls {
                    results.extend(self.fetch_page(http, url).await?);
                }
            }
        }

        Ok(results)
    }
}
