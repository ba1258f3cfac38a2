use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hub_core::{Cursor, RawPayload, SourceDomain};
use hub_storage::{BackoffPolicy, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::{sequence_records, AdapterContext, AdapterError, RawBatch, SourceAdapter};

#[derive(Debug, Clone)]
pub struct PropertyListingConfig {
    /// Listing page URL with a 1-based `{page}` placeholder.
    pub listing_url_template: String,
    pub detail_link_selector: String,
    pub max_pages: Option<u64>,
    pub backoff: BackoffPolicy,
}

impl PropertyListingConfig {
    pub fn new(listing_url_template: impl Into<String>) -> Self {
        Self {
            listing_url_template: listing_url_template.into(),
            detail_link_selector: ".listing-card a[href]".to_string(),
            max_pages: None,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn listing_url(&self, page: u64) -> String {
        self.listing_url_template.replace("{page}", &page.to_string())
    }
}

/// Scraped listing source. One batch is one listing page: its detail pages,
/// in link order. The cursor position counts listing pages consumed in the pass.
pub struct PropertyListingAdapter {
    source_id: String,
    config: PropertyListingConfig,
    http: Arc<HttpFetcher>,
}

impl PropertyListingAdapter {
    pub fn new(source_id: &str, config: PropertyListingConfig, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.to_string(),
            config,
            http,
        }
    }
}

/// Absolute detail URLs found on a listing page, first occurrence order, no duplicates.
pub(crate) fn detail_links(
    listing_html: &str,
    listing_url: &str,
    link_selector: &str,
) -> Result<Vec<String>, AdapterError> {
    let selector = Selector::parse(link_selector)
        .map_err(|e| AdapterError::Message(format!("invalid detail link selector: {e}")))?;
    let base = Url::parse(listing_url)
        .map_err(|e| AdapterError::Message(format!("invalid listing url {listing_url}: {e}")))?;
    let document = Html::parse_document(listing_html);

    let mut links: Vec<String> = Vec::new();
    for href in document
        .select(&selector)
        .filter_map(|n| n.value().attr("href"))
    {
        let Ok(resolved) = base.join(href.trim()) else {
            continue;
        };
        let resolved = resolved.to_string();
        if !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    Ok(links)
}

#[async_trait]
impl SourceAdapter for PropertyListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn domain(&self) -> SourceDomain {
        SourceDomain::PropertyListing
    }

    async fn next_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError> {
        if self.config.max_pages.is_some_and(|max| cursor.position >= max) {
            return Ok(None);
        }
        let page = cursor.position + 1;
        let listing_url = self.config.listing_url(page);

        let listing = self
            .http
            .fetch_bytes_with(ctx.run_id, &self.source_id, &listing_url, &self.config.backoff)
            .await
            .map_err(|e| AdapterError::SourceUnavailable {
                source_id: self.source_id.clone(),
                reason: e.to_string(),
            })?;
        let listing_html = String::from_utf8_lossy(&listing.body);
        let links = detail_links(&listing_html, &listing.final_url, &self.config.detail_link_selector)?;
        if links.is_empty() {
            info!(source_id = %self.source_id, page, "listing page empty; pass complete");
            return Ok(None);
        }

        let mut fetched = Vec::with_capacity(links.len());
        for link in links {
            let payload = match self
                .http
                .fetch_bytes_with(ctx.run_id, &self.source_id, &link, &self.config.backoff)
                .await
            {
                Ok(resp) => RawPayload::Bytes {
                    content_type: resp.content_type,
                    body: resp.body,
                },
                Err(err) => {
                    warn!(source_id = %self.source_id, url = %link, error = %err, "detail page unavailable");
                    RawPayload::Unavailable {
                        reason: err.to_string(),
                    }
                }
            };
            fetched.push((Utc::now(), link, payload));
        }

        let records = sequence_records(&self.source_id, cursor, fetched);
        let next_cursor = cursor.advance(1, records.len() as u64);
        info!(source_id = %self.source_id, page, records = records.len(), "listing page fetched");
        Ok(Some(RawBatch {
            records,
            next_cursor,
        }))
    }
}
