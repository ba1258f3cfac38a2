use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hub_core::{Cursor, RawPayload, SourceDomain};
use hub_storage::{BackoffPolicy, FetchError, HttpFetcher};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::{sequence_records, AdapterContext, AdapterError, RawBatch, SourceAdapter};

pub const CARBON_API_BASE_URL: &str = "https://api.carbonintensity.org.uk";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Region(u32),
    Postcode(String),
}

impl Target {
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Target::Region(id) => format!("{base}/regional/regionid/{id}"),
            Target::Postcode(pc) => format!("{base}/regional/postcode/{}", pc.replace(' ', "")),
        }
    }

    fn annotate(&self, window: &mut Map<String, JsonValue>) {
        match self {
            Target::Region(id) => {
                window.insert("region_id_queried".into(), JsonValue::from(*id));
            }
            Target::Postcode(pc) => {
                window.insert("postcode_queried".into(), JsonValue::from(pc.clone()));
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CarbonIntensityConfig {
    pub base_url: String,
    pub region_ids: Vec<u32>,
    pub postcodes: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl Default for CarbonIntensityConfig {
    /// London regions and outward postcodes.
    fn default() -> Self {
        Self {
            base_url: CARBON_API_BASE_URL.to_string(),
            region_ids: vec![10, 11, 12, 13],
            postcodes: [
                "SW1A", "E1", "WC2N", "W1", "WC1", "EC1", "E2", "E3", "E14", "W2", "W6", "W8",
                "W11", "N1", "N7", "NW1", "NW3", "SW3", "SW7", "SE1", "SE10", "BR1", "HA1", "IG1",
                "TW9", "CR0",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl CarbonIntensityConfig {
    /// Region ids first, then postcodes; the cursor position indexes this list.
    pub fn targets(&self) -> Vec<Target> {
        self.region_ids
            .iter()
            .copied()
            .map(Target::Region)
            .chain(self.postcodes.iter().cloned().map(Target::Postcode))
            .collect()
    }
}

/// Split a regional response into one payload per forecast window, carrying the
/// region fields and the queried target along.
pub(crate) fn split_windows(target: &Target, body: &JsonValue) -> Vec<JsonValue> {
    let Some(region) = body
        .get("data")
        .and_then(JsonValue::as_array)
        .and_then(|d| d.first())
    else {
        return Vec::new();
    };
    let windows = region
        .get("data")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();

    windows
        .into_iter()
        .filter_map(|window| {
            let JsonValue::Object(mut window) = window else {
                return None;
            };
            for key in ["regionid", "shortname", "dnoregion", "postcode"] {
                if let Some(v) = region.get(key) {
                    window.insert(key.to_string(), v.clone());
                }
            }
            target.annotate(&mut window);
            Some(JsonValue::Object(window))
        })
        .collect()
}

/// Windows of one target's response. A body that is not JSON yields none.
pub(crate) fn windows_from_body(target: &Target, url: &str, body: &[u8]) -> Vec<JsonValue> {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(body) => split_windows(target, &body),
        Err(err) => {
            warn!(%url, error = %err, "malformed JSON from target");
            Vec::new()
        }
    }
}

/// Polled regional carbon-intensity API. One batch is one target.
pub struct CarbonIntensityAdapter {
    source_id: String,
    config: CarbonIntensityConfig,
    targets: Vec<Target>,
    http: Arc<HttpFetcher>,
}

impl CarbonIntensityAdapter {
    pub fn new(source_id: &str, config: CarbonIntensityConfig, http: Arc<HttpFetcher>) -> Self {
        let targets = config.targets();
        Self {
            source_id: source_id.to_string(),
            config,
            targets,
            http,
        }
    }

    fn unavailable(&self, err: impl ToString) -> AdapterError {
        AdapterError::SourceUnavailable {
            source_id: self.source_id.clone(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CarbonIntensityAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn domain(&self) -> SourceDomain {
        SourceDomain::CarbonIntensity
    }

    async fn next_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError> {
        let Some(target) = self.targets.get(cursor.position as usize) else {
            return Ok(None);
        };
        let url = target.url(&self.config.base_url);

        let windows = match self
            .http
            .fetch_bytes_with(ctx.run_id, &self.source_id, &url, &self.config.backoff)
            .await
        {
            Ok(resp) => windows_from_body(target, &url, &resp.body),
            Err(err @ FetchError::HttpStatus { .. }) if !err.retries_exhausted() => {
                warn!(source_id = %self.source_id, %url, status = ?err.status(), "target skipped");
                Vec::new()
            }
            Err(err) => return Err(self.unavailable(err)),
        };
        if windows.is_empty() {
            warn!(source_id = %self.source_id, %url, "no intensity data for target");
        }

        let fetched_at = Utc::now();
        let records = sequence_records(
            &self.source_id,
            cursor,
            windows.into_iter().enumerate().map(|(i, value)| {
                (fetched_at, format!("{url}#{i}"), RawPayload::Tree { value })
            }),
        );
        let next_cursor = cursor.advance(1, records.len() as u64);
        info!(source_id = %self.source_id, %url, records = records.len(), "target fetched");
        Ok(Some(RawBatch {
            records,
            next_cursor,
        }))
    }
}
