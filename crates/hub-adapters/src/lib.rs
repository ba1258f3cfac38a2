//! Source adapter contracts, the declarative extractor and adapter implementations.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hub_core::{Cursor, HubError, RawRecord, SourceDomain};
use hub_storage::{BackoffPolicy, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod carbon;
mod extract;
mod fixture;
mod property;
mod tables;

pub use carbon::{CarbonIntensityAdapter, CarbonIntensityConfig, Target};
pub use extract::{Coercion, DefaultPolicy, ExtractionTable, FieldRule, Locator};
pub use fixture::{load_fixture_bundle, FixtureAdapter, FixtureBundle, FixtureRecord};
pub use property::{PropertyListingAdapter, PropertyListingConfig};
pub use tables::{
    builtin_table, carbon_intensity_table, property_listing_table, RENEWABLE_FUELS,
    UK_POSTCODE_PATTERN,
};

pub const CRATE_NAME: &str = "hub-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// Records handed off together, plus the cursor that resumes after them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    pub next_cursor: Cursor,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<AdapterError> for HubError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::SourceUnavailable { source_id, reason } => {
                HubError::SourceUnavailable { source_id, reason }
            }
            other => HubError::Config(other.to_string()),
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn domain(&self) -> SourceDomain;

    /// Fetch the batch starting at `cursor`. `Ok(None)` means the current pass is exhausted.
    /// Fetch sequence numbers are assigned from `cursor.next_sequence`, so the same cursor
    /// always yields the same numbering.
    async fn next_batch(
        &self,
        ctx: &AdapterContext,
        cursor: Cursor,
    ) -> Result<Option<RawBatch>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

/// Connection parameters of one source as declared in `sources.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub listing_url_template: Option<String>,
    pub detail_link_selector: Option<String>,
    pub max_pages: Option<u64>,
    pub base_url: Option<String>,
    pub region_ids: Vec<u32>,
    pub postcodes: Vec<String>,
    /// Per-field CSS selector overrides for scraped sources.
    pub selectors: BTreeMap<String, String>,
    pub fixture_path: Option<String>,
    pub batch_size: Option<usize>,
}

/// Extraction table for a source: the built-in table of its domain with selector overrides.
pub fn extraction_table_for(domain: SourceDomain, settings: &ConnectionSettings) -> ExtractionTable {
    builtin_table(domain).with_selector_overrides(&settings.selectors)
}

pub fn adapter_for_source(
    source_id: &str,
    domain: SourceDomain,
    mode: SourceMode,
    settings: &ConnectionSettings,
    backoff: BackoffPolicy,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    match (mode, domain) {
        (SourceMode::Fixture, _) => {
            let path = settings
                .fixture_path
                .clone()
                .unwrap_or_else(|| format!("fixtures/{source_id}/bundle.json"));
            let bundle = load_fixture_bundle(workspace_root.join(path))?;
            let mut adapter = FixtureAdapter::new(bundle);
            if let Some(batch_size) = settings.batch_size {
                adapter = adapter.with_batch_size(batch_size);
            }
            Ok(Arc::new(adapter))
        }
        (SourceMode::Live, SourceDomain::PropertyListing) => {
            let template = settings.listing_url_template.clone().ok_or_else(|| {
                AdapterError::Message(format!("{source_id}: listing_url_template is required"))
            })?;
            let mut config = PropertyListingConfig::new(template);
            if let Some(selector) = &settings.detail_link_selector {
                config.detail_link_selector = selector.clone();
            }
            config.max_pages = settings.max_pages;
            config.backoff = backoff;
            Ok(Arc::new(PropertyListingAdapter::new(source_id, config, http)))
        }
        (SourceMode::Live, SourceDomain::CarbonIntensity) => {
            let mut config = CarbonIntensityConfig::default();
            if let Some(base_url) = &settings.base_url {
                config.base_url = base_url.clone();
            }
            if !settings.region_ids.is_empty() || !settings.postcodes.is_empty() {
                config.region_ids = settings.region_ids.clone();
                config.postcodes = settings.postcodes.clone();
            }
            config.backoff = backoff;
            Ok(Arc::new(CarbonIntensityAdapter::new(source_id, config, http)))
        }
    }
}

/// Number records from the cursor's next sequence, in payload order.
pub(crate) fn sequence_records(
    source_id: &str,
    cursor: Cursor,
    items: impl IntoIterator<Item = (chrono::DateTime<chrono::Utc>, String, hub_core::RawPayload)>,
) -> Vec<RawRecord> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, (fetched_at, locator, payload))| RawRecord {
            source_id: source_id.to_string(),
            fetch_sequence: cursor.next_sequence + i as u64,
            fetched_at,
            locator,
            payload,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use hub_storage::HttpClientConfig;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[test]
    fn fixture_mode_resolves_default_bundle_path() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
        let adapter = adapter_for_source(
            "london-property",
            SourceDomain::PropertyListing,
            SourceMode::Fixture,
            &ConnectionSettings::default(),
            BackoffPolicy::default(),
            http,
            &workspace_root(),
        )
        .expect("fixture adapter");
        assert_eq!(adapter.source_id(), "london-property");
        assert_eq!(adapter.domain(), SourceDomain::PropertyListing);
    }

    #[test]
    fn live_property_source_needs_a_listing_template() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("client"));
        let err = adapter_for_source(
            "london-property",
            SourceDomain::PropertyListing,
            SourceMode::Live,
            &ConnectionSettings::default(),
            BackoffPolicy::default(),
            http,
            &workspace_root(),
        )
        .err()
        .expect("missing template");
        assert!(err.to_string().contains("listing_url_template"));
    }

    #[test]
    fn adapter_errors_map_onto_the_hub_taxonomy() {
        let err: HubError = AdapterError::SourceUnavailable {
            source_id: "carbon-intensity".into(),
            reason: "timeout".into(),
        }
        .into();
        assert!(matches!(err, HubError::SourceUnavailable { .. }));
    }
}
