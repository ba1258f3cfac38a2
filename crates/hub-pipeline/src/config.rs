use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hub_adapters::{ConnectionSettings, SourceMode};
use hub_core::SourceDomain;
use hub_storage::BackoffPolicy;
use serde::Deserialize;

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    /// PostgreSQL relational sink when set, in-memory otherwise.
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub archive_raw: bool,
    pub reports_enabled: bool,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl HubConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("HUB_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            data_dir: std::env::var("HUB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data")),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            scheduler_enabled: env_flag("HUB_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("HUB_SYNC_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            user_agent: std::env::var("HUB_USER_AGENT")
                .unwrap_or_else(|_| "smart-city-hub/0.1".to_string()),
            http_timeout_secs: std::env::var("HUB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            archive_raw: env_flag("HUB_ARCHIVE_RAW", true),
            reports_enabled: env_flag("HUB_REPORTS_ENABLED", true),
            workspace_root,
        }
    }

    /// Defaults rooted at `workspace_root`, ignoring the environment.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            data_dir: workspace_root.join("data"),
            database_url: None,
            scheduler_enabled: false,
            sync_cron: "0 */30 * * * *".to_string(),
            user_agent: "smart-city-hub/0.1".to_string(),
            http_timeout_secs: 20,
            archive_raw: false,
            reports_enabled: false,
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    pub fn cursors_dir(&self) -> PathBuf {
        self.data_dir.join("cursors")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub domain: SourceDomain,
    #[serde(default)]
    pub mode: SourceMode,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Validation rules file relative to the workspace root; built-in rules otherwise.
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            if source.source_id.contains(':') {
                bail!("source_id {} must not contain ':'", source.source_id);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
