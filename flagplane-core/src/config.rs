//! Daemon configuration file.
//!
//! # Storage layout
//!
//! ```text
//! ~/.flagplane/
//!   config.yaml
//! ```
//!
//! ```yaml
//! sources:
//!   - uri: /etc/flags/base.json
//!   - uri: /etc/flags/overrides.yaml
//!     selector: overrides
//! debounce_ms: 500
//! subscriber_buffer: 16
//! ```
//!
//! # API pattern
//!
//! Every function takes the home directory explicitly (`fn_at(home, …)`);
//! the CLI resolves it once and tests pass a `TempDir`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// One file-backed configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub uri: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl SourceConfig {
    pub fn new(uri: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            selector: None,
        }
    }

    /// Source identifier: the uri as written.
    pub fn id(&self) -> String {
        self.uri.display().to_string()
    }

    /// Selector stamped on this source's flags; defaults to the source id.
    pub fn selector(&self) -> String {
        self.selector.clone().unwrap_or_else(|| self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Ordered by priority: later sources win read-side ties.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Bound on each subscriber's delivery queue.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}

impl DaemonConfig {
    /// Source ids in priority order.
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(SourceConfig::id).collect()
    }

    /// Append sources given on the command line after the file's own.
    pub fn with_extra_sources(mut self, uris: impl IntoIterator<Item = PathBuf>) -> Self {
        self.sources.extend(uris.into_iter().map(SourceConfig::new));
        self
    }

    /// Reject configurations that name one source twice.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for id in self.source_ids() {
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateSource(id));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<home>/.flagplane/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".flagplane").join("config.yaml")
}

/// Load the config, or the default config when the file does not exist.
pub fn load_at(home: &Path) -> Result<DaemonConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// Atomically save the config: `.yaml.tmp` sibling, then `rename`.
pub fn save_at(home: &Path, config: &DaemonConfig) -> Result<(), ConfigError> {
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(config)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
