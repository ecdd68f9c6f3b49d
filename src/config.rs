//! Engine configuration: decision tunables plus storage selection.
//!
//! Loadable from a TOML file; every field has a default so an empty file
//! (or no file at all) is a valid configuration:
//!
//! ```toml
//! [decision]
//! min_sample_size = 30
//! min_lead = 0.0
//!
//! [storage]
//! backend = "sqlite"
//! path = "splitlab.db"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::decision::DecisionConfig;
use crate::error::SplitError;

/// Which event backend the engine opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-lifetime storage. The default for embedding and tests.
    Memory,
    /// Durable single-file log at `path`.
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file, only read for the sqlite backend.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("splitlab.db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decision: DecisionConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load from a TOML file. Unreadable or unparsable files are
    /// configuration errors.
    pub fn load(path: &Path) -> Result<Self, SplitError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SplitError::Configuration(format!("cannot read config {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            SplitError::Configuration(format!("cannot parse config {}: {e}", path.display()))
        })
    }
}
