// Engine configuration.
//
// Default location: `~/.replica/engine.toml`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root directory for replica global state: `~/.replica/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".replica"))
}

/// Path to the engine config file: `~/.replica/engine.toml`.
pub fn config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("engine.toml"))
}

/// Default file store location: `~/.replica/store`.
pub fn default_data_dir() -> Option<PathBuf> {
    global_dir().map(|d| d.join("store"))
}

// ── Engine config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub persistence: PersistenceConfig,
    pub conflict: ConflictConfig,
    pub degraded: DegradedConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load from `~/.replica/engine.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Store directory from config, falling back to `~/.replica/store`.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.storage.data_dir.clone().or_else(default_data_dir)
    }
}

/// Durable log and snapshot behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Compaction is scheduled once updates since the last compaction exceed this.
    pub compact_threshold: u64,
    /// Start loads from the latest snapshot instead of replaying the whole log.
    pub load_snapshots: bool,
    pub duplicate_check: DuplicateCheck,
    pub load_failure_policy: LoadFailurePolicy,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 500,
            load_snapshots: true,
            duplicate_check: DuplicateCheck::Sha256,
            load_failure_policy: LoadFailurePolicy::MarkLoaded,
        }
    }
}

/// How consecutive byte-identical updates are recognised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCheck {
    /// Compare full payload bytes.
    Structural,
    /// Compare SHA-256 digests.
    Sha256,
    /// Persist everything.
    Disabled,
}

/// What a document becomes after its initial load failed part-way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailurePolicy {
    /// Accept writes anyway; whatever loaded is treated as the document.
    MarkLoaded,
    /// Drop writes until the document is reopened successfully.
    KeepWriteBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConflictConfig {
    /// Window after a local edit during which remote versions are blocked.
    pub guard_window_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self { guard_window_ms: 2_000 }
    }
}

impl ConflictConfig {
    pub fn guard_window(&self) -> Duration {
        Duration::from_millis(self.guard_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DegradedConfig {
    /// Consecutive persistence failures that trip degraded mode.
    pub failure_threshold: u32,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self { failure_threshold: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of concurrently open documents.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
