use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{SealfsError, SealfsResult};

/// Operator settings (loaded from sealfs.toml).
///
/// These only choose defaults for new filesystems and logging; everything
/// needed to open an existing filesystem lives in its security config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SealfsConfig {
    pub logging: LoggingConfig,
    pub kdf: KdfConfig,
    pub format: FormatConfig,
}

impl SealfsConfig {
    /// Load settings from `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> SealfsResult<Self> {
        if !path.exists() {
            tracing::debug!("settings file not found: {} (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| SealfsError::config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Password stretching defaults for `create` and `chpass`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// One of "pkcs5-pbkdf2-hmac-sha256", "scrypt", "argon2id"
    pub pbkdf: String,
    /// Cost parameter (0 = automatic): PBKDF2 iterations, scrypt N, Argon2 time cost
    pub rounds: u32,
    /// Argon2id memory cost in KiB (unset: SEALFS_ARGON2_M_COST or 2^18)
    pub argon2_m_cost: Option<u32>,
    /// Argon2id parallelism (unset: SEALFS_ARGON2_P or 4)
    pub argon2_p: Option<u32>,
}

/// Layout parameters for newly created filesystems
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    /// Format version (1-4)
    pub version: u32,
    /// Content block size (ignored for version 1)
    pub block_size: u32,
    /// Per-block IV size (ignored for version 1)
    pub iv_size: u32,
    /// Maximum random padding added to files, in bytes (0 disables)
    pub max_padding: u32,
    /// Store over-long encrypted names through the lookup table
    pub long_name_component: bool,
    /// Shorthand for version 3 (encrypted timestamps)
    pub store_time: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            pbkdf: "argon2id".into(),
            rounds: 0,
            argon2_m_cost: None,
            argon2_p: None,
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            version: 4,
            block_size: 4096,
            iv_size: 12,
            max_padding: 0,
            long_name_component: false,
            store_time: false,
        }
    }
}

impl FormatConfig {
    /// Version actually used: `store_time` selects format 3.
    pub fn effective_version(&self) -> u32 {
        if self.store_time {
            3
        } else {
            self.version
        }
    }
}
