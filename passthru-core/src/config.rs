//! Configuration management.

use crate::error::{PassthruError, Result};
use crate::paths;
use crate::pci::{BusyPolicy, LifecycleOptions, ResetPolicy, StubDriver, DEFAULT_SYSFS_ROOT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the Busy retry count.
const MAX_BUSY_RETRIES: u32 = 100;
/// Upper bound for the delay between Busy retries.
const MAX_BUSY_RETRY_DELAY_MS: u64 = 10_000;

/// Persistent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassthruConfig {
    /// Root of the sysfs tree; only changed to point at a synthetic tree.
    pub sysfs_root: PathBuf,
    pub stub_driver: StubDriver,
    pub group_detach: bool,
    pub reset_policy: ResetPolicy,
    pub busy_retries: u32,
    pub busy_retry_delay_ms: u64,
    pub persist_state: bool,
    pub state_file: PathBuf,
    pub log_level: String,
}

impl Default for PassthruConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            stub_driver: StubDriver::default(),
            group_detach: false,
            reset_policy: ResetPolicy::default(),
            busy_retries: 3,
            busy_retry_delay_ms: 100,
            persist_state: true,
            state_file: paths::state_path(),
            log_level: "info".to_string(),
        }
    }
}

impl PassthruConfig {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| PassthruError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| PassthruError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PassthruError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| PassthruError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| PassthruError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Apply `PASSTHRU_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("PASSTHRU_SYSFS_ROOT") {
            self.sysfs_root = PathBuf::from(root);
        }
        if let Some(stub) = lookup("PASSTHRU_STUB_DRIVER") {
            self.stub_driver = stub.parse()?;
        }
        if let Some(group) = lookup("PASSTHRU_GROUP_DETACH") {
            self.group_detach = parse_bool("PASSTHRU_GROUP_DETACH", &group)?;
        }
        if let Some(policy) = lookup("PASSTHRU_RESET_POLICY") {
            self.reset_policy = policy.parse()?;
        }
        if let Some(level) = lookup("PASSTHRU_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    /// Reject settings that would let a Busy device stall callers.
    pub fn validate(&self) -> Result<()> {
        if self.busy_retries > MAX_BUSY_RETRIES {
            return Err(PassthruError::InvalidConfig {
                reason: format!(
                    "busy_retries {} exceeds maximum {}",
                    self.busy_retries, MAX_BUSY_RETRIES
                ),
            });
        }
        if self.busy_retry_delay_ms > MAX_BUSY_RETRY_DELAY_MS {
            return Err(PassthruError::InvalidConfig {
                reason: format!(
                    "busy_retry_delay_ms {} exceeds maximum {}",
                    self.busy_retry_delay_ms, MAX_BUSY_RETRY_DELAY_MS
                ),
            });
        }
        if self.sysfs_root.as_os_str().is_empty() {
            return Err(PassthruError::InvalidConfig {
                reason: "sysfs_root must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn busy_policy(&self) -> BusyPolicy {
        BusyPolicy {
            retries: self.busy_retries,
            delay: Duration::from_millis(self.busy_retry_delay_ms),
        }
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            stub: self.stub_driver,
            group_detach: self.group_detach,
            reset_policy: self.reset_policy,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PassthruError::InvalidConfig {
            reason: format!("{} must be a boolean, got {:?}", key, other),
        }),
    }
}
