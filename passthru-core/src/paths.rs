//! Centralized path configuration.
//!
//! All on-disk locations go through this module so the CLI and any embedding
//! service agree on where configuration and the device ledger live.

use std::path::PathBuf;

/// System-wide configuration directory.
const SYSTEM_CONFIG_DIR: &str = "/etc/passthru";
/// System-wide state directory.
const SYSTEM_DATA_DIR: &str = "/var/lib/passthru";

/// Get the configuration directory.
///
/// Resolution order:
/// 1. `PASSTHRU_CONFIG_DIR` environment variable
/// 2. `/etc/passthru` if it exists (system install)
/// 3. `~/.config/passthru` for user-only installs
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PASSTHRU_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from(SYSTEM_CONFIG_DIR);
    if system_dir.exists() {
        return system_dir;
    }

    dirs::config_dir().map(|d| d.join("passthru")).unwrap_or(system_dir)
}

/// Get the data directory holding the device ledger.
///
/// Resolution order:
/// 1. `PASSTHRU_DATA_DIR` environment variable
/// 2. `/var/lib/passthru` if it exists (system install)
/// 3. `~/.passthru` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PASSTHRU_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from(SYSTEM_DATA_DIR);
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".passthru")).unwrap_or(system_dir)
}

/// Get the configuration file path.
///
/// `PASSTHRU_CONFIG` names the file directly.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PASSTHRU_CONFIG") {
        return PathBuf::from(path);
    }
    config_dir().join("config.json")
}

/// Get the device ledger path.
pub fn state_path() -> PathBuf {
    data_dir().join("devices.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_from_env() {
        std::env::set_var("PASSTHRU_DATA_DIR", "/tmp/passthru-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/passthru-test"));
        assert_eq!(state_path(), PathBuf::from("/tmp/passthru-test/devices.json"));
        std::env::remove_var("PASSTHRU_DATA_DIR");
    }

    #[test]
    fn test_config_path_under_config_dir() {
        if std::env::var("PASSTHRU_CONFIG").is_err() {
            assert!(config_path().starts_with(config_dir()));
        }
    }
}
