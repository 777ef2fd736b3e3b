use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Runtime settings for the custody core.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LimsConfig {
    /// Directory of the sled database
    pub db_path: PathBuf,
    /// Zero-padded width of the numeric part of minted lab codes
    pub code_width: usize,
    /// How long a counter allocation waits for the prefix lock
    pub lock_timeout_ms: u64,
    /// Audit action identifiers are truncated to this many characters
    pub audit_action_max_len: usize,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of the compact format
    pub log_json: bool,
}

impl Default for LimsConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("lab-custody.db"),
            code_width: 3,
            lock_timeout_ms: 2_000,
            audit_action_max_len: 64,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl LimsConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: LimsConfig = toml::from_str(raw).context("invalid lab-custody config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.code_width == 0 {
            anyhow::bail!("code_width must be at least 1");
        }
        if self.audit_action_max_len == 0 {
            anyhow::bail!("audit_action_max_len must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config = LimsConfig::from_toml_str("code_width = 4\n").unwrap();
        assert_eq!(config.code_width, 4);
        assert_eq!(config.lock_timeout_ms, 2_000);
        assert_eq!(config.audit_action_max_len, 64);
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(LimsConfig::from_toml_str("code_width = 0\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lims.toml");
        std::fs::write(&path, "log_level = \"debug\"\nlog_json = true\n").unwrap();

        let config = LimsConfig::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.log_json);
    }
}
