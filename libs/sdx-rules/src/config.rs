//! Rule manager configuration
//!
//! Layered with figment: built-in defaults, then an optional YAML file, then
//! `SDX_`-prefixed environment variables (`SDX_DB_PATH`, `SDX_RETRY_DELAY_MS`, ...).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SDX_";

/// Rule manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// SQLite database file
    pub db_path: PathBuf,
    /// User name marking system-generated rules, purged at startup
    pub autogenerated_user: String,
    /// Minimum delay before a timer retries a failed transition
    pub retry_delay_ms: u64,
    /// Log level used by binaries embedding the manager
    pub log_level: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/sdxctlr.db"),
            autogenerated_user: "AUTOGENERATED".to_string(),
            retry_delay_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Load defaults, then `path` if it exists, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ManagerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment.merge(Env::prefixed(ENV_PREFIX)).extract()?;
        Ok(config)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.autogenerated_user, "AUTOGENERATED");
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.db_path, PathBuf::from("data/sdxctlr.db"));
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "db_path: /tmp/rules.db").unwrap();
        writeln!(file, "retry_delay_ms: 250").unwrap();

        let config = ManagerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/rules.db"));
        assert_eq!(config.retry_delay_ms, 250);
        assert_eq!(config.autogenerated_user, "AUTOGENERATED");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ManagerConfig::load(Some(Path::new("/nonexistent/sdx.yaml"))).unwrap();
        assert_eq!(config.log_level, ManagerConfig::default().log_level);
    }
}
