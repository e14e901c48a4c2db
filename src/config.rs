use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Engine configuration, loaded from `<settings_dir>/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the databases and the vault
    #[serde(default = "Config::default_data_dir")]
    pub data_dir: PathBuf,
    /// Queued runs allowed per action while one is in flight
    #[serde(default = "Config::default_queue_depth")]
    pub queue_depth: usize,
    /// Completed execution records kept in memory
    #[serde(default = "Config::default_history_capacity")]
    pub history_capacity: usize,
    /// Sub-action retry attempts (including the first try)
    #[serde(default = "Config::default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Base delay for the first retry (milliseconds)
    #[serde(default = "Config::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How often the schedule checker ticks (seconds)
    #[serde(default = "Config::default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// Prometheus metrics bind address (disabled when unset)
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Webhook listener bind address (disabled when unset)
    #[serde(default)]
    pub webhook_addr: Option<String>,
}

impl Config {
    fn default_data_dir() -> PathBuf {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".streamrig")
    }

    fn default_queue_depth() -> usize {
        4
    }

    fn default_history_capacity() -> usize {
        256
    }

    fn default_retry_max_attempts() -> u32 {
        3
    }

    fn default_retry_base_delay_ms() -> u64 {
        500
    }

    fn default_scheduler_tick_secs() -> u64 {
        30
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            queue_depth: Self::default_queue_depth(),
            history_capacity: Self::default_history_capacity(),
            retry_max_attempts: Self::default_retry_max_attempts(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            scheduler_tick_secs: Self::default_scheduler_tick_secs(),
            metrics_addr: None,
            webhook_addr: None,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults when absent.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            Self::default_data_dir().join("config.toml")
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = if let Some(p) = path {
            p
        } else {
            self.data_dir.join("config.toml")
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn actions_db_path(&self) -> PathBuf {
        self.data_dir.join("actions.db")
    }

    pub fn variables_db_path(&self) -> PathBuf {
        self.data_dir.join("variables.db")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.data_dir.join("vault")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(Some(temp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.queue_depth, 4);
        assert_eq!(config.retry_max_attempts, 3);
        assert!(config.metrics_addr.is_none());
    }

    #[test]
    fn save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.queue_depth = 1;
        config.metrics_addr = Some("127.0.0.1:9090".into());
        config.save(Some(path.clone())).unwrap();

        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.queue_depth, 1);
        assert_eq!(loaded.metrics_addr.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "queue_depth = 9\n").unwrap();

        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.queue_depth, 9);
        assert_eq!(loaded.scheduler_tick_secs, 30);
    }
}
