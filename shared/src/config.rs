use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::{KeyNamespace, KvError, StoreKey};

pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tuning for connectivity detection, the offline queue and the backend tables
/// the client writes to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub probe_url: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Minimum time the monitor stays Offline after a write failed on the
    /// network. Zero disables the hold.
    pub offline_cooldown_ms: u64,
    pub start_online: bool,
    pub queue_namespace: String,
    pub queue_key: String,
    pub items_table: String,
    pub lists_table: String,
    pub members_table: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            probe_interval_ms: 8_000,
            probe_timeout_ms: 3_000,
            offline_cooldown_ms: 20_000,
            start_online: true,
            queue_namespace: "offline".to_string(),
            queue_key: "queue".to_string(),
            items_table: "items".to_string(),
            lists_table: "lists".to_string(),
            members_table: "list_members".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_url.trim().is_empty() {
            return Err(ConfigError::Invalid("probe_url must not be empty".into()));
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid("probe_interval_ms must be > 0".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".into()));
        }
        if self.probe_timeout_ms >= self.probe_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "probe_timeout_ms ({}) must be shorter than probe_interval_ms ({})",
                self.probe_timeout_ms, self.probe_interval_ms
            )));
        }
        for (field, value) in [
            ("queue_namespace", &self.queue_namespace),
            ("queue_key", &self.queue_key),
            ("items_table", &self.items_table),
            ("lists_table", &self.lists_table),
            ("members_table", &self.members_table),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    /// Where the action queue lives in local storage.
    pub fn queue_store_key(&self) -> Result<StoreKey, KvError> {
        StoreKey::new(KeyNamespace::from_prefix(&self.queue_namespace)?, self.queue_key.clone())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn offline_cooldown(&self) -> Duration {
        Duration::from_millis(self.offline_cooldown_ms)
    }
}
