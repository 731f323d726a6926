//! Start configuration handed over by the host application

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Where skipped ratchet message keys are kept
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreMode {
    Local,
    Remote,
}

impl Default for KeyStoreMode {
    fn default() -> Self {
        KeyStoreMode::Local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Websocket URL of the private chat backend
    #[serde(default)]
    pub private_chat_endpoint: Option<String>,
    #[serde(default)]
    pub private_chat_bearer_token: Option<String>,
    /// Raises the default log filter to debug; applied by `ChatCore::start`
    /// unless the host already installed a subscriber or set `RUST_LOG`
    #[serde(default)]
    pub enable_debugging: bool,
    #[serde(default)]
    pub key_store: KeyStoreMode,
    #[serde(default = "default_queue_capacity")]
    pub outgoing_queue_capacity: usize,
    #[serde(default = "default_auth_poll_interval_ms")]
    pub auth_poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_key_store_timeout_secs")]
    pub key_store_timeout_secs: u64,
    #[serde(default = "default_signed_pre_key_max_age_days")]
    pub signed_pre_key_max_age_days: i64,
    #[serde(default = "default_max_one_time_pre_keys")]
    pub max_one_time_pre_keys: u32,
}

fn default_database_path() -> String {
    "sealchat.db".to_string()
}

fn default_queue_capacity() -> usize {
    150
}

fn default_auth_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_key_store_timeout_secs() -> u64 {
    8
}

fn default_signed_pre_key_max_age_days() -> i64 {
    7
}

fn default_max_one_time_pre_keys() -> u32 {
    100
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            private_chat_endpoint: None,
            private_chat_bearer_token: None,
            enable_debugging: false,
            key_store: KeyStoreMode::default(),
            outgoing_queue_capacity: default_queue_capacity(),
            auth_poll_interval_ms: default_auth_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            key_store_timeout_secs: default_key_store_timeout_secs(),
            signed_pre_key_max_age_days: default_signed_pre_key_max_age_days(),
            max_one_time_pre_keys: default_max_one_time_pre_keys(),
        }
    }
}

impl CoreConfig {
    /// Parse and validate the host's JSON start config
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("invalid start config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.outgoing_queue_capacity < 1 {
            return Err(CoreError::Validation("outgoing queue capacity must be at least 1".to_string()));
        }
        if self.request_timeout_secs < 1 || self.key_store_timeout_secs < 1 {
            return Err(CoreError::Validation("timeouts must be at least one second".to_string()));
        }
        if self.auth_poll_interval_ms < 1 {
            return Err(CoreError::Validation("auth poll interval must be positive".to_string()));
        }
        if self.max_one_time_pre_keys < 1 {
            return Err(CoreError::Validation("max one-time pre-keys must be at least 1".to_string()));
        }
        if self.signed_pre_key_max_age_days < 1 {
            return Err(CoreError::Validation("signed pre-key validity must be at least a day".to_string()));
        }
        Ok(())
    }

    /// Default `tracing` filter for this config
    pub fn log_filter(&self) -> &'static str {
        if self.enable_debugging {
            "sealchat_core=debug"
        } else {
            "sealchat_core=info"
        }
    }

    pub fn auth_poll_interval(&self) -> Duration {
        Duration::from_millis(self.auth_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn key_store_timeout(&self) -> Duration {
        Duration::from_secs(self.key_store_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = CoreConfig::from_json("{}").unwrap();
        assert_eq!(config.database_path, "sealchat.db");
        assert_eq!(config.outgoing_queue_capacity, 150);
        assert_eq!(config.key_store, KeyStoreMode::Local);
        assert_eq!(config.key_store_timeout(), Duration::from_secs(8));
        assert_eq!(config.max_one_time_pre_keys, 100);
        assert_eq!(config.log_filter(), "sealchat_core=info");
    }

    #[test]
    fn test_host_json() {
        let config = CoreConfig::from_json(
            r#"{
                "databasePath": ":memory:",
                "privateChatEndpoint": "wss://chat.example.org/ws",
                "privateChatBearerToken": "token",
                "enableDebugging": true,
                "keyStore": "remote"
            }"#,
        )
        .unwrap();
        assert_eq!(config.key_store, KeyStoreMode::Remote);
        assert_eq!(config.private_chat_endpoint.as_deref(), Some("wss://chat.example.org/ws"));
        assert_eq!(config.log_filter(), "sealchat_core=debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CoreConfig::from_json(r#"{"outgoingQueueCapacity": 0}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = CoreConfig::from_json(r#"{"requestTimeoutSecs": 0}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = CoreConfig::from_json(r#"{"keyStore": "cloud"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
