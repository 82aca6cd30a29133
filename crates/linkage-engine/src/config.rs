use std::time::Duration;

use serde::Deserialize;

use crate::backoff::BackoffPolicy;
use crate::error::LinkageError;
use crate::notifications::PromptLifetimes;

/// Engine settings, read from `LINKAGE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_authority_base_url")]
    pub authority_base_url: String,
    #[serde(default)]
    pub authority_token: Option<String>,
    #[serde(default)]
    pub event_stream_url: Option<String>,
    #[serde(default)]
    pub push_socket_url: Option<String>,
    #[serde(default = "default_pending_timeout_ms")]
    pub pending_timeout_ms: u64,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub auto_sync_interval_ms: Option<u64>,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: u32,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_prompt_ttl_ms")]
    pub prompt_ttl_ms: u64,
    #[serde(default = "default_acceptance_prompt_ttl_ms")]
    pub acceptance_prompt_ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            authority_base_url: default_authority_base_url(),
            authority_token: None,
            event_stream_url: None,
            push_socket_url: None,
            pending_timeout_ms: default_pending_timeout_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            auto_sync_interval_ms: None,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_max_ms: default_reconnect_max_ms(),
            prompt_ttl_ms: default_prompt_ttl_ms(),
            acceptance_prompt_ttl_ms: default_acceptance_prompt_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, LinkageError> {
        ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix("LINKAGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<EngineConfig>())
            .map(EngineConfig::normalize)
            .map_err(|err| LinkageError::Config(err.to_string()))
    }

    fn normalize(mut self) -> Self {
        self.authority_token = Self::normalize_opt(self.authority_token.take());
        self.event_stream_url = Self::normalize_opt(self.event_stream_url.take());
        self.push_socket_url = Self::normalize_opt(self.push_socket_url.take());
        self.auto_sync_interval_ms = self.auto_sync_interval_ms.filter(|ms| *ms > 0);
        self.reconnect_multiplier = self.reconnect_multiplier.max(1);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Bound on a single link or unlink round trip.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auto_sync_interval(&self) -> Option<Duration> {
        self.auto_sync_interval_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            multiplier: self.reconnect_multiplier,
            ceiling: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn prompt_lifetimes(&self) -> PromptLifetimes {
        PromptLifetimes {
            acceptance: Duration::from_millis(self.acceptance_prompt_ttl_ms),
            default: Duration::from_millis(self.prompt_ttl_ms),
        }
    }
}

fn default_authority_base_url() -> String {
    "http://127.0.0.1:8080".into()
}

fn default_pending_timeout_ms() -> u64 {
    30_000
}

fn default_batch_timeout_ms() -> u64 {
    20_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_multiplier() -> u32 {
    2
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_prompt_ttl_ms() -> u64 {
    15_000
}

fn default_acceptance_prompt_ttl_ms() -> u64 {
    120_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_log_filter() -> String {
    "info,linkage=debug".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "LINKAGE_AUTHORITY_BASE_URL",
        "LINKAGE_AUTHORITY_TOKEN",
        "LINKAGE_EVENT_STREAM_URL",
        "LINKAGE_PENDING_TIMEOUT_MS",
        "LINKAGE_AUTO_SYNC_INTERVAL_MS",
        "LINKAGE_RECONNECT_MULTIPLIER",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        clear_env();
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.authority_base_url, "http://127.0.0.1:8080");
        assert_eq!(config.pending_timeout(), Duration::from_secs(30));
        assert_eq!(config.batch_timeout(), Duration::from_secs(20));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.event_stream_url.is_none());
        assert!(config.auto_sync_interval().is_none());
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert_eq!(config.prompt_lifetimes(), PromptLifetimes::default());
    }

    #[test]
    #[serial]
    fn env_overrides_and_blank_values() {
        clear_env();
        std::env::set_var("LINKAGE_AUTHORITY_BASE_URL", "https://authority.test/v1");
        std::env::set_var("LINKAGE_AUTHORITY_TOKEN", "   ");
        std::env::set_var("LINKAGE_EVENT_STREAM_URL", "https://authority.test/v1/events");
        std::env::set_var("LINKAGE_PENDING_TIMEOUT_MS", "5000");
        std::env::set_var("LINKAGE_AUTO_SYNC_INTERVAL_MS", "60000");
        std::env::set_var("LINKAGE_RECONNECT_MULTIPLIER", "0");

        let config = EngineConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.authority_base_url, "https://authority.test/v1");
        assert!(config.authority_token.is_none());
        assert_eq!(
            config.event_stream_url.as_deref(),
            Some("https://authority.test/v1/events")
        );
        assert_eq!(config.pending_timeout(), Duration::from_secs(5));
        assert_eq!(config.auto_sync_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.backoff_policy().multiplier, 1);
    }

    #[test]
    #[serial]
    fn unparsable_numbers_are_config_errors() {
        clear_env();
        std::env::set_var("LINKAGE_PENDING_TIMEOUT_MS", "soon");
        let err = EngineConfig::from_env().unwrap_err();
        clear_env();
        assert_eq!(err.kind(), "config");
    }
}
