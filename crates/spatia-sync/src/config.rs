use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Tunables for the consistency layer. Every field has a default so an empty
/// environment yields a working configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_expiry")]
    pub queue_expiry_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_spatial_interval")]
    pub spatial_interval_ms: u64,
}

impl SyncConfig {
    /// Layers `SPATIA_*` environment variables over the defaults.
    pub fn from_env() -> SyncResult<Self> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("SPATIA")
                    .prefix_separator("_")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<SyncConfig>())
            .map_err(SyncError::from)
            .and_then(SyncConfig::normalize)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn normalize(mut self) -> SyncResult<Self> {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(SyncError::Config("base_url must not be empty".into()));
        }
        self.base_url = trimmed.to_string();
        Url::parse(&self.base_url).map_err(|err| {
            SyncError::Config(format!("invalid base_url {}: {err}", self.base_url))
        })?;

        let checks: [(&str, u64); 6] = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("queue_expiry_ms", self.queue_expiry_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("spatial_interval_ms", self.spatial_interval_ms),
            ("max_failures", u64::from(self.max_failures)),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.queue_capacity == 0 {
            return Err(SyncError::Config(
                "queue_capacity must be greater than zero".into(),
            ));
        }
        Ok(self)
    }

    pub fn base(&self) -> SyncResult<Url> {
        // join() replaces the last segment unless the base ends with '/'
        Url::parse(&format!("{}/", self.base_url))
            .map_err(|err| SyncError::Config(format!("invalid base_url: {err}")))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn queue_expiry(&self) -> Duration {
        Duration::from_millis(self.queue_expiry_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn spatial_interval(&self) -> Duration {
        Duration::from_millis(self.spatial_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            max_failures: default_max_failures(),
            queue_capacity: default_queue_capacity(),
            queue_expiry_ms: default_queue_expiry(),
            request_timeout_ms: default_request_timeout(),
            spatial_interval_ms: default_spatial_interval(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_heartbeat_interval() -> u64 {
    2_000
}

fn default_heartbeat_timeout() -> u64 {
    1_500
}

fn default_max_failures() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    50
}

fn default_queue_expiry() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_spatial_interval() -> u64 {
    500
}
