use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Delay before a failed session is retried
pub const RETRY_PAUSE_MS: u64 = 2000;

/// Payload type injected into throwaway offers by the codec prober
pub const PROBE_PAYLOAD_TYPE: u8 = 118;

/// Dynamic RTP payload type range (RFC 3551)
pub const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 96..=127;

/// Reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// WHEP endpoint URL, may carry a `jwt` query parameter
    pub url: String,
    /// Bearer token (takes precedence over the `jwt` query parameter)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Pause before an automatic retry in milliseconds
    pub retry_pause_ms: u64,
    /// Payload type used by the codec prober
    pub probe_payload_type: u8,
    /// Send DELETE to the session URL on explicit close
    pub delete_session_on_close: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            retry_pause_ms: RETRY_PAUSE_MS,
            probe_payload_type: PROBE_PAYLOAD_TYPE,
            delete_session_on_close: false,
        }
    }
}

impl ReaderConfig {
    /// Create config for a stream URL with default settings
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    /// Check values that cannot be caught by deserialization
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(AppError::Config("stream URL is empty".to_string()));
        }
        if !DYNAMIC_PAYLOAD_TYPES.contains(&self.probe_payload_type) {
            return Err(AppError::Config(format!(
                "probe payload type {} outside dynamic range 96-127",
                self.probe_payload_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::default();
        assert_eq!(config.retry_pause(), Duration::from_secs(2));
        assert_eq!(config.probe_payload_type, 118);
        assert!(!config.delete_session_on_close);
    }

    #[test]
    fn test_partial_json() {
        let config: ReaderConfig =
            serde_json::from_str(r#"{"url":"http://localhost:8889/cam/whep"}"#).unwrap();
        assert_eq!(config.url, "http://localhost:8889/cam/whep");
        assert_eq!(config.retry_pause_ms, RETRY_PAUSE_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(ReaderConfig::default().validate().is_err());

        let mut config = ReaderConfig::with_url("http://localhost/whep");
        config.probe_payload_type = 20;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }
}
