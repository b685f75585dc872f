//! Session tunables.
//!
//! Defaults match the constants the deployed protocol shipped with; a TOML
//! overlay is accepted so product integrations can retune cadence and
//! buffer sizing without a rebuild.

use crate::error::{OtaError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Bounded wait for the peer's Ready reply during the handshake.
    pub handshake_timeout_ms: u64,

    /// Bounded wait for the peer's checkpoint acknowledgement.
    pub checkpoint_timeout_ms: u64,

    /// A checkpoint is taken every this many accepted data frames.
    pub checkpoint_interval: u32,

    /// A checkpoint is also taken once the remaining bytes fall under this.
    pub low_water: u32,

    /// Streaming buffer capacity in bytes.
    pub buffer_capacity: usize,

    /// Largest accepted data-frame payload.
    pub max_payload: usize,

    /// Backend adapter polling interval while waiting for buffered data.
    pub poll_interval_ms: u64,

    /// Single reader wait slice inside the streaming buffer.
    pub read_wait_ms: u64,

    /// Peer send attempts before the send is reported failed.
    pub send_retries: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            checkpoint_timeout_ms: 5_000,
            checkpoint_interval: 5,
            low_water: 0x400,
            buffer_capacity: 4096,
            max_payload: 2048,
            poll_interval_ms: 10,
            read_wait_ms: 100,
            send_retries: 5,
        }
    }
}

impl OtaConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: OtaConfig =
            toml::from_str(text).map_err(|e| OtaError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(OtaError::Config("buffer_capacity must be non-zero".into()));
        }
        if self.max_payload == 0 || self.max_payload > self.buffer_capacity {
            return Err(OtaError::Config(
                "max_payload must be non-zero and fit the buffer".into(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(OtaError::Config(
                "checkpoint_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OtaConfig::default();
        assert_eq!(cfg.checkpoint_interval, 5);
        assert_eq!(cfg.low_water, 1024);
        assert_eq!(cfg.max_payload, 2048);
        assert_eq!(cfg.send_retries, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_toml_overlay() {
        let cfg = OtaConfig::from_toml(
            r#"
            checkpoint_interval = 8
            buffer_capacity = 8192
            "#,
        )
        .unwrap();
        assert_eq!(cfg.checkpoint_interval, 8);
        assert_eq!(cfg.buffer_capacity, 8192);
        // untouched fields keep their defaults
        assert_eq!(cfg.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let err = OtaConfig::from_toml("max_payload = 99999").unwrap_err();
        assert!(matches!(err, OtaError::Config(_)));
    }
}
