// Configuration for the transform pipeline and reconnect machine
//
// Every section has defaults, so a JSON document only needs the values it
// overrides.

use std::{path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{stream::DEFAULT_RECEIVE_BUFFER_SIZE, Result, TransformError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream settings
    pub stream: StreamConfig,
    /// Reconnect timing
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.stream.receive_buffer_size == 0 {
            return Err(TransformError::Config("receive_buffer_size must be positive".to_string()));
        }

        self.reconnect.validate()
    }
}

/// Stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest packet accepted; larger ones are dropped
    pub receive_buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
        }
    }
}

/// Reconnect timing, all in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Lower bound of the randomized first reconnect delay
    pub reconnect_delay_min_secs: u64,
    /// Upper bound of the randomized first reconnect delay
    pub reconnect_delay_max_secs: u64,
    /// Cap on the doubled reconnect delay
    pub max_reconnect_delay_secs: u64,
    /// How long all interfaces must stay down before a delayed network-down notification
    pub network_down_threshold_secs: u64,
    /// Delay the network-down notification instead of firing it at once
    pub delay_network_down_notification: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_min_secs: 2,
            reconnect_delay_max_secs: 4,
            max_reconnect_delay_secs: 300,
            network_down_threshold_secs: 30,
            // Mobile links flap while the next connection attaches
            delay_network_down_notification: cfg!(target_os = "android"),
        }
    }
}

impl ReconnectConfig {
    /// Check the delay bounds
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_delay_min_secs > self.reconnect_delay_max_secs {
            return Err(TransformError::Config(format!(
                "reconnect_delay_min_secs ({}) exceeds reconnect_delay_max_secs ({})",
                self.reconnect_delay_min_secs, self.reconnect_delay_max_secs
            )));
        }

        if self.max_reconnect_delay_secs < self.reconnect_delay_max_secs {
            return Err(TransformError::Config(format!(
                "max_reconnect_delay_secs ({}) is below reconnect_delay_max_secs ({})",
                self.max_reconnect_delay_secs, self.reconnect_delay_max_secs
            )));
        }

        Ok(())
    }

    /// Cap on the reconnect delay
    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    /// Network-down notification threshold
    pub fn network_down_threshold(&self) -> Duration {
        Duration::from_secs(self.network_down_threshold_secs)
    }

    /// Randomized first reconnect delay
    pub fn initial_delay(&self) -> Duration {
        let secs = rand::thread_rng().gen_range(self.reconnect_delay_min_secs..=self.reconnect_delay_max_secs);
        Duration::from_secs(secs)
    }

    /// Delay following `previous`: doubled and capped, or the initial delay
    pub fn next_delay(&self, previous: Option<Duration>) -> Duration {
        match previous {
            Some(previous) => previous.saturating_mul(2).min(self.max_reconnect_delay()),
            None => self.initial_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reconnect_constants() {
        let config = Config::default();

        assert_eq!(config.reconnect.reconnect_delay_min_secs, 2);
        assert_eq!(config.reconnect.reconnect_delay_max_secs, 4);
        assert_eq!(config.reconnect.max_reconnect_delay(), Duration::from_secs(300));
        assert_eq!(config.reconnect.network_down_threshold(), Duration::from_secs(30));
        assert_eq!(config.stream.receive_buffer_size, 65535);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json_str(r#"{"reconnect": {"max_reconnect_delay_secs": 60}}"#).unwrap();

        assert_eq!(config.reconnect.max_reconnect_delay_secs, 60);
        assert_eq!(config.reconnect.reconnect_delay_min_secs, 2);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = Config::from_json_str(r#"{"reconnect": {"reconnect_delay_min_secs": 10}}"#).unwrap_err();
        assert!(matches!(err, TransformError::Config(_)));

        assert!(matches!(Config::from_json_str("{not json"), Err(TransformError::Json(_))));
    }

    #[test]
    fn initial_delay_stays_within_bounds() {
        let config = ReconnectConfig::default();
        for _ in 0..50 {
            let delay = config.initial_delay();
            assert!(delay >= Duration::from_secs(2) && delay <= Duration::from_secs(4));
        }
    }

    #[test]
    fn next_delay_doubles_up_to_the_cap() {
        let config = ReconnectConfig {
            reconnect_delay_min_secs: 4,
            reconnect_delay_max_secs: 4,
            ..Default::default()
        };

        let mut delays = Vec::new();
        let mut previous = None;
        for _ in 0..10 {
            let delay = config.next_delay(previous);
            delays.push(delay.as_secs());
            previous = Some(delay);
        }

        assert_eq!(delays, vec![4, 8, 16, 32, 64, 128, 256, 300, 300, 300]);
    }
}
