// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Peer connection parameters.
    pub dtu: DtuConfig,
    /// Implementation/runtime parameters that have no counterpart on the
    /// wire (retry policy, timer periods).
    pub runtime: RuntimeConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// DTU peer address and cloud-coexistence policy.
pub struct DtuConfig {
    #[serde(rename = "Server")]
    /// Hostname or IP address of the DTU.
    pub server: String,

    #[serde(rename = "Port")]
    /// TCP port the DTU listens on.
    pub port: u16,

    #[serde(rename = "PreventCloudErrors", default)]
    /// Whether the cloud-coexistence scheduler (§4.6) is armed.
    pub prevent_cloud_errors: bool,

    #[serde(rename = "CloudUploadSeconds", with = "serde_secs", default = "default_cloud_upload")]
    /// Width of the pause window straddling each quarter-hour.
    pub cloud_upload_seconds: Duration,
}

fn default_cloud_upload() -> Duration {
    Duration::from_secs(40)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Runtime-only settings that do not map to wire fields.
pub struct RuntimeConfig {
    #[serde(rename = "TickPeriod", with = "serde_secs", default = "default_tick_period")]
    /// Period of the periodic driver's main tick (§4.7).
    pub tick_period: Duration,

    #[serde(rename = "KeepalivePeriod", with = "serde_secs", default = "default_keepalive_period")]
    /// Period of the keep-alive poke while connected (§4.4).
    pub keepalive_period: Duration,

    #[serde(rename = "ShortRetryLimit", default = "default_short_retry_limit")]
    /// Consecutive short retries before the long pause kicks in (§4.4).
    pub short_retry_limit: u32,

    #[serde(rename = "LongRetryPause", with = "serde_secs", default = "default_long_retry_pause")]
    /// Pause duration after exhausting short retries (§4.4).
    pub long_retry_pause: Duration,

    #[serde(rename = "TimeoutConnection", with = "serde_secs", default = "default_timeout_connection")]
    /// Timeout for establishing the TCP connection and for each I/O call.
    pub timeout_connection: Duration,
}

fn default_tick_period() -> Duration {
    Duration::from_secs(5)
}

fn default_keepalive_period() -> Duration {
    Duration::from_secs(10)
}

fn default_short_retry_limit() -> u32 {
    5
}

fn default_long_retry_pause() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout_connection() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.dtu.server.is_empty(), "Server must not be empty");
        ensure!(self.dtu.port != 0, "Port must not be zero");
        ensure!(
            self.runtime.short_retry_limit >= 1,
            "ShortRetryLimit must be >= 1"
        );
        ensure!(
            !self.runtime.tick_period.is_zero(),
            "TickPeriod must be > 0"
        );
        ensure!(
            !self.dtu.cloud_upload_seconds.is_zero(),
            "CloudUploadSeconds must be > 0"
        );
        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            dtu: DtuConfig {
                server: "192.168.1.50".to_string(),
                port: 8899,
                prevent_cloud_errors: true,
                cloud_upload_seconds: Duration::from_secs(40),
            },
            runtime: RuntimeConfig {
                tick_period: Duration::from_secs(5),
                keepalive_period: Duration::from_secs(10),
                short_retry_limit: 5,
                long_retry_pause: Duration::from_secs(60),
                timeout_connection: Duration::from_secs(10),
            },
        }
    }

    #[test]
    fn validates_nonempty_server() {
        let mut cfg = sample();
        cfg.dtu.server.clear();
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn validates_nonzero_tick_period() {
        let mut cfg = sample();
        cfg.runtime.tick_period = Duration::ZERO;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn valid_config_passes() {
        let mut cfg = sample();
        assert!(cfg.validate_and_normalize().is_ok());
    }
}
