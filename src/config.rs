use std::{env, fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::util;

/// Environment variable overriding the sensor host name.
pub const HOST_ENV: &str = "OXIMETER_HOST";

/// Address of the sensor when it runs its own access point.
pub const DEFAULT_HOST: &str = "192.168.4.1";

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `config.json`.
//
// Every field is optional. A missing file or an empty object
// `{}` yields the deployed defaults:
// - ws://<OXIMETER_HOST or 192.168.4.1>:81
// - 5 reconnect attempts, 1000 ms linear backoff unit
//
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Where the sensor stream lives
    pub endpoint: EndpointConfig,

    /// Automatic reconnection settings
    pub reconnect: ReconnectConfig,

    /// Periodic metrics reporting
    pub metrics: MetricsConfig,

    /// Optional debug configuration
    pub debug: Option<DebugConfig>,
}

// ------------------------------------------------------------
// Endpoint configuration
// ------------------------------------------------------------
//
// The stream endpoint is `scheme://host:port` with no path
// and no query parameters.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointConfig {
    /// "ws" or "wss"
    pub scheme: String,

    /// Sensor host name or IP address
    pub host: String,

    /// Sensor WebSocket port
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            host: env::var(HOST_ENV)
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: 81,
        }
    }
}

impl EndpointConfig {
    pub fn url(&self) -> String {
        util::build_endpoint(&self.scheme, &self.host, self.port)
    }
}

// ------------------------------------------------------------
// Reconnect configuration
// ------------------------------------------------------------
//
// Linear backoff: the Nth retry waits N * base_delay_ms.
// After `max_attempts` consecutive failures the link gives up.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between metric reports (0 disables the reporter)
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

// ------------------------------------------------------------
// Debug configuration
// ------------------------------------------------------------
//
// Optional flags used while bringing up a sensor.
//
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DebugConfig {
    /// Log every raw frame payload
    pub raw: Option<bool>,

    /// Enables debug-level logging
    pub log: Option<bool>,
}

impl Config {
    pub fn debug_log(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.log.unwrap_or(false))
    }

    pub fn debug_raw(&self) -> bool {
        self.debug.as_ref().is_some_and(|d| d.raw.unwrap_or(false))
    }

    /// Rejects values the connection manager cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.endpoint.scheme.as_str() {
            "ws" | "wss" => {}
            other => bail!("unsupported endpoint scheme '{}' (expected ws or wss)", other),
        }

        if self.endpoint.host.trim().is_empty() {
            bail!("endpoint host must not be empty");
        }

        if self.reconnect.base_delay_ms == 0 {
            bail!("reconnect.base_delay_ms must be greater than zero");
        }

        Ok(())
    }
}

/// Reads and validates a JSON configuration file.
///
/// A missing file is not an error: the built-in defaults are used.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let cfg = match fs::read_to_string(path) {
        Ok(data) => parse_config(&data)
            .with_context(|| format!("invalid config file {}", path.display()))?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::info!("No config at {}, using defaults", path.display());
            Config::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read {}", path.display()));
        }
    };

    cfg.validate()?;
    Ok(cfg)
}

fn parse_config(data: &str) -> anyhow::Result<Config> {
    Ok(serde_json::from_str(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_deployed_defaults() {
        let cfg = parse_config("{}").unwrap();

        assert_eq!(cfg.endpoint.scheme, "ws");
        assert_eq!(cfg.endpoint.port, 81);
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(cfg.metrics.interval_secs, 10);
        assert!(!cfg.debug_log());
        assert!(!cfg.debug_raw());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg = parse_config(
            r#"{
                "endpoint": { "host": "oximeter.local" },
                "reconnect": { "base_delay_ms": 250 },
                "debug": { "log": true }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.endpoint.url(), "ws://oximeter.local:81");
        assert_eq!(cfg.reconnect.max_attempts, 5);
        assert_eq!(cfg.reconnect.base_delay_ms, 250);
        assert!(cfg.debug_log());
        assert!(!cfg.debug_raw());
    }

    #[test]
    fn rejects_unknown_scheme() {
        let cfg = parse_config(r#"{ "endpoint": { "scheme": "http", "host": "x" } }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_backoff_unit() {
        let cfg = parse_config(r#"{ "reconnect": { "base_delay_ms": 0 } }"#).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = env::temp_dir().join("oximeter-link-does-not-exist.json");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.endpoint.port, 81);
    }

    #[test]
    fn reads_file_from_disk() {
        let path = env::temp_dir().join(format!("oximeter-link-{}.json", std::process::id()));
        fs::write(&path, r#"{ "endpoint": { "scheme": "wss", "host": "10.0.0.7", "port": 8443 } }"#)
            .unwrap();

        let cfg = load_config(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(cfg.endpoint.url(), "wss://10.0.0.7:8443");
    }

    #[test]
    fn broken_file_is_an_error() {
        let path = env::temp_dir().join(format!("oximeter-link-bad-{}.json", std::process::id()));
        fs::write(&path, "{ endpoint: ").unwrap();

        let result = load_config(&path);
        fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
