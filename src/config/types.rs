//! Configuration data types.

use crate::server::{ServeMode, ServerSettings};
use crate::util::Signal;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Top level of the YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Logging and metrics
    #[serde(default)]
    pub global: GlobalConfig,

    /// The served endpoint
    pub server: ServerConfig,
}

/// Settings shared by every part of the process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// trace, debug, info, warn or error; `RUST_LOG` and `--log-level` win
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Prometheus endpoint, served by its own drainable server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Must differ from `server.bind`
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Served endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TCP address (`host:port`, `:port`) or Unix socket path (`/..`, `./..`)
    pub bind: String,

    /// Protocol: auto, http or fastcgi
    #[serde(default)]
    pub mode: ServeMode,

    /// Reuse connections for several requests
    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// TCP keep-alive probing period, TCP only
    #[serde(default = "default_tcp_keepalive", with = "option_humantime_serde")]
    pub tcp_keepalive: Option<Duration>,

    /// Certificate and key, TCP only
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Give up waiting for in-flight work after this long
    #[serde(default, with = "option_humantime_serde")]
    pub shutdown_timeout: Option<Duration>,

    /// Signals that start a graceful shutdown
    #[serde(default = "default_signals")]
    pub signals: Vec<Signal>,

    /// Body returned by the built-in handler
    #[serde(default = "default_response")]
    pub response: String,

    /// Delay before the built-in handler responds
    #[serde(default, with = "humantime_serde")]
    pub response_delay: Duration,
}

impl ServerConfig {
    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            addr: self.bind.clone(),
            mode: self.mode,
            keep_alive: self.keep_alive,
            tcp_keepalive: self.tcp_keepalive,
        }
    }
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_tcp_keepalive() -> Option<Duration> {
    Some(Duration::from_secs(3 * 60))
}

fn default_signals() -> Vec<Signal> {
    Signal::DEFAULT.to_vec()
}

fn default_response() -> String {
    "Hello\n".to_string()
}

/// Durations written as humantime strings such as `250ms` or `1m 30s`.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(D::Error::custom)
    }
}

/// Optional humantime durations; `null` or a missing key is `None`.
mod option_humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => super::humantime_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| humantime::parse_duration(&text).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_server_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  bind: \"127.0.0.1:8080\"\n").unwrap();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.server.mode, ServeMode::Auto);
        assert!(config.server.keep_alive);
        assert_eq!(config.server.tcp_keepalive, Some(Duration::from_secs(180)));
        assert_eq!(config.server.signals, Signal::DEFAULT);
        assert_eq!(config.server.response_delay, Duration::ZERO);
        assert!(config.server.shutdown_timeout.is_none());
    }

    #[test]
    fn test_durations_and_signals() {
        let yaml = r#"
server:
  bind: /run/app.sock
  mode: fastcgi
  tcp_keepalive: 30s
  shutdown_timeout: 1m 30s
  signals: [terminate, hangup]
  response_delay: 250ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.mode, ServeMode::FastCgi);
        assert_eq!(config.server.tcp_keepalive, Some(Duration::from_secs(30)));
        assert_eq!(config.server.shutdown_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.server.signals, vec![Signal::Terminate, Signal::Hangup]);
        assert_eq!(config.server.response_delay, Duration::from_millis(250));

        let settings = config.server.settings();
        assert_eq!(settings.addr, "/run/app.sock");
        assert_eq!(settings.mode, ServeMode::FastCgi);
    }
}
