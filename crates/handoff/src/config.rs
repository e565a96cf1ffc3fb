//! Server configuration.
//!
//! Settings are layered: built-in defaults, an optional TOML file, then
//! environment variables. The embedding binary may override the result with
//! command line flags before handing it to [`crate::Server::bind`].
//!
//! # Environment Variables
//!
//! - `HANDOFF_SOCK_FILE`: Control channel socket path. Default: `/tmp/handoff.sock`
//! - `HANDOFF_ADDR`: Listening address. Default: `0.0.0.0:3000`
//! - `HANDOFF_SHUTDOWN_TIMEOUT_SECS`: Drain timeout in seconds, fractions allowed. Default: `5`
//! - `HANDOFF_SIGNAL_BUFFER_SIZE`: Signal queue capacity. Default: `1`
//!
//! A replacement process is started without arguments, so the effective
//! configuration travels to it through these variables (see [`Config::to_env`]).
//!
//! # Example
//!
//! ```toml
//! sock_file = "/run/myapp/handoff.sock"
//! addr = "127.0.0.1:8080"
//! shutdown_timeout_secs = 10
//! signal_buffer_size = 4
//! ```

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::ConfigError;

const SOCK_FILE_ENV: &str = "HANDOFF_SOCK_FILE";
const ADDR_ENV: &str = "HANDOFF_ADDR";
const SHUTDOWN_TIMEOUT_ENV: &str = "HANDOFF_SHUTDOWN_TIMEOUT_SECS";
const SIGNAL_BUFFER_ENV: &str = "HANDOFF_SIGNAL_BUFFER_SIZE";

/// Configuration file path, read by the embedding binary.
pub const CONFIG_ENV: &str = "HANDOFF_CONFIG";

/// Configuration for a succession-capable server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Location of the control channel socket file used during succession.
    pub sock_file: PathBuf,

    /// Address of the listener (`host:port`).
    pub addr: String,

    /// Shutdown timeout. Connections still open once it elapses are dropped.
    #[serde(rename = "shutdown_timeout_secs", with = "duration_secs")]
    pub shutdown_timeout: Duration,

    /// Capacity of the queue holding received OS signals.
    pub signal_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sock_file: PathBuf::from("/tmp/handoff.sock"),
            addr: "0.0.0.0:3000".to_string(),
            shutdown_timeout: Duration::from_secs(5),
            signal_buffer_size: 1,
        }
    }
}

impl Config {
    /// Load configuration from the defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Load configuration from a TOML file overlaid with environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::Read)?;
        let config: Self = toml::from_str(&raw)?;
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(sock_file) = lookup(SOCK_FILE_ENV) {
            self.sock_file = PathBuf::from(sock_file);
        }

        if let Some(addr) = lookup(ADDR_ENV) {
            self.addr = addr;
        }

        if let Some(raw) = lookup(SHUTDOWN_TIMEOUT_ENV) {
            let secs: f64 = parse_env(SHUTDOWN_TIMEOUT_ENV, raw.clone())?;
            self.shutdown_timeout =
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidEnv {
                    name: SHUTDOWN_TIMEOUT_ENV,
                    value: raw,
                })?;
        }

        if let Some(raw) = lookup(SIGNAL_BUFFER_ENV) {
            self.signal_buffer_size = parse_env(SIGNAL_BUFFER_ENV, raw)?;
        }

        Ok(self)
    }

    /// Environment variables that reproduce this configuration when applied
    /// over the defaults.
    pub fn to_env(&self) -> Vec<(&'static str, OsString)> {
        vec![
            (SOCK_FILE_ENV, self.sock_file.clone().into_os_string()),
            (ADDR_ENV, self.addr.clone().into()),
            (
                SHUTDOWN_TIMEOUT_ENV,
                self.shutdown_timeout.as_secs_f64().to_string().into(),
            ),
            (SIGNAL_BUFFER_ENV, self.signal_buffer_size.to_string().into()),
        ]
    }

    /// Check that every setting is usable. Called before any socket is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sock_file.as_os_str().is_empty() {
            return Err(ConfigError::MissingSockFile);
        }

        if self.addr.is_empty() {
            return Err(ConfigError::MissingAddr);
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ZeroShutdownTimeout);
        }

        if self.signal_buffer_size < 1 {
            return Err(ConfigError::ZeroSignalBufferSize);
        }

        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            sock_file = %self.sock_file.display(),
            addr = %self.addr,
            shutdown_timeout_secs = self.shutdown_timeout.as_secs_f64(),
            signal_buffer_size = self.signal_buffer_size,
            "Server configuration"
        );
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.sock_file, PathBuf::from("/tmp/handoff.sock"));
        assert_eq!(config.addr, "0.0.0.0:3000");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.signal_buffer_size, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_each_field() {
        let mut config = Config::default();
        config.sock_file = PathBuf::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingSockFile)));

        let mut config = Config::default();
        config.addr = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingAddr)));

        let mut config = Config::default();
        config.shutdown_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroShutdownTimeout)));

        let mut config = Config::default();
        config.signal_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroSignalBufferSize)));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_env_overrides(lookup(&[
                (SOCK_FILE_ENV, "/run/app.sock"),
                (ADDR_ENV, "127.0.0.1:8080"),
                (SHUTDOWN_TIMEOUT_ENV, "12"),
                (SIGNAL_BUFFER_ENV, " 8 "),
            ]))
            .unwrap();

        assert_eq!(config.sock_file, PathBuf::from("/run/app.sock"));
        assert_eq!(config.addr, "127.0.0.1:8080");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(12));
        assert_eq!(config.signal_buffer_size, 8);
    }

    #[test]
    fn test_env_invalid_number() {
        let err = Config::default()
            .with_env_overrides(lookup(&[(SHUTDOWN_TIMEOUT_ENV, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { name: SHUTDOWN_TIMEOUT_ENV, .. }
        ));
    }

    #[test]
    fn test_env_fractional_timeout() {
        let config = Config::default()
            .with_env_overrides(lookup(&[(SHUTDOWN_TIMEOUT_ENV, "0.5")]))
            .unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_millis(500));

        let err = Config::default()
            .with_env_overrides(lookup(&[(SHUTDOWN_TIMEOUT_ENV, "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_to_env_reproduces_config() {
        let config = Config {
            sock_file: PathBuf::from("/run/app/handoff.sock"),
            addr: "127.0.0.1:18081".to_string(),
            shutdown_timeout: Duration::from_millis(2500),
            signal_buffer_size: 3,
        };

        let vars: HashMap<&'static str, String> = config
            .to_env()
            .into_iter()
            .map(|(k, v)| (k, v.into_string().unwrap()))
            .collect();
        assert_eq!(vars[ADDR_ENV], "127.0.0.1:18081");
        assert_eq!(vars[SOCK_FILE_ENV], "/run/app/handoff.sock");

        let restored = Config::default()
            .with_env_overrides(move |name| vars.get(name).cloned())
            .unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            addr = "127.0.0.1:9000"
            shutdown_timeout_secs = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.sock_file, PathBuf::from("/tmp/handoff.sock"));
        assert_eq!(config.signal_buffer_size, 1);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "addr = [").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            Config::from_file("/nonexistent/handoff.toml"),
            Err(ConfigError::Read(_))
        ));
    }
}
