//! Configuration Module
//!
//! TOML configuration for mqttprobe with support for:
//! - Logging
//! - Broker endpoint, credentials and protocol versions
//! - Client TLS
//! - Probe timing, ceilings and selection
//! - Environment variable overrides (MQTTPROBE__* prefix)

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::client::{TlsError, TlsSettings};
use crate::probe::{ConnectionParams, ProbeKind, ProbeSettings};
use crate::protocol::ProtocolVersion;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// TLS material could not be loaded
    Tls(TlsError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Tls(e) => write!(f, "TLS error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<TlsError> for ConfigError {
    fn from(e: TlsError) -> Self {
        ConfigError::Tls(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker under test
    pub broker: BrokerConfig,
    /// Probe tuning
    pub probe: ProbeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Protocol versions to probe, e.g. `["3.1.1", "5"]`
    pub versions: Vec<String>,
    /// Client TLS (connects over TLS when present)
    pub tls: Option<TlsConfig>,
}

fn default_versions() -> Vec<String> {
    vec!["3.1.1".to_string(), "5".to_string()]
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            versions: default_versions(),
            tls: None,
        }
    }
}

/// Client TLS configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate used to verify the broker (PEM format)
    pub ca_cert: Option<String>,
    /// Client certificate for mutual TLS (PEM format)
    pub cert: Option<String>,
    /// Client private key (PEM format)
    pub key: Option<String>,
    /// Name to verify the broker certificate against (default: host)
    pub server_name: Option<String>,
}

/// Probe configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Bound for connecting and for every acknowledgement (e.g. "10s")
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Wait per expected message
    #[serde(with = "humantime_serde")]
    pub message_budget: Duration,
    /// Overall bound for a single probe
    #[serde(with = "humantime_serde")]
    pub probe_budget: Duration,
    /// Messages published by each QoS probe
    pub qos_tries: u32,
    pub topic_ceiling: usize,
    pub client_id_ceiling: usize,
    pub payload_ceiling: usize,
    /// Messages published to the shared subscription group
    pub shared_sample: u32,
    /// Characters tried in client identifiers (default: printable ASCII)
    pub ascii_candidates: Option<String>,
    /// Run optional probes for every protocol version
    pub all: bool,
    /// Probes to leave out, by name
    pub skip: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        let settings = ProbeSettings::default();
        Self {
            timeout: Duration::from_secs(10),
            message_budget: settings.message_budget,
            probe_budget: settings.probe_budget,
            qos_tries: settings.qos_tries,
            topic_ceiling: settings.topic_ceiling,
            client_id_ceiling: settings.client_id_ceiling,
            payload_ceiling: settings.payload_ceiling,
            shared_sample: settings.shared_sample,
            ascii_candidates: None,
            all: false,
            skip: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTPROBE__` prefix with double underscores for nesting:
    ///    - `MQTTPROBE__BROKER__HOST=broker.local` overrides `broker.host`
    ///    - `MQTTPROBE__PROBE__QOS_TRIES=50` overrides `probe.qos_tries`
    ///    - `MQTTPROBE__BROKER__VERSIONS=5` overrides `broker.versions`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let defaults = ProbeConfig::default();
        let mut builder = config::Config::builder()
            .set_default("log.level", default_log_level())?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", 1883)?
            .set_default("broker.versions", default_versions())?
            .set_default("probe.timeout", "10s")?
            .set_default("probe.message_budget", "1s")?
            .set_default("probe.probe_budget", "5m")?
            .set_default("probe.qos_tries", defaults.qos_tries)?
            .set_default("probe.topic_ceiling", defaults.topic_ceiling as u64)?
            .set_default("probe.client_id_ceiling", defaults.client_id_ceiling as u64)?
            .set_default("probe.payload_ceiling", defaults.payload_ceiling as u64)?
            .set_default("probe.shared_sample", defaults.shared_sample)?
            .set_default("probe.all", false)?
            .set_default("probe.skip", Vec::<String>::new())?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTTPROBE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("broker.versions")
                    .with_list_parse_key("probe.skip")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.qos_tries == 0 {
            return Err(ConfigError::Validation(
                "qos_tries must be at least 1".to_string(),
            ));
        }
        if self.probe.shared_sample == 0 {
            return Err(ConfigError::Validation(
                "shared_sample must be at least 1".to_string(),
            ));
        }
        if self.probe.timeout.is_zero() || self.probe.message_budget.is_zero() {
            return Err(ConfigError::Validation(
                "timeout and message_budget must be non-zero".to_string(),
            ));
        }

        self.versions()?;
        self.skipped()?;

        if let Some(ref candidates) = self.probe.ascii_candidates {
            if candidates.is_empty() {
                return Err(ConfigError::Validation(
                    "ascii_candidates cannot be empty".to_string(),
                ));
            }
            if !candidates.is_ascii() {
                return Err(ConfigError::Validation(
                    "ascii_candidates must only contain ASCII characters".to_string(),
                ));
            }
        }

        if let Some(ref tls) = self.broker.tls {
            match (&tls.cert, &tls.key) {
                (Some(_), None) => {
                    return Err(ConfigError::Validation(
                        "tls.key is required when tls.cert is set".to_string(),
                    ));
                }
                (None, Some(_)) => {
                    return Err(ConfigError::Validation(
                        "tls.cert is required when tls.key is set".to_string(),
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Protocol versions to probe, in configured order without repeats
    pub fn versions(&self) -> Result<Vec<ProtocolVersion>, ConfigError> {
        if self.broker.versions.is_empty() {
            return Err(ConfigError::Validation(
                "at least one protocol version is required".to_string(),
            ));
        }
        let mut versions = Vec::new();
        for name in &self.broker.versions {
            let version = ProtocolVersion::parse(name).ok_or_else(|| {
                ConfigError::Validation(format!("unknown protocol version '{}'", name))
            })?;
            if !versions.contains(&version) {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Probes excluded by `probe.skip`
    pub fn skipped(&self) -> Result<BTreeSet<ProbeKind>, ConfigError> {
        self.probe
            .skip
            .iter()
            .map(|name| {
                ProbeKind::parse(name)
                    .ok_or_else(|| ConfigError::Validation(format!("unknown probe '{}'", name)))
            })
            .collect()
    }

    /// Build the probe settings
    pub fn probe_settings(&self) -> Result<ProbeSettings, ConfigError> {
        let mut settings = ProbeSettings {
            message_budget: self.probe.message_budget,
            probe_budget: self.probe.probe_budget,
            qos_tries: self.probe.qos_tries,
            topic_ceiling: self.probe.topic_ceiling,
            client_id_ceiling: self.probe.client_id_ceiling,
            payload_ceiling: self.probe.payload_ceiling,
            shared_sample: self.probe.shared_sample,
            run_optional: self.probe.all,
            skip: self.skipped()?,
            ..Default::default()
        };
        if let Some(ref candidates) = self.probe.ascii_candidates {
            let mut seen = BTreeSet::new();
            settings.ascii_candidates = candidates.chars().filter(|c| seen.insert(*c)).collect();
        }
        Ok(settings)
    }

    /// Build the connection parameters, loading TLS material if configured
    pub fn connection_params(&self) -> Result<ConnectionParams, ConfigError> {
        let broker = &self.broker;
        let tls = match broker.tls {
            Some(ref tls) => Some(TlsSettings::from_config(tls, &broker.host)?),
            None => None,
        };
        Ok(ConnectionParams {
            host: broker.host.clone(),
            port: broker.port,
            username: broker.username.clone(),
            password: broker.password.clone().map(Bytes::from),
            tls,
            timeout: self.probe.timeout,
        })
    }
}
