//! mqttprobe - MQTT broker capability prober
//!
//! Usage:
//!   mqttprobe [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -H, --host <HOST>          Broker host (default: localhost)
//!   -p, --port <PORT>          Broker port (default: 1883)
//!   -V, --mqtt-version <3|5>   Only probe one protocol version
//!   -a, --all                  Run optional probes for every version
//!   -t, --timeout <SECS>       Connect and acknowledgement timeout
//!   -q, --qos-tries <N>        Messages per QoS probe
//!   --json                     Print the report as JSON
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mqttprobe::client::MqttConnector;
use mqttprobe::config::{Config, TlsConfig};
use mqttprobe::probe::FeatureProber;
use mqttprobe::render::render_reports;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// mqttprobe - discover which MQTT features and limits a broker supports
#[derive(Parser, Debug)]
#[command(name = "mqttprobe")]
#[command(about = "Probes an MQTT broker for supported features and limits")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// Protocol version to probe (3 or 5, default: both)
    #[arg(short = 'V', long = "mqtt-version")]
    mqtt_version: Option<String>,

    /// Run optional probes for every protocol version
    #[arg(short, long)]
    all: bool,

    /// Connect and acknowledgement timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Messages published by each QoS probe
    #[arg(short, long)]
    qos_tries: Option<u32>,

    /// Username
    #[arg(short, long)]
    user: Option<String>,

    /// Password
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// CA certificate used to verify the broker (PEM)
    #[arg(long)]
    cafile: Option<String>,

    /// Client certificate for mutual TLS (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// Client private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Name to verify the broker certificate against
    #[arg(long)]
    server_name: Option<String>,

    /// Probe to leave out (repeatable)
    #[arg(long = "skip", value_name = "PROBE")]
    skip: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI args override file config
    fn apply(&self, config: &mut Config) {
        let broker = &mut config.broker;
        if let Some(ref host) = self.host {
            broker.host = host.clone();
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(ref version) = self.mqtt_version {
            broker.versions = vec![version.clone()];
        }
        if self.user.is_some() {
            broker.username = self.user.clone();
        }
        if self.password.is_some() {
            broker.password = self.password.clone();
        }

        let wants_tls = self.tls
            || self.cafile.is_some()
            || self.cert.is_some()
            || self.key.is_some()
            || self.server_name.is_some();
        if wants_tls {
            let tls = broker.tls.get_or_insert_with(TlsConfig::default);
            if self.cafile.is_some() {
                tls.ca_cert = self.cafile.clone();
            }
            if self.cert.is_some() {
                tls.cert = self.cert.clone();
            }
            if self.key.is_some() {
                tls.key = self.key.clone();
            }
            if self.server_name.is_some() {
                tls.server_name = self.server_name.clone();
            }
        }

        let probe = &mut config.probe;
        if let Some(secs) = self.timeout {
            probe.timeout = Duration::from_secs(secs);
        }
        if let Some(tries) = self.qos_tries {
            probe.qos_tries = tries;
        }
        probe.all |= self.all;
        probe.skip.extend(self.skip.iter().cloned());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = match args.config {
        Some(ref path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    args.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(2);
    }

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let params = config.connection_params()?;
    let settings = config.probe_settings()?;
    let versions = config.versions()?;

    info!("Probing {}:{}", params.host, params.port);
    info!("  TLS: {}", if params.tls.is_some() { "enabled" } else { "disabled" });
    info!(
        "  Versions: {}",
        versions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let connector = Arc::new(MqttConnector::new());
    let mut reports = Vec::with_capacity(versions.len());
    for version in versions {
        let prober = FeatureProber::new(connector.clone(), params.clone(), settings.clone(), version);
        reports.push(prober.run().await);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print!("{}", render_reports(&reports));
    }

    // Nothing could be probed at all
    if reports.iter().all(|report| report.aborted()) {
        std::process::exit(1);
    }

    Ok(())
}
