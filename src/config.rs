//! Configuration module for bounceping.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{HEADER_LEN, MAX_PROBE_SIZE};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for bounceping
#[derive(Parser, Debug)]
#[command(name = "bounceping")]
#[command(author = "bounceping authors")]
#[command(version = "0.1.0")]
#[command(about = "Hop-chain network latency probe", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short = 'C', long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Skip real-time scheduling, CPU pinning and memory locking
    #[arg(long, global = true)]
    pub no_realtime: bool,

    /// CPU core to pin the measuring thread to
    #[arg(long, global = true)]
    pub cpu: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer and relay probes
    Server(ServerArgs),
    /// Measure latency against a server
    Client(ClientArgs),
    /// Run a server thread on loopback and measure against it
    Selftest(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Transport mode
    #[arg(short, long, ignore_case = true)]
    pub mode: Option<TransportMode>,

    /// Address to bind to
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Destination IP address
    pub destination: String,

    #[command(flatten)]
    pub probe: ProbeArgs,
}

#[derive(Args, Debug, Default)]
pub struct ProbeArgs {
    /// Destination port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of hops (1-255)
    #[arg(short = 'H', long)]
    pub hops: Option<u32>,

    /// Messages per batch
    #[arg(short, long)]
    pub count: Option<u32>,

    /// Message size in bytes (minimum 13)
    #[arg(short, long)]
    pub size: Option<usize>,

    /// Number of tests to run
    #[arg(short, long)]
    pub tests: Option<u32>,

    /// Batches per test
    #[arg(short, long)]
    pub batches: Option<u32>,

    /// Seconds between tests
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Output file for detailed results
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Discard samples slower than this many microseconds
    #[arg(short = 'T', long)]
    pub threshold: Option<u64>,

    /// Transport mode
    #[arg(short, long, ignore_case = true)]
    pub mode: Option<TransportMode>,
}

/// Socket lifecycle used for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Connectionless datagrams on one long-lived socket.
    Udp,
    /// A fresh TCP connection per probe.
    #[default]
    Tcp,
    /// One TCP connection reused for the whole run.
    #[value(alias = "tcp_stream")]
    #[serde(alias = "tcp_stream")]
    TcpStream,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network-related configuration
#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: TransportMode,
    /// Address the server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            mode: TransportMode::default(),
            bind: default_bind(),
        }
    }
}

/// Probe schedule configuration
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_one")]
    pub hops: u32,
    #[serde(default = "default_one")]
    pub count: u32,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default = "default_one")]
    pub tests: u32,
    #[serde(default = "default_batches")]
    pub batches: u32,
    /// Seconds between tests
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Outlier threshold in microseconds
    pub threshold: Option<u64>,
    pub output: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            hops: default_one(),
            count: default_one(),
            size: default_size(),
            tests: default_one(),
            batches: default_batches(),
            interval: default_interval(),
            threshold: None,
            output: None,
        }
    }
}

/// Real-time environment configuration
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cpu: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    13234
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_size() -> usize {
    HEADER_LEN
}

fn default_batches() -> u32 {
    10
}

fn default_interval() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Server,
    Client,
    /// Server thread and client in one process, over loopback.
    SelfTest,
}

/// Final resolved configuration, immutable for the run.
#[derive(Debug, Clone)]
pub struct Config {
    pub kind: RunKind,
    pub mode: TransportMode,
    pub port: u16,
    pub bind: IpAddr,
    pub destination: IpAddr,
    pub hops: u8,
    pub count: u32,
    pub size: usize,
    pub tests: u32,
    pub batches: u32,
    pub interval: Duration,
    /// Outlier threshold in microseconds.
    pub threshold: Option<u64>,
    pub output: Option<PathBuf>,
    pub realtime: bool,
    pub cpu: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::try_parse()?)
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let TomlConfig {
            network,
            probe,
            realtime,
            logging,
        } = toml_config;

        let (kind, destination, port, mode, bind, args) = match cli.command {
            Command::Server(args) => (
                RunKind::Server,
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                args.port,
                args.mode,
                args.bind,
                ProbeArgs::default(),
            ),
            Command::Client(args) => {
                let destination = args.destination.parse().map_err(|_| {
                    ConfigError::invalid("destination", &args.destination, "not a valid IP address")
                })?;
                let probe = args.probe;
                (RunKind::Client, destination, probe.port, probe.mode, None, probe)
            }
            Command::Selftest(probe) => (
                RunKind::SelfTest,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                probe.port,
                probe.mode,
                None,
                probe,
            ),
        };

        let bind_str = bind.unwrap_or(network.bind);
        let bind = match kind {
            RunKind::SelfTest => IpAddr::V4(Ipv4Addr::LOCALHOST),
            _ => bind_str
                .parse()
                .map_err(|_| ConfigError::invalid("bind", &bind_str, "not a valid IP address"))?,
        };

        let hops = args.hops.unwrap_or(probe.hops);
        let hops = u8::try_from(hops)
            .ok()
            .filter(|h| *h >= 1)
            .ok_or_else(|| ConfigError::invalid("hops", hops, "must be between 1 and 255"))?;

        let count = positive("count", args.count.unwrap_or(probe.count))?;
        let tests = positive("tests", args.tests.unwrap_or(probe.tests))?;
        let batches = positive("batches", args.batches.unwrap_or(probe.batches))?;
        let interval = args.interval.unwrap_or(probe.interval);
        if interval == 0 {
            return Err(ConfigError::invalid("interval", interval, "must be positive"));
        }

        let size = args.size.unwrap_or(probe.size);
        if !(HEADER_LEN..=MAX_PROBE_SIZE).contains(&size) {
            return Err(ConfigError::invalid(
                "size",
                size,
                &format!("must be between {HEADER_LEN} and {MAX_PROBE_SIZE}"),
            ));
        }

        let threshold = args.threshold.or(probe.threshold);
        if threshold == Some(0) {
            return Err(ConfigError::invalid("threshold", 0, "must be positive"));
        }

        let output = args.output.or(probe.output);
        if let Some(ref path) = output {
            check_output_path(path)?;
        }

        Ok(Config {
            kind,
            mode: mode.unwrap_or(network.mode),
            port: port.unwrap_or(network.port),
            bind,
            destination,
            hops,
            count,
            size,
            tests,
            batches,
            interval: Duration::from_secs(interval),
            threshold,
            output,
            realtime: !cli.no_realtime && realtime.enabled,
            cpu: cli.cpu.unwrap_or(realtime.cpu),
            log_level: cli.log_level.unwrap_or(logging.level),
        })
    }
}

fn positive(field: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, value, "must be positive"));
    }
    Ok(value)
}

fn check_output_path(path: &Path) -> Result<(), ConfigError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Ok(()),
    };
    if !parent.is_dir() {
        return Err(ConfigError::invalid(
            "output",
            path.display(),
            "parent directory does not exist",
        ));
    }
    Ok(())
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid {field} '{value}': {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl std::fmt::Display, reason: &str) -> Self {
        ConfigError::Invalid {
            field,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let cli = CliArgs::try_parse_from(args).unwrap();
        Config::from_args(cli)
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.network.port, 13234);
        assert_eq!(config.network.mode, TransportMode::Tcp);
        assert_eq!(config.probe.size, 13);
        assert_eq!(config.probe.batches, 10);
        assert!(config.probe.threshold.is_none());
        assert!(config.realtime.enabled);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [network]
            port = 9000
            mode = "tcp-stream"

            [probe]
            hops = 3
            count = 100
            size = 64
            threshold = 1000

            [realtime]
            enabled = false
            cpu = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.mode, TransportMode::TcpStream);
        assert_eq!(config.probe.hops, 3);
        assert_eq!(config.probe.count, 100);
        assert_eq!(config.probe.size, 64);
        assert_eq!(config.probe.threshold, Some(1000));
        assert_eq!(config.probe.batches, 10);
        assert!(!config.realtime.enabled);
        assert_eq!(config.realtime.cpu, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_client_args() {
        let config = parse(&[
            "bounceping", "client", "192.168.1.10", "-b", "5", "-c", "10", "-H", "3", "-m",
            "UDP",
        ])
        .unwrap();

        assert_eq!(config.kind, RunKind::Client);
        assert_eq!(config.destination, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(config.batches, 5);
        assert_eq!(config.count, 10);
        assert_eq!(config.hops, 3);
        assert_eq!(config.mode, TransportMode::Udp);
        assert_eq!(config.port, 13234);
        assert_eq!(config.size, 13);
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_server_args() {
        let config = parse(&["bounceping", "server", "-p", "9000", "-m", "tcp-stream"]).unwrap();
        assert_eq!(config.kind, RunKind::Server);
        assert_eq!(config.port, 9000);
        assert_eq!(config.mode, TransportMode::TcpStream);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounceping.toml");
        std::fs::write(&path, "[probe]\ncount = 50\nsize = 128\n").unwrap();

        let config = parse(&[
            "bounceping",
            "--config",
            path.to_str().unwrap(),
            "client",
            "10.0.0.1",
            "-c",
            "7",
        ])
        .unwrap();

        assert_eq!(config.count, 7);
        assert_eq!(config.size, 128);
    }

    #[test]
    fn test_invalid_values() {
        let cases: &[&[&str]] = &[
            &["bounceping", "client", "not-an-ip"],
            &["bounceping", "client", "10.0.0.1", "-H", "0"],
            &["bounceping", "client", "10.0.0.1", "-H", "256"],
            &["bounceping", "client", "10.0.0.1", "-s", "12"],
            &["bounceping", "client", "10.0.0.1", "-c", "0"],
            &["bounceping", "client", "10.0.0.1", "-T", "0"],
            &["bounceping", "client", "10.0.0.1", "-i", "0"],
            &["bounceping", "client", "10.0.0.1", "-o", "/nonexistent/dir/out.txt"],
            &["bounceping", "server", "--bind", "localhost"],
        ];

        for args in cases {
            match parse(args) {
                Err(ConfigError::Invalid { .. }) => {}
                other => panic!("{:?} -> {:?}", args, other),
            }
        }
    }

    #[test]
    fn test_selftest_uses_loopback() {
        let config = parse(&["bounceping", "--no-realtime", "selftest", "-p", "0"]).unwrap();
        assert_eq!(config.kind, RunKind::SelfTest);
        assert_eq!(config.destination, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(!config.realtime);
    }

    #[test]
    fn test_missing_config_file() {
        let err = parse(&["bounceping", "--config", "/nonexistent.toml", "server"]).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
