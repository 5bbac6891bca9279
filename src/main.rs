//! bounceping: hop-chain network latency probe
//!
//! A client sends fixed-size probes to a server which bounces them back and
//! forth a configured number of hops. The last hop computes one-way latency
//! from kernel receive timestamps.
//!
//! Features:
//! - UDP, one-shot TCP and persistent TCP transports
//! - Tests of batches of probes, with per-batch and per-test summaries
//! - Outlier threshold with cooldown and retry
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod engine;
mod error;
mod protocol;
mod realtime;
mod report;
mod runtime;
mod server;
mod shutdown;
mod stats;

use client::ProbeClient;
use config::{Config, ConfigError, RunKind};
use error::BounceError;
use report::ResultWriter;
use runtime::Role;
use server::Server;
use shutdown::CancellationToken;
use stats::{Aggregator, Schedule};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status for fatal errors (-1 as a process status).
const FATAL_EXIT: u8 = 255;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(e)) => {
            // Help and version go to stdout and are not failures.
            if let Err(print_err) = e.print() {
                init_logging("warn");
                warn!(error = %print_err, "Could not print usage");
            }
            return if e.use_stderr() {
                ExitCode::from(FATAL_EXIT)
            } else {
                ExitCode::SUCCESS
            };
        }
        Err(e) => {
            init_logging("error");
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(FATAL_EXIT);
        }
    };

    init_logging(&config.log_level);

    info!(
        kind = ?config.kind,
        mode = ?config.mode,
        port = config.port,
        hops = config.hops,
        size = config.size,
        "Starting bounceping"
    );

    let token = CancellationToken::new();
    if let Err(e) = token.register_signals() {
        warn!(error = %e, "Could not install signal handlers");
    }

    if config.realtime {
        realtime::prepare(config.cpu);
    }

    let result = match config.kind {
        RunKind::Server => run_server(&config, token),
        RunKind::Client => {
            let destination = SocketAddr::new(config.destination, config.port);
            run_client(&config, destination, token)
        }
        RunKind::SelfTest => run_selftest(&config, token),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(FATAL_EXIT)
        }
    }
}

/// `RUST_LOG` overrides the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_server(config: &Config, token: CancellationToken) -> Result<(), BounceError> {
    let addr = SocketAddr::new(config.bind, config.port);
    let transport = runtime::open(Role::Server, config.mode, addr)?;
    info!(addr = ?transport.local_addr(), mode = ?config.mode, "Server listening");

    let stats = Server::new(transport, token).run()?;
    info!(
        terminated = stats.terminated,
        relayed = stats.relayed,
        rejected = stats.rejected,
        "Server stopped"
    );
    Ok(())
}

fn run_client(
    config: &Config,
    destination: SocketAddr,
    token: CancellationToken,
) -> Result<(), BounceError> {
    let transport = runtime::open(Role::Client, config.mode, destination)?;
    info!(%destination, mode = ?config.mode, "Client started");

    let mut client = ProbeClient::new(transport, config.size, config.hops);
    let mut writer = ResultWriter::create(config.output.as_deref())?;

    let result = Aggregator::new(Schedule::from_config(config), &mut writer, token).run(&mut client);
    writer.finish();
    client.close();

    let run = result?;
    info!(samples = run.samples(), total_us = run.total(), "Client finished");
    Ok(())
}

/// Serve on loopback from a background thread and probe it from this one.
fn run_selftest(config: &Config, token: CancellationToken) -> Result<(), BounceError> {
    let bind = SocketAddr::new(config.bind, config.port);
    let transport = runtime::open(Role::Server, config.mode, bind)?;
    let addr = transport.local_addr().unwrap_or(bind);
    info!(%addr, mode = ?config.mode, "Self-test server ready");

    let server_token = token.clone();
    // Not joined: a datagram server stays blocked in receive after the client
    // is done, and exiting the process releases it.
    thread::Builder::new()
        .name("selftest-server".to_string())
        .spawn(move || {
            if let Err(e) = Server::new(transport, server_token).run() {
                error!(error = %e, "Self-test server failed");
            }
        })?;

    let result = run_client(config, addr, token.clone());
    token.cancel();
    result
}
