//! streamerd - sensor streaming daemon
//!
//! This daemon:
//! 1. Loads `StreamerConfig` (file from `STREAMER_CONFIG`, env overrides)
//! 2. Builds the sensor backend and consent provider
//! 3. Binds one TCP frame server and one UDP request port per sensor
//! 4. Streams until Ctrl-C, logging per-sensor stats periodically

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use sensor_streamer::{
    backend_from_url, ConsentState, ScriptedConsent, StreamOrchestrator, StreamerConfig,
    SyntheticConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or JSON).
    #[arg(long, env = "STREAMER_CONFIG")]
    config: Option<PathBuf>,
    /// Address every endpoint binds to.
    #[arg(long)]
    bind_host: Option<String>,
    /// Sensor backend URL.
    #[arg(long)]
    backend: Option<String>,
    /// Consent answer for the synthetic backend (allowed, denied_by_user, ...).
    #[arg(long)]
    consent: Option<String>,
    /// Seconds between stats lines; 0 disables them.
    #[arg(long, default_value_t = 10)]
    stats_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Some(path) = &args.config {
        std::env::set_var("STREAMER_CONFIG", path);
    }
    let mut config = StreamerConfig::load()?;
    if let Some(host) = args.bind_host {
        config.bind_host = host;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(consent) = args.consent.as_deref() {
        config.stub.consent = ConsentState::parse(consent)
            .filter(|state| state.is_terminal())
            .ok_or_else(|| anyhow!("--consent: unknown consent state '{}'", consent))?;
    }

    let backend = backend_from_url(
        &config.backend,
        SyntheticConfig {
            frame_rate: config.stub.frame_rate,
            dropout_rate: config.stub.dropout_rate,
        },
    )?;
    let consent = Arc::new(ScriptedConsent::new(
        config.stub.consent,
        config.stub.consent_delay,
    ));

    let mut orchestrator = StreamOrchestrator::initialize(&config, backend, consent)?;
    for endpoint in orchestrator.endpoints() {
        log::info!(
            "{}: frames on tcp {}, requests on udp {}",
            endpoint.role,
            endpoint.stream_addr,
            endpoint.request_addr
        );
    }
    orchestrator.start();

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("streamerd waiting for shutdown signal (Ctrl-C)...");
    let tick = match args.stats_interval {
        0 => Duration::from_secs(3600),
        secs => Duration::from_secs(secs),
    };
    loop {
        match rx.recv_timeout(tick) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if args.stats_interval == 0 {
                    continue;
                }
                for stats in orchestrator.stats() {
                    match serde_json::to_string(&stats) {
                        Ok(line) => log::info!("stats {}", line),
                        Err(err) => log::warn!("stats for {} not serializable: {}", stats.role, err),
                    }
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping sensors...");
    orchestrator.stop();
    Ok(())
}
