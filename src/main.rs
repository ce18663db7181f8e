//! sdrctl - software-defined radio scanner.
//!
//! Captures IQ samples from an RTL-SDR tuner, demodulates AM/FM/WBFM to
//! monaural PCM, and hops across a channel list under a power squelch.

mod config;
mod dsp;
mod error;
mod scanner;
mod tuner;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::scanner::Controller;

#[derive(Debug, Parser)]
#[command(version, about = "software-defined radio scanner")]
struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let path = config::resolve_path(cli.config.as_deref());
    let cfg = config::load(&path)?;
    info!("loaded configuration from {}", path.display());
    log_config(&cfg);

    let (controller, shutdown) = Controller::new(cfg)?;
    let mut pipeline = tokio::task::spawn_blocking(move || controller.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received an interrupt, stopping services...");
            shutdown.trigger();
            (&mut pipeline).await??;
        }
        res = &mut pipeline => res??,
    }

    info!("exiting");
    Ok(())
}

fn log_config(cfg: &Config) {
    info!("database at {}", cfg.database.display());
    info!(
        "control interface on {}:{} ({}), auth user '{}'",
        cfg.ctrl_interface.listen_host,
        cfg.ctrl_interface.listen_port,
        if cfg.ctrl_interface.network.is_empty() {
            "tcp"
        } else {
            &cfg.ctrl_interface.network
        },
        cfg.ctrl_interface.basic_auth_username,
    );
    if cfg.ctrl_interface.basic_auth_password.is_empty() {
        warn!("control interface basic auth password is empty");
    }
    info!(
        "audio interface on {}:{}",
        cfg.audio_interface.listen_host, cfg.audio_interface.listen_port,
    );
    if !cfg.scanner.dongle_serial.is_empty() {
        info!("using dongle serial {}", cfg.scanner.dongle_serial);
    }
}
