//! veil-relayd: the Veil mix network relay daemon.
//!
//! Single OS process running a Tokio async runtime. The config file path
//! comes from `VEIL_CONFIG` or the first CLI argument, defaulting to
//! `veil.toml` in the working directory.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use veil_relayd::config::Config;
use veil_relayd::server::{Externals, Server};
use veil_relayd::Error;

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("VEIL_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("veil.toml"))
}

fn init_logging(cfg: &Config) -> anyhow::Result<()> {
    let writer = if cfg.logging.disable {
        BoxMakeWriter::new(std::io::sink)
    } else if cfg.logging.file.is_empty() {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        let mut path = PathBuf::from(&cfg.logging.file);
        if path.is_relative() {
            path = cfg.server.data_dir.join(path);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        BoxMakeWriter::new(std::sync::Mutex::new(file))
    };

    let level = cfg.tracing_directive();
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in ["veil_relayd", "veil_transport", "veil_mixkey", "veil_crypto"] {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cfg = match Config::load(&config_path()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("veil-relayd: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&cfg) {
        eprintln!("veil-relayd: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let mut server = match Server::new(cfg, Externals::default()).await {
        Ok(server) => server,
        Err(Error::GenerateOnly) => {
            info!("key generation complete, exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("relay running");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    server.shutdown().await;
    ExitCode::SUCCESS
}
