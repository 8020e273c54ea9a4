//! metalbootd, the network-boot provisioning daemon.

use anyhow::{Context, Result};
use metalboot::server::{self, AppState};
use metalboot::Config;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("metalbootd: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::load().context("failed to load server config")?;
    init_tracing(&config).context("failed to initialize logging")?;

    let state = AppState::new(config);
    state
        .catalog
        .ensure_layout()
        .context("failed to create catalog directories")?;
    init_ks_dir(&state).context("failed to initialize KS directory")?;

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutting down main function");
        signal_token.cancel();
    });

    server::run(state, shutdown).await?;
    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_file_path {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

/// The answer-file tree does not survive restarts: wipe and recreate it.
fn init_ks_dir(state: &AppState) -> Result<()> {
    let ks_root = state.ks_root();
    if ks_root.exists() {
        fs::remove_dir_all(&ks_root)?;
    }
    fs::create_dir_all(&ks_root)?;
    set_mode(&ks_root)?;
    Ok(())
}

fn set_mode(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
