//! Listener orchestration.
//!
//! Wires the shared state (config, registry, catalog) and runs the three
//! listeners until the cancellation token fires. A fatal error in any
//! listener (socket bind, missing directory) tears the service down.

use crate::catalog::Catalog;
use crate::config::Config;
use crate::lease::{ArpProbe, LeaseRange};
use crate::registry::Registry;
use crate::{dhcp, http, tftp};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared state handed to every listener.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub catalog: Arc<Catalog>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let probe = ArpProbe::new(config.service_interface.clone());
        let registry = Registry::new(
            LeaseRange {
                start: config.dhcp_start,
                end: config.dhcp_end,
            },
            Arc::new(probe),
        );
        let catalog = Catalog::new(&config.file_dir_path);
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            catalog: Arc::new(catalog),
        }
    }

    /// Root of the per-IP answer-file tree (`<KS_DIR_PATH>/ks`).
    pub fn ks_root(&self) -> PathBuf {
        self.config.ks_dir_path.join("ks")
    }
}

/// Runs DHCP, TFTP, and HTTP listeners until `shutdown` fires. Returns the
/// first fatal listener error; in-flight work on the other listeners is
/// dropped with it.
pub async fn run(state: AppState, shutdown: CancellationToken) -> io::Result<()> {
    info!(
        "serving on {} (api {}:{})",
        state.config.service_addr, state.config.api_addr, state.config.api_server_port
    );
    tokio::try_join!(
        dhcp::run(state.clone(), shutdown.clone()),
        tftp::run(state.clone(), shutdown.clone()),
        http::run(state.clone(), shutdown.clone()),
    )?;
    Ok(())
}
