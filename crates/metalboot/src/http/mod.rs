//! HTTP API server.
//!
//! One axum router carries the REST surface (upload, answer files, image
//! listing) and the installer trees fetched by firmware and installers
//! during boot.

pub mod installer;
pub mod ks;
pub mod upload;

use crate::server::AppState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(upload::upload_form))
        .route(
            "/upload",
            post(upload::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/ks", get(ks::get_ks).post(ks::create_ks))
        .route("/ks/{id}", delete(ks::delete_ks))
        .route("/esxi-versions", get(upload::esxi_versions))
        .route("/installer/{*path}", get(installer::esxi_tree))
        .route("/rhelinstaller/{*path}", get(installer::rhel_tree))
        .with_state(state)
}

/// Runs the API server until cancellation. Bind failures are fatal.
pub async fn run(state: AppState, shutdown: CancellationToken) -> io::Result<()> {
    let addr = SocketAddr::V4(SocketAddrV4::new(
        state.config.api_addr,
        state.config.api_server_port,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("starting API server...");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}
