//! TFTP server.
//!
//! Read-only RFC 1350 server over the shared boot-file resolver. The
//! library spawns one task per transfer; a peer aborting mid-transfer is a
//! normal event and never surfaces as a server error.

use crate::catalog::OsFamily;
use crate::resolve::{self, ResolveError, ServedFile};
use crate::server::AppState;
use async_tftp::packet::Error as TftpError;
use async_tftp::server::{Handler, TftpServerBuilder};
use async_trait::async_trait;
use futures::io::{AsyncRead, Cursor};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TFTP_PORT: u16 = 69;

/// Reader handed to the TFTP library: either resolved bytes (embedded
/// assets, rendered templates, lock-guarded loader reads) or a catalog file
/// streamed from disk.
pub enum BootFileReader {
    Memory(Cursor<Vec<u8>>),
    Disk(Compat<tokio::fs::File>),
}

impl AsyncRead for BootFileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BootFileReader::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            BootFileReader::Disk(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

struct BootFileHandler {
    state: AppState,
}

#[async_trait]
impl Handler for BootFileHandler {
    type Reader = BootFileReader;
    type Writer = futures::io::Sink;

    async fn read_req_open(
        &mut self,
        client: &SocketAddr,
        path: &Path,
    ) -> Result<(Self::Reader, Option<u64>), TftpError> {
        let requested = path.to_string_lossy();
        info!("tftp read request from {}: {}", client, requested);

        match resolve::resolve_boot_file(&self.state, &requested, OsFamily::Esxi).await {
            Ok(ServedFile::Bytes(bytes)) => {
                let size = bytes.len() as u64;
                Ok((BootFileReader::Memory(Cursor::new(bytes)), Some(size)))
            }
            Ok(ServedFile::Path(path)) => {
                let file = tokio::fs::File::open(&path).await.map_err(TftpError::from)?;
                let size = file.metadata().await.ok().map(|m| m.len());
                Ok((BootFileReader::Disk(file.compat()), size))
            }
            Err(ResolveError::NotFound(p)) => {
                warn!("tftp: no boot file for {}", p);
                Err(TftpError::FileNotFound)
            }
            Err(ResolveError::InvalidPath(p)) => {
                warn!("tftp: rejected path {}", p);
                Err(TftpError::FileNotFound)
            }
            Err(ResolveError::Io(e)) => {
                warn!("tftp: failed to open boot file: {}", e);
                Err(TftpError::from(e))
            }
        }
    }

    async fn write_req_open(
        &mut self,
        client: &SocketAddr,
        path: &Path,
        _size: Option<u64>,
    ) -> Result<Self::Writer, TftpError> {
        warn!(
            "tftp: rejecting write request from {} for {}",
            client,
            path.display()
        );
        Err(TftpError::IllegalOperation)
    }
}

/// Runs the TFTP listener until cancellation. Bind failures are fatal.
pub async fn run(state: AppState, shutdown: CancellationToken) -> io::Result<()> {
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(state.config.service_addr, TFTP_PORT));
    let server = TftpServerBuilder::with_handler(BootFileHandler { state })
        .bind(bind_addr)
        .build()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e.to_string()))?;

    info!("starting TFTP server...");
    tokio::select! {
        _ = shutdown.cancelled() => {
            info!("tftp server: shutting down...");
            Ok(())
        }
        result = server.serve() => {
            result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        }
    }
}
