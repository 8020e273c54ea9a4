//! Installer trees over HTTP.
//!
//! `/installer/{path}` and `/rhelinstaller/{path}` serve the same
//! selection logic as TFTP: embedded assets, the promoted loader, rendered
//! boot configs, and raw files from the extracted trees. UEFI HTTP
//! firmware and iPXE fetch loaders here; the installers then pull their
//! kernel, initrd, and package tree over the same routes.

use crate::catalog::OsFamily;
use crate::resolve::{self, ResolveError, ServedFile};
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// GET /installer/{*path}
pub async fn esxi_tree(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    serve(&state, &path, OsFamily::Esxi).await
}

/// GET /rhelinstaller/{*path}
///
/// RHEL GRUB configs sometimes reference mixed-case paths while the
/// extracted tree is all lowercase, so everything from the `rhel` segment
/// on is lowercased before the lookup.
pub async fn rhel_tree(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let path = lowercase_from_rhel(&path);
    serve(&state, &path, OsFamily::Rhel).await
}

async fn serve(state: &AppState, path: &str, default_family: OsFamily) -> Response {
    info!("http boot file request: {}", path);
    match resolve::resolve_boot_file(state, path, default_family).await {
        Ok(ServedFile::Bytes(bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Ok(ServedFile::Path(disk_path)) => match tokio::fs::File::open(&disk_path).await {
            Ok(file) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response(),
            Err(e) => {
                warn!("failed to open {}: {}", disk_path.display(), e);
                (StatusCode::NOT_FOUND, "file not found").into_response()
            }
        },
        Err(ResolveError::NotFound(_)) | Err(ResolveError::InvalidPath(_)) => {
            (StatusCode::NOT_FOUND, "file not found").into_response()
        }
        Err(ResolveError::Io(e)) => {
            warn!("failed to serve {}: {}", path, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encountered unexpected problem",
            )
                .into_response()
        }
    }
}

/// Lowercases the request from the first case-insensitive `rhel` on. The
/// scan walks char boundaries of the original string; lowercasing first and
/// reusing that offset would split multi-byte characters whose lowercase
/// form has a different length.
fn lowercase_from_rhel(path: &str) -> String {
    for (idx, _) in path.char_indices() {
        let rest = &path[idx..];
        if rest.len() >= 4 && rest.as_bytes()[..4].eq_ignore_ascii_case(b"rhel") {
            return format!("{}{}", &path[..idx], rest.to_lowercase());
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_from_the_rhel_segment() {
        assert_eq!(
            lowercase_from_rhel("rhel-9.3/rhel/EFI/BOOT/grubx64.efi"),
            "rhel-9.3/rhel/efi/boot/grubx64.efi"
        );
        assert_eq!(
            lowercase_from_rhel("RHEL-9.3/Rhel/Images/INSTALL.IMG"),
            "rhel-9.3/rhel/images/install.img"
        );
        assert_eq!(lowercase_from_rhel("esxi-8u2/BOOT.CFG"), "esxi-8u2/BOOT.CFG");
    }

    #[test]
    fn multibyte_characters_before_rhel_do_not_break_the_split() {
        // U+0130 lowercases to a longer byte sequence
        assert_eq!(lowercase_from_rhel("İSO/RHEL/EFI"), "İSO/rhel/efi");
        assert_eq!(lowercase_from_rhel("ünrelated/path"), "ünrelated/path");
    }
}
