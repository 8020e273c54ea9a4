//! Boot-file resolution shared by the TFTP and HTTP listeners.
//!
//! A requested path is mapped, by basename, to one of: an embedded asset
//! (static, or the RHEL template variant rendered per request), the
//! promoted default loader (read under the promotion lock), a `boot.cfg`
//! template rendered from the catalog, or a plain file in the extracted
//! tree. The catalog root for disk reads follows the registered family of
//! the first path segment.

use crate::assets::{self, BootTemplateData};
use crate::catalog::OsFamily;
use crate::server::AppState;
use regex::Regex;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Legacy ESXi 6.x request shape: two unused hex chars, then the client
/// MAC with dash separators.
fn legacy_mac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{2}-(([0-9A-Fa-f]{2}-){5}[0-9A-Fa-f]{2})/boot\.cfg$")
            .expect("legacy boot.cfg pattern is valid")
    })
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A resolved boot file, either materialized in memory (embedded or
/// rendered content, and lock-guarded reads) or a path to stream from disk.
#[derive(Debug)]
pub enum ServedFile {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Resolves `requested` for a listener whose unqualified reads default to
/// `default_family` (TFTP and `/installer` default to ESXi,
/// `/rhelinstaller` to RHEL).
pub async fn resolve_boot_file(
    state: &AppState,
    requested: &str,
    default_family: OsFamily,
) -> Result<ServedFile, ResolveError> {
    let requested = requested.trim_start_matches('/');
    if requested.is_empty() || requested.split('/').any(|c| c.is_empty() || c == "..") {
        return Err(ResolveError::InvalidPath(requested.to_string()));
    }

    let first_segment = requested.split('/').next().unwrap_or_default();
    let family = family_hint(state, first_segment).unwrap_or(default_family);
    let basename = requested.rsplit('/').next().unwrap_or(requested);

    match basename {
        "autoexec.ipxe" => Ok(embedded_script(
            state,
            family,
            first_segment,
            assets::AUTOEXEC_IPXE,
            assets::RHEL_AUTOEXEC_IPXE,
        )),
        "default" => Ok(embedded_script(
            state,
            family,
            first_segment,
            assets::PXELINUX_DEFAULT,
            assets::RHEL_PXELINUX_DEFAULT,
        )),
        "grub.cfg" => Ok(embedded_script(
            state,
            family,
            first_segment,
            assets::GRUB_CFG,
            assets::RHEL_GRUB_CFG,
        )),
        "ipxe.efi" => Ok(ServedFile::Bytes(assets::IPXE_EFI.to_vec())),
        "pxelinux.0" => Ok(ServedFile::Bytes(assets::PXELINUX_0.to_vec())),
        "undionly.kpxe" => Ok(ServedFile::Bytes(assets::UNDIONLY_KPXE.to_vec())),
        "mboot.efi" => match state.catalog.read_promoted_loader().await {
            Ok(bytes) => Ok(ServedFile::Bytes(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ResolveError::NotFound(requested.to_string()))
            }
            Err(e) => Err(e.into()),
        },
        "boot.cfg" => render_boot_cfg(state, requested).await,
        _ => {
            let path = state.catalog.root_for(family).join(requested);
            if path.is_file() {
                Ok(ServedFile::Path(path))
            } else {
                Err(ResolveError::NotFound(requested.to_string()))
            }
        }
    }
}

/// ESXi clients get the static embedded script; paths leading with a
/// registered RHEL image get the RHEL variant rendered for that image.
fn embedded_script(
    state: &AppState,
    family: OsFamily,
    first_segment: &str,
    esxi_variant: &str,
    rhel_variant: &str,
) -> ServedFile {
    let content = match family {
        OsFamily::Esxi => esxi_variant.to_string(),
        OsFamily::Rhel => assets::render_boot_template(
            rhel_variant,
            &BootTemplateData::new(
                state.config.service_addr,
                state.config.api_server_port,
                first_segment,
            ),
        ),
    };
    ServedFile::Bytes(content.into_bytes())
}

/// Renders the on-disk `boot.cfg` template of an entry, resolving the
/// legacy `XX-<mac>/boot.cfg` request shape through the registry.
async fn render_boot_cfg(state: &AppState, requested: &str) -> Result<ServedFile, ResolveError> {
    let (template_path, filename) = match legacy_mac_pattern().captures(requested) {
        Some(captures) => {
            let mac_raw = captures
                .get(1)
                .map(|m| m.as_str().replace('-', ":"))
                .unwrap_or_default();
            let Ok(mac) = crate::registry::Mac::parse(&mac_raw) else {
                return Err(ResolveError::InvalidPath(requested.to_string()));
            };
            let Some(binding) = state.registry.image_of(&mac) else {
                warn!("no image bound for legacy boot.cfg request from {}", mac);
                return Err(ResolveError::NotFound(requested.to_string()));
            };
            debug!("legacy boot.cfg request for {} resolved to {}", mac, binding.image);
            (
                state.catalog.boot_dir().join(&binding.image).join("boot.cfg"),
                binding.image,
            )
        }
        None => {
            let dir = requested
                .strip_suffix("boot.cfg")
                .map(|d| d.trim_end_matches('/'))
                .unwrap_or_default();
            (state.catalog.boot_dir().join(requested), dir.to_string())
        }
    };

    let template = match tokio::fs::read_to_string(&template_path).await {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ResolveError::NotFound(requested.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let data = BootTemplateData::new(
        state.config.service_addr,
        state.config.api_server_port,
        &filename,
    );
    Ok(ServedFile::Bytes(
        assets::render_boot_template(&template, &data).into_bytes(),
    ))
}

/// Family of the first path segment: the registry's view first, then the
/// catalog directories for images uploaded but not yet bound to a host.
fn family_hint(state: &AppState, first_segment: &str) -> Option<OsFamily> {
    state
        .registry
        .family_of_image(first_segment)
        .or_else(|| state.catalog.family_of(first_segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lease::LeaseRange;
    use crate::registry::{Mac, Registry};
    use crate::Catalog;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct QuietProbe;
    impl crate::lease::Probe for QuietProbe {
        fn is_in_use(&self, _ip: Ipv4Addr) -> Result<bool, crate::error::RegistryError> {
            Ok(false)
        }
    }

    fn test_state(root: &TempDir) -> AppState {
        let catalog = Arc::new(Catalog::new(root.path()));
        catalog.ensure_layout().unwrap();
        let config = Config {
            api_addr: Ipv4Addr::new(10, 0, 0, 1),
            api_server_port: 80,
            service_interface: "eth1".to_string(),
            service_addr: Ipv4Addr::new(10, 0, 0, 1),
            service_netmask: Ipv4Addr::new(255, 255, 255, 0),
            dhcp_start: Ipv4Addr::new(10, 0, 0, 2),
            dhcp_end: Ipv4Addr::new(10, 0, 0, 10),
            ks_dir_path: root.path().to_path_buf(),
            file_dir_path: root.path().to_path_buf(),
            log_file_path: None,
        };
        AppState {
            config: Arc::new(config),
            registry: Arc::new(Registry::new(
                LeaseRange {
                    start: Ipv4Addr::new(10, 0, 0, 2),
                    end: Ipv4Addr::new(10, 0, 0, 10),
                },
                Arc::new(QuietProbe),
            )),
            catalog,
        }
    }

    fn seed_esxi_entry(state: &AppState, image: &str) {
        let entry = state.catalog.boot_dir().join(image);
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(
            entry.join("boot.cfg"),
            "kernelopt=runweasel ks=http://{{.KSServerAddr}}:{{.KSServerPort}}/ks\n\
             prefix=http://{{.KSServerAddr}}:{{.KSServerPort}}/installer/{{.Filename}}/esxi\n",
        )
        .unwrap();
    }

    async fn resolve_bytes(state: &AppState, path: &str) -> String {
        match resolve_boot_file(state, path, OsFamily::Esxi).await.unwrap() {
            ServedFile::Bytes(b) => String::from_utf8(b).unwrap(),
            ServedFile::Path(p) => panic!("expected bytes, got path {}", p.display()),
        }
    }

    #[tokio::test]
    async fn serves_embedded_loaders_by_basename() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let got = resolve_boot_file(&state, "esxi-8u2/pxelinux.0", OsFamily::Esxi)
            .await
            .unwrap();
        match got {
            ServedFile::Bytes(b) => assert_eq!(b, crate::assets::PXELINUX_0),
            _ => panic!("expected embedded bytes"),
        }
    }

    #[tokio::test]
    async fn renders_boot_cfg_with_request_data() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        seed_esxi_entry(&state, "esxi-8u2");

        let out = resolve_bytes(&state, "esxi-8u2/boot.cfg").await;
        assert!(out.contains("ks=http://10.0.0.1:80/ks"));
        assert!(out.contains("prefix=http://10.0.0.1:80/installer/esxi-8u2/esxi"));
        assert_eq!(out.lines().filter(|l| l.starts_with("kernelopt=")).count(), 1);
        assert_eq!(out.lines().filter(|l| l.starts_with("prefix=")).count(), 1);
    }

    #[tokio::test]
    async fn legacy_mac_path_redirects_through_the_registry() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        seed_esxi_entry(&state, "esxi-8u2");
        let mac = Mac::parse("aa:bb:cc:dd:ee:01").unwrap();
        state
            .registry
            .bind_image(&mac, "esxi-8u2", &state.catalog)
            .unwrap();

        let out = resolve_bytes(&state, "01-aa-bb-cc-dd-ee-01/boot.cfg").await;
        assert!(out.contains("/installer/esxi-8u2/esxi"));
    }

    #[tokio::test]
    async fn legacy_mac_path_without_binding_is_not_found() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let err = resolve_boot_file(&state, "01-aa-bb-cc-dd-ee-99/boot.cfg", OsFamily::Esxi)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn rhel_images_get_rendered_template_variants() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::create_dir_all(state.catalog.rhel_boot_dir().join("rhel-9.3")).unwrap();

        let out = resolve_bytes(&state, "rhel-9.3/autoexec.ipxe").await;
        assert!(out.contains("http://10.0.0.1:80/rhelinstaller/rhel-9.3"));
        assert!(!out.contains("{{."));
    }

    #[tokio::test]
    async fn esxi_images_get_the_static_script() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        std::fs::create_dir_all(state.catalog.boot_dir().join("esxi-8u2")).unwrap();

        let out = resolve_bytes(&state, "esxi-8u2/autoexec.ipxe").await;
        assert_eq!(out, crate::assets::AUTOEXEC_IPXE);
    }

    #[tokio::test]
    async fn plain_files_resolve_against_the_family_root() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let tree = state.catalog.rhel_boot_dir().join("rhel-9.3/rhel/images");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("install.img"), b"image").unwrap();

        let got = resolve_boot_file(&state, "rhel-9.3/rhel/images/install.img", OsFamily::Esxi)
            .await
            .unwrap();
        match got {
            ServedFile::Path(p) => assert!(p.ends_with("rhel-9.3/rhel/images/install.img")),
            _ => panic!("expected a disk path"),
        }
    }

    #[tokio::test]
    async fn rejects_traversal_attempts() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let err = resolve_boot_file(&state, "../secrets", OsFamily::Esxi)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn missing_promoted_loader_is_not_found() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let err = resolve_boot_file(&state, "esxi-8u2/mboot.efi", OsFamily::Esxi)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }
}
