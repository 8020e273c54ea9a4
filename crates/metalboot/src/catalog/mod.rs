//! On-disk image catalog.
//!
//! Extracted installer trees live under `<file-root>/bootfiles/<image>` for
//! ESXi and `<file-root>/rhelbootfiles/<image>` for RHEL; uploaded ISOs are
//! kept under `<file-root>/isofiles`. The catalog owns the extractor mutex
//! (one upload at a time) and the promotion lock guarding the default
//! boot loader at `bootfiles/mboot.efi`.

pub mod extract;
pub mod metadata;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Name of the default-loader record at the ESXi catalog root.
pub const LATEST_RELEASE_FILE: &str = "latest_release.yaml";

/// Name of the promoted default boot loader at the ESXi catalog root.
pub const PROMOTED_LOADER_FILE: &str = "mboot.efi";

/// The two installer families this service provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Esxi,
    Rhel,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Esxi => "esxi",
            OsFamily::Rhel => "rhel",
        }
    }

    /// Directory name of the extracted tree inside a catalog entry.
    pub fn tree_dir(&self) -> &'static str {
        self.as_str()
    }

    /// Boot loader the firmware chain ends at for this family.
    pub fn main_boot_loader(&self) -> &'static str {
        match self {
            OsFamily::Esxi => "mboot.efi",
            OsFamily::Rhel => "bootx64.efi",
        }
    }

    /// First segment of the HTTP boot path for this family.
    pub fn http_installer_prefix(&self) -> &'static str {
        match self {
            OsFamily::Esxi => "installer",
            OsFamily::Rhel => "rhelinstaller",
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle over the catalog directory layout and its locks.
pub struct Catalog {
    boot_dir: PathBuf,
    rhel_boot_dir: PathBuf,
    iso_dir: PathBuf,
    /// Serializes whole extraction pipelines.
    extract_lock: Mutex<()>,
    /// Guards `bootfiles/mboot.efi` so readers never observe a torn copy.
    promotion_lock: RwLock<()>,
}

impl Catalog {
    pub fn new(file_root: &Path) -> Self {
        Self {
            boot_dir: file_root.join("bootfiles"),
            rhel_boot_dir: file_root.join("rhelbootfiles"),
            iso_dir: file_root.join("isofiles"),
            extract_lock: Mutex::new(()),
            promotion_lock: RwLock::new(()),
        }
    }

    /// Creates the catalog directories (mode 0755). Fatal at startup when it
    /// fails.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [&self.boot_dir, &self.rhel_boot_dir, &self.iso_dir] {
            fs::create_dir_all(dir)?;
            set_mode_0755(dir)?;
        }
        Ok(())
    }

    pub fn boot_dir(&self) -> &Path {
        &self.boot_dir
    }

    pub fn rhel_boot_dir(&self) -> &Path {
        &self.rhel_boot_dir
    }

    pub fn iso_dir(&self) -> &Path {
        &self.iso_dir
    }

    /// Catalog root for one family.
    pub fn root_for(&self, family: OsFamily) -> &Path {
        match family {
            OsFamily::Esxi => &self.boot_dir,
            OsFamily::Rhel => &self.rhel_boot_dir,
        }
    }

    /// Root directory of one catalog entry.
    pub fn entry_root(&self, family: OsFamily, image: &str) -> PathBuf {
        self.root_for(family).join(image)
    }

    /// Resolves the family of an image by checking which catalog root holds
    /// a directory of that name (ESXi first, then RHEL).
    pub fn family_of(&self, image: &str) -> Option<OsFamily> {
        if image.is_empty() || image.contains('/') {
            return None;
        }
        if self.boot_dir.join(image).is_dir() {
            return Some(OsFamily::Esxi);
        }
        if self.rhel_boot_dir.join(image).is_dir() {
            return Some(OsFamily::Rhel);
        }
        None
    }

    pub fn latest_release_path(&self) -> PathBuf {
        self.boot_dir.join(LATEST_RELEASE_FILE)
    }

    pub fn promoted_loader_path(&self) -> PathBuf {
        self.boot_dir.join(PROMOTED_LOADER_FILE)
    }

    /// Reads the promoted default loader under the promotion read lock.
    pub async fn read_promoted_loader(&self) -> io::Result<Vec<u8>> {
        let _guard = self.promotion_lock.read().await;
        tokio::fs::read(self.promoted_loader_path()).await
    }

    /// Replaces the promoted default loader under the promotion write lock.
    pub async fn replace_promoted_loader(&self, content: Vec<u8>) -> io::Result<()> {
        let _guard = self.promotion_lock.write().await;
        tokio::fs::write(self.promoted_loader_path(), content).await
    }

    pub(crate) fn extract_lock(&self) -> &Mutex<()> {
        &self.extract_lock
    }
}

pub(crate) fn set_mode_0755(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
