//! ISO extraction pipeline.
//!
//! Uploads are validated (ESXi upgrade metadata or RHEL treeinfo), their
//! tree extracted into the catalog with every path component lowercased,
//! and their boot configuration prepared: ESXi gets a rewritten top-level
//! `boot.cfg` template plus a shot at the default-loader promotion, RHEL
//! gets its UEFI loaders copied to the entry root so firmware paths like
//! `<image>/bootx64.efi` resolve.
//!
//! The whole pipeline runs under the catalog's extractor mutex; on any
//! failure the partial entry and the uploaded ISO are removed.

use crate::catalog::metadata::{self, EsxiRelease, TreeInfo};
use crate::catalog::{set_mode_0755, Catalog, OsFamily};
use crate::error::ExtractError;
use cdfs::{DirectoryEntry, ISODirectory, ISOFile, ISO9660};
use std::fs;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::{info, warn};

/// Replacement `kernelopt=` line; the markers are rendered per request by
/// the file server, never at extraction time.
const KERNELOPT_LINE: &str =
    "kernelopt=runweasel ks=http://{{.KSServerAddr}}:{{.KSServerPort}}/ks";

/// Replacement `prefix=` line, appended when the source had none.
const PREFIX_LINE: &str =
    "prefix=http://{{.KSServerAddr}}:{{.KSServerPort}}/installer/{{.Filename}}/esxi";

/// What an upload turned out to be.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub image: String,
    pub family: OsFamily,
}

#[derive(Debug)]
enum ImageKind {
    Esxi(EsxiRelease),
    Rhel(TreeInfo),
}

/// Runs the full pipeline for an uploaded ISO. `image` is the
/// client-provided name and becomes the catalog directory name.
pub async fn ingest(
    catalog: &Catalog,
    iso_path: &Path,
    image: &str,
) -> Result<ExtractOutcome, ExtractError> {
    let _guard = catalog.extract_lock().lock().await;

    let identified = {
        let iso_path = iso_path.to_path_buf();
        tokio::task::spawn_blocking(move || identify(&iso_path))
            .await
            .map_err(|e| ExtractError::Iso(e.to_string()))?
    };
    let kind = match identified {
        Ok(kind) => kind,
        Err(e) => {
            warn!("rejecting upload {}: {}", image, e);
            let _ = tokio::fs::remove_file(iso_path).await;
            return Err(e);
        }
    };

    let family = match &kind {
        ImageKind::Esxi(_) => OsFamily::Esxi,
        ImageKind::Rhel(_) => OsFamily::Rhel,
    };
    let entry_root = catalog.entry_root(family, image);

    let result = populate(catalog, iso_path, image, &entry_root, &kind).await;
    if let Err(e) = &result {
        warn!("extraction of {} failed, rolling back: {}", image, e);
        let _ = tokio::fs::remove_dir_all(&entry_root).await;
        let _ = tokio::fs::remove_file(iso_path).await;
    }
    result?;

    info!("extracted {} image {}", family, image);
    Ok(ExtractOutcome {
        image: image.to_string(),
        family,
    })
}

/// Everything after family identification; split out so `ingest` can roll
/// back on any error.
async fn populate(
    catalog: &Catalog,
    iso_path: &Path,
    image: &str,
    entry_root: &Path,
    kind: &ImageKind,
) -> Result<(), ExtractError> {
    let tree_dir = match kind {
        ImageKind::Esxi(_) => entry_root.join(OsFamily::Esxi.tree_dir()),
        ImageKind::Rhel(_) => entry_root.join(OsFamily::Rhel.tree_dir()),
    };

    {
        let iso_path = iso_path.to_path_buf();
        let entry_root = entry_root.to_path_buf();
        let tree_dir = tree_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ExtractError> {
            fs::create_dir_all(&entry_root)?;
            set_mode_0755(&entry_root)?;
            extract_tree(&iso_path, &tree_dir)
        })
        .await
        .map_err(|e| ExtractError::Iso(e.to_string()))??;
    }

    match kind {
        ImageKind::Esxi(release) => {
            let source = tree_dir.join("efi/boot/boot.cfg");
            let content = tokio::fs::read_to_string(&source).await?;
            tokio::fs::write(entry_root.join("boot.cfg"), rewrite_boot_cfg(&content)).await?;

            promote_if_newer(catalog, &tree_dir, image, release).await?;
        }
        ImageKind::Rhel(tree) => {
            info!("recognized {} {} tree", tree.family, tree.version);
            for loader in ["bootx64.efi", "grubx64.efi"] {
                let src = tree_dir.join("efi/boot").join(loader);
                tokio::fs::copy(&src, entry_root.join(loader)).await?;
            }
        }
    }
    Ok(())
}

/// Decides the promotion contest and, when won, records the release and
/// replaces `bootfiles/mboot.efi` under the promotion lock.
async fn promote_if_newer(
    catalog: &Catalog,
    tree_dir: &Path,
    image: &str,
    release: &EsxiRelease,
) -> Result<(), ExtractError> {
    let record_path = catalog.latest_release_path();
    let current = metadata::read_current_release(&record_path);
    if !metadata::supersedes(release, current.as_ref()) {
        return Ok(());
    }

    let yaml = serde_yaml::to_string(release)
        .map_err(|e| ExtractError::Metadata(e.to_string()))?;
    tokio::fs::write(&record_path, yaml).await?;

    let loader = tokio::fs::read(tree_dir.join("efi/boot/bootx64.efi")).await?;
    catalog.replace_promoted_loader(loader).await?;
    info!(
        "promoted {} ({}) as default boot loader",
        image, release.esx_version
    );
    Ok(())
}

/// Opens the ISO and decides which installer family it carries.
fn identify(iso_path: &Path) -> Result<ImageKind, ExtractError> {
    let file = fs::File::open(iso_path)?;
    let iso = ISO9660::new(file).map_err(|e| ExtractError::Iso(e.to_string()))?;

    if let Some(raw) = read_iso_file(&iso, "UPGRADE/METADATA.XML")? {
        return Ok(ImageKind::Esxi(metadata::parse_vum(&raw)?));
    }

    if let Some(raw) = read_iso_file(&iso, ".treeinfo")? {
        let text = String::from_utf8_lossy(&raw).into_owned();
        if let Some(info) = metadata::parse_treeinfo(&text) {
            return Ok(ImageKind::Rhel(info));
        }
    }

    Err(ExtractError::UnrecognizedImage(
        "neither ESXi upgrade metadata nor RHEL treeinfo found".to_string(),
    ))
}

/// Reads one file out of the image, trying the path as given and uppercased
/// (primary volume descriptors store bare uppercase identifiers).
fn read_iso_file<T: Read + Seek>(
    iso: &ISO9660<T>,
    path: &str,
) -> Result<Option<Vec<u8>>, ExtractError> {
    for candidate in [path.to_string(), path.to_uppercase()] {
        match iso.open(&candidate) {
            Ok(Some(DirectoryEntry::File(file))) => return read_all(&file).map(Some),
            Ok(_) => continue,
            Err(e) => return Err(ExtractError::Iso(e.to_string())),
        }
    }
    Ok(None)
}

fn read_all<T: Read + Seek>(file: &ISOFile<T>) -> Result<Vec<u8>, ExtractError> {
    let mut buf = Vec::new();
    file.read()
        .read_to_end(&mut buf)
        .map_err(|e| ExtractError::Iso(e.to_string()))?;
    Ok(buf)
}

/// Extracts the whole image tree below `target`, lowercasing every path
/// component on the way out.
fn extract_tree(iso_path: &Path, target: &Path) -> Result<(), ExtractError> {
    let file = fs::File::open(iso_path)?;
    let iso = ISO9660::new(file).map_err(|e| ExtractError::Iso(e.to_string()))?;
    match iso.open("/") {
        Ok(Some(DirectoryEntry::Directory(root))) => extract_dir(&root, target),
        Ok(_) => Err(ExtractError::Iso("image has no root directory".to_string())),
        Err(e) => Err(ExtractError::Iso(e.to_string())),
    }
}

fn extract_dir<T: Read + Seek>(
    dir: &ISODirectory<T>,
    target: &Path,
) -> Result<(), ExtractError> {
    fs::create_dir_all(target)?;
    for entry in dir.contents() {
        let entry = entry.map_err(|e| ExtractError::Iso(e.to_string()))?;
        let name = normalize_component(entry.identifier());
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        match entry {
            DirectoryEntry::Directory(sub) => extract_dir(&sub, &target.join(&name))?,
            DirectoryEntry::File(file) => {
                let mut out = fs::File::create(target.join(&name))?;
                let mut reader = file.read();
                std::io::copy(&mut reader, &mut out)?;
            }
            DirectoryEntry::Symlink(_) => {
                warn!("skipping symlink entry in ISO: {}", name);
            }
        }
    }
    Ok(())
}

/// Lowercases an ISO9660 identifier and drops the `;1` version suffix.
fn normalize_component(identifier: &str) -> String {
    let trimmed = identifier.split(';').next().unwrap_or(identifier);
    trimmed.trim_matches(char::from(0)).to_lowercase()
}

/// Rewrites an ESXi `boot.cfg` into the template served per request:
/// `kernelopt=` and `prefix=` lines point at the service, every other line
/// loses its slashes (the loader paths inside an entry are flat), and a
/// `prefix=` line is appended when the source had none.
pub fn rewrite_boot_cfg(content: &str) -> String {
    let mut prefix_found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with("kernelopt=") {
                KERNELOPT_LINE.to_string()
            } else if line.starts_with("prefix=") {
                prefix_found = true;
                PREFIX_LINE.to_string()
            } else {
                line.replace('/', "")
            }
        })
        .collect();
    if !prefix_found {
        lines.push(PREFIX_LINE.to_string());
    }
    lines.join("\n")
}
