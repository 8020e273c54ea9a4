//! Installer image metadata.
//!
//! ESXi images carry `UPGRADE/METADATA.XML` with a `<vum>` document naming
//! the product version and release date; RHEL images carry an INI-style
//! `.treeinfo` at the image root. Both are used to recognize uploads, and
//! the ESXi record additionally drives the default-loader promotion contest
//! persisted in `latest_release.yaml`.

use crate::error::ExtractError;
use chrono::DateTime;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// `<vum>` document inside an ESXi image.
#[derive(Debug, Deserialize)]
pub struct Vum {
    pub product: Product,
}

#[derive(Debug, Default, Deserialize)]
pub struct Product {
    #[serde(rename = "esxVersion", default)]
    pub esx_version: String,
    #[serde(rename = "name", default)]
    pub name: String,
    #[serde(rename = "releaseDate", default)]
    pub release_date: String,
}

/// The record persisted in `latest_release.yaml` for the promotion contest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsxiRelease {
    #[serde(rename = "esxVersion")]
    pub esx_version: String,
    #[serde(rename = "releaseDate")]
    pub release_date: String,
}

/// Parses `METADATA.XML` content. Vendor images ship this with non-UTF-8
/// charset declarations, so the bytes are decoded lossily before parsing.
pub fn parse_vum(raw: &[u8]) -> Result<EsxiRelease, ExtractError> {
    let text = String::from_utf8_lossy(raw);
    let vum: Vum = quick_xml::de::from_str(&text)
        .map_err(|e| ExtractError::Metadata(e.to_string()))?;
    if vum.product.name.is_empty() {
        return Err(ExtractError::Metadata(
            "product name missing from METADATA.XML".to_string(),
        ));
    }
    Ok(EsxiRelease {
        esx_version: vum.product.esx_version,
        release_date: vum.product.release_date,
    })
}

/// Key facts from a RHEL `.treeinfo` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    pub family: String,
    pub version: String,
}

/// Parses the INI-style `.treeinfo`, keeping the first `family` and
/// `version` keys seen. Returns `None` when either is absent or empty.
pub fn parse_treeinfo(raw: &str) -> Option<TreeInfo> {
    let mut family = None;
    let mut version = None;
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "family" if family.is_none() && !value.is_empty() => {
                family = Some(value.to_string());
            }
            "version" if version.is_none() && !value.is_empty() => {
                version = Some(value.to_string());
            }
            _ => {}
        }
    }
    Some(TreeInfo {
        family: family?,
        version: version?,
    })
}

/// Reads the current `latest_release.yaml`, treating a missing or
/// unparseable file as "no current record".
pub fn read_current_release(path: &Path) -> Option<EsxiRelease> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&raw) {
        Ok(release) => Some(release),
        Err(e) => {
            warn!("ignoring unparseable {}: {}", path.display(), e);
            None
        }
    }
}

/// The promotion contest: true when `candidate` should become the default
/// boot loader over `current`.
///
/// Semantic-version precedence, RFC3339 release date as tiebreak. A current
/// record that does not parse loses; a candidate that does not parse loses
/// only against a well-formed current record.
pub fn supersedes(candidate: &EsxiRelease, current: Option<&EsxiRelease>) -> bool {
    let Some(current) = current else {
        return true;
    };
    let Ok(old_version) = Version::parse(&current.esx_version) else {
        return true;
    };
    let Ok(new_version) = Version::parse(&candidate.esx_version) else {
        return false;
    };

    if new_version > old_version {
        return true;
    }
    if new_version < old_version {
        return false;
    }

    let Ok(old_date) = DateTime::parse_from_rfc3339(&current.release_date) else {
        return true;
    };
    let Ok(new_date) = DateTime::parse_from_rfc3339(&candidate.release_date) else {
        return false;
    };
    new_date > old_date
}
