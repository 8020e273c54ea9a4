//! Per-host state registry.
//!
//! Three maps bind a booting host to what it should install: MAC→assigned
//! IP, MAC→(image, family), image→family. Each map sits behind its own
//! reader-writer lock; the compound allocate-if-absent operation is
//! serialized by a dedicated allocator mutex so two concurrent creates can
//! never hand out the same address.
//!
//! Nothing here persists: assignments live only as long as the process.

use crate::catalog::{Catalog, OsFamily};
use crate::error::RegistryError;
use crate::lease::{self, LeaseRange, Probe};
use macaddr::MacAddr6;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::info;

/// Canonical lowercase colon-separated MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mac(String);

impl Mac {
    /// Parses a MAC in colon, hyphen, or dot notation.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let addr = MacAddr6::from_str(raw).map_err(|e| e.to_string())?;
        Ok(Self::from_bytes(addr.into_array()))
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Mac(format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Image binding of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBinding {
    pub image: String,
    pub family: OsFamily,
}

/// Everything the boot path knows about one host.
#[derive(Debug, Clone)]
pub struct HostBinding {
    pub ip: Ipv4Addr,
    pub image: String,
    pub family: OsFamily,
}

pub struct Registry {
    mac_ip: RwLock<HashMap<Mac, Ipv4Addr>>,
    mac_image: RwLock<HashMap<Mac, ImageBinding>>,
    image_family: RwLock<HashMap<String, OsFamily>>,
    /// Serializes allocate-if-absent against concurrent allocators.
    allocator: Mutex<()>,
    range: LeaseRange,
    probe: Arc<dyn Probe>,
}

impl Registry {
    pub fn new(range: LeaseRange, probe: Arc<dyn Probe>) -> Self {
        Self {
            mac_ip: RwLock::new(HashMap::new()),
            mac_image: RwLock::new(HashMap::new()),
            image_family: RwLock::new(HashMap::new()),
            allocator: Mutex::new(()),
            range,
            probe,
        }
    }

    pub fn lease_range(&self) -> LeaseRange {
        self.range
    }

    /// Assigns an address to `mac`, or returns the one it already holds.
    /// ARP probing runs on the blocking pool; the allocator mutex is held
    /// across the probe so concurrent creates serialize.
    pub async fn assign(&self, mac: &Mac) -> Result<Ipv4Addr, RegistryError> {
        let _guard = self.allocator.lock().await;

        if let Some(ip) = self.ip_of(mac) {
            info!("MAC {} already has IP {} assigned", mac, ip);
            return Ok(ip);
        }

        let used: HashSet<Ipv4Addr> = self
            .mac_ip
            .read()
            .expect("mac_ip lock poisoned")
            .values()
            .copied()
            .collect();
        let range = self.range;
        let probe = Arc::clone(&self.probe);
        let found = tokio::task::spawn_blocking(move || {
            lease::find_available_ip(&used, range, probe.as_ref())
        })
        .await
        .map_err(|e| RegistryError::Probe(e.to_string()))??;

        let ip = found.ok_or(RegistryError::Exhausted)?;
        self.mac_ip
            .write()
            .expect("mac_ip lock poisoned")
            .insert(mac.clone(), ip);
        info!("assigned IP {} to MAC {}", ip, mac);
        Ok(ip)
    }

    /// Binds `mac` to an image, resolving the family from the catalog.
    pub fn bind_image(
        &self,
        mac: &Mac,
        image: &str,
        catalog: &Catalog,
    ) -> Result<OsFamily, RegistryError> {
        let family = catalog
            .family_of(image)
            .ok_or_else(|| RegistryError::UnknownImage(image.to_string()))?;
        self.mac_image
            .write()
            .expect("mac_image lock poisoned")
            .insert(
                mac.clone(),
                ImageBinding {
                    image: image.to_string(),
                    family,
                },
            );
        self.image_family
            .write()
            .expect("image_family lock poisoned")
            .insert(image.to_string(), family);
        info!("bound image {} ({}) to MAC {}", image, family, mac);
        Ok(family)
    }

    /// Drops the assignment whose address equals `ip` (DHCP RELEASE path).
    pub fn release(&self, ip: Ipv4Addr) {
        let mut map = self.mac_ip.write().expect("mac_ip lock poisoned");
        if let Some(mac) = map
            .iter()
            .find_map(|(mac, v)| (*v == ip).then(|| mac.clone()))
        {
            map.remove(&mac);
            info!("IP {} released, removed assignment for MAC {}", ip, mac);
        }
    }

    /// Removes `mac` from both host-keyed maps. The image→family map is
    /// left alone: images outlive hosts.
    pub fn forget(&self, mac: &Mac) {
        self.mac_ip
            .write()
            .expect("mac_ip lock poisoned")
            .remove(mac);
        self.mac_image
            .write()
            .expect("mac_image lock poisoned")
            .remove(mac);
        info!("removed registry entries for MAC {}", mac);
    }

    pub fn ip_of(&self, mac: &Mac) -> Option<Ipv4Addr> {
        self.mac_ip
            .read()
            .expect("mac_ip lock poisoned")
            .get(mac)
            .copied()
    }

    pub fn image_of(&self, mac: &Mac) -> Option<ImageBinding> {
        self.mac_image
            .read()
            .expect("mac_image lock poisoned")
            .get(mac)
            .cloned()
    }

    pub fn family_of_image(&self, image: &str) -> Option<OsFamily> {
        self.image_family
            .read()
            .expect("image_family lock poisoned")
            .get(image)
            .copied()
    }

    pub fn lookup(&self, mac: &Mac) -> Option<HostBinding> {
        let ip = self.ip_of(mac)?;
        let binding = self.image_of(mac)?;
        Some(HostBinding {
            ip,
            image: binding.image,
            family: binding.family,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::test_support::StaticProbe;
    use tempfile::tempdir;

    fn test_registry(start: [u8; 4], end: [u8; 4]) -> Registry {
        Registry::new(
            LeaseRange {
                start: Ipv4Addr::from(start),
                end: Ipv4Addr::from(end),
            },
            Arc::new(StaticProbe {
                alive: HashSet::new(),
            }),
        )
    }

    fn mac(last: u8) -> Mac {
        Mac::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    #[test]
    fn canonicalizes_macs() {
        assert_eq!(
            Mac::parse("AA-BB-CC-DD-EE-01").unwrap().as_str(),
            "aa:bb:cc:dd:ee:01"
        );
        assert_eq!(
            Mac::parse("aa:bb:cc:dd:ee:01").unwrap(),
            Mac::from_bytes([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01])
        );
        assert!(Mac::parse("not-a-mac").is_err());
    }

    #[tokio::test]
    async fn assign_is_idempotent_per_mac() {
        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 10]);
        let first = registry.assign(&mac(1)).await.unwrap();
        let second = registry.assign(&mac(1)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn assignments_are_injective_and_in_range() {
        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 10]);
        let a = registry.assign(&mac(1)).await.unwrap();
        let b = registry.assign(&mac(2)).await.unwrap();
        assert_ne!(a, b);
        assert!(registry.lease_range().contains(a));
        assert!(registry.lease_range().contains(b));
    }

    #[tokio::test]
    async fn exhausted_range_is_an_error() {
        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 3]);
        registry.assign(&mac(1)).await.unwrap();
        registry.assign(&mac(2)).await.unwrap();
        let err = registry.assign(&mac(3)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Exhausted));
    }

    #[tokio::test]
    async fn release_removes_the_matching_assignment() {
        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 10]);
        let ip = registry.assign(&mac(1)).await.unwrap();
        registry.release(ip);
        assert_eq!(registry.ip_of(&mac(1)), None);
    }

    #[tokio::test]
    async fn forget_clears_host_maps_but_not_image_family() {
        let root = tempdir().unwrap();
        let catalog = Catalog::new(root.path());
        catalog.ensure_layout().unwrap();
        std::fs::create_dir_all(catalog.boot_dir().join("esxi-8u2")).unwrap();

        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 10]);
        registry.assign(&mac(1)).await.unwrap();
        registry.bind_image(&mac(1), "esxi-8u2", &catalog).unwrap();

        registry.forget(&mac(1));
        assert!(registry.ip_of(&mac(1)).is_none());
        assert!(registry.image_of(&mac(1)).is_none());
        assert_eq!(registry.family_of_image("esxi-8u2"), Some(OsFamily::Esxi));
    }

    #[tokio::test]
    async fn binding_an_unknown_image_fails() {
        let root = tempdir().unwrap();
        let catalog = Catalog::new(root.path());
        catalog.ensure_layout().unwrap();

        let registry = test_registry([10, 0, 0, 2], [10, 0, 0, 10]);
        let err = registry
            .bind_image(&mac(1), "missing-image", &catalog)
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownImage(_)));
    }
}
