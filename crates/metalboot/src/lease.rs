//! Lease allocation for the DHCP responder.
//!
//! The registry is authoritative for addresses this service handed out, but
//! unmanaged hosts on the same broadcast domain may occupy addresses inside
//! the lease range. Each candidate is therefore ARP-probed on the service
//! interface before it is allocated; an ARP answer within the deadline means
//! the address is taken.

use crate::error::RegistryError;
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

const ARP_DEADLINE: Duration = Duration::from_secs(1);

/// Inclusive IPv4 lease range.
#[derive(Debug, Clone, Copy)]
pub struct LeaseRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl LeaseRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.start)..=u32::from(self.end)).contains(&u32::from(ip))
    }
}

/// Liveness probe for a candidate address.
///
/// Trait seam so the allocator can be exercised without a network; the
/// production implementation is [`ArpProbe`].
pub trait Probe: Send + Sync {
    /// Returns true when `ip` is already in use on the segment.
    fn is_in_use(&self, ip: Ipv4Addr) -> Result<bool, RegistryError>;
}

/// Walks the range low-to-high and returns the first address that is
/// neither in `used` nor alive according to `probe`. `Ok(None)` means the
/// range is exhausted.
pub fn find_available_ip(
    used: &HashSet<Ipv4Addr>,
    range: LeaseRange,
    probe: &dyn Probe,
) -> Result<Option<Ipv4Addr>, RegistryError> {
    for raw in u32::from(range.start)..=u32::from(range.end) {
        let candidate = Ipv4Addr::from(raw);
        if used.contains(&candidate) {
            continue;
        }
        if probe.is_in_use(candidate)? {
            debug!("candidate {} answered ARP, skipping", candidate);
            continue;
        }
        return Ok(Some(candidate));
    }
    Ok(None)
}

/// ARP-based probe bound to the service interface.
pub struct ArpProbe {
    interface_name: String,
}

impl ArpProbe {
    pub fn new(interface_name: String) -> Self {
        Self { interface_name }
    }

    fn interface(&self) -> Result<NetworkInterface, RegistryError> {
        datalink::interfaces()
            .into_iter()
            .find(|i| i.name == self.interface_name)
            .ok_or_else(|| {
                RegistryError::Probe(format!("interface {} not found", self.interface_name))
            })
    }
}

impl Probe for ArpProbe {
    fn is_in_use(&self, ip: Ipv4Addr) -> Result<bool, RegistryError> {
        let iface = self.interface()?;

        // The interface's own addresses are in use by definition.
        for net in &iface.ips {
            if let IpNetwork::V4(v4) = net {
                if v4.ip() == ip {
                    return Ok(true);
                }
            }
        }

        let source_mac = iface
            .mac
            .ok_or_else(|| RegistryError::Probe(format!("{} has no MAC", iface.name)))?;
        let source_ip = iface
            .ips
            .iter()
            .find_map(|n| match n {
                IpNetwork::V4(v4) => Some(v4.ip()),
                _ => None,
            })
            .ok_or_else(|| RegistryError::Probe(format!("{} has no IPv4 address", iface.name)))?;

        let config = datalink::Config {
            read_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (mut tx, mut rx) = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(RegistryError::Probe(format!(
                    "unsupported channel type on {}",
                    iface.name
                )))
            }
            Err(e) => return Err(RegistryError::Probe(e.to_string())),
        };

        let mut eth_buf = [0u8; 42];
        let mut arp_buf = [0u8; 28];
        let mut eth = MutableEthernetPacket::new(&mut eth_buf)
            .ok_or_else(|| RegistryError::Probe("ethernet buffer too small".to_string()))?;
        eth.set_destination(MacAddr::broadcast());
        eth.set_source(source_mac);
        eth.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(&mut arp_buf)
            .ok_or_else(|| RegistryError::Probe("arp buffer too small".to_string()))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(ip);

        eth.set_payload(arp.packet_mut());

        if let Some(Err(e)) = tx.send_to(eth.packet(), None) {
            return Err(RegistryError::Probe(e.to_string()));
        }

        let deadline = Instant::now() + ARP_DEADLINE;
        while Instant::now() < deadline {
            match rx.next() {
                Ok(frame) => {
                    let Some(reply) = EthernetPacket::new(frame) else {
                        continue;
                    };
                    if reply.get_ethertype() != EtherTypes::Arp {
                        continue;
                    }
                    let Some(arp_reply) = ArpPacket::new(reply.payload()) else {
                        continue;
                    };
                    if arp_reply.get_operation() == ArpOperations::Reply
                        && arp_reply.get_sender_proto_addr() == ip
                    {
                        return Ok(true);
                    }
                }
                // Read timeouts just mean nothing arrived in this window.
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => return Err(RegistryError::Probe(e.to_string())),
            }
        }
        Ok(false)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StaticProbe;
    use super::*;

    fn range(start: [u8; 4], end: [u8; 4]) -> LeaseRange {
        LeaseRange {
            start: Ipv4Addr::from(start),
            end: Ipv4Addr::from(end),
        }
    }

    fn quiet() -> StaticProbe {
        StaticProbe {
            alive: HashSet::new(),
        }
    }

    #[test]
    fn allocates_lowest_free_address() {
        let used = HashSet::new();
        let got = find_available_ip(&used, range([10, 0, 0, 2], [10, 0, 0, 10]), &quiet()).unwrap();
        assert_eq!(got, Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn skips_addresses_already_handed_out() {
        let used: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
            .into_iter()
            .collect();
        let got = find_available_ip(&used, range([10, 0, 0, 2], [10, 0, 0, 10]), &quiet()).unwrap();
        assert_eq!(got, Some(Ipv4Addr::new(10, 0, 0, 4)));
    }

    #[test]
    fn skips_addresses_answering_arp() {
        let probe = StaticProbe {
            alive: [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect(),
        };
        let used = HashSet::new();
        let got = find_available_ip(&used, range([10, 0, 0, 2], [10, 0, 0, 10]), &probe).unwrap();
        assert_eq!(got, Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn range_end_is_a_valid_candidate() {
        let used: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();
        let got = find_available_ip(&used, range([10, 0, 0, 2], [10, 0, 0, 3]), &quiet()).unwrap();
        assert_eq!(got, Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn exhausted_range_returns_none() {
        let used: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
            .into_iter()
            .collect();
        let got = find_available_ip(&used, range([10, 0, 0, 2], [10, 0, 0, 3]), &quiet()).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn empty_range_returns_none() {
        // start > end iterates nothing
        let used = HashSet::new();
        let got = find_available_ip(&used, range([10, 0, 0, 10], [10, 0, 0, 2]), &quiet()).unwrap();
        assert_eq!(got, None);
    }
}
