//! Service configuration.
//!
//! Configuration comes from environment variables with interface
//! auto-discovery filling the gaps: when `API_IP_ADDR` or `SERVICE_IP_ADDR`
//! is unset, the first two up, non-loopback `eth*`/`ens*` interfaces are
//! used (first for the API, second for the boot services). When the DHCP
//! lease range is unset it is derived from the service interface's CIDR.

use crate::error::ConfigError;
use pnet::datalink;
use pnet::ipnetwork::IpNetwork;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::info;

/// A local interface selected to carry one of the service roles.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub interface_name: String,
    pub ip_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_addr: Ipv4Addr,
    pub api_server_port: u16,
    pub service_interface: String,
    pub service_addr: Ipv4Addr,
    pub service_netmask: Ipv4Addr,
    pub dhcp_start: Ipv4Addr,
    pub dhcp_end: Ipv4Addr,
    pub ks_dir_path: PathBuf,
    pub file_dir_path: PathBuf,
    pub log_file_path: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from the environment, consulting the local
    /// interface table for anything not pinned by a variable.
    pub fn load() -> Result<Self, ConfigError> {
        let api_ip = env::var("API_IP_ADDR").ok().filter(|v| !v.is_empty());
        let service_ip = env::var("SERVICE_IP_ADDR").ok().filter(|v| !v.is_empty());

        let (api_port, service_port) = match (api_ip, service_ip) {
            (Some(api), Some(svc)) => (
                find_port("API_IP_ADDR", &api)?,
                find_port("SERVICE_IP_ADDR", &svc)?,
            ),
            (Some(api), None) => {
                let (_, svc) = discover_ports(false)?;
                (
                    find_port("API_IP_ADDR", &api)?,
                    svc.ok_or(ConfigError::InterfaceDiscovery)?,
                )
            }
            (None, Some(svc)) => {
                let (api, _) = discover_ports(false)?;
                (
                    api.ok_or(ConfigError::InterfaceDiscovery)?,
                    find_port("SERVICE_IP_ADDR", &svc)?,
                )
            }
            (None, None) => {
                let (api, svc) = discover_ports(true)?;
                (
                    api.ok_or(ConfigError::InterfaceDiscovery)?,
                    svc.ok_or(ConfigError::InterfaceDiscovery)?,
                )
            }
        };

        let api_server_port = parse_env("API_SERVER_PORT", 80u16)?;

        let (dhcp_start, dhcp_end) = match (
            env::var("DHCP_START_IP").ok().filter(|v| !v.is_empty()),
            env::var("DHCP_END_IP").ok().filter(|v| !v.is_empty()),
        ) {
            (Some(start), Some(end)) => (
                parse_ipv4("DHCP_START_IP", &start)?,
                parse_ipv4("DHCP_END_IP", &end)?,
            ),
            _ => derive_lease_range(service_port.ip_address, service_port.subnet_mask),
        };

        let ks_dir_path = env::var("KS_DIR_PATH").unwrap_or_else(|_| "./".to_string());
        let file_dir_path = env::var("FILE_DIR_PATH").unwrap_or_else(|_| "./files".to_string());
        let log_file_path = env::var("LOG_FILE_PATH").ok().filter(|v| !v.is_empty());

        Ok(Config {
            api_addr: api_port.ip_address,
            api_server_port,
            service_interface: service_port.interface_name,
            service_addr: service_port.ip_address,
            service_netmask: service_port.subnet_mask,
            dhcp_start,
            dhcp_end,
            ks_dir_path: PathBuf::from(ks_dir_path),
            file_dir_path: PathBuf::from(file_dir_path),
            log_file_path: log_file_path.map(PathBuf::from),
        })
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn parse_ipv4(var: &'static str, raw: &str) -> Result<Ipv4Addr, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        var,
        reason: format!("{raw} is not an IPv4 address"),
    })
}

/// Finds the local interface carrying `ip` and captures its netmask. `var`
/// is the environment variable the address came from, so errors point at
/// what the operator actually set.
fn find_port(var: &'static str, ip: &str) -> Result<PortInfo, ConfigError> {
    let wanted = parse_ipv4(var, ip)?;

    for iface in datalink::interfaces() {
        for net in &iface.ips {
            if let IpNetwork::V4(v4) = net {
                if v4.ip() == wanted {
                    info!("found IP {} on interface {}", wanted, iface.name);
                    return Ok(PortInfo {
                        interface_name: iface.name.clone(),
                        ip_address: v4.ip(),
                        subnet_mask: v4.mask(),
                    });
                }
            }
        }
    }
    Err(ConfigError::InterfaceNotFound {
        var,
        ip: wanted.to_string(),
    })
}

/// Picks the first two up, non-loopback `eth*`/`ens*` IPv4 interfaces.
/// The first is the API port, the second the service port.
fn discover_ports(require_both: bool) -> Result<(Option<PortInfo>, Option<PortInfo>), ConfigError> {
    let mut api_port: Option<PortInfo> = None;
    let mut service_port: Option<PortInfo> = None;

    for iface in datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        if !(iface.name.starts_with("eth") || iface.name.starts_with("ens")) {
            continue;
        }
        for net in &iface.ips {
            let IpNetwork::V4(v4) = net else { continue };
            let info = PortInfo {
                interface_name: iface.name.clone(),
                ip_address: v4.ip(),
                subnet_mask: v4.mask(),
            };
            if api_port.is_none() {
                api_port = Some(info);
            } else if service_port.is_none()
                && api_port.as_ref().map(|p| p.interface_name.as_str()) != Some(iface.name.as_str())
            {
                service_port = Some(info);
                break;
            }
        }
        if api_port.is_some() && service_port.is_some() {
            break;
        }
    }

    if require_both && (api_port.is_none() || service_port.is_none()) {
        return Err(ConfigError::InterfaceDiscovery);
    }
    Ok((api_port, service_port))
}

/// First and last usable host addresses of the subnet `addr`/`mask`.
pub fn derive_lease_range(addr: Ipv4Addr, mask: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    let ip = u32::from(addr);
    let mask = u32::from(mask);
    let network = ip & mask;
    let broadcast = network | !mask;
    (Ipv4Addr::from(network + 1), Ipv4Addr::from(broadcast - 1))
}
