//! DHCP responder.
//!
//! Only hosts registered through the REST surface get answers: the MAC must
//! hold both an IP assignment and an image binding, otherwise the packet is
//! dropped with a warning and the client keeps retrying. The boot filename
//! is chosen from the client architecture (option 93) and user class
//! (option 77); UEFI HTTP clients get a full URL and the `HTTPClient`
//! vendor class. Per-packet errors never stop the loop.

use crate::registry::Mac;
use crate::server::AppState;
use dhcproto::v4::{
    Decodable, Decoder, DhcpOption, Encodable, Encoder, Flags, Message, MessageType, Opcode,
    OptionCode,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const LEASE_SECONDS: u32 = 7200;

/// User class iPXE sets once it has chain-loaded, so the server can stop
/// handing out the chain-loader again.
const IPXE_USER_CLASS: &[u8] = b"iPXE";

/// What to do with one received packet.
#[derive(Debug)]
pub enum DhcpAction {
    Reply(Message),
    Release(Ipv4Addr),
    Ignore,
}

/// Runs the responder until cancellation. Startup failures (socket bind)
/// are fatal; everything after that is per-packet.
pub async fn run(state: AppState, shutdown: CancellationToken) -> io::Result<()> {
    let socket = bind_broadcast_socket(DHCP_SERVER_PORT)?;
    info!("starting DHCP server...");

    let mut buf = vec![0u8; 1500];
    loop {
        let (len, _src) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("dhcp server: shutting down...");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    error!("failed to receive DHCP packet: {}", e);
                    continue;
                }
            },
        };

        let msg = match Message::decode(&mut Decoder::new(&buf[..len])) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable DHCP packet: {}", e);
                continue;
            }
        };

        match build_response(&state, &msg) {
            DhcpAction::Reply(reply) => {
                let mut out = Vec::with_capacity(300);
                if let Err(e) = reply.encode(&mut Encoder::new(&mut out)) {
                    error!("failed to encode DHCP reply: {}", e);
                    continue;
                }
                let dst = SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::BROADCAST,
                    DHCP_CLIENT_PORT,
                ));
                if let Err(e) = socket.send_to(&out, dst).await {
                    error!("unable to send DHCP reply: {}", e);
                }
            }
            DhcpAction::Release(ip) => state.registry.release(ip),
            DhcpAction::Ignore => {}
        }
    }
}

/// Decides the reply for one request. Pure over registry state, so the
/// firmware-class table is unit-testable without sockets.
pub fn build_response(state: &AppState, msg: &Message) -> DhcpAction {
    if msg.opcode() != Opcode::BootRequest {
        return DhcpAction::Ignore;
    }

    let chaddr = msg.chaddr();
    if chaddr.len() < 6 {
        warn!("DHCP request with short hardware address");
        return DhcpAction::Ignore;
    }
    let mut raw_mac = [0u8; 6];
    raw_mac.copy_from_slice(&chaddr[..6]);
    let mac = Mac::from_bytes(raw_mac);

    let msg_type = match msg.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => *t,
        _ => {
            warn!("DHCP packet from {} has no message type", mac);
            return DhcpAction::Ignore;
        }
    };
    info!("received {:?} from {}", msg_type, mac);

    let Some(ip) = state.registry.ip_of(&mac) else {
        warn!("no IP address found for MAC address: {}", mac);
        return DhcpAction::Ignore;
    };
    let Some(binding) = state.registry.image_of(&mac) else {
        warn!("no image found for MAC address: {}", mac);
        return DhcpAction::Ignore;
    };

    if msg_type == MessageType::Release {
        return DhcpAction::Release(msg.ciaddr());
    }

    let mut reply = Message::default();
    reply
        .set_opcode(Opcode::BootReply)
        .set_xid(msg.xid())
        .set_ciaddr(msg.ciaddr())
        .set_yiaddr(ip)
        .set_siaddr(state.config.service_addr)
        .set_chaddr(chaddr);
    info!("assigned ip is {}", ip);

    let user_class_is_ipxe = msg
        .opts()
        .get(OptionCode::from(77u8))
        .and_then(option_data)
        .is_some_and(|data| data == IPXE_USER_CLASS);

    let mut http_client = false;
    match client_architecture(msg) {
        Some(arch) => {
            let filename = match arch {
                // Legacy BIOS PXE
                0 => {
                    if user_class_is_ipxe {
                        format!("{}/pxelinux.0", binding.image)
                    } else {
                        format!("{}/undionly.kpxe", binding.image)
                    }
                }
                // UEFI PXE
                6 | 7 | 9 => {
                    if user_class_is_ipxe {
                        format!("{}/{}", binding.image, binding.family.main_boot_loader())
                    } else {
                        format!("{}/ipxe.efi", binding.image)
                    }
                }
                // UEFI HTTP
                16 => {
                    http_client = true;
                    format!(
                        "http://{}/{}/{}/{}",
                        state.config.service_addr,
                        binding.family.http_installer_prefix(),
                        binding.image,
                        binding.family.main_boot_loader()
                    )
                }
                other => {
                    info!(
                        "unknown client system architecture {} for MAC address: {}",
                        other, mac
                    );
                    return DhcpAction::Ignore;
                }
            };
            reply.set_fname_str(&filename);
        }
        None => {
            info!("no client system architecture found for MAC address: {}", mac);
        }
    }

    let opts = reply.opts_mut();
    if http_client {
        opts.insert(DhcpOption::ClassIdentifier(b"HTTPClient".to_vec()));
    }
    opts.insert(DhcpOption::ServerIdentifier(state.config.service_addr));
    opts.insert(DhcpOption::SubnetMask(state.config.service_netmask));
    opts.insert(DhcpOption::AddressLeaseTime(LEASE_SECONDS));

    match msg_type {
        MessageType::Discover => {
            reply.set_flags(Flags::default().set_broadcast());
            reply
                .opts_mut()
                .insert(DhcpOption::MessageType(MessageType::Offer));
        }
        MessageType::Request => {
            reply
                .opts_mut()
                .insert(DhcpOption::MessageType(MessageType::Ack));
        }
        other => {
            warn!("message type {:?} not supported", other);
            return DhcpAction::Ignore;
        }
    }

    DhcpAction::Reply(reply)
}

fn client_architecture(msg: &Message) -> Option<u16> {
    match msg.opts().get(OptionCode::ClientSystemArchitecture) {
        Some(DhcpOption::ClientSystemArchitecture(arch)) => Some(u16::from(*arch)),
        _ => None,
    }
}

/// Raw payload of one option, whatever variant the decoder produced. Typed
/// variants are re-encoded and stripped of the code/length header.
fn option_data(opt: &DhcpOption) -> Option<Vec<u8>> {
    match opt {
        DhcpOption::Unknown(raw) => Some(raw.data().to_vec()),
        other => {
            let mut buf = Vec::new();
            other.encode(&mut Encoder::new(&mut buf)).ok()?;
            (buf.len() >= 2).then(|| buf[2..].to_vec())
        }
    }
}

/// UDP/67 socket able to receive broadcast DISCOVERs and answer to
/// 255.255.255.255.
fn bind_broadcast_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::RegistryError;
    use crate::lease::{LeaseRange, Probe};
    use crate::registry::Registry;
    use crate::Catalog;
    use dhcproto::v4;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct QuietProbe;
    impl Probe for QuietProbe {
        fn is_in_use(&self, _ip: Ipv4Addr) -> Result<bool, RegistryError> {
            Ok(false)
        }
    }

    const CLIENT_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

    fn test_state(root: &TempDir) -> AppState {
        let catalog = Arc::new(Catalog::new(root.path()));
        catalog.ensure_layout().unwrap();
        AppState {
            config: Arc::new(Config {
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
            }),
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

    async fn register(state: &AppState, image: &str, family_dir: &Path) {
        std::fs::create_dir_all(family_dir.join(image)).unwrap();
        let mac = Mac::from_bytes(CLIENT_MAC);
        state.registry.assign(&mac).await.unwrap();
        state.registry.bind_image(&mac, image, &state.catalog).unwrap();
    }

    /// Builds a request and round-trips it through the wire codec, so the
    /// options land in whatever variants the decoder really produces.
    fn request(msg_type: MessageType, arch: Option<v4::Architecture>, ipxe: bool) -> Message {
        let mut msg = Message::default();
        msg.set_chaddr(&CLIENT_MAC).set_xid(0x1234);
        let opts = msg.opts_mut();
        opts.insert(DhcpOption::MessageType(msg_type));
        if let Some(arch) = arch {
            opts.insert(DhcpOption::ClientSystemArchitecture(arch));
        }
        if ipxe {
            opts.insert(DhcpOption::Unknown(v4::UnknownOption::new(
                OptionCode::Unknown(77),
                IPXE_USER_CLASS.to_vec(),
            )));
        }
        roundtrip(msg)
    }

    fn roundtrip(msg: Message) -> Message {
        let mut buf = Vec::new();
        msg.encode(&mut Encoder::new(&mut buf)).unwrap();
        Message::decode(&mut Decoder::new(&buf)).unwrap()
    }

    fn reply_of(action: DhcpAction) -> Message {
        match action {
            DhcpAction::Reply(msg) => msg,
            other => panic!("expected a reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn uefi_ipxe_esxi_discover_gets_promoted_loader_path() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "esxi-8u2", state.catalog.boot_dir()).await;

        let msg = request(MessageType::Discover, Some(v4::Architecture::from(7)), true);
        let reply = reply_of(build_response(&state, &msg));

        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.fname_str().map(|r| r.unwrap()), Some("esxi-8u2/mboot.efi"));
        assert!(matches!(
            reply.opts().get(OptionCode::MessageType),
            Some(DhcpOption::MessageType(MessageType::Offer))
        ));
        assert!(matches!(
            reply.opts().get(OptionCode::AddressLeaseTime),
            Some(DhcpOption::AddressLeaseTime(7200))
        ));
        assert!(matches!(
            reply.opts().get(OptionCode::ServerIdentifier),
            Some(DhcpOption::ServerIdentifier(ip)) if *ip == Ipv4Addr::new(10, 0, 0, 1)
        ));
    }

    #[tokio::test]
    async fn uefi_http_rhel_discover_gets_url_and_vendor_class() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "rhel-9.3", state.catalog.rhel_boot_dir()).await;

        let msg = request(MessageType::Discover, Some(v4::Architecture::from(16)), false);
        let reply = reply_of(build_response(&state, &msg));

        assert_eq!(
            reply.fname_str().map(|r| r.unwrap()),
            Some("http://10.0.0.1/rhelinstaller/rhel-9.3/bootx64.efi")
        );
        assert!(matches!(
            reply.opts().get(OptionCode::ClassIdentifier),
            Some(DhcpOption::ClassIdentifier(v)) if v == b"HTTPClient"
        ));
    }

    #[tokio::test]
    async fn bios_clients_get_the_chain_loader_first() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "esxi-8u2", state.catalog.boot_dir()).await;

        let plain = request(MessageType::Discover, Some(v4::Architecture::from(0)), false);
        let reply = reply_of(build_response(&state, &plain));
        assert_eq!(reply.fname_str().map(|r| r.unwrap()), Some("esxi-8u2/undionly.kpxe"));

        let chained = request(MessageType::Discover, Some(v4::Architecture::from(0)), true);
        let reply = reply_of(build_response(&state, &chained));
        assert_eq!(reply.fname_str().map(|r| r.unwrap()), Some("esxi-8u2/pxelinux.0"));
    }

    #[tokio::test]
    async fn missing_architecture_still_answers_without_filename() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "esxi-8u2", state.catalog.boot_dir()).await;

        let msg = request(MessageType::Request, None, false);
        let reply = reply_of(build_response(&state, &msg));
        assert!(reply.fname_str().is_none() || reply.fname_str().map(|r| r.unwrap()) == Some(""));
        assert!(matches!(
            reply.opts().get(OptionCode::MessageType),
            Some(DhcpOption::MessageType(MessageType::Ack))
        ));
    }

    #[tokio::test]
    async fn user_class_survives_the_wire_codec() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "esxi-8u2", state.catalog.boot_dir()).await;

        // Decoded straight off the wire, option 77 must still flip the
        // firmware class to the chain-loaded table rows.
        let msg = request(MessageType::Discover, Some(v4::Architecture::from(0)), true);
        let reply = reply_of(build_response(&state, &msg));
        assert_eq!(reply.fname_str().map(|r| r.unwrap()), Some("esxi-8u2/pxelinux.0"));
    }

    #[tokio::test]
    async fn unmanaged_macs_are_dropped_silently() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let msg = request(MessageType::Discover, Some(v4::Architecture::from(7)), true);
        assert!(matches!(build_response(&state, &msg), DhcpAction::Ignore));
    }

    #[tokio::test]
    async fn release_drops_the_assignment_and_later_discovers() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        register(&state, "esxi-8u2", state.catalog.boot_dir()).await;
        let assigned = state
            .registry
            .ip_of(&Mac::from_bytes(CLIENT_MAC))
            .unwrap();

        let mut release = request(MessageType::Release, None, false);
        release.set_ciaddr(assigned);
        match build_response(&state, &release) {
            DhcpAction::Release(ip) => state.registry.release(ip),
            other => panic!("expected release, got {:?}", other),
        }

        let discover = request(MessageType::Discover, Some(v4::Architecture::from(7)), true);
        assert!(matches!(build_response(&state, &discover), DhcpAction::Ignore));
    }
}
