//! Embedded bootstrap assets.
//!
//! Chain-loaders, boot scripts, and answer-file templates compiled into the
//! binary. Template markers use the `{{.Name}}` form and stay unrendered
//! until a request arrives, because the service address is only known at
//! runtime.

/// PXELINUX chain-loader for BIOS iPXE clients.
pub const PXELINUX_0: &[u8] = include_bytes!("../assets/pxelinux.0");

/// iPXE UEFI chain-loader.
pub const IPXE_EFI: &[u8] = include_bytes!("../assets/ipxe.efi");

/// iPXE legacy (UNDI) chain-loader for BIOS clients.
pub const UNDIONLY_KPXE: &[u8] = include_bytes!("../assets/undionly.kpxe");

/// iPXE auto-run script for ESXi installs.
pub const AUTOEXEC_IPXE: &str = include_str!("../assets/autoexec.ipxe");

/// iPXE auto-run template for RHEL installs.
pub const RHEL_AUTOEXEC_IPXE: &str = include_str!("../assets/rhelautoexec.ipxe");

/// PXELINUX default config for ESXi installs.
pub const PXELINUX_DEFAULT: &str = include_str!("../assets/default");

/// PXELINUX default template for RHEL installs.
pub const RHEL_PXELINUX_DEFAULT: &str = include_str!("../assets/rheldefault");

/// GRUB config template for ESXi HTTP boot.
pub const GRUB_CFG: &str = include_str!("../assets/grub.cfg");

/// GRUB config template for RHEL HTTP boot.
pub const RHEL_GRUB_CFG: &str = include_str!("../assets/rhelgrub.cfg");

/// ESXi unattended-install answer-file template.
pub const ESXI_KS_TEMPLATE: &str = include_str!("../assets/esxi-ks.cfg");

/// RHEL unattended-install answer-file template.
pub const RHEL_KS_TEMPLATE: &str = include_str!("../assets/rhel-ks.cfg");

/// Data substituted into boot templates (`boot.cfg`, iPXE scripts, GRUB and
/// PXELINUX configs).
#[derive(Debug, Clone)]
pub struct BootTemplateData {
    pub ks_server_addr: String,
    pub ks_server_port: String,
    pub filename: String,
}

impl BootTemplateData {
    pub fn new(addr: std::net::Ipv4Addr, port: u16, filename: &str) -> Self {
        Self {
            ks_server_addr: addr.to_string(),
            ks_server_port: port.to_string(),
            filename: filename.to_string(),
        }
    }
}

/// Renders a boot template by substituting the three markers. Rendering is
/// pure string replacement and therefore deterministic.
pub fn render_boot_template(template: &str, data: &BootTemplateData) -> String {
    template
        .replace("{{.KSServerAddr}}", &data.ks_server_addr)
        .replace("{{.KSServerPort}}", &data.ks_server_port)
        .replace("{{.Filename}}", &data.filename)
}
