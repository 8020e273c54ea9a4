//! Service error types.
//!
//! One enum per concern; HTTP status mapping lives in the `http` module
//! where the errors are surfaced.

use thiserror::Error;

/// Errors raised while loading or validating the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that does not parse.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    /// A configured IP address is not bound to any local interface.
    #[error("no interface found with IP {ip} (from {var})")]
    InterfaceNotFound { var: &'static str, ip: String },

    /// Automatic interface discovery could not find enough candidates.
    #[error("could not find two suitable network interfaces")]
    InterfaceDiscovery,
}

/// Errors raised by the registry and the lease allocator.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Every address in the lease range is taken or answers ARP.
    #[error("no IP addresses available in the configured lease range")]
    Exhausted,

    /// The requested image name does not match any catalog entry.
    #[error("unknown image: {0}")]
    UnknownImage(String),

    /// ARP probing failed at the network-interface level.
    #[error("lease probe failed: {0}")]
    Probe(String),
}

/// Errors raised by the ISO extraction pipeline.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The image carries neither ESXi upgrade metadata nor a RHEL treeinfo.
    #[error("unrecognized installer image: {0}")]
    UnrecognizedImage(String),

    /// The ISO9660 filesystem could not be read.
    #[error("ISO read error: {0}")]
    Iso(String),

    /// ESXi METADATA.XML was present but did not parse.
    #[error("metadata XML error: {0}")]
    Metadata(String),

    /// File I/O while populating the catalog.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The external ZIP-to-ISO converter failed.
    #[error("zip conversion failed: {0}")]
    ZipConvert(String),
}

impl ExtractError {
    /// True when the upload itself is at fault rather than the service.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            ExtractError::UnrecognizedImage(_)
                | ExtractError::Iso(_)
                | ExtractError::Metadata(_)
        )
    }
}
