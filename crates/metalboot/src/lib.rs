//! Network-boot provisioning service.
//!
//! Bare-metal hosts broadcast DHCP, get a lease and a boot-program name
//! matched to their firmware class, fetch loaders and configs over TFTP or
//! HTTP, then pull an installer tree and a per-host answer file to finish
//! an unattended ESXi or RHEL install.
//!
//! The crate is organized around the shared registry (per-host state), the
//! on-disk image catalog fed by the ISO extractor, and three listeners
//! (DHCP, TFTP, HTTP) that consult both.

pub mod assets;
pub mod catalog;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod http;
pub mod lease;
pub mod registry;
pub mod resolve;
pub mod server;
pub mod tftp;

pub use catalog::{Catalog, OsFamily};
pub use config::Config;
pub use error::{ConfigError, ExtractError, RegistryError};
pub use registry::{Mac, Registry};
pub use server::AppState;
