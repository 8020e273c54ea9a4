//! Answer-file REST surface.
//!
//! `POST /ks` validates the request, assigns an IP from the lease range,
//! binds the MAC to an installer image, and writes the rendered answer file
//! under `ks/<ip>/ks.cfg`. Installers later fetch it with `GET /ks`, keyed
//! purely by their source address. `DELETE /ks/{id}` forgets the host.

use crate::assets;
use crate::catalog::OsFamily;
use crate::error::RegistryError;
use crate::registry::Mac;
use crate::server::AppState;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// An unattended-install request for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KsRequest {
    pub macaddress: String,
    pub password: String,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub nameserver: String,
    pub hostname: String,
    pub vlanid: Option<u16>,
    pub cli: Vec<String>,
    pub keyboard: String,
    pub isofilename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notvmpgcreate: Option<bool>,
}

fn hostname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$")
            .expect("hostname pattern is valid")
    })
}

impl KsRequest {
    /// Field validation; returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        Mac::parse(&self.macaddress).map_err(|_| "invalid mac address format".to_string())?;
        if self.password.is_empty() {
            return Err("password is required".to_string());
        }
        for (field, value) in [
            ("ip", &self.ip),
            ("gateway", &self.gateway),
            ("nameserver", &self.nameserver),
            ("netmask", &self.netmask),
        ] {
            if value.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(format!("invalid {field} address"));
            }
        }
        if self.hostname.is_empty() || !hostname_pattern().is_match(&self.hostname) {
            return Err("invalid hostname".to_string());
        }
        if let Some(vlan) = self.vlanid {
            if vlan > 4094 {
                return Err("vlanid must be between 0 and 4094".to_string());
            }
        }
        if self.cli.is_empty() {
            return Err("cli is required".to_string());
        }
        if self.keyboard.is_empty() {
            return Err("keyboard is required".to_string());
        }
        if self.isofilename.is_empty() {
            return Err("isofilename is required".to_string());
        }
        Ok(())
    }
}

/// Renders the per-family answer file. Pure substitution, so two renders of
/// the same request are byte-identical.
pub fn render_ks(family: OsFamily, ks: &KsRequest) -> String {
    let template = match family {
        OsFamily::Esxi => assets::ESXI_KS_TEMPLATE,
        OsFamily::Rhel => assets::RHEL_KS_TEMPLATE,
    };
    let vlan_option = ks
        .vlanid
        .map(|v| format!(" --vlanid={v}"))
        .unwrap_or_default();
    let portgroup_option = if family == OsFamily::Esxi && ks.notvmpgcreate == Some(true) {
        " --addvmportgroup=0"
    } else {
        ""
    };
    template
        .replace("{{.Password}}", &ks.password)
        .replace("{{.IP}}", &ks.ip)
        .replace("{{.Netmask}}", &ks.netmask)
        .replace("{{.Gateway}}", &ks.gateway)
        .replace("{{.Nameserver}}", &ks.nameserver)
        .replace("{{.Hostname}}", &ks.hostname)
        .replace("{{.Keyboard}}", &ks.keyboard)
        .replace("{{.VlanOption}}", &vlan_option)
        .replace("{{.PortGroupOption}}", portgroup_option)
        .replace("{{.CLI}}", &ks.cli.join("\n"))
}

/// GET /ks: serve the answer file for the calling installer's address.
/// Anything unexpected is a plain 500: the installer gets no hints about
/// other hosts' files.
pub async fn get_ks(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let ks_path = state.ks_root().join(peer.ip().to_string()).join("ks.cfg");
    info!("received GET request. KS file path is {}", ks_path.display());

    match tokio::fs::read(&ks_path).await {
        Ok(content) => (StatusCode::OK, content).into_response(),
        Err(e) => {
            error!("error opening file: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encountered unexpected problem",
            )
                .into_response()
        }
    }
}

/// POST /ks: register a host and write its answer file.
pub async fn create_ks(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != "application/json" {
        error!("invalid Content-Type received: {:?}", content_type);
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "invalid Content-Type").into_response();
    }

    let ks: KsRequest = match serde_json::from_slice(&body) {
        Ok(ks) => ks,
        Err(e) => {
            error!("could not unmarshal request body: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
        }
    };

    if let Err(reason) = ks.validate() {
        error!("validate request error: {}", reason);
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }

    match register_host(&state, &ks).await {
        Ok(()) => Json(ks).into_response(),
        Err(response) => response,
    }
}

/// The creation path behind POST /ks: IP first, then image, then the
/// rendered file. Hosts therefore never hold an image binding without an
/// address.
pub async fn register_host(state: &AppState, ks: &KsRequest) -> Result<(), Response> {
    let mac = Mac::parse(&ks.macaddress)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid mac address format").into_response())?;

    let ip = state.registry.assign(&mac).await.map_err(|e| {
        error!("error saving MAC to IP mappings: {}", e);
        match e {
            RegistryError::Exhausted => {
                (StatusCode::BAD_REQUEST, "no IP addresses available").into_response()
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encountered unexpected problem",
            )
                .into_response(),
        }
    })?;

    let family = state
        .registry
        .bind_image(&mac, &ks.isofilename, &state.catalog)
        .map_err(|e| {
            error!("error saving MAC to image mappings: {}", e);
            (StatusCode::BAD_REQUEST, format!("unknown isofilename: {}", ks.isofilename))
                .into_response()
        })?;

    let ks_folder = state.ks_root().join(ip.to_string());
    let rendered = render_ks(family, ks);
    let write = async {
        tokio::fs::create_dir_all(&ks_folder).await?;
        tokio::fs::write(ks_folder.join("ks.cfg"), rendered).await
    };
    write.await.map_err(|e| {
        error!("failed to create ks config file: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encountered unexpected problem",
        )
            .into_response()
    })?;

    Ok(())
}

/// DELETE /ks/{id}: the id is the MAC with `-` separators.
pub async fn delete_ks(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let raw = id.replace('-', ":");
    let Ok(mac) = Mac::parse(&raw) else {
        warn!("delete request with invalid mac: {}", id);
        return (StatusCode::BAD_REQUEST, "mac address is required").into_response();
    };
    state.registry.forget(&mac);
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> KsRequest {
        KsRequest {
            macaddress: "aa:bb:cc:dd:ee:01".to_string(),
            password: "secret".to_string(),
            ip: "10.0.0.50".to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: "10.0.0.1".to_string(),
            nameserver: "10.0.0.53".to_string(),
            hostname: "esx01.lab.example.com".to_string(),
            vlanid: Some(100),
            cli: vec!["vim-cmd hostsvc/enable_ssh".to_string()],
            keyboard: "US Default".to_string(),
            isofilename: "esxi-8u2".to_string(),
            notvmpgcreate: None,
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn vlan_boundaries() {
        let mut ks = valid_request();
        ks.vlanid = Some(0);
        assert!(ks.validate().is_ok());
        ks.vlanid = Some(4094);
        assert!(ks.validate().is_ok());
        ks.vlanid = Some(4095);
        assert!(ks.validate().is_err());
        ks.vlanid = None;
        assert!(ks.validate().is_ok());
    }

    #[test]
    fn rejects_malformed_fields() {
        let mut ks = valid_request();
        ks.macaddress = "zz:zz".to_string();
        assert!(ks.validate().is_err());

        let mut ks = valid_request();
        ks.ip = "300.1.1.1".to_string();
        assert!(ks.validate().is_err());

        let mut ks = valid_request();
        ks.hostname = "-bad-".to_string();
        assert!(ks.validate().is_err());

        let mut ks = valid_request();
        ks.cli.clear();
        assert!(ks.validate().is_err());
    }

    #[test]
    fn renders_esxi_answer_file() {
        let ks = valid_request();
        let out = render_ks(OsFamily::Esxi, &ks);
        assert!(out.contains("rootpw secret"));
        assert!(out.contains("--ip=10.0.0.50"));
        assert!(out.contains("--vlanid=100"));
        assert!(out.contains("vim-cmd hostsvc/enable_ssh"));
        assert!(!out.contains("{{."));
        assert!(!out.contains("--addvmportgroup"));
    }

    #[test]
    fn vlan_and_portgroup_options_are_conditional() {
        let mut ks = valid_request();
        ks.vlanid = None;
        ks.notvmpgcreate = Some(true);
        let out = render_ks(OsFamily::Esxi, &ks);
        assert!(!out.contains("--vlanid"));
        assert!(out.contains("--addvmportgroup=0"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let ks = valid_request();
        assert_eq!(render_ks(OsFamily::Esxi, &ks), render_ks(OsFamily::Esxi, &ks));
        assert_eq!(render_ks(OsFamily::Rhel, &ks), render_ks(OsFamily::Rhel, &ks));
    }
}
