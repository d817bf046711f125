//! Core domain types for the mesh control plane

use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A WireGuard-capable host backing one or more sites. The control plane
/// pushes peer entries to its management listener at `mgmt_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitNode {
    pub exit_node_id: i64,
    pub name: String,
    pub public_key: String,
    pub mgmt_url: String,
}

/// How peer state reaches a site: native WireGuard sites get their exit-node
/// peer entry recomputed in full; agent sites receive incremental pushes over
/// their own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    Wireguard,
    Agent,
}

impl Default for SiteKind {
    fn default() -> Self {
        Self::Wireguard
    }
}

impl std::fmt::Display for SiteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wireguard => write!(f, "wireguard"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for SiteKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "wireguard" => Ok(Self::Wireguard),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("unknown site kind: {}", s)),
        }
    }
}

/// A fixed network location reachable through an exit node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub site_id: i64,
    pub org_id: String,
    pub name: String,
    pub kind: SiteKind,
    pub exit_node_id: Option<i64>,
    pub endpoint: Option<String>,
    pub subnet: Option<String>,
    pub public_key: Option<String>,
    pub last_hole_punch: Option<i64>,
    /// Tunnel-side address of the site, reported to clients as `serverIP`.
    pub address: String,
}

impl Site {
    /// A site can carry client traffic only when all three are present.
    pub fn is_reachable(&self) -> bool {
        self.exit_node_id.is_some() && self.endpoint.is_some() && self.subnet.is_some()
    }
}

/// A roaming endpoint that registers a public key to join the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: i64,
    pub org_id: String,
    pub name: String,
    pub pub_key: Option<String>,
    /// Assigned tunnel address, handed back as `tunnelIP` on connect.
    pub subnet: String,
    pub endpoint: Option<String>,
    pub last_hole_punch: Option<i64>,
    pub exit_node_id: Option<i64>,
}

/// A routable service owned by exactly one site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: i64,
    pub site_id: i64,
    pub name: String,
}

/// A concrete backend address under a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: i64,
    pub resource_id: i64,
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub enabled: bool,
}

impl Target {
    /// Host route advertised for this target (`ip/32`, or `/128` for v6).
    pub fn allowed_ip(&self) -> Result<IpNetwork> {
        let addr: IpAddr = self
            .ip
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid target ip: {}", self.ip)))?;
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNetwork::new(addr, prefix).map_err(|e| Error::InvalidInput(e.to_string()))
    }
}

/// The unit pushed to an exit node's peer table. Derived state: always
/// recomputable from the store, never read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(exit_node_id: Option<i64>, endpoint: Option<&str>, subnet: Option<&str>) -> Site {
        Site {
            site_id: 1,
            org_id: "org".to_string(),
            name: "test".to_string(),
            kind: SiteKind::Wireguard,
            exit_node_id,
            endpoint: endpoint.map(String::from),
            subnet: subnet.map(String::from),
            public_key: None,
            last_hole_punch: None,
            address: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn test_site_kind_roundtrip() {
        for kind in [SiteKind::Wireguard, SiteKind::Agent] {
            let parsed: SiteKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("tunnel".parse::<SiteKind>().is_err());
    }

    #[test]
    fn test_site_reachability() {
        assert!(site(Some(1), Some("1.2.3.4:51820"), Some("10.0.0.0/24")).is_reachable());
        assert!(!site(None, Some("1.2.3.4:51820"), Some("10.0.0.0/24")).is_reachable());
        assert!(!site(Some(1), None, Some("10.0.0.0/24")).is_reachable());
        assert!(!site(Some(1), Some("1.2.3.4:51820"), None).is_reachable());
    }

    #[test]
    fn test_target_allowed_ip() {
        let target = Target {
            target_id: 1,
            resource_id: 1,
            ip: "10.0.0.5".to_string(),
            port: 80,
            method: None,
            enabled: true,
        };
        assert_eq!(target.allowed_ip().unwrap().to_string(), "10.0.0.5/32");

        let bad = Target {
            ip: "not-an-ip".to_string(),
            ..target
        };
        assert!(bad.allowed_ip().is_err());
    }

    #[test]
    fn test_peer_config_wire_shape() {
        let peer = PeerConfig {
            public_key: "abc".to_string(),
            allowed_ips: vec!["10.0.0.5/32".to_string()],
            endpoint: Some("1.2.3.4:51820".to_string()),
        };
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["publicKey"], "abc");
        assert_eq!(json["allowedIps"][0], "10.0.0.5/32");
        assert_eq!(json["endpoint"], "1.2.3.4:51820");

        let no_endpoint = PeerConfig {
            endpoint: None,
            ..peer
        };
        let json = serde_json::to_value(&no_endpoint).unwrap();
        assert!(json.get("endpoint").is_none());
    }
}
