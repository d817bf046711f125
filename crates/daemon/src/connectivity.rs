//! Connectivity engine
//!
//! Processes client key registrations: decides which member sites are
//! currently reachable under the hole-punch freshness rules, cleans up peer
//! entries for rotated keys, fans out peer upserts to exit nodes, and
//! assembles the consolidated connect reply. Also records hole-punch
//! observations, the only writer of the freshness timestamps consulted here.

use crate::ws::{HandlerContext, HandlerOutcome, MessageHandler, Principal, WireMessage};
use async_trait::async_trait;
use meshplane_common::{Client, Database, Error, PeerConfig, PeerTable, Result, Site};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hole-punch observations older than this cannot vouch for an endpoint.
pub const HOLE_PUNCH_STALE_SECS: i64 = 6;

pub const MSG_REGISTER: &str = "client/wg/register";
pub const MSG_HOLEPUNCH: &str = "client/wg/holepunch";
pub const MSG_CONNECT: &str = "client/wg/connect";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload {
    public_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HolepunchPayload {
    server_pub_key: String,
}

/// One entry in the connect reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachableSite {
    pub site_id: i64,
    pub endpoint: String,
    pub public_key: Option<String>,
    #[serde(rename = "serverIP")]
    pub server_ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub sites: Vec<ReachableSite>,
    #[serde(rename = "tunnelIP")]
    pub tunnel_ip: String,
}

/// Why a site was or was not included, evaluated one site at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteVerdict {
    /// Site passed every gate.
    Included,
    /// Site is missing a field it cannot serve traffic without.
    SkippedMissingConfig(MissingConfig),
    /// The site's own hole punch is too old.
    SkippedStale { age_secs: i64 },
    /// The client's hole punch is too old; invalidates this site and every
    /// site after it.
    Aborted { age_secs: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingConfig {
    ExitNode,
    Endpoint,
    Subnet,
}

/// Eligibility policy for one site. Checks run in a fixed order and the
/// first failure wins; the subnet check runs last so key-rotation cleanup
/// still applies to sites that only lack a subnet.
pub fn site_verdict(site: &Site, client: &Client, now: i64) -> SiteVerdict {
    if site.exit_node_id.is_none() {
        return SiteVerdict::SkippedMissingConfig(MissingConfig::ExitNode);
    }
    if site.endpoint.is_none() {
        return SiteVerdict::SkippedMissingConfig(MissingConfig::Endpoint);
    }
    if let Some(punched) = site.last_hole_punch {
        let age_secs = now - punched;
        if age_secs > HOLE_PUNCH_STALE_SECS {
            return SiteVerdict::SkippedStale { age_secs };
        }
    }
    if let Some(punched) = client.last_hole_punch {
        let age_secs = now - punched;
        if age_secs > HOLE_PUNCH_STALE_SECS {
            return SiteVerdict::Aborted { age_secs };
        }
    }
    if site.subnet.is_none() {
        return SiteVerdict::SkippedMissingConfig(MissingConfig::Subnet);
    }
    SiteVerdict::Included
}

/// Handles client key registrations.
pub struct RegisterHandler {
    db: Database,
    peers: Arc<dyn PeerTable>,
}

impl RegisterHandler {
    pub fn new(db: Database, peers: Arc<dyn PeerTable>) -> Self {
        Self { db, peers }
    }

    /// Best-effort removal of the previous key's peer entry on one site's
    /// exit node.
    async fn cleanup_rotated_key(&self, site: &Site, old_key: &str) {
        let Some(exit_node_id) = site.exit_node_id else {
            return;
        };
        let exit_node = match self.db.exit_node(exit_node_id) {
            Ok(Some(node)) => node,
            Ok(None) => {
                warn!(
                    "Exit node {} for site {} not found, skipping old peer cleanup",
                    exit_node_id, site.site_id
                );
                return;
            }
            Err(e) => {
                warn!(
                    "Failed to load exit node {} for site {}: {}",
                    exit_node_id, site.site_id, e
                );
                return;
            }
        };
        info!(
            "Public key rotated, removing old peer from site {}",
            site.site_id
        );
        if let Err(e) = self.peers.delete_peer(&exit_node, old_key).await {
            warn!("Failed to remove old peer on site {}: {}", site.site_id, e);
        }
    }
}

#[async_trait]
impl MessageHandler for RegisterHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<Option<HandlerOutcome>> {
        let Principal::Client { client_id } = ctx.principal else {
            warn!(
                "Register message from non-client connection {}",
                ctx.connection_id
            );
            return Ok(None);
        };

        let payload: RegisterPayload = match serde_json::from_value(ctx.message.data.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Malformed register payload from client {}: {}", client_id, e);
                return Ok(None);
            }
        };
        let Some(public_key) = payload.public_key.filter(|key| !key.is_empty()) else {
            warn!("Client {} sent register without a public key", client_id);
            return Ok(None);
        };

        let Some(client) = self.db.client(client_id)? else {
            warn!("Client {} not found", client_id);
            return Ok(None);
        };

        // Relay the exit node's key so the client can start punching while
        // the sites below are being reconciled.
        if let Some(exit_node_id) = client.exit_node_id {
            match self.db.exit_node(exit_node_id)? {
                Some(exit_node) => {
                    let assist = WireMessage::new(
                        MSG_HOLEPUNCH,
                        serde_json::to_value(HolepunchPayload {
                            server_pub_key: exit_node.public_key,
                        })?,
                    );
                    ctx.registry.send_to_connection(ctx.connection_id, assist);
                }
                None => warn!(
                    "Client {} references missing exit node {}",
                    client_id, exit_node_id
                ),
            }
        }

        self.db.update_client_pub_key(client_id, &public_key)?;
        let old_key = client.pub_key.clone().filter(|key| key != &public_key);

        let sites = self.db.client_sites(client_id)?;
        let now = chrono::Utc::now().timestamp();
        let mut reachable = Vec::new();

        for site in &sites {
            match site_verdict(site, &client, now) {
                SiteVerdict::SkippedMissingConfig(MissingConfig::ExitNode) => {
                    warn!("Site {} has no exit node, skipping", site.site_id);
                }
                SiteVerdict::SkippedMissingConfig(MissingConfig::Endpoint) => {
                    warn!("Site {} has no endpoint, skipping", site.site_id);
                }
                SiteVerdict::SkippedStale { age_secs } => {
                    warn!(
                        "Site {} last hole punch is {}s old, skipping",
                        site.site_id, age_secs
                    );
                }
                SiteVerdict::Aborted { age_secs } => {
                    warn!(
                        "Client {} last hole punch is {}s old, skipping all sites",
                        client_id, age_secs
                    );
                    break;
                }
                SiteVerdict::SkippedMissingConfig(MissingConfig::Subnet) => {
                    if let Some(old_key) = &old_key {
                        self.cleanup_rotated_key(site, old_key).await;
                    }
                    warn!("Site {} has no subnet, skipping", site.site_id);
                }
                SiteVerdict::Included => {
                    if let Some(old_key) = &old_key {
                        self.cleanup_rotated_key(site, old_key).await;
                    }

                    // The verdict vouches for these fields being present.
                    let (Some(exit_node_id), Some(endpoint)) =
                        (site.exit_node_id, site.endpoint.as_deref())
                    else {
                        continue;
                    };

                    let mut included = true;
                    if let Some(client_endpoint) = client.endpoint.as_deref() {
                        match self.db.exit_node(exit_node_id)? {
                            Some(exit_node) => {
                                let peer = PeerConfig {
                                    public_key: public_key.clone(),
                                    allowed_ips: vec![client.subnet.clone()],
                                    endpoint: Some(client_endpoint.to_string()),
                                };
                                if let Err(e) = self.peers.upsert_peer(&exit_node, peer).await {
                                    warn!(
                                        "Failed to upsert peer on site {}: {}",
                                        site.site_id, e
                                    );
                                    included = false;
                                }
                            }
                            None => {
                                warn!(
                                    "Exit node {} for site {} not found, skipping",
                                    exit_node_id, site.site_id
                                );
                                included = false;
                            }
                        }
                    }

                    if included {
                        reachable.push(ReachableSite {
                            site_id: site.site_id,
                            endpoint: endpoint.to_string(),
                            public_key: site.public_key.clone(),
                            server_ip: site.address.clone(),
                        });
                    }
                }
            }
        }

        if reachable.is_empty() {
            warn!("No reachable sites for client {}", client_id);
            return Ok(None);
        }

        info!(
            "Client {} registered, {} site(s) reachable",
            client_id,
            reachable.len()
        );
        let connect = ConnectPayload {
            sites: reachable,
            tunnel_ip: client.subnet.clone(),
        };
        Ok(Some(HandlerOutcome::reply(WireMessage::new(
            MSG_CONNECT,
            serde_json::to_value(connect)?,
        ))))
    }
}

/// A hole-punch observation relayed by an exit node.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolePunchReport {
    #[serde(default)]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub site_id: Option<i64>,
    pub ip: String,
    pub port: u16,
    pub timestamp: i64,
}

/// Store a hole-punch observation against the client or site it names.
pub fn record_hole_punch(db: &Database, report: &HolePunchReport) -> Result<()> {
    let endpoint = format!("{}:{}", report.ip, report.port);
    match (report.client_id, report.site_id) {
        (Some(client_id), None) => {
            if !db.record_client_hole_punch(client_id, &endpoint, report.timestamp)? {
                return Err(Error::not_found("client", client_id));
            }
            debug!("Recorded hole punch for client {} at {}", client_id, endpoint);
            Ok(())
        }
        (None, Some(site_id)) => {
            if !db.record_site_hole_punch(site_id, &endpoint, report.timestamp)? {
                return Err(Error::not_found("site", site_id));
            }
            debug!("Recorded hole punch for site {} at {}", site_id, endpoint);
            Ok(())
        }
        _ => Err(Error::InvalidInput(
            "exactly one of clientId or siteId is required".to_string(),
        )),
    }
}
