//! Target reconciler
//!
//! Converges exit-node peer state after a target mutation. Wireguard sites
//! get a full allowed-IP recompute pushed as one peer entry; agent sites get
//! the changed target pushed incrementally over their live connection. An
//! agent that reconnects later pulls the full set on registration.

use crate::ws::{
    ConnectionRegistry, HandlerContext, HandlerOutcome, MessageHandler, Principal, WireMessage,
};
use async_trait::async_trait;
use meshplane_common::{
    wgkey, Database, Error, PeerConfig, PeerTable, Result, Site, SiteKind, Target,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MSG_AGENT_REGISTER: &str = "agent/register";
pub const MSG_TARGETS_ADD: &str = "agent/targets/add";
pub const MSG_TARGETS_REMOVE: &str = "agent/targets/remove";

/// A target mutation the reconciler must converge.
#[derive(Debug, Clone)]
pub enum TargetChange {
    Added(Target),
    Updated(Target),
    Removed(Target),
}

impl TargetChange {
    pub fn target(&self) -> &Target {
        match self {
            Self::Added(target) | Self::Updated(target) | Self::Removed(target) => target,
        }
    }
}

/// Payload for agent target pushes; `add` carries upsert semantics at the
/// agent, so updates travel on the same tag.
#[derive(Debug, Serialize, Deserialize)]
pub struct TargetsPayload {
    pub targets: Vec<Target>,
}

pub struct TargetReconciler {
    db: Database,
    peers: Arc<dyn PeerTable>,
    registry: ConnectionRegistry,
}

impl TargetReconciler {
    pub fn new(db: Database, peers: Arc<dyn PeerTable>, registry: ConnectionRegistry) -> Self {
        Self {
            db,
            peers,
            registry,
        }
    }

    /// Converge peer state for the site owning the changed target. Errors
    /// surface to the caller; the store mutation behind the change stays
    /// applied either way.
    pub async fn reconcile(&self, change: &TargetChange) -> Result<()> {
        let target = change.target();
        let resource = self
            .db
            .resource(target.resource_id)?
            .ok_or_else(|| Error::not_found("resource", target.resource_id))?;
        let site = self
            .db
            .site(resource.site_id)?
            .ok_or_else(|| Error::not_found("site", resource.site_id))?;

        let Some(public_key) = site.public_key.clone() else {
            debug!(
                "Site {} has not registered a public key yet, skipping reconciliation",
                site.site_id
            );
            return Ok(());
        };

        match site.kind {
            SiteKind::Wireguard => self.recompute_site_peer(&site, public_key).await,
            SiteKind::Agent => self.push_to_agent(&site, change),
        }
    }

    /// Full recompute: one peer entry carrying a host route for every
    /// enabled target across every resource on the site.
    async fn recompute_site_peer(&self, site: &Site, public_key: String) -> Result<()> {
        let exit_node_id = site.exit_node_id.ok_or_else(|| {
            Error::InvalidConfig(format!("site {} has no exit node", site.site_id))
        })?;
        let exit_node = self.db.exit_node(exit_node_id)?.ok_or_else(|| {
            Error::InvalidConfig(format!(
                "exit node {} missing for site {}",
                exit_node_id, site.site_id
            ))
        })?;

        let targets = self.db.enabled_targets_for_site(site.site_id)?;
        let mut allowed_ips = Vec::with_capacity(targets.len());
        for target in &targets {
            allowed_ips.push(target.allowed_ip()?.to_string());
        }

        info!(
            "Recomputed {} allowed IP(s) for site {}",
            allowed_ips.len(),
            site.site_id
        );
        self.peers
            .upsert_peer(
                &exit_node,
                PeerConfig {
                    public_key,
                    allowed_ips,
                    endpoint: None,
                },
            )
            .await
    }

    /// Incremental push of just the changed target to the site's agent.
    fn push_to_agent(&self, site: &Site, change: &TargetChange) -> Result<()> {
        let (kind, target) = match change {
            TargetChange::Added(target) | TargetChange::Updated(target) => {
                (MSG_TARGETS_ADD, target)
            }
            TargetChange::Removed(target) => (MSG_TARGETS_REMOVE, target),
        };
        let payload = TargetsPayload {
            targets: vec![target.clone()],
        };
        let message = WireMessage::new(kind, serde_json::to_value(payload)?);
        if !self.registry.send_to_site_agent(site.site_id, message) {
            return Err(Error::AgentUnavailable {
                site_id: site.site_id,
            });
        }
        debug!("Pushed target change for site {} to its agent", site.site_id);
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AgentRegisterPayload {
    public_key: Option<String>,
}

/// Handles agent registrations: persists the public key the agent reports
/// for its site, then replies with the full enabled-target set, converging
/// agents that were offline for earlier pushes.
pub struct AgentSyncHandler {
    db: Database,
}

impl AgentSyncHandler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageHandler for AgentSyncHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<Option<HandlerOutcome>> {
        let Principal::Agent { site_id } = ctx.principal else {
            warn!(
                "Agent register message from non-agent connection {}",
                ctx.connection_id
            );
            return Ok(None);
        };
        let Some(site) = self.db.site(site_id)? else {
            warn!("Agent registered for missing site {}", site_id);
            return Ok(None);
        };

        let payload: AgentRegisterPayload =
            serde_json::from_value(ctx.message.data.clone()).unwrap_or_default();
        if let Some(public_key) = payload.public_key {
            if let Err(e) = wgkey::validate_public_key(&public_key) {
                warn!(
                    "Agent for site {} reported an implausible public key: {}",
                    site_id, e
                );
            } else if site.public_key.as_deref() != Some(public_key.as_str()) {
                self.db.set_site_public_key(site_id, &public_key)?;
                info!("Site {} registered public key", site_id);
            }
        }

        let targets = self.db.enabled_targets_for_site(site.site_id)?;
        info!(
            "Agent for site {} registered, syncing {} target(s)",
            site_id,
            targets.len()
        );
        let payload = TargetsPayload { targets };
        Ok(Some(HandlerOutcome::reply(WireMessage::new(
            MSG_TARGETS_ADD,
            serde_json::to_value(payload)?,
        ))))
    }
}
