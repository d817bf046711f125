//! Exit node peer-table client
//!
//! Pushes peer entries to an exit node's management API. Both operations are
//! idempotent: upsert replaces the entry for the key in full, delete treats
//! absence as success. Callers supply the complete allowed-IP set they
//! intend; nothing is merged.

use crate::types::{ExitNode, PeerConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout for peer pushes. A slow exit node delays only
/// its own site's inclusion.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Idempotent interface to an exit node's peer table.
#[async_trait]
pub trait PeerTable: Send + Sync {
    /// Replace the entry for `peer.public_key` on the exit node in full.
    async fn upsert_peer(&self, exit_node: &ExitNode, peer: PeerConfig) -> Result<()>;

    /// Remove the entry for `public_key`; absence is not an error.
    async fn delete_peer(&self, exit_node: &ExitNode, public_key: &str) -> Result<()>;
}

/// HTTP implementation against the exit node management API.
pub struct HttpPeerTable {
    http: reqwest::Client,
}

impl HttpPeerTable {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::PeerPush(format!("failed to build http client: {}", e)))?;
        Ok(Self { http })
    }

    fn peers_url(exit_node: &ExitNode) -> String {
        format!("{}/v1/peers", exit_node.mgmt_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl PeerTable for HttpPeerTable {
    async fn upsert_peer(&self, exit_node: &ExitNode, peer: PeerConfig) -> Result<()> {
        let url = Self::peers_url(exit_node);
        debug!(
            "Upserting peer {} on exit node {}",
            peer.public_key, exit_node.exit_node_id
        );

        let response = self.http.post(&url).json(&peer).send().await?;
        if !response.status().is_success() {
            return Err(Error::PeerPush(format!(
                "exit node {} rejected peer upsert: {}",
                exit_node.exit_node_id,
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_peer(&self, exit_node: &ExitNode, public_key: &str) -> Result<()> {
        let url = Self::peers_url(exit_node);
        debug!(
            "Deleting peer {} on exit node {}",
            public_key, exit_node.exit_node_id
        );

        let response = self
            .http
            .delete(&url)
            .query(&[("publicKey", public_key)])
            .send()
            .await?;

        // The entry being already gone still satisfies the caller's intent
        if response.status() == StatusCode::NOT_FOUND {
            debug!(
                "Peer {} already absent on exit node {}",
                public_key, exit_node.exit_node_id
            );
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Error::PeerPush(format!(
                "exit node {} rejected peer delete: {}",
                exit_node.exit_node_id,
                response.status()
            )));
        }
        Ok(())
    }
}
