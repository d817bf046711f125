//! Shared test fixtures

use async_trait::async_trait;
use meshplane_common::{Error, ExitNode, NewClient, NewSite, PeerConfig, PeerTable, Result, SiteKind};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerOp {
    Upsert { exit_node_id: i64, peer: PeerConfig },
    Delete { exit_node_id: i64, public_key: String },
}

/// Peer table fake that records operations in order. Pushes to exit nodes
/// listed in `fail_exit_nodes` fail without being recorded.
#[derive(Default)]
pub struct RecordingPeerTable {
    ops: Mutex<Vec<PeerOp>>,
    fail_exit_nodes: HashSet<i64>,
}

impl RecordingPeerTable {
    pub fn failing(exit_nodes: impl IntoIterator<Item = i64>) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            fail_exit_nodes: exit_nodes.into_iter().collect(),
        }
    }

    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTable for RecordingPeerTable {
    async fn upsert_peer(&self, exit_node: &ExitNode, peer: PeerConfig) -> Result<()> {
        if self.fail_exit_nodes.contains(&exit_node.exit_node_id) {
            return Err(Error::PeerPush(format!(
                "exit node {} unreachable",
                exit_node.exit_node_id
            )));
        }
        self.ops.lock().unwrap().push(PeerOp::Upsert {
            exit_node_id: exit_node.exit_node_id,
            peer,
        });
        Ok(())
    }

    async fn delete_peer(&self, exit_node: &ExitNode, public_key: &str) -> Result<()> {
        if self.fail_exit_nodes.contains(&exit_node.exit_node_id) {
            return Err(Error::PeerPush(format!(
                "exit node {} unreachable",
                exit_node.exit_node_id
            )));
        }
        self.ops.lock().unwrap().push(PeerOp::Delete {
            exit_node_id: exit_node.exit_node_id,
            public_key: public_key.to_string(),
        });
        Ok(())
    }
}

/// A wireguard site with every field an eligible site needs.
pub fn reachable_site(exit_node_id: Option<i64>) -> NewSite {
    NewSite {
        org_id: "org1".to_string(),
        name: "site".to_string(),
        kind: SiteKind::Wireguard,
        exit_node_id,
        endpoint: Some("203.0.113.10:51820".to_string()),
        subnet: Some("10.0.0.0/24".to_string()),
        public_key: Some("site-pub-key".to_string()),
        address: "10.0.0.1".to_string(),
    }
}

pub fn new_client() -> NewClient {
    NewClient {
        org_id: "org1".to_string(),
        name: "laptop".to_string(),
        subnet: "100.89.0.2/32".to_string(),
        exit_node_id: None,
    }
}
