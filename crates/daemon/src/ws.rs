//! WebSocket session layer
//!
//! Every connection is bound to a principal (a client device or a site
//! agent) and registered under a connection id. Inbound text frames carry a
//! `{type, data}` envelope dispatched to the handler registered for that
//! type; a handler may stay silent, reply to the sender, or broadcast.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use meshplane_common::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Wire envelope: a type tag plus free-form payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }
}

/// Identity bound to a connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Client { client_id: i64 },
    Agent { site_id: i64 },
}

struct Connection {
    principal: Principal,
    tx: mpsc::UnboundedSender<WireMessage>,
}

/// Live connections keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. The returned receiver feeds the writer task.
    pub fn register(
        &self,
        principal: Principal,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<WireMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(id, Connection { principal, tx });
        debug!("Registered connection {} for {:?}", id, principal);
        (id, rx)
    }

    pub fn deregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!("Deregistered connection {}", id);
        }
    }

    pub fn principal(&self, id: ConnectionId) -> Option<Principal> {
        self.connections.get(&id).map(|conn| conn.principal)
    }

    /// Deliver to one connection. Returns false if it is gone.
    pub fn send_to_connection(&self, id: ConnectionId, message: WireMessage) -> bool {
        match self.connections.get(&id) {
            Some(conn) => conn.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Deliver to the agent connection bound to a site, if one is up.
    pub fn send_to_site_agent(&self, site_id: i64, message: WireMessage) -> bool {
        for entry in self.connections.iter() {
            if entry.principal == (Principal::Agent { site_id }) {
                return entry.tx.send(message).is_ok();
            }
        }
        false
    }

    /// Deliver to every connection, optionally excluding one.
    pub fn broadcast(&self, message: &WireMessage, exclude: Option<ConnectionId>) {
        for entry in self.connections.iter() {
            if Some(*entry.key()) == exclude {
                continue;
            }
            let _ = entry.tx.send(message.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// What a handler sees: the inbound message, who sent it, and a registry
/// handle for addressed sends during handling.
pub struct HandlerContext<'a> {
    pub message: &'a WireMessage,
    pub connection_id: ConnectionId,
    pub principal: Principal,
    pub registry: &'a ConnectionRegistry,
}

/// A handler's reply, if any.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub message: WireMessage,
    pub broadcast: bool,
    pub exclude_sender: bool,
}

impl HandlerOutcome {
    /// Reply addressed to the sender only.
    pub fn reply(message: WireMessage) -> Self {
        Self {
            message,
            broadcast: false,
            exclude_sender: false,
        }
    }

    pub fn broadcast(message: WireMessage, exclude_sender: bool) -> Self {
        Self {
            message,
            broadcast: true,
            exclude_sender,
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<Option<HandlerOutcome>>;
}

/// Tag-keyed dispatch. The router owns delivery semantics only; handlers
/// own meaning.
pub struct MessageRouter {
    registry: ConnectionRegistry,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl MessageRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn register(&mut self, kind: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(kind.to_string(), handler);
    }

    /// Dispatch one inbound message. Unknown tags and handler errors are
    /// logged and dropped; nothing on this path reports back to the socket.
    pub async fn dispatch(&self, connection_id: ConnectionId, message: WireMessage) {
        let Some(principal) = self.registry.principal(connection_id) else {
            warn!("Message from unknown connection {}", connection_id);
            return;
        };
        let Some(handler) = self.handlers.get(&message.kind) else {
            debug!("No handler for message type {:?}, dropping", message.kind);
            return;
        };

        let ctx = HandlerContext {
            message: &message,
            connection_id,
            principal,
            registry: &self.registry,
        };
        match handler.handle(ctx).await {
            Ok(Some(outcome)) => {
                if outcome.broadcast {
                    let exclude = outcome.exclude_sender.then_some(connection_id);
                    self.registry.broadcast(&outcome.message, exclude);
                } else if !self.registry.send_to_connection(connection_id, outcome.message) {
                    debug!("Connection {} went away before reply", connection_id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Handler for {:?} failed: {}", message.kind, e),
        }
    }
}

/// Drive one WebSocket session to completion: register the principal, pump
/// outbound messages from the registry channel into the sink, dispatch
/// inbound frames, deregister on teardown.
pub async fn drive_connection(router: Arc<MessageRouter>, socket: WebSocket, principal: Principal) {
    let (connection_id, mut outbound) = router.registry().register(principal);
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode outbound message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    };

    let reader = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                    Ok(message) => router.dispatch(connection_id, message).await,
                    Err(e) => warn!("Dropping malformed frame on {}: {}", connection_id, e),
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} closed by peer", connection_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Connection {} errored: {}", connection_id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    router.registry().deregister(connection_id);
}

/// Liveness probe: any `ping` gets an addressed `pong`.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _ctx: HandlerContext<'_>) -> Result<Option<HandlerOutcome>> {
        Ok(Some(HandlerOutcome::reply(WireMessage::new(
            "pong",
            Value::Null,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with_ping() -> (ConnectionRegistry, MessageRouter) {
        let registry = ConnectionRegistry::new();
        let mut router = MessageRouter::new(registry.clone());
        router.register("ping", Arc::new(PingHandler));
        (registry, router)
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = registry.register(Principal::Client { client_id: 1 });

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.principal(id),
            Some(Principal::Client { client_id: 1 })
        );

        assert!(registry.send_to_connection(id, WireMessage::new("hello", Value::Null)));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, "hello");

        registry.deregister(id);
        assert!(registry.is_empty());
        assert!(!registry.send_to_connection(id, WireMessage::new("hello", Value::Null)));
    }

    #[tokio::test]
    async fn test_send_to_site_agent() {
        let registry = ConnectionRegistry::new();
        let (_client_id, mut client_rx) = registry.register(Principal::Client { client_id: 7 });
        let (_agent_id, mut agent_rx) = registry.register(Principal::Agent { site_id: 3 });

        assert!(registry.send_to_site_agent(3, WireMessage::new("task", Value::Null)));
        assert_eq!(agent_rx.recv().await.unwrap().kind, "task");
        assert!(client_rx.try_recv().is_err());

        assert!(!registry.send_to_site_agent(99, WireMessage::new("task", Value::Null)));
    }

    #[tokio::test]
    async fn test_broadcast_with_exclusion() {
        let registry = ConnectionRegistry::new();
        let (sender, mut sender_rx) = registry.register(Principal::Client { client_id: 1 });
        let (_other, mut other_rx) = registry.register(Principal::Client { client_id: 2 });

        registry.broadcast(&WireMessage::new("news", Value::Null), Some(sender));
        assert_eq!(other_rx.recv().await.unwrap().kind, "news");
        assert!(sender_rx.try_recv().is_err());

        registry.broadcast(&WireMessage::new("news", Value::Null), None);
        assert_eq!(sender_rx.recv().await.unwrap().kind, "news");
    }

    #[tokio::test]
    async fn test_dispatch_ping_replies_to_sender() {
        let (registry, router) = router_with_ping();
        let (id, mut rx) = registry.register(Principal::Client { client_id: 1 });

        router
            .dispatch(id, WireMessage::new("ping", Value::Null))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, "pong");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tag_is_dropped() {
        let (registry, router) = router_with_ping();
        let (id, mut rx) = registry.register(Principal::Client { client_id: 1 });

        router
            .dispatch(id, WireMessage::new("no/such/tag", Value::Null))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_from_unknown_connection_is_dropped() {
        let (_registry, router) = router_with_ping();
        router
            .dispatch(Uuid::new_v4(), WireMessage::new("ping", Value::Null))
            .await;
    }

    #[tokio::test]
    async fn test_broadcast_outcome_excludes_sender() {
        struct Announce;

        #[async_trait]
        impl MessageHandler for Announce {
            async fn handle(&self, ctx: HandlerContext<'_>) -> Result<Option<HandlerOutcome>> {
                Ok(Some(HandlerOutcome::broadcast(
                    ctx.message.clone(),
                    true,
                )))
            }
        }

        let registry = ConnectionRegistry::new();
        let mut router = MessageRouter::new(registry.clone());
        router.register("announce", Arc::new(Announce));

        let (sender, mut sender_rx) = registry.register(Principal::Client { client_id: 1 });
        let (_other, mut other_rx) = registry.register(Principal::Client { client_id: 2 });

        router
            .dispatch(sender, WireMessage::new("announce", Value::Null))
            .await;
        assert_eq!(other_rx.recv().await.unwrap().kind, "announce");
        assert!(sender_rx.try_recv().is_err());
    }

    #[test]
    fn test_wire_message_envelope_shape() {
        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"ping","data":{"n":1}}"#).unwrap();
        assert_eq!(msg.kind, "ping");
        assert_eq!(msg.data["n"], 1);

        // data is optional on the wire
        let bare: WireMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(bare.data.is_null());

        let out = serde_json::to_value(WireMessage::new("pong", Value::Null)).unwrap();
        assert_eq!(out["type"], "pong");
    }
}
