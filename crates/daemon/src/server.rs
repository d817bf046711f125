//! HTTP surface
//!
//! Hosts the WebSocket endpoint for client and agent sessions, the target
//! trigger API, and hole-punch ingest. Target mutations commit to the store
//! first and reconcile second, so a failed push reports an error without
//! hiding the row.

use crate::connectivity::{self, RegisterHandler};
use crate::targets::{
    AgentSyncHandler, TargetChange, TargetReconciler, MSG_AGENT_REGISTER,
};
use crate::ws::{self, ConnectionRegistry, MessageRouter, PingHandler, Principal};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use meshplane_common::{Database, Error, PeerTable, TargetUpdate};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

struct AppState {
    db: Database,
    router: Arc<MessageRouter>,
    reconciler: TargetReconciler,
}

/// Wire the message router, reconciler, and HTTP routes together.
pub fn build_app(db: Database, peers: Arc<dyn PeerTable>) -> Router {
    let registry = ConnectionRegistry::new();

    let mut router = MessageRouter::new(registry.clone());
    router.register(
        connectivity::MSG_REGISTER,
        Arc::new(RegisterHandler::new(db.clone(), peers.clone())),
    );
    router.register(MSG_AGENT_REGISTER, Arc::new(AgentSyncHandler::new(db.clone())));
    router.register("ping", Arc::new(PingHandler));

    let reconciler = TargetReconciler::new(db.clone(), peers, registry);
    let state = Arc::new(AppState {
        db,
        router: Arc::new(router),
        reconciler,
    });

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/ws", get(ws_handler))
        .route("/v1/holepunch", post(holepunch_handler))
        .route(
            "/v1/resources/:resource_id/targets",
            put(create_target_handler).get(list_targets_handler),
        )
        .route(
            "/v1/targets/:target_id",
            get(get_target_handler)
                .post(update_target_handler)
                .delete(delete_target_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the daemon's HTTP listener
pub async fn serve(listen: String, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::PeerPush(_) | Error::AgentUnavailable { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    client_id: Option<i64>,
    site_id: Option<i64>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let principal = match (query.client_id, query.site_id) {
        (Some(client_id), None) => Principal::Client { client_id },
        (None, Some(site_id)) => Principal::Agent { site_id },
        _ => {
            return error_response(Error::InvalidInput(
                "exactly one of clientId or siteId is required".to_string(),
            ))
        }
    };
    let router = state.router.clone();
    ws.on_upgrade(move |socket| ws::drive_connection(router, socket, principal))
}

async fn holepunch_handler(
    State(state): State<Arc<AppState>>,
    Json(report): Json<connectivity::HolePunchReport>,
) -> Response {
    match connectivity::record_hole_punch(&state.db, &report) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTargetRequest {
    ip: String,
    port: u16,
    method: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_target_handler(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<i64>,
    Json(req): Json<CreateTargetRequest>,
) -> Response {
    if req.ip.parse::<IpAddr>().is_err() {
        return error_response(Error::InvalidInput(format!(
            "invalid target ip {:?}",
            req.ip
        )));
    }
    let resource = match state.db.resource(resource_id) {
        Ok(Some(resource)) => resource,
        Ok(None) => return error_response(Error::not_found("resource", resource_id)),
        Err(e) => return error_response(e),
    };
    let target = match state.db.create_target(
        resource.resource_id,
        &req.ip,
        req.port,
        req.method.as_deref(),
        req.enabled,
    ) {
        Ok(target) => target,
        Err(e) => return error_response(e),
    };

    if let Err(e) = state
        .reconciler
        .reconcile(&TargetChange::Added(target.clone()))
        .await
    {
        warn!("Reconciliation after target create failed: {}", e);
        return error_response(e);
    }
    (StatusCode::CREATED, Json(target)).into_response()
}

async fn list_targets_handler(
    State(state): State<Arc<AppState>>,
    Path(resource_id): Path<i64>,
) -> Response {
    match state.db.resource(resource_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(Error::not_found("resource", resource_id)),
        Err(e) => return error_response(e),
    }
    match state.db.targets_for_resource(resource_id) {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_target_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<i64>,
) -> Response {
    match state.db.target(target_id) {
        Ok(Some(target)) => Json(target).into_response(),
        Ok(None) => error_response(Error::not_found("target", target_id)),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateTargetRequest {
    ip: Option<String>,
    port: Option<u16>,
    method: Option<String>,
    enabled: Option<bool>,
}

async fn update_target_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<i64>,
    Json(req): Json<UpdateTargetRequest>,
) -> Response {
    if let Some(ip) = &req.ip {
        if ip.parse::<IpAddr>().is_err() {
            return error_response(Error::InvalidInput(format!("invalid target ip {:?}", ip)));
        }
    }
    let update = TargetUpdate {
        ip: req.ip,
        port: req.port,
        method: req.method,
        enabled: req.enabled,
    };
    let target = match state.db.update_target(target_id, update) {
        Ok(Some(target)) => target,
        Ok(None) => return error_response(Error::not_found("target", target_id)),
        Err(e) => return error_response(e),
    };

    if let Err(e) = state
        .reconciler
        .reconcile(&TargetChange::Updated(target.clone()))
        .await
    {
        warn!("Reconciliation after target update failed: {}", e);
        return error_response(e);
    }
    Json(target).into_response()
}

async fn delete_target_handler(
    State(state): State<Arc<AppState>>,
    Path(target_id): Path<i64>,
) -> Response {
    // The agent push needs the row as it was, so fetch before deleting.
    let target = match state.db.target(target_id) {
        Ok(Some(target)) => target,
        Ok(None) => return error_response(Error::not_found("target", target_id)),
        Err(e) => return error_response(e),
    };
    if let Err(e) = state.db.delete_target(target_id) {
        return error_response(e);
    }

    let change = TargetChange::Removed(target);
    if let Err(e) = state.reconciler.reconcile(&change).await {
        warn!("Reconciliation after target delete failed: {}", e);
        return error_response(e);
    }
    Json(change.target().clone()).into_response()
}
