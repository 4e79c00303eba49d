use std::collections::HashMap;

use axum::{
    Json, Router,
    extract::{
        Extension, Query, State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
    },
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tracing::warn;

use crate::Gateway;
use crate::collaborators::AuditEvent;
use crate::connection;
use crate::handshake::{HandshakeRejection, PeerInfo};

/// `GET /gateway` (upgrade) and `GET /health`.
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(gateway)
}

async fn ws_upgrade(
    State(gateway): State<Gateway>,
    peer: Option<Extension<PeerInfo>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let peer = peer.map(|Extension(p)| p);

    let admitted = ws
        .map_err(|e| HandshakeRejection::Malformed(e.body_text()))
        .and_then(|ws| Ok((ws, gateway.handshake().accept(&headers, &query, peer)?)));

    let (ws, accepted) = match admitted {
        Ok(ok) => ok,
        Err(rejection) => {
            let origin = headers
                .get(header::ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            warn!("Rejected upgrade from {:?}: {}", peer.map(|p| p.addr), rejection);
            gateway.audit().record(AuditEvent::HandshakeRejected {
                remote: peer.map(|p| p.addr),
                origin,
                code: rejection.close_code(),
            });
            return rejection.into_response();
        }
    };

    let limit = gateway.config().max_frame_bytes.saturating_mul(2);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| connection::handle_connection(socket, gateway, accepted))
}

async fn health(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": gateway.registry().connection_count().await,
    }))
}
