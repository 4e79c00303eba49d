//! Upgrade-request admission: origin allow-list, encrypted transport,
//! identity token. Nothing here touches key material, so a rejected peer
//! never learns anything beyond the rejection code.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use srmc_types::CloseCode;
use srmc_types::api::Rejection;

use crate::collaborators::{TokenVerifier, VerifiedIdentity};
use crate::config::GatewayConfig;

/// Attached by the listener to every accepted TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// The stream arrived over the TLS listener.
    pub secure: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeRejection {
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("origin not allowed: {0:?}")]
    OriginNotAllowed(Option<String>),
    #[error("encrypted transport required")]
    InsecureTransport,
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),
}

impl HandshakeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::InsecureTransport => StatusCode::UPGRADE_REQUIRED,
            Self::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Malformed(_) => CloseCode::MalformedMessage,
            Self::OriginNotAllowed(_) => CloseCode::OriginNotAllowed,
            Self::InsecureTransport => CloseCode::InsecureTransport,
            Self::AuthenticationRequired(_) => CloseCode::AuthenticationRequired,
        }
    }

    fn public_reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed handshake",
            Self::OriginNotAllowed(_) => "origin not allowed",
            Self::InsecureTransport => "encrypted transport required",
            Self::AuthenticationRequired(_) => "authentication required",
        }
    }
}

impl IntoResponse for HandshakeRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Rejection::new(status.as_u16(), self.close_code(), self.public_reason());
        (status, Json(body)).into_response()
    }
}

/// An admitted peer, not yet registered.
#[derive(Debug, Clone)]
pub struct AcceptedPeer {
    pub identity: VerifiedIdentity,
    pub privileged: bool,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
}

pub struct Handshake {
    allowed_origins: HashSet<String>,
    require_tls: bool,
    trust_forwarded_proto: bool,
    privileged_role: String,
    verifier: Arc<dyn TokenVerifier>,
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

impl Handshake {
    pub fn new(config: &GatewayConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            allowed_origins: config.allowed_origins.iter().map(|o| normalize_origin(o)).collect(),
            require_tls: config.require_tls,
            trust_forwarded_proto: config.trust_forwarded_proto,
            privileged_role: config.privileged_role.clone(),
            verifier,
        }
    }

    /// Run the admission checks in order: origin, transport, token.
    pub fn accept(
        &self,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        peer: Option<PeerInfo>,
    ) -> Result<AcceptedPeer, HandshakeRejection> {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let origin_allowed = origin
            .as_deref()
            .is_some_and(|o| self.allowed_origins.contains(&normalize_origin(o)));
        if !origin_allowed {
            return Err(HandshakeRejection::OriginNotAllowed(origin));
        }

        let secure = self.is_secure(headers, peer);
        if !secure {
            if self.require_tls {
                return Err(HandshakeRejection::InsecureTransport);
            }
            warn!(
                "Accepting plaintext upgrade from {:?} (TLS not required)",
                peer.map(|p| p.addr)
            );
        }

        let token = query
            .get("token")
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .or_else(|| bearer_token(headers))
            .ok_or_else(|| HandshakeRejection::AuthenticationRequired("missing token".into()))?;
        let identity = self
            .verifier
            .verify(token)
            .map_err(|e| HandshakeRejection::AuthenticationRequired(e.to_string()))?;

        let privileged = identity.roles.iter().any(|r| *r == self.privileged_role);
        Ok(AcceptedPeer {
            identity,
            privileged,
            remote: peer.map(|p| p.addr),
            secure,
        })
    }

    fn is_secure(&self, headers: &HeaderMap, peer: Option<PeerInfo>) -> bool {
        if peer.is_some_and(|p| p.secure) {
            return true;
        }
        self.trust_forwarded_proto
            && headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}
