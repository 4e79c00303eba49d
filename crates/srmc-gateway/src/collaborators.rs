//! Interfaces to systems outside the channel: token verification, presence
//! storage and the audit/metrics sink, with the in-process defaults the
//! server binary wires up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{info, warn};

use srmc_types::api::Claims;
use srmc_types::{CloseCode, ConnectionId, IdentityId};

// -- Token verification --

/// The principal behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub id: IdentityId,
    pub roles: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid token: {0}")]
pub struct InvalidToken(pub String);

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, InvalidToken>;
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, InvalidToken> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| InvalidToken(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(InvalidToken("empty subject".into()));
        }
        Ok(VerifiedIdentity {
            id: IdentityId::new(data.claims.sub),
            roles: data.claims.roles,
        })
    }
}

/// Sign a token for `identity`, valid for `ttl`.
pub fn issue_token(
    secret: &str,
    identity: &str,
    roles: &[&str],
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: identity.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        roles: roles.iter().map(|r| r.to_string()).collect(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

// -- Presence --

pub trait PresenceStore: Send + Sync {
    fn set_status(&self, identity: &IdentityId, status: &str);
}

/// Presence kept in process memory.
#[derive(Default)]
pub struct MemoryPresence {
    statuses: RwLock<HashMap<IdentityId, String>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, identity: &IdentityId) -> Option<String> {
        self.statuses
            .read()
            .expect("presence lock poisoned")
            .get(identity)
            .cloned()
    }
}

impl PresenceStore for MemoryPresence {
    fn set_status(&self, identity: &IdentityId, status: &str) {
        self.statuses
            .write()
            .expect("presence lock poisoned")
            .insert(identity.clone(), status.to_string());
    }
}

// -- Audit --

/// Security-relevant events for anomaly alerting.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    HandshakeRejected {
        remote: Option<SocketAddr>,
        origin: Option<String>,
        code: CloseCode,
    },
    Connected {
        connection_id: ConnectionId,
        identity: IdentityId,
        remote: Option<SocketAddr>,
    },
    Throttled {
        connection_id: ConnectionId,
        identity: IdentityId,
        count: u32,
    },
    RateExceeded {
        connection_id: ConnectionId,
        identity: IdentityId,
        count: u32,
    },
    FrameRejected {
        connection_id: ConnectionId,
        identity: IdentityId,
        code: CloseCode,
        detail: String,
    },
    KeyRotated {
        identity: IdentityId,
        epoch: u64,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `srmc::audit` tracing target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Connected { .. } | AuditEvent::KeyRotated { .. } => {
                info!(target: "srmc::audit", ?event)
            }
            _ => warn!(target: "srmc::audit", ?event),
        }
    }
}

/// Discards all events.
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record(&self, _event: AuditEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let token = issue_token("secret", "alice", &["admin"], chrono::Duration::minutes(5)).unwrap();
        let id = JwtVerifier::new("secret").verify(&token).unwrap();
        assert_eq!(id.id, IdentityId::from("alice"));
        assert_eq!(id.roles, vec!["admin".to_string()]);
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = issue_token("secret", "alice", &[], chrono::Duration::minutes(5)).unwrap();
        assert!(JwtVerifier::new("other").verify(&token).is_err());
        assert!(JwtVerifier::new("secret").verify("garbage").is_err());
    }

    #[test]
    fn expired_token_is_invalid() {
        let token = issue_token("secret", "alice", &[], chrono::Duration::hours(-2)).unwrap();
        assert!(JwtVerifier::new("secret").verify(&token).is_err());
    }

    #[test]
    fn memory_presence_keeps_latest() {
        let presence = MemoryPresence::new();
        let alice = IdentityId::from("alice");
        presence.set_status(&alice, "online");
        presence.set_status(&alice, "away");
        assert_eq!(presence.status_of(&alice).as_deref(), Some("away"));
    }
}
