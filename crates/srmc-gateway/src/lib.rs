//! Server side of the secure real-time channel.
//!
//! Upgrade requests pass [`handshake`]; admitted connections are registered
//! in the [`registry`], issued a key by the [`keys`] manager, and then every
//! inbound frame goes rate limiter → codec → dispatcher, in order, on the
//! connection's own task.

pub mod codec;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod keys;
pub mod rate_limit;
pub mod registry;
pub mod routes;

use std::sync::Arc;

use crate::codec::MessageCodec;
use crate::collaborators::{AuditSink, MemoryPresence, PresenceStore, TokenVerifier, TracingAudit};
use crate::commands::CommandRegistry;
use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::handshake::Handshake;
use crate::keys::KeyManager;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;

pub use crate::handshake::PeerInfo;
pub use crate::routes::router;

/// External collaborators the gateway is wired to.
pub struct Collaborators {
    pub verifier: Arc<dyn TokenVerifier>,
    pub presence: Arc<dyn PresenceStore>,
    pub audit: Arc<dyn AuditSink>,
    pub commands: CommandRegistry,
}

impl Collaborators {
    /// In-memory presence, tracing audit and the built-in commands.
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            presence: Arc::new(MemoryPresence::new()),
            audit: Arc::new(TracingAudit),
            commands: CommandRegistry::with_builtins(),
        }
    }
}

/// All gateway components, constructed once and shared by handle.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    registry: SessionRegistry,
    keys: KeyManager,
    codec: MessageCodec,
    limiter: RateLimiter,
    dispatcher: Dispatcher,
    handshake: Handshake,
    audit: Arc<dyn AuditSink>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, collaborators: Collaborators) -> Self {
        let registry = SessionRegistry::new(config.send_queue);
        let keys = KeyManager::new(config.keys.clone());
        let codec = MessageCodec::new(keys.clone(), config.max_frame_bytes, config.forbidden_keys.clone());
        let limiter = RateLimiter::new(config.rate.clone(), registry.clone(), collaborators.audit.clone());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            keys.clone(),
            collaborators.presence,
            collaborators.commands,
            config.command_timeout,
        );
        let handshake = Handshake::new(&config, collaborators.verifier);

        Self {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                keys,
                codec,
                limiter,
                dispatcher,
                handshake,
                audit: collaborators.audit,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn keys(&self) -> &KeyManager {
        &self.inner.keys
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.inner.codec
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.inner.audit
    }
}
