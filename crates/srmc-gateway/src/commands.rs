//! `command` messages: a registry of named handlers plus the built-ins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use srmc_types::ControlFrame;

use crate::keys::KeyManager;
use crate::registry::{ConnectionContext, Outbound, SessionRegistry};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("command timed out")]
    TimedOut,
    #[error("{0}")]
    Failed(String),
}

/// What a handler can reach while running.
#[derive(Clone)]
pub struct CommandContext {
    pub conn: ConnectionContext,
    pub registry: SessionRegistry,
    pub keys: KeyManager,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &CommandContext, args: Value) -> Result<Value, CommandError>;
}

/// Name → handler map. Cheap to clone.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `ping`, `whoami`, `online` and `rotate_key`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Ping));
        registry.register(Arc::new(WhoAmI));
        registry.register(Arc::new(Online));
        registry.register(Arc::new(RotateKey));
        registry
    }

    /// Add a handler, replacing any previous handler of the same name.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn handle(&self, _ctx: &CommandContext, args: Value) -> Result<Value, CommandError> {
        Ok(json!({ "pong": true, "echo": args }))
    }
}

struct WhoAmI;

#[async_trait]
impl CommandHandler for WhoAmI {
    fn name(&self) -> &'static str {
        "whoami"
    }

    async fn handle(&self, ctx: &CommandContext, _args: Value) -> Result<Value, CommandError> {
        let connections = ctx.registry.connections_of(&ctx.conn.identity).await.len();
        Ok(json!({
            "identity": ctx.conn.identity,
            "connection_id": ctx.conn.id,
            "connections": connections,
            "privileged": ctx.conn.privileged,
        }))
    }
}

struct Online;

#[async_trait]
impl CommandHandler for Online {
    fn name(&self) -> &'static str {
        "online"
    }

    async fn handle(&self, ctx: &CommandContext, _args: Value) -> Result<Value, CommandError> {
        Ok(json!({ "identities": ctx.registry.identities().await }))
    }
}

/// Force a rotation of the caller's own key.
struct RotateKey;

#[async_trait]
impl CommandHandler for RotateKey {
    fn name(&self) -> &'static str {
        "rotate_key"
    }

    async fn handle(&self, ctx: &CommandContext, _args: Value) -> Result<Value, CommandError> {
        let key = ctx
            .keys
            .rotate_now(&ctx.conn.identity)
            .await
            .map_err(|e| CommandError::Failed(e.to_string()))?
            .ok_or_else(|| CommandError::Failed("no active key".into()))?;

        // Every device of the identity switches keys, not only the caller.
        let frame = Outbound::Control(ControlFrame::KeyRotated { key: key.grant() });
        ctx.registry.send_to_identity(&ctx.conn.identity, frame).await;
        Ok(json!({ "epoch": key.epoch }))
    }
}
