use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use srmc_types::{CommandData, CommandReply, Message, MessageBody};

use crate::collaborators::PresenceStore;
use crate::commands::{CommandContext, CommandError, CommandRegistry};
use crate::keys::KeyManager;
use crate::registry::{ConnectionContext, Outbound, SessionRegistry};

/// Lifecycle of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Routed,
    Delivered,
    Rejected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Routed => "routed",
            Self::Delivered => "delivered",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Fanned out (chat) or applied (status).
    Delivered { recipients: usize, skipped: usize },
    /// Command accepted; its result is sent to the requester later.
    Accepted,
    Rejected { reason: String },
}

/// Routes validated messages to business handlers and the broadcast path.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: SessionRegistry,
    keys: KeyManager,
    presence: Arc<dyn PresenceStore>,
    commands: CommandRegistry,
    command_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: SessionRegistry,
        keys: KeyManager,
        presence: Arc<dyn PresenceStore>,
        commands: CommandRegistry,
        command_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                keys,
                presence,
                commands,
                command_timeout,
            }),
        }
    }

    pub fn presence(&self) -> &Arc<dyn PresenceStore> {
        &self.inner.presence
    }

    pub async fn dispatch(&self, conn: &ConnectionContext, message: Message) -> DispatchOutcome {
        let kind = message.kind();
        trace!("{} ({}) {} message {}", conn.identity, conn.id, kind.as_str(), Stage::Routed);

        let outcome = match message.body {
            MessageBody::Chat(_) => {
                let report = self
                    .inner
                    .registry
                    .broadcast(Arc::new(message), Some(conn.id))
                    .await;
                DispatchOutcome::Delivered {
                    recipients: report.delivered,
                    skipped: report.skipped,
                }
            }
            MessageBody::Status(status) => {
                self.inner.presence.set_status(&conn.identity, &status.status);
                DispatchOutcome::Delivered {
                    recipients: 0,
                    skipped: 0,
                }
            }
            MessageBody::Command(command) => self.run_command(conn, command).await,
            MessageBody::CommandResult(_) => DispatchOutcome::Rejected {
                reason: "command_result is server-only".into(),
            },
        };

        match &outcome {
            DispatchOutcome::Rejected { reason } => {
                debug!("{} ({}) {} message {}: {}", conn.identity, conn.id, kind.as_str(), Stage::Rejected, reason)
            }
            _ => trace!("{} ({}) {} message {}", conn.identity, conn.id, kind.as_str(), Stage::Delivered),
        }
        outcome
    }

    async fn run_command(&self, conn: &ConnectionContext, command: CommandData) -> DispatchOutcome {
        let CommandData { name, id, args } = command;

        let Some(handler) = self.inner.commands.get(&name) else {
            let err = CommandError::Unknown(name.clone());
            let reply = reply(name, id, Err(&err));
            self.inner
                .registry
                .send_to(conn.id, Outbound::Message(Arc::new(reply)))
                .await;
            return DispatchOutcome::Rejected { reason: err.to_string() };
        };

        let ctx = CommandContext {
            conn: conn.clone(),
            registry: self.inner.registry.clone(),
            keys: self.inner.keys.clone(),
        };
        let registry = self.inner.registry.clone();
        let timeout = self.inner.command_timeout;

        // The command outlives the connection if it has to; its result is
        // then discarded.
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, handler.handle(&ctx, args)).await {
                Ok(result) => result,
                Err(_) => Err(CommandError::TimedOut),
            };
            if let Err(e) = &result {
                warn!("{} ({}) command `{}` failed: {}", ctx.conn.identity, ctx.conn.id, name, e);
            } else {
                info!("{} ({}) ran command `{}`", ctx.conn.identity, ctx.conn.id, name);
            }

            let message = reply(name, id, result.as_ref());
            if !registry.send_to(ctx.conn.id, Outbound::Message(Arc::new(message))).await {
                debug!("Connection {} gone, discarding command result", ctx.conn.id);
            }
        });

        DispatchOutcome::Accepted
    }
}

fn reply(name: String, id: Option<String>, result: Result<&Value, &CommandError>) -> Message {
    let body = match result {
        Ok(value) => CommandReply {
            name,
            id,
            ok: true,
            result: Some(value.clone()),
            error: None,
        },
        Err(e) => CommandReply {
            name,
            id,
            ok: false,
            result: None,
            error: Some(e.to_string()),
        },
    };
    Message::new(MessageBody::CommandResult(body))
}
