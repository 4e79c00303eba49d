use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use srmc_types::{CloseCode, ControlFrame, IdentityId};

use crate::Gateway;
use crate::collaborators::AuditEvent;
use crate::dispatcher::Stage;
use crate::handshake::AcceptedPeer;
use crate::rate_limit::{RateCounter, RateDecision};
use crate::registry::{ConnectionContext, Outbound, Registration};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
/// Key rotation is checked on the same tick.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long either half waits for the other side of the closing handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Run an admitted connection until it closes.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, peer: AcceptedPeer) {
    let (mut sender, receiver) = socket.split();
    let identity = peer.identity.id.clone();

    let Registration { id, outbound, cancel } = gateway
        .registry()
        .register(identity.clone(), peer.remote, peer.privileged)
        .await;
    let ctx = ConnectionContext {
        id,
        identity: identity.clone(),
        privileged: peer.privileged,
    };

    info!("{} ({}) connected from {:?}", identity, id, peer.remote);
    gateway.audit().record(AuditEvent::Connected {
        connection_id: id,
        identity: identity.clone(),
        remote: peer.remote,
    });

    // Key is issued only now, after admission and registration.
    let key = match gateway.keys().get_or_create_key(&identity).await {
        Ok(key) => key,
        Err(e) => {
            error!("{} ({}) key issue failed: {}", identity, id, e);
            let _ = sender.send(close_message(CloseCode::InternalError, CloseCode::InternalError.reason())).await;
            finish(&gateway, &ctx).await;
            return;
        }
    };

    let ready = ControlFrame::Ready {
        identity: identity.clone(),
        connection_id: id,
        key: key.grant(),
    };
    if send_control(&mut sender, &ready).await.is_err() {
        finish(&gateway, &ctx).await;
        return;
    }

    gateway.dispatcher().presence().set_status(&identity, "online");

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(run_writer(
        sender,
        outbound,
        gateway.clone(),
        ctx.clone(),
        cancel.clone(),
        key.epoch,
        pong_received.clone(),
    ));
    let mut recv_task = tokio::spawn(run_reader(
        receiver,
        gateway.clone(),
        ctx.clone(),
        cancel.clone(),
        pong_received,
    ));

    tokio::select! {
        _ = &mut send_task => {
            cancel.cancel();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            gateway.registry().terminate(id, CloseCode::Normal, CloseCode::Normal.reason()).await;
            if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    finish(&gateway, &ctx).await;
}

/// Unregister and release per-identity state once the last connection goes.
async fn finish(gateway: &Gateway, ctx: &ConnectionContext) {
    if let Some(gone) = gateway.registry().unregister(ctx.id).await {
        if gone.last_for_identity {
            gateway.dispatcher().presence().set_status(&gone.identity, "offline");
            gateway.keys().evict_if_idle(&gone.identity, gateway.registry()).await;
        }
    }
    info!("{} ({}) disconnected", ctx.identity, ctx.id);
}

fn close_message(code: CloseCode, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: code.as_u16(),
        reason: reason.to_string().into(),
    }))
}

async fn send_control(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    frame: &ControlFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(WsMessage::Text(text.into())).await
}

/// Outbound queue → socket. Seals each message with the identity's active
/// key, announcing a new key before the first frame sealed with it.
async fn run_writer(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    gateway: Gateway,
    ctx: ConnectionContext,
    cancel: CancellationToken,
    mut announced_epoch: u64,
    pong_received: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = outbound.recv() => {
                let Some(item) = item else { break };
                let result = match item {
                    // Epochs only grow; an announcement already overtaken is stale.
                    Outbound::Control(ControlFrame::KeyRotated { key }) if key.epoch <= announced_epoch => Ok(()),
                    Outbound::Control(frame) => {
                        if let ControlFrame::KeyRotated { key } = &frame {
                            announced_epoch = key.epoch;
                        }
                        send_control(&mut sender, &frame).await
                    }
                    Outbound::Message(message) => {
                        let key = match gateway.keys().get_or_create_key(&ctx.identity).await {
                            Ok(key) => key,
                            Err(e) => {
                                error!("{} ({}) no key for outbound frame: {}", ctx.identity, ctx.id, e);
                                gateway.registry().terminate(ctx.id, CloseCode::InternalError, "key failure").await;
                                break;
                            }
                        };
                        if key.epoch != announced_epoch {
                            if send_control(&mut sender, &ControlFrame::KeyRotated { key: key.grant() }).await.is_err() {
                                break;
                            }
                            announced_epoch = key.epoch;
                        }
                        match gateway.codec().seal(&message, &ctx.identity, &key) {
                            Ok(bytes) => sender.send(WsMessage::Binary(bytes.into())).await,
                            Err(e) => {
                                error!("{} ({}) encode failed: {}", ctx.identity, ctx.id, e);
                                gateway.registry().terminate(ctx.id, e.close_code(), "encode failure").await;
                                break;
                            }
                        }
                    }
                };
                if result.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("{} ({}) heartbeat timeout (missed {} pongs), dropping connection", ctx.identity, ctx.id, missed_heartbeats);
                        gateway.registry().terminate(ctx.id, CloseCode::GoingAway, "heartbeat timeout").await;
                        break;
                    }
                }
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if announce_rotation(&mut sender, &gateway, &ctx.identity, &mut announced_epoch).await.is_err() {
                    break;
                }
            }
        }
    }

    let (code, reason) = gateway
        .registry()
        .close_reason(ctx.id)
        .await
        .unwrap_or((CloseCode::Normal, CloseCode::Normal.reason().to_string()));
    debug!("{} ({}) closing with {}", ctx.identity, ctx.id, code);
    let _ = sender.send(close_message(code, &reason)).await;
    let _ = sender.close().await;
}

/// Rotate the identity's key if due and tell this client about whichever
/// key is now active. The identity's other connections get the new key
/// through their queues.
async fn announce_rotation(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    gateway: &Gateway,
    identity: &IdentityId,
    announced_epoch: &mut u64,
) -> Result<(), axum::Error> {
    match gateway.keys().rotate_if_due(identity).await {
        Ok(Some(key)) => {
            gateway.audit().record(AuditEvent::KeyRotated {
                identity: identity.clone(),
                epoch: key.epoch,
            });
            let frame = Outbound::Control(ControlFrame::KeyRotated { key: key.grant() });
            gateway.registry().send_to_identity(identity, frame).await;
        }
        Ok(None) => {}
        Err(e) => error!("{} key rotation failed: {}", identity, e),
    }

    if let Ok(key) = gateway.keys().get_or_create_key(identity).await {
        if key.epoch != *announced_epoch {
            send_control(sender, &ControlFrame::KeyRotated { key: key.grant() }).await?;
            *announced_epoch = key.epoch;
        }
    }
    Ok(())
}

/// Close code for a socket read error caused by the peer's input, as opposed
/// to the peer going away. Frames over the socket limit never reach the codec.
fn read_error_code(error: &axum::Error) -> Option<CloseCode> {
    let text = error.to_string();
    if text.starts_with("Space limit exceeded") {
        Some(CloseCode::TooLarge)
    } else if text.starts_with("WebSocket protocol error") && !text.contains("without closing handshake") {
        Some(CloseCode::MalformedMessage)
    } else {
        None
    }
}

/// Socket → rate limiter → codec → dispatcher, one frame at a time.
async fn run_reader(
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    ctx: ConnectionContext,
    cancel: CancellationToken,
    pong_received: Arc<AtomicBool>,
) {
    let mut counter = RateCounter::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = receiver.next() => frame,
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                match read_error_code(&e) {
                    Some(code) => {
                        warn!("{} ({}) rejected frame: {}", ctx.identity, ctx.id, e);
                        gateway.audit().record(AuditEvent::FrameRejected {
                            connection_id: ctx.id,
                            identity: ctx.identity.clone(),
                            code,
                            detail: e.to_string(),
                        });
                        gateway.registry().terminate(ctx.id, code, code.reason()).await;
                    }
                    None => debug!("{} ({}) read error: {}", ctx.identity, ctx.id, e),
                }
                break;
            }
            None => break,
        };

        match msg {
            WsMessage::Binary(data) => {
                gateway.registry().touch(ctx.id).await;
                trace!("{} ({}) frame of {} bytes {}", ctx.identity, ctx.id, data.len(), Stage::Received);

                match gateway.limiter().check(&ctx, &mut counter).await {
                    RateDecision::Allowed => {}
                    RateDecision::Exceeded => break,
                    RateDecision::Throttled { retry_after } => {
                        let notice = ControlFrame::Throttled {
                            retry_after_ms: retry_after.as_millis() as u64,
                        };
                        gateway.registry().send_to(ctx.id, Outbound::Control(notice)).await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(retry_after) => {}
                        }
                    }
                }

                match gateway.codec().decode(&data, &ctx).await {
                    Ok(message) => {
                        trace!("{} ({}) {} message {}", ctx.identity, ctx.id, message.kind().as_str(), Stage::Validated);
                        gateway.dispatcher().dispatch(&ctx, message).await;
                    }
                    Err(e) => {
                        warn!("{} ({}) rejected frame: {}", ctx.identity, ctx.id, e);
                        let code = e.close_code();
                        gateway.audit().record(AuditEvent::FrameRejected {
                            connection_id: ctx.id,
                            identity: ctx.identity.clone(),
                            code,
                            detail: e.to_string(),
                        });
                        gateway.registry().terminate(ctx.id, code, code.reason()).await;
                        break;
                    }
                }
            }
            WsMessage::Text(_) => {
                warn!("{} ({}) sent a plaintext frame", ctx.identity, ctx.id);
                gateway.audit().record(AuditEvent::FrameRejected {
                    connection_id: ctx.id,
                    identity: ctx.identity.clone(),
                    code: CloseCode::MalformedMessage,
                    detail: "text frames are not accepted".into(),
                });
                gateway
                    .registry()
                    .terminate(ctx.id, CloseCode::MalformedMessage, "text frames are not accepted")
                    .await;
                break;
            }
            WsMessage::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) => {}
        }
    }

    // Discard input until the peer acknowledges the close; unread bytes at
    // drop time turn the close into a TCP reset.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, WsMessage::Close(_)) {
                break;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_error(text: &str) -> axum::Error {
        axum::Error::new(std::io::Error::other(text.to_string()))
    }

    #[test]
    fn oversized_input_maps_to_too_large() {
        let e = read_error("Space limit exceeded: Message too long: 4096 > 2048");
        assert_eq!(read_error_code(&e), Some(CloseCode::TooLarge));
    }

    #[test]
    fn broken_framing_is_malformed() {
        let e = read_error("WebSocket protocol error: Reserved bits are non-zero");
        assert_eq!(read_error_code(&e), Some(CloseCode::MalformedMessage));
    }

    #[test]
    fn peer_disappearing_has_no_close_code() {
        assert_eq!(read_error_code(&read_error("IO error: broken pipe")), None);
        let reset = read_error("WebSocket protocol error: Connection reset without closing handshake");
        assert_eq!(read_error_code(&reset), None);
    }
}
