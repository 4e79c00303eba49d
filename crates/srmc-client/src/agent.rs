use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use srmc_types::close::ABNORMAL_CLOSURE;
use srmc_types::{CloseCode, ControlFrame, Message, MessageBody};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::ClientKeys;
use crate::error::{ClientError, ErrorKind};
use crate::transport::{Connector, Frame, Transport};

/// How long the server gets to send `ready` after the upgrade completes.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages accepted while connected but not yet written, in reject mode.
const MAX_IN_FLIGHT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the agent gave up or was closed. Sends fail from here on.
    Closed,
}

/// What `send` does while there is no live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Fail immediately with [`ClientError::NotConnected`].
    Reject,
    /// Hold up to `capacity` messages, dropping the oldest on overflow, and
    /// flush them in order after reconnecting.
    Buffer { capacity: usize },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway endpoint, e.g. `wss://chat.example.com/gateway`.
    pub url: String,
    pub origin: String,
    pub token: String,
    /// Reconnect attempts after a loss before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub send_mode: SendMode,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, origin: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
            token: token.into(),
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            send_mode: SendMode::Reject,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(n-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn queue_capacity(&self) -> usize {
        match self.send_mode {
            SendMode::Reject => MAX_IN_FLIGHT,
            SendMode::Buffer { capacity } => capacity.max(1),
        }
    }
}

/// Callbacks from the agent task. They run on that task, so keep them short.
pub trait ClientEvents: Send + Sync {
    fn on_message(&self, message: Message);

    fn on_state(&self, _state: ClientState) {}

    /// `Terminal` is reported at most once, after which the agent stops.
    fn on_error(&self, kind: ErrorKind, error: &ClientError);

    /// A buffered message was dropped to make room.
    fn on_overflow(&self, _dropped: &MessageBody) {}
}

struct Shared {
    inner: Mutex<SharedState>,
    wake: Notify,
}

struct SharedState {
    state: ClientState,
    pending: VecDeque<MessageBody>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.inner.lock().expect("client state lock poisoned")
    }
}

/// Handle to a running agent. Dropping it closes the connection.
pub struct Client {
    config: ClientConfig,
    shared: Arc<Shared>,
    events: Arc<dyn ClientEvents>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Start the agent. The first connection attempt begins immediately.
    pub fn connect(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        events: Arc<dyn ClientEvents>,
    ) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(SharedState {
                state: ClientState::Disconnected,
                pending: VecDeque::new(),
            }),
            wake: Notify::new(),
        });
        let cancel = CancellationToken::new();

        let agent = Agent {
            config: config.clone(),
            connector,
            events: events.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(agent.run());

        Self {
            config,
            shared,
            events,
            cancel,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ClientState {
        self.shared.lock().state
    }

    /// Queue `body` for delivery. The sender is filled in by the server.
    pub fn send(&self, body: MessageBody) -> Result<(), ClientError> {
        let dropped = {
            let mut shared = self.shared.lock();
            match (shared.state, self.config.send_mode) {
                (ClientState::Closed, _) => return Err(ClientError::Closed),
                (ClientState::Connected, _) | (_, SendMode::Buffer { .. }) => {}
                (_, SendMode::Reject) => return Err(ClientError::NotConnected),
            }

            let dropped = if shared.pending.len() >= self.config.queue_capacity() {
                match self.config.send_mode {
                    SendMode::Reject => return Err(ClientError::QueueFull),
                    SendMode::Buffer { .. } => shared.pending.pop_front(),
                }
            } else {
                None
            };
            shared.pending.push_back(body);
            dropped
        };

        self.shared.wake.notify_one();
        if let Some(dropped) = dropped {
            warn!("Send buffer full, dropped oldest {} message", dropped.kind().as_str());
            self.events.on_overflow(&dropped);
        }
        Ok(())
    }

    /// Number of messages waiting for a connection.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Close the connection with a normal closure and stop reconnecting.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    ClosedByClient,
    Lost(ClientError),
}

/// The task side: owns the connector and at most one live transport.
struct Agent {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    events: Arc<dyn ClientEvents>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Agent {
    async fn run(self) {
        // 0 is the initial connect; n > 0 is the n-th reconnect attempt
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                let delay = self.config.backoff(attempt);
                debug!("Reconnect attempt {} in {:?}", attempt, delay);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            self.set_state(ClientState::Connecting);
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.open_session() => outcome,
            };

            let error = match outcome {
                Ok((transport, keys)) => {
                    info!("Connected as {}", keys.identity());
                    attempt = 0;
                    self.set_state(ClientState::Connected);
                    match self.run_session(transport, keys).await {
                        SessionEnd::ClosedByClient => break,
                        SessionEnd::Lost(e) => {
                            self.discard_unsent();
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            if error.is_terminal() {
                self.give_up(error);
                return;
            }
            if attempt >= self.config.max_attempts {
                self.give_up(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
                return;
            }

            warn!("Connection lost: {}", error);
            self.events.on_error(ErrorKind::Retryable, &error);
            self.set_state(ClientState::Disconnected);
            attempt += 1;
        }

        self.set_state(ClientState::Closed);
    }

    /// Reject mode only promises delivery while connected; whatever the
    /// lost session did not write goes with it.
    fn discard_unsent(&self) {
        if !matches!(self.config.send_mode, SendMode::Reject) {
            return;
        }
        let dropped = std::mem::take(&mut self.shared.lock().pending).len();
        if dropped > 0 {
            warn!("Connection lost, discarding {} unsent message(s)", dropped);
        }
    }

    /// Connect and wait for the server's `ready` frame.
    async fn open_session(&self) -> Result<(Box<dyn Transport>, ClientKeys), ClientError> {
        let mut transport = self.connector.connect(&self.config).await?;

        let first = tokio::time::timeout(READY_TIMEOUT, transport.recv())
            .await
            .map_err(|_| ClientError::Protocol("timed out waiting for ready".into()))?;

        match first {
            Some(Ok(Frame::Text(text))) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(ControlFrame::Ready {
                    identity,
                    connection_id,
                    key,
                }) => {
                    debug!("Ready on connection {} (key epoch {})", connection_id, key.epoch);
                    let keys = ClientKeys::new(identity, &key)?;
                    Ok((transport, keys))
                }
                Ok(other) => Err(ClientError::Protocol(format!("expected ready, got {:?}", other))),
                Err(e) => Err(ClientError::Protocol(format!("invalid control frame: {}", e))),
            },
            Some(Ok(Frame::Close(code, reason))) => Err(server_close(code, reason)),
            Some(Ok(Frame::Binary(_))) => Err(ClientError::Protocol("binary frame before ready".into())),
            Some(Err(e)) => Err(e),
            None => Err(server_close(Some(ABNORMAL_CLOSURE), "connection lost".into())),
        }
    }

    async fn run_session(&self, mut transport: Box<dyn Transport>, mut keys: ClientKeys) -> SessionEnd {
        loop {
            let next = self.shared.lock().pending.pop_front();
            if let Some(body) = next {
                let frame = match keys.seal(&Message::new(body.clone()).to_json_bytes()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping unsendable message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = transport.send(Frame::Binary(frame)).await {
                    self.shared.lock().pending.push_front(body);
                    return SessionEnd::Lost(e);
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let code = CloseCode::Normal;
                    let _ = transport.send(Frame::Close(Some(code.as_u16()), code.reason().into())).await;
                    return SessionEnd::ClosedByClient;
                }

                _ = self.shared.wake.notified() => {}

                frame = transport.recv() => match frame {
                    Some(Ok(Frame::Binary(bytes))) => self.deliver(&keys, &bytes),
                    Some(Ok(Frame::Text(text))) => {
                        if let Err(e) = self.control(&mut keys, &text) {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Some(Ok(Frame::Close(code, reason))) => {
                        return SessionEnd::Lost(server_close(code, reason));
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e),
                    None => {
                        return SessionEnd::Lost(server_close(Some(ABNORMAL_CLOSURE), "connection lost".into()));
                    }
                },
            }
        }
    }

    fn deliver(&self, keys: &ClientKeys, frame: &[u8]) {
        let message = keys
            .open(frame)
            .and_then(|plaintext| {
                serde_json::from_slice::<Message>(&plaintext)
                    .map_err(|e| ClientError::Protocol(format!("invalid message: {}", e)))
            });
        match message {
            Ok(message) => self.events.on_message(message),
            Err(e) => warn!("Discarding inbound frame: {}", e),
        }
    }

    fn control(&self, keys: &mut ClientKeys, text: &str) -> Result<(), ClientError> {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(ControlFrame::KeyRotated { key }) => {
                debug!("Key rotated to epoch {}", key.epoch);
                keys.install(&key)
            }
            Ok(ControlFrame::Throttled { retry_after_ms }) => {
                warn!("Throttled by server for {}ms", retry_after_ms);
                Ok(())
            }
            Ok(ControlFrame::Ready { .. }) => Ok(()),
            Err(e) => {
                warn!("Ignoring unknown control frame: {}", e);
                Ok(())
            }
        }
    }

    fn set_state(&self, state: ClientState) {
        {
            let mut shared = self.shared.lock();
            if shared.state == state {
                return;
            }
            shared.state = state;
            if state == ClientState::Closed {
                shared.pending.clear();
            }
        }
        self.events.on_state(state);
    }

    fn give_up(&self, error: ClientError) {
        warn!("Giving up: {}", error);
        self.set_state(ClientState::Closed);
        self.events.on_error(ErrorKind::Terminal, &error);
    }
}

fn server_close(code: Option<u16>, reason: String) -> ClientError {
    ClientError::ClosedByServer {
        // 1005: no status code present
        code: code.unwrap_or(1005),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use srmc_crypto::SecretKey;
    use srmc_types::{IdentityId, KeyGrant};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    // -- test doubles --

    struct MockTransport {
        inbound: mpsc::UnboundedReceiver<Frame>,
        outbound: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
            self.outbound
                .send(frame)
                .map_err(|_| ClientError::Transport("peer gone".into()))
        }

        async fn recv(&mut self) -> Option<Result<Frame, ClientError>> {
            self.inbound.recv().await.map(Ok)
        }
    }

    /// Server side of one scripted connection.
    struct Peer {
        inbound: mpsc::UnboundedSender<Frame>,
        outbound: mpsc::UnboundedReceiver<Frame>,
        key: SecretKey,
    }

    impl Peer {
        fn sealed(&self, message: &Message) -> Frame {
            let bytes = srmc_crypto::seal(&self.key, b"alice", &message.to_json_bytes()).unwrap();
            Frame::Binary(bytes)
        }

        fn open(&self, frame: &Frame) -> Message {
            let Frame::Binary(bytes) = frame else {
                panic!("expected binary frame, got {:?}", frame);
            };
            let plaintext = srmc_crypto::open(&self.key, b"alice", bytes).unwrap();
            serde_json::from_slice(&plaintext).unwrap()
        }
    }

    enum Script {
        Accept(MockTransport),
        Fail(ClientError),
    }

    #[derive(Default)]
    struct MockConnector {
        script: Mutex<VecDeque<Script>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl MockConnector {
        fn push_fail(&self, error: ClientError) {
            self.script.lock().unwrap().push_back(Script::Fail(error));
        }

        /// Queue a connection that sends `ready` for alice at epoch 1.
        fn push_accept(&self) -> Peer {
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let key = SecretKey::generate().unwrap();

            let ready = ControlFrame::Ready {
                identity: IdentityId::from("alice"),
                connection_id: Default::default(),
                key: grant(1, &key),
            };
            in_tx.send(Frame::Text(serde_json::to_string(&ready).unwrap())).unwrap();

            self.script.lock().unwrap().push_back(Script::Accept(MockTransport {
                inbound: in_rx,
                outbound: out_tx,
            }));
            Peer {
                inbound: in_tx,
                outbound: out_rx,
                key,
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _config: &ClientConfig) -> Result<Box<dyn Transport>, ClientError> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.script.lock().unwrap().pop_front() {
                Some(Script::Accept(t)) => Ok(Box::new(t)),
                Some(Script::Fail(e)) => Err(e),
                None => Err(ClientError::Transport("connection refused".into())),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ClientState>>,
        errors: Mutex<Vec<(ErrorKind, ClientError)>>,
        messages: Mutex<Vec<Message>>,
        overflows: Mutex<Vec<MessageBody>>,
        changed: Notify,
    }

    impl Recorder {
        async fn wait_until(&self, pred: impl Fn(&Self) -> bool) {
            loop {
                let notified = self.changed.notified();
                if pred(self) {
                    return;
                }
                notified.await;
            }
        }

        fn terminal_count(&self) -> usize {
            self.errors
                .lock()
                .unwrap()
                .iter()
                .filter(|(kind, _)| *kind == ErrorKind::Terminal)
                .count()
        }

        fn last_state(&self) -> Option<ClientState> {
            self.states.lock().unwrap().last().copied()
        }
    }

    impl ClientEvents for Recorder {
        fn on_message(&self, message: Message) {
            self.messages.lock().unwrap().push(message);
            self.changed.notify_waiters();
        }

        fn on_state(&self, state: ClientState) {
            self.states.lock().unwrap().push(state);
            self.changed.notify_waiters();
        }

        fn on_error(&self, kind: ErrorKind, error: &ClientError) {
            self.errors.lock().unwrap().push((kind, error.clone()));
            self.changed.notify_waiters();
        }

        fn on_overflow(&self, dropped: &MessageBody) {
            self.overflows.lock().unwrap().push(dropped.clone());
            self.changed.notify_waiters();
        }
    }

    fn grant(epoch: u64, key: &SecretKey) -> KeyGrant {
        KeyGrant {
            epoch,
            key: key.to_base64(),
            expires_at: chrono::Utc::now(),
        }
    }

    fn config(send_mode: SendMode) -> ClientConfig {
        ClientConfig {
            send_mode,
            ..ClientConfig::new("ws://test/gateway", "https://app.example.com", "token")
        }
    }

    fn start(send_mode: SendMode) -> (Client, Arc<MockConnector>, Arc<Recorder>) {
        let connector = Arc::new(MockConnector::default());
        let recorder = Arc::new(Recorder::default());
        let client = Client::connect(config(send_mode), connector.clone(), recorder.clone());
        (client, connector, recorder)
    }

    // -- tests --

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = ClientConfig {
            max_delay: Duration::from_secs(10),
            ..config(SendMode::Reject)
        };
        let delays: Vec<u64> = (1..=5).map(|n| config.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
        assert_eq!(config.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_transport_retries_on_schedule_then_gives_up_once() {
        let (client, connector, events) = start(SendMode::Reject);
        let peer = connector.push_accept();

        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;
        let lost_at = Instant::now();
        drop(peer);

        events.wait_until(|e| e.terminal_count() == 1).await;
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6, "initial connect plus five retries");

        let mut previous = lost_at;
        for (retry, at) in attempts[1..].iter().enumerate() {
            assert_eq!(*at - previous, Duration::from_secs(1 << retry));
            previous = *at;
        }

        // Nothing further happens once terminal.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.attempts().len(), 6);
        assert_eq!(events.terminal_count(), 1);
        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(
            events.errors.lock().unwrap().last(),
            Some((ErrorKind::Terminal, ClientError::RetriesExhausted { attempts: 5, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn policy_close_is_terminal_without_retry() {
        let (client, connector, events) = start(SendMode::Reject);
        let peer = connector.push_accept();
        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;

        peer.inbound
            .send(Frame::Close(Some(4008), "rate limit exceeded".into()))
            .unwrap();
        events.wait_until(|e| e.terminal_count() == 1).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(client.send(MessageBody::chat("hi")), Err(ClientError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_handshake_is_terminal() {
        let (client, connector, events) = start(SendMode::Reject);
        connector.push_fail(ClientError::Rejected(401));

        events.wait_until(|e| e.terminal_count() == 1).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(client.state(), ClientState::Closed);
        let errors = events.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1, ClientError::Rejected(401));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_mode_fails_fast_while_disconnected() {
        let (client, connector, events) = start(SendMode::Reject);
        connector.push_fail(ClientError::Transport("refused".into()));

        assert_eq!(client.send(MessageBody::chat("early")), Err(ClientError::NotConnected));

        let peer = connector.push_accept();
        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;
        assert_eq!(client.send(MessageBody::chat("now")), Ok(()));

        let mut peer = peer;
        let frame = peer.outbound.recv().await.unwrap();
        assert_eq!(peer.open(&frame).body, MessageBody::chat("now"));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_mode_discards_unsent_on_loss() {
        let (client, connector, events) = start(SendMode::Reject);
        let Peer { inbound: _inbound, outbound, .. } = connector.push_accept();
        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;

        // The peer stops reading, so the write fails and the session is lost.
        drop(outbound);
        assert_eq!(client.send(MessageBody::chat("lost")), Ok(()));
        events.wait_until(|e| !e.errors.lock().unwrap().is_empty()).await;
        assert_eq!(client.pending(), 0);

        let mut peer = connector.push_accept();
        events
            .wait_until(|e| {
                let states = e.states.lock().unwrap();
                states.iter().filter(|s| **s == ClientState::Connected).count() == 2
            })
            .await;
        client.send(MessageBody::chat("fresh")).unwrap();

        let frame = peer.outbound.recv().await.unwrap();
        assert_eq!(peer.open(&frame).body, MessageBody::chat("fresh"));
        assert!(peer.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_drops_oldest_and_flushes_in_order() {
        let (client, connector, events) = start(SendMode::Buffer { capacity: 2 });
        connector.push_fail(ClientError::Transport("refused".into()));
        events.wait_until(|e| !e.errors.lock().unwrap().is_empty()).await;

        let mut peer = connector.push_accept();
        for text in ["one", "two", "three"] {
            client.send(MessageBody::chat(text)).unwrap();
        }
        assert_eq!(*events.overflows.lock().unwrap(), vec![MessageBody::chat("one")]);
        assert_eq!(client.pending(), 2);

        let first = peer.outbound.recv().await.unwrap();
        let second = peer.outbound.recv().await.unwrap();
        assert_eq!(peer.open(&first).body, MessageBody::chat("two"));
        assert_eq!(peer.open(&second).body, MessageBody::chat("three"));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_key_rotation() {
        let (_client, connector, events) = start(SendMode::Reject);
        let peer = connector.push_accept();
        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;

        let before = Message::from_sender("bob".into(), MessageBody::chat("before"));
        let sealed_with_old = peer.sealed(&before);

        let next = SecretKey::generate().unwrap();
        let rotated = ControlFrame::KeyRotated { key: grant(2, &next) };
        peer.inbound
            .send(Frame::Text(serde_json::to_string(&rotated).unwrap()))
            .unwrap();

        let after = Message::from_sender("bob".into(), MessageBody::chat("after"));
        let sealed_with_new = srmc_crypto::seal(&next, b"alice", &after.to_json_bytes()).unwrap();
        peer.inbound.send(Frame::Binary(sealed_with_new)).unwrap();
        peer.inbound.send(sealed_with_old).unwrap();

        events.wait_until(|e| e.messages.lock().unwrap().len() == 2).await;
        let messages = events.messages.lock().unwrap();
        assert_eq!(messages[0].body, MessageBody::chat("after"));
        assert_eq!(messages[1].body, MessageBody::chat("before"));
        assert_eq!(messages[1].sender, Some(IdentityId::from("bob")));
    }

    #[tokio::test(start_paused = true)]
    async fn close_sends_normal_closure() {
        let (client, connector, events) = start(SendMode::Reject);
        let mut peer = connector.push_accept();
        events.wait_until(|e| e.last_state() == Some(ClientState::Connected)).await;

        client.close().await;
        assert_eq!(
            peer.outbound.recv().await,
            Some(Frame::Close(Some(1000), CloseCode::Normal.reason().into()))
        );
        assert_eq!(events.last_state(), Some(ClientState::Closed));
        assert_eq!(events.terminal_count(), 0);
    }
}
