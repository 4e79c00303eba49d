//! The agent against a real gateway on a loopback socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use srmc_client::{Client, ClientConfig, ClientError, ClientEvents, ClientState, ErrorKind, WsConnector};
use srmc_gateway::collaborators::{JwtVerifier, issue_token};
use srmc_gateway::config::{GatewayConfig, RateLimitConfig};
use srmc_gateway::{Collaborators, Gateway, router};
use srmc_types::{IdentityId, Message, MessageBody};

const SECRET: &str = "live-gateway-secret";
const ORIGIN: &str = "https://app.example.com";

async fn start(config: GatewayConfig) -> String {
    let gateway = Gateway::new(config, Collaborators::new(Arc::new(JwtVerifier::new(SECRET))));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(gateway)).await.unwrap();
    });
    format!("ws://{}/gateway", addr)
}

fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        allowed_origins: vec![ORIGIN.into()],
        ..GatewayConfig::default()
    }
}

struct Events {
    messages: mpsc::UnboundedSender<Message>,
    states: mpsc::UnboundedSender<ClientState>,
    errors: mpsc::UnboundedSender<(ErrorKind, ClientError)>,
}

impl ClientEvents for Events {
    fn on_message(&self, message: Message) {
        let _ = self.messages.send(message);
    }

    fn on_state(&self, state: ClientState) {
        let _ = self.states.send(state);
    }

    fn on_error(&self, kind: ErrorKind, error: &ClientError) {
        let _ = self.errors.send((kind, error.clone()));
    }
}

struct Peer {
    client: Client,
    messages: mpsc::UnboundedReceiver<Message>,
    states: mpsc::UnboundedReceiver<ClientState>,
    errors: mpsc::UnboundedReceiver<(ErrorKind, ClientError)>,
}

impl Peer {
    fn start(url: &str, origin: &str, identity: &str) -> Self {
        let token = issue_token(SECRET, identity, &[], chrono::Duration::minutes(5)).unwrap();
        let (messages_tx, messages) = mpsc::unbounded_channel();
        let (states_tx, states) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let events = Arc::new(Events {
            messages: messages_tx,
            states: states_tx,
            errors: errors_tx,
        });
        let client = Client::connect(ClientConfig::new(url, origin, token), Arc::new(WsConnector), events);
        Self {
            client,
            messages,
            states,
            errors,
        }
    }

    async fn reach(&mut self, target: ClientState) {
        let wait = async {
            while let Some(state) = self.states.recv().await {
                if state == target {
                    return;
                }
            }
            panic!("event channel closed before {:?}", target);
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("never reached {:?}", target));
    }

    async fn terminal_error(&mut self) -> ClientError {
        let wait = async {
            while let Some((kind, error)) = self.errors.recv().await {
                if kind == ErrorKind::Terminal {
                    return error;
                }
            }
            panic!("event channel closed without a terminal error");
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }
}

#[tokio::test]
async fn chat_between_two_agents() {
    let url = start(gateway_config()).await;
    let mut bob = Peer::start(&url, ORIGIN, "bob");
    let mut alice = Peer::start(&url, ORIGIN, "alice");
    bob.reach(ClientState::Connected).await;
    alice.reach(ClientState::Connected).await;

    alice.client.send(MessageBody::chat("hi")).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(2), bob.messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.body, MessageBody::chat("hi"));
    assert_eq!(got.sender, Some(IdentityId::from("alice")));

    let echo = tokio::time::timeout(Duration::from_millis(300), alice.messages.recv()).await;
    assert!(echo.is_err(), "sender received its own chat");

    alice.client.close().await;
    bob.client.close().await;
}

#[tokio::test]
async fn wrong_origin_is_terminal() {
    let url = start(gateway_config()).await;
    let mut eve = Peer::start(&url, "https://evil.example.com", "eve");

    assert_eq!(eve.terminal_error().await, ClientError::Rejected(403));
    eve.reach(ClientState::Closed).await;
    assert_eq!(eve.client.send(MessageBody::chat("hi")), Err(ClientError::Closed));
}

#[tokio::test]
async fn rate_limit_closure_is_terminal() {
    let url = start(GatewayConfig {
        rate: RateLimitConfig {
            window: Duration::from_secs(1),
            soft_limit: 1_000,
            hard_window: Duration::from_secs(10),
            hard_limit: 5,
        },
        ..gateway_config()
    })
    .await;
    let mut alice = Peer::start(&url, ORIGIN, "alice");
    alice.reach(ClientState::Connected).await;

    for i in 0..10 {
        let _ = alice.client.send(MessageBody::chat(format!("spam {}", i)));
    }

    match alice.terminal_error().await {
        ClientError::ClosedByServer { code, .. } => assert_eq!(code, 4008),
        other => panic!("unexpected terminal error {:?}", other),
    }
}
