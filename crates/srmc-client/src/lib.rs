//! Peer-side agent for the secure real-time channel.
//!
//! [`Client::connect`] spawns a task that owns the socket: it keeps the
//! identity's keys current, reconnects with exponential backoff after
//! transient failures, and gives up for good on policy violations.

pub mod agent;
pub mod crypto;
pub mod error;
pub mod transport;

pub use agent::{Client, ClientConfig, ClientEvents, ClientState, SendMode};
pub use error::{ClientError, ErrorKind};
pub use transport::{Connector, Frame, Transport, WsConnector};
