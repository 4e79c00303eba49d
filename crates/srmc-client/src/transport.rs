use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::ORIGIN};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::agent::ClientConfig;
use crate::error::ClientError;

/// A frame as the agent sees it, independent of the socket library.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Close frame; `None` when the peer sent no status code.
    Close(Option<u16>, String),
}

/// An open connection to the gateway.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ClientError>;

    /// Next inbound frame. `None` means the connection dropped without a
    /// close frame. Must be cancel safe.
    async fn recv(&mut self) -> Option<Result<Frame, ClientError>>;
}

/// Opens transports; one call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> Result<Box<dyn Transport>, ClientError>;
}

/// `tokio-tungstenite` connector. Sends the configured `Origin` and passes
/// the token as the `token` query parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &ClientConfig) -> Result<Box<dyn Transport>, ClientError> {
        let separator = if config.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}token={}", config.url, separator, config.token);

        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Transport(format!("invalid url: {}", e)))?;
        let origin = HeaderValue::from_str(&config.origin)
            .map_err(|e| ClientError::Transport(format!("invalid origin: {}", e)))?;
        request.headers_mut().insert(ORIGIN, origin);

        match connect_async(request).await {
            Ok((ws, _)) => Ok(Box::new(WsTransport { ws })),
            Err(tungstenite::Error::Http(response)) => {
                Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => Err(ClientError::Transport(e.to_string())),
        }
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
        let result = match frame {
            Frame::Text(text) => self.ws.send(WsMessage::Text(text.into())).await,
            Frame::Binary(bytes) => self.ws.send(WsMessage::Binary(bytes.into())).await,
            Frame::Close(code, reason) => {
                let frame = code.map(|code| CloseFrame {
                    code: code.into(),
                    reason: reason.into(),
                });
                self.ws.close(frame).await
            }
        };
        result.map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ClientError>> {
        loop {
            let frame = match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => Frame::Text(text.to_string()),
                Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                Ok(WsMessage::Close(frame)) => match frame {
                    Some(f) => Frame::Close(Some(u16::from(f.code)), f.reason.to_string()),
                    None => Frame::Close(None, String::new()),
                },
                // Pings are answered by tungstenite itself
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            };
            return Some(Ok(frame));
        }
    }
}
