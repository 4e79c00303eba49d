use srmc_types::CloseCode;

/// Whether the agent will keep trying after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("send queue full")]
    QueueFull,

    #[error("client closed")]
    Closed,

    /// The upgrade request was answered with an HTTP error status.
    #[error("handshake rejected with HTTP {0}")]
    Rejected(u16),

    #[error("closed by server ({code}): {reason}")]
    ClosedByServer { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("gave up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClientError> },
}

impl ClientError {
    /// Policy and data rejections mean reconnecting with the same
    /// credentials would fail again.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Rejected(status) => matches!(status, 400 | 401 | 403 | 426),
            Self::ClosedByServer { code, .. } => {
                CloseCode::from_u16(*code).is_some_and(|c| !c.is_retryable())
            }
            Self::Closed | Self::RetriesExhausted { .. } => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_terminal() {
            ErrorKind::Terminal
        } else {
            ErrorKind::Retryable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srmc_types::close::ABNORMAL_CLOSURE;

    fn closed(code: u16) -> ClientError {
        ClientError::ClosedByServer {
            code,
            reason: String::new(),
        }
    }

    #[test]
    fn policy_closes_are_terminal() {
        for code in [4001, 4002, 4003, 4008, 4026, 4400, 4403, 4404] {
            assert_eq!(closed(code).kind(), ErrorKind::Terminal, "code {}", code);
        }
    }

    #[test]
    fn transient_closes_are_retryable() {
        for code in [1000, 1001, 1011, ABNORMAL_CLOSURE, 1005] {
            assert_eq!(closed(code).kind(), ErrorKind::Retryable, "code {}", code);
        }
        assert_eq!(ClientError::Transport("reset".into()).kind(), ErrorKind::Retryable);
    }

    #[test]
    fn handshake_statuses() {
        assert!(ClientError::Rejected(401).is_terminal());
        assert!(ClientError::Rejected(403).is_terminal());
        assert!(ClientError::Rejected(426).is_terminal());
        assert!(!ClientError::Rejected(503).is_terminal());
    }
}
