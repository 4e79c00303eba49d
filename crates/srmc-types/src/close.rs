use std::fmt;

/// WebSocket close codes used by the channel.
///
/// Policy and data codes tell the client to stop reconnecting; normal,
/// going-away and internal-error closures are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    GoingAway,
    TooLarge,
    InternalError,
    AuthenticationRequired,
    DecryptionFailed,
    OriginNotAllowed,
    RateExceeded,
    InsecureTransport,
    MalformedMessage,
    Forbidden,
    UnknownType,
}

/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::TooLarge => 1009,
            Self::InternalError => 1011,
            Self::AuthenticationRequired => 4001,
            Self::DecryptionFailed => 4002,
            Self::OriginNotAllowed => 4003,
            Self::RateExceeded => 4008,
            Self::InsecureTransport => 4026,
            Self::MalformedMessage => 4400,
            Self::Forbidden => 4403,
            Self::UnknownType => 4404,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        let code = match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1009 => Self::TooLarge,
            1011 => Self::InternalError,
            4001 => Self::AuthenticationRequired,
            4002 => Self::DecryptionFailed,
            4003 => Self::OriginNotAllowed,
            4008 => Self::RateExceeded,
            4026 => Self::InsecureTransport,
            4400 => Self::MalformedMessage,
            4403 => Self::Forbidden,
            4404 => Self::UnknownType,
            _ => return None,
        };
        Some(code)
    }

    /// Origin, authentication, transport and abuse violations.
    pub fn is_policy(self) -> bool {
        matches!(
            self,
            Self::AuthenticationRequired
                | Self::OriginNotAllowed
                | Self::RateExceeded
                | Self::InsecureTransport
                | Self::Forbidden
        )
    }

    /// Frames the server could not accept: oversized, undecryptable or malformed.
    pub fn is_data_error(self) -> bool {
        matches!(
            self,
            Self::TooLarge | Self::DecryptionFailed | Self::MalformedMessage | Self::UnknownType
        )
    }

    /// Whether a client may reconnect after the server closed with this code.
    pub fn is_retryable(self) -> bool {
        !(self.is_policy() || self.is_data_error())
    }

    /// Short machine-readable reason sent along with the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "server going away",
            Self::TooLarge => "frame too large",
            Self::InternalError => "internal error",
            Self::AuthenticationRequired => "authentication required",
            Self::DecryptionFailed => "decryption failed",
            Self::OriginNotAllowed => "origin not allowed",
            Self::RateExceeded => "rate exceeded",
            Self::InsecureTransport => "encrypted transport required",
            Self::MalformedMessage => "malformed message",
            Self::Forbidden => "forbidden",
            Self::UnknownType => "unknown message type",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CloseCode; 12] = [
        CloseCode::Normal,
        CloseCode::GoingAway,
        CloseCode::TooLarge,
        CloseCode::InternalError,
        CloseCode::AuthenticationRequired,
        CloseCode::DecryptionFailed,
        CloseCode::OriginNotAllowed,
        CloseCode::RateExceeded,
        CloseCode::InsecureTransport,
        CloseCode::MalformedMessage,
        CloseCode::Forbidden,
        CloseCode::UnknownType,
    ];

    #[test]
    fn codes_are_distinct_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.as_u16()), "duplicate code {}", code);
            assert_eq!(CloseCode::from_u16(code.as_u16()), Some(code));
        }
        assert_eq!(CloseCode::from_u16(ABNORMAL_CLOSURE), None);
    }

    #[test]
    fn internal_error_is_not_a_ban() {
        assert!(CloseCode::InternalError.is_retryable());
        assert!(CloseCode::GoingAway.is_retryable());
        assert!(!CloseCode::RateExceeded.is_retryable());
        assert!(!CloseCode::OriginNotAllowed.is_retryable());
        assert!(!CloseCode::MalformedMessage.is_retryable());
    }
}
