//! Close status codes, as defined in [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
use crate::{GatewayError, ProtocolError};

/// Status code carried by a CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection closed abnormally. Never sent on the wire.
    Abnormal,
    /// 1007: a message carried data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008: a message violates the endpoint's policy.
    Policy,
    /// 1009: a message is too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension.
    Extension,
    /// 1011: the server hit an unexpected condition.
    Error,
    /// 1012: the server is restarting.
    Restart,
    /// 1013: the server is overloaded, try again later.
    Again,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// Codes reserved by the protocol (1004, 1014, 1016-2999 unassigned).
    Reserved(u16),
    /// Codes registered with IANA (3000-3999).
    Iana(u16),
    /// Codes for private use by libraries and applications (4000-4999).
    Library(u16),
    /// Anything outside the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may legitimately appear in a CLOSE frame on the wire.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Bad(_) | Self::Reserved(_) | Self::Status | Self::Abnormal | Self::Tls
        )
    }

    /// Picks the status code a session answers with when it fails with `err`.
    pub fn for_error(err: &GatewayError) -> Self {
        match err {
            GatewayError::Protocol(ProtocolError::FrameTooLarge)
            | GatewayError::Protocol(ProtocolError::MessageTooLarge) => Self::Size,
            GatewayError::Protocol(ProtocolError::InvalidOpCode(_)) => Self::Unsupported,
            GatewayError::Protocol(_) => Self::Protocol,
            GatewayError::InvalidUTF8 => Self::Invalid,
            GatewayError::Unauthorized => Self::Policy,
            _ => Self::Error,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1012 => Self::Restart,
            1013 => Self::Again,
            1015 => Self::Tls,
            1..=999 => Self::Bad(code),
            1016..=2999 | 1004 | 1014 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}
