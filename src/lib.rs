//! # wsgate
//! A WebSocket protocol gateway core: it resolves logical endpoint URIs into nested transport
//! stacks, terminates RFC 6455 (and draft hybi) WebSocket connections over TCP or TLS, and runs
//! every connection through a per-session pipeline of filters that turns bytes into frames and
//! frames into application messages.
//!
//! The crate is organised in layers:
//!
//! - [`address`]: the scheme registry, [`ResourceFactory`](address::ResourceFactory) rewrites and
//!   the immutable, nested [`ResourceAddress`](address::ResourceAddress).
//! - [`frame`], [`codec`], [`close`]: the RFC 6455 wire model and the frame codec.
//! - [`reassembly`], [`message`]: fragment reassembly into typed messages.
//! - [`pipeline`], [`filter`], [`session`]: the sans-io session and its filter chain.
//! - the tokio runtime: [`Gateway::bind`] / [`Gateway::connect`], the HTTP upgrade and the
//!   per-session driver loop.
//!
//! # Server Example
//! ```no_run
//! use wsgate::{Gateway, Message, Options, Outbox, Service, SessionInfo};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn message_received(
//!         &mut self,
//!         _session: &SessionInfo,
//!         message: Message,
//!         out: &mut Outbox,
//!     ) -> wsgate::Result<()> {
//!         out.send(message);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> wsgate::Result<()> {
//!     let gateway = Gateway::new(Options::default());
//!     let listener = gateway.bind("ws://127.0.0.1:8080/echo", || Echo).await?;
//!     listener.await?;
//!     Ok(())
//! }
//! ```
//!
//! # Address Example
//! ```rust
//! use wsgate::address::ResourceAddressFactory;
//!
//! let factory = ResourceAddressFactory::default();
//! let address = factory.resolve("wss://example.com:9000/path").unwrap();
//!
//! assert_eq!(address.protocol_name(), "ws/rfc6455");
//! let ssl = address.inner().unwrap();
//! assert_eq!(ssl.scheme(), "ssl");
//! assert_eq!(ssl.authority(), "example.com:9000");
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod address;
pub mod auth;
pub mod close;
pub mod codec;
pub mod filter;
pub mod frame;
mod mask;
pub mod message;
mod native;
pub mod pipeline;
pub mod reassembly;
pub mod session;
mod stream;

use thiserror::Error;

pub use native::*;

pub use address::{Protocol, ResourceAddress, ResourceAddressFactory};
pub use auth::{AllowAll, Authorizer, PrincipalRoles, RequireRole};
pub use close::CloseCode;
pub use filter::{Outbox, Service};
pub use frame::{Frame, OpCode};
pub use message::{Message, MessageKind};
pub use pipeline::{Event, Filter, FilterPipeline, IdleStatus, Payload};
pub use session::{Session, SessionHandle, SessionId, SessionInfo, SessionStats, SessionStatus};

/// A result type for gateway operations, using [`GatewayError`] as the error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The role a session plays on the wire.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked. Each role also rejects
/// incoming frames whose masking does not match the peer's role.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accept side of a connection.
    Server,
    /// Connect side of a connection.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Violations of the framing protocol.
///
/// Every variant is fatal to the session that produced it: the session answers with a
/// CLOSE frame carrying the matching [`CloseCode`] and is torn down. Other sessions are
/// never affected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Reserved bits in the frame header are set while no extension was negotiated.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The opcode nibble holds one of the reserved values (0x3-0x7, 0xB-0xF).
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame (close, ping or pong) arrived with the FIN bit unset.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame carried more than 125 bytes of payload.
    #[error("Control frame too large ({0} bytes)")]
    ControlFrameTooLarge(u64),

    /// The 64-bit extended payload length had its most significant bit set.
    #[error("Payload length overflows 63 bits")]
    LengthOverflow,

    /// A server received a frame without a masking key.
    #[error("Frame from client is not masked")]
    UnmaskedFrame,

    /// A client received a frame carrying a masking key.
    #[error("Frame from server is masked")]
    MaskedFrame,

    /// A continuation frame arrived while no fragmented message was in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuation,

    /// A new text or binary frame arrived before the previous fragmented message completed.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// A single frame's payload exceeds the configured read limit.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A reassembled message exceeds the configured message size limit.
    #[error("Message too large")]
    MessageTooLarge,

    /// The fragments of one message did not arrive within the fragment timeout.
    #[error("Fragmented message timed out")]
    FragmentTimeout,

    /// A close frame carried a one byte payload.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that may not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// The reassembler already failed; no further frames are processed.
    #[error("Reassembler terminated after a protocol error")]
    Terminated,
}

/// Represents errors that can occur while resolving addresses or running sessions.
///
/// The errors fall into three groups:
///
/// - Resolution errors ([`GatewayError::UnsupportedScheme`], [`GatewayError::InvalidAddress`]),
///   surfaced synchronously to whoever asked for the address.
/// - Session errors ([`GatewayError::Protocol`], [`GatewayError::InvalidUTF8`],
///   [`GatewayError::Io`], ...), funneled through the `ExceptionCaught` pipeline event.
/// - Handshake and runtime errors raised by the acceptor and connector.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No resolution strategy is registered for the scheme.
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The location could not be turned into an address (bad URI, missing host or port).
    #[error("Invalid address {location}: {reason}")]
    InvalidAddress {
        location: String,
        reason: &'static str,
    },

    /// The peer violated the framing protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A text message or close reason is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Returned when attempting to use a session that is already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The authorization gate refused to open the session.
    #[error("Session is not authorized to open")]
    Unauthorized,

    /// The peer did not answer our CLOSE frame within the close timeout.
    #[error("Close handshake timed out")]
    CloseTimeout,

    /// A payload reached the bottom of the pipeline before being encoded to bytes.
    #[error("Payload reached the transport without being encoded")]
    UnencodedPayload,

    /// A filter with the same name is already installed in the pipeline.
    #[error("Duplicate filter name: {0}")]
    DuplicateFilter(String),

    /// No filter with the given name is installed in the pipeline.
    #[error("Unknown filter: {0}")]
    UnknownFilter(String),

    /// The address stack contains an `ssl` layer but no TLS acceptor was configured.
    #[error("No TLS acceptor configured for {0}")]
    MissingTlsAcceptor(String),

    /// The address cannot be bound or connected with the WebSocket runtime.
    #[error("Address {0} is not a WebSocket address")]
    NotWebSocket(String),

    /// Returned when receiving an HTTP status code other than 101 during the handshake.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The HTTP "Upgrade" header is missing or not "websocket".
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The HTTP "Connection" header is missing or does not contain "upgrade".
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The "Sec-WebSocket-Key" header is missing from the client request.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The "Sec-WebSocket-Version" header is not accepted by the negotiated protocol.
    #[error("Unsupported Sec-WebSocket-Version")]
    InvalidSecWebsocketVersion,

    /// The server answered with a "Sec-WebSocket-Accept" that does not match our key.
    #[error("Invalid Sec-WebSocket-Accept")]
    InvalidSecWebsocketAccept,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps errors surfaced by the underlying byte stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps errors from hyper during the upgrade handshake.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),

    /// The upgrade request could not be built from the address.
    #[error(transparent)]
    HttpRequest(#[from] hyper::http::Error),

    /// Wraps errors from rustls while configuring TLS.
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),
}

impl GatewayError {
    /// Whether this error is a framing protocol violation by the peer.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::InvalidUTF8)
    }

    /// Whether this error originates from the transport below the framing layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
