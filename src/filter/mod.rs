//! Built-in pipeline filters.
//!
//! | filter | inbound | outbound |
//! |---|---|---|
//! | [`CodecFilter`] | bytes to frames | frames to bytes |
//! | [`FramingFilter`] | frames to messages, control frames, close handshake | messages to frames |
//! | [`ServiceFilter`] | messages to a [`Service`] | - |
//! | [`LoggingFilter`] | logs events | logs writes |
//! | [`ExceptionLoggingFilter`] | logs open, close and errors | - |
mod codec;
mod framing;
mod logging;
mod service;

pub use codec::CodecFilter;
pub use framing::FramingFilter;
pub use logging::{ExceptionLoggingFilter, LogEvents, LoggingFilter};
pub use service::{Outbox, Service, ServiceFilter};
