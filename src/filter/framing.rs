use std::time::Duration;

use bytes::Bytes;

use crate::{
    close::CloseCode,
    frame::{Frame, OpCode},
    message::Message,
    pipeline::{Event, Filter, NextFilter, NextWrite, Payload},
    reassembly::{Reassembled, Reassembler},
    session::SessionStatus,
    GatewayError, Options, ProtocolError, Result,
};

/// Turns frames into messages and messages into frames, and runs the control protocol.
///
/// Inbound, data frames are reassembled into [`Message`]s; pings are answered with pongs;
/// a CLOSE from the peer is validated and echoed unless we already sent one. Outbound,
/// messages are cut into frames of at most `fragment_size` bytes when a size is set.
///
/// When a protocol violation is reported through `ExceptionCaught`, the filter answers with a
/// CLOSE carrying the matching status code and marks the session for teardown.
pub struct FramingFilter {
    reassembler: Reassembler,
    fragment_size: Option<usize>,
    check_utf8: bool,
}

impl FramingFilter {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            reassembler: Reassembler::new(max_message_size),
            fragment_size: None,
            check_utf8: true,
        }
    }

    pub(crate) fn from_options(options: &Options) -> Self {
        let mut filter = Self::new(options.max_message_size());
        if let Some(timeout) = options.fragment_timeout {
            filter = filter.with_fragment_timeout(timeout);
        }
        filter.fragment_size = options.fragment_size.map(|size| size.max(1));
        filter.check_utf8 = options.check_utf8;
        filter
    }

    /// Splits outgoing messages into frames carrying at most `size` bytes.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = Some(size.max(1));
        self
    }

    /// Fails fragmented messages that take longer than `timeout` to complete.
    pub fn with_fragment_timeout(mut self, timeout: Duration) -> Self {
        self.reassembler = self.reassembler.with_fragment_timeout(timeout);
        self
    }

    /// Enables or disables UTF-8 validation of text messages.
    pub fn with_utf8(mut self, check_utf8: bool) -> Self {
        self.check_utf8 = check_utf8;
        self
    }

    fn on_frame(&mut self, frame: Frame, next: &mut NextFilter<'_>) -> Result<()> {
        // nothing but our own echo is expected after the peer's CLOSE
        if next.state_mut().close_received {
            return Ok(());
        }

        match self.reassembler.push(frame)? {
            Reassembled::Pending => Ok(()),
            Reassembled::Message(message) => {
                if self.check_utf8 && message.is_text() && message.as_str().is_err() {
                    return Err(GatewayError::InvalidUTF8);
                }
                next.state_mut().stats.messages_received += 1;
                next.fire(Event::MessageReceived(Payload::Message(message)))
            }
            Reassembled::Control(frame) => self.on_control(frame, next),
        }
    }

    fn on_control(&mut self, frame: Frame, next: &mut NextFilter<'_>) -> Result<()> {
        match frame.opcode {
            OpCode::Ping => {
                if !next.state_mut().close_sent {
                    next.write(Payload::Frame(Frame::pong(frame.payload)));
                }
                Ok(())
            }
            OpCode::Pong => {
                log::trace!("session {}: pong ({} bytes)", next.session().id(), frame.payload.len());
                Ok(())
            }
            OpCode::Close => {
                let code = validate_close(&frame)?;
                log::debug!(
                    "session {}: peer closed with {:?}",
                    next.session().id(),
                    code
                );

                let state = next.state_mut();
                state.mark_close_received();
                if !state.close_sent {
                    state.mark_close_sent();
                    // echo the status code, or nothing when the peer sent none
                    let echo = frame.payload.slice(..frame.payload.len().min(2));
                    next.write(Payload::Frame(Frame::close_raw(echo)));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_exception(&mut self, err: &GatewayError, next: &mut NextFilter<'_>) {
        if !err.is_protocol_violation() {
            return;
        }

        let state = next.state_mut();
        state.fatal = true;
        if state.close_sent || state.status == SessionStatus::Closed {
            return;
        }

        state.mark_close_sent();
        next.write(Payload::Frame(Frame::close(
            CloseCode::for_error(err),
            err.to_string(),
        )));
    }

    fn write_message(&mut self, message: Message, next: &mut NextWrite<'_>) -> Result<()> {
        if next.state_mut().close_sent {
            return Err(GatewayError::ConnectionClosed);
        }

        let opcode = message.kind.opcode();
        match self.fragment_size {
            Some(size) if message.payload.len() > size => {
                let mut chunks = chunks(&message.payload, size).peekable();
                let mut first = true;
                while let Some(chunk) = chunks.next() {
                    let opcode = if first { opcode } else { OpCode::Continuation };
                    let fin = chunks.peek().is_none();
                    next.write(Payload::Frame(Frame::new(fin, opcode, None, chunk)))?;
                    first = false;
                }
            }
            _ => {
                next.write(Payload::Frame(Frame::new(
                    true,
                    opcode,
                    None,
                    message.payload.clone(),
                )))?;
            }
        }

        next.state_mut().written.push(message);
        Ok(())
    }
}

impl Filter for FramingFilter {
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        match event {
            Event::MessageReceived(Payload::Frame(frame)) => self.on_frame(frame, next),
            Event::ExceptionCaught(err) => {
                self.on_exception(&err, next);
                next.fire(Event::ExceptionCaught(err))
            }
            event => next.fire(event),
        }
    }

    fn filter_write(&mut self, payload: Payload, next: &mut NextWrite<'_>) -> Result<()> {
        let close_sent = next.state_mut().close_sent;
        match payload {
            Payload::Message(message) => self.write_message(message, next),
            Payload::Frame(frame) if frame.opcode == OpCode::Close => {
                if close_sent {
                    return Ok(());
                }
                next.state_mut().mark_close_sent();
                next.write(Payload::Frame(frame))
            }
            Payload::Frame(frame) if close_sent && !frame.opcode.is_control() => {
                Err(GatewayError::ConnectionClosed)
            }
            payload => next.write(payload),
        }
    }
}

/// Checks a received CLOSE payload and returns its status code, if any.
fn validate_close(frame: &Frame) -> Result<Option<CloseCode>> {
    match frame.payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::InvalidCloseFrame.into()),
        _ => {
            let code = frame.close_code().ok_or(ProtocolError::InvalidCloseFrame)?;
            if !code.is_allowed() {
                return Err(ProtocolError::InvalidCloseCode.into());
            }
            frame.close_reason()?;
            Ok(Some(code))
        }
    }
}

/// Splits `payload` into zero-copy chunks of at most `size` bytes.
fn chunks(payload: &Bytes, size: usize) -> impl Iterator<Item = Bytes> + '_ {
    (0..payload.len())
        .step_by(size)
        .map(move |start| payload.slice(start..(start + size).min(payload.len())))
}
