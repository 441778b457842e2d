//! Fragment reassembly.
//!
//! A [`Reassembler`] consumes decoded frames in wire order and yields complete
//! [`Message`]s. It is a three state machine:
//!
//! ```text
//!   IDLE --(data, fin=0)--> ACCUMULATING --(continuation, fin=1)--> IDLE
//!     |                          |
//!     +----(violation)-----------+----(violation)----> ERROR (terminal)
//! ```
//!
//! Control frames are handed back untouched in every live state so they can be processed
//! immediately, and never disturb a message being accumulated.
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::{
    frame::{Frame, OpCode},
    message::{Message, MessageKind},
    ProtocolError,
};

/// Observable state of a [`Reassembler`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReassemblyState {
    Idle,
    Accumulating,
    Error,
}

/// Outcome of pushing one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Reassembled {
    /// A complete message is ready.
    Message(Message),
    /// A control frame that must be handled right away.
    Control(Frame),
    /// The frame was buffered as part of an unfinished message.
    Pending,
}

/// Header of the message currently being accumulated.
struct Fragment {
    started: Instant,
    kind: MessageKind,
    frames: usize,
}

enum State {
    Idle,
    Accumulating(Fragment),
    Error,
}

/// Reassembles fragmented messages from a sequence of frames.
pub struct Reassembler {
    state: State,
    /// Accumulated data from fragmented frames.
    accumulated: BytesMut,
    /// Largest message the reassembler accepts, in bytes.
    max_message_size: usize,
    /// Maximum time allowed to receive all fragments of a message.
    fragment_timeout: Option<Duration>,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: State::Idle,
            accumulated: BytesMut::with_capacity(1024),
            max_message_size,
            fragment_timeout: None,
        }
    }

    /// Fails a fragmented message whose fragments take longer than `timeout` to arrive.
    pub fn with_fragment_timeout(mut self, timeout: Duration) -> Self {
        self.fragment_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> ReassemblyState {
        match self.state {
            State::Idle => ReassemblyState::Idle,
            State::Accumulating(_) => ReassemblyState::Accumulating,
            State::Error => ReassemblyState::Error,
        }
    }

    /// Feeds the next frame.
    ///
    /// Any violation moves the reassembler to the terminal error state; every later call
    /// fails with [`ProtocolError::Terminated`].
    pub fn push(&mut self, frame: Frame) -> Result<Reassembled, ProtocolError> {
        match self.on_frame(frame) {
            Ok(out) => Ok(out),
            Err(err) => {
                self.state = State::Error;
                self.accumulated.clear();
                Err(err)
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Reassembled, ProtocolError> {
        if matches!(self.state, State::Error) {
            return Err(ProtocolError::Terminated);
        }

        match frame.opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                // the codec already refuses fragmented control frames
                if !frame.fin {
                    return Err(ProtocolError::ControlFrameFragmented);
                }
                Ok(Reassembled::Control(frame))
            }
            OpCode::Text | OpCode::Binary => {
                if matches!(self.state, State::Accumulating(_)) {
                    return Err(ProtocolError::InvalidFragment);
                }

                let kind = match frame.opcode {
                    OpCode::Text => MessageKind::Text,
                    _ => MessageKind::Binary,
                };
                if frame.payload.len() > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge);
                }

                if frame.fin {
                    return Ok(Reassembled::Message(Message::new(kind, frame.payload)));
                }

                self.accumulated.extend_from_slice(&frame.payload);
                self.state = State::Accumulating(Fragment {
                    started: Instant::now(),
                    kind,
                    frames: 1,
                });

                Ok(Reassembled::Pending)
            }
            OpCode::Continuation => {
                let fragment = match &mut self.state {
                    State::Accumulating(fragment) => fragment,
                    _ => return Err(ProtocolError::InvalidContinuation),
                };

                if self
                    .fragment_timeout
                    .is_some_and(|timeout| fragment.started.elapsed() > timeout)
                {
                    return Err(ProtocolError::FragmentTimeout);
                }
                if self.accumulated.len() + frame.payload.len() > self.max_message_size {
                    return Err(ProtocolError::MessageTooLarge);
                }

                self.accumulated.extend_from_slice(&frame.payload);
                fragment.frames += 1;

                if !frame.fin {
                    return Ok(Reassembled::Pending);
                }

                let kind = fragment.kind;
                let frames = fragment.frames;
                self.state = State::Idle;

                // hand the buffer over and start a fresh one so a huge message does not pin memory
                let payload = std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
                let mut message = Message::new(kind, payload.freeze());
                message.frame_count = frames;

                Ok(Reassembled::Message(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(out: Reassembled) -> Message {
        match out {
            Reassembled::Message(message) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_single_frame_message() {
        let mut reassembler = Reassembler::new(1024);
        let msg = message(reassembler.push(Frame::text("hi")).unwrap());

        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.payload, Bytes::from("hi"));
        assert_eq!(msg.frame_count, 1);
        assert_eq!(reassembler.state(), ReassemblyState::Idle);
    }

    #[test]
    fn test_three_fragments() {
        let mut reassembler = Reassembler::new(1024);

        let out = reassembler.push(Frame::text("Hel").with_fin(false)).unwrap();
        assert_eq!(out, Reassembled::Pending);
        assert_eq!(reassembler.state(), ReassemblyState::Accumulating);

        let out = reassembler
            .push(Frame::continuation("lo, ").with_fin(false))
            .unwrap();
        assert_eq!(out, Reassembled::Pending);

        let msg = message(reassembler.push(Frame::continuation("world")).unwrap());
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.payload, Bytes::from("Hello, world"));
        assert_eq!(msg.frame_count, 3);
        assert_eq!(reassembler.state(), ReassemblyState::Idle);
    }

    #[test]
    fn test_control_frames_interleave() {
        let mut reassembler = Reassembler::new(1024);

        reassembler
            .push(Frame::binary(vec![1, 2]).with_fin(false))
            .unwrap();

        let out = reassembler.push(Frame::ping("are you there")).unwrap();
        assert_eq!(out, Reassembled::Control(Frame::ping("are you there")));
        assert_eq!(reassembler.state(), ReassemblyState::Accumulating);

        let msg = message(reassembler.push(Frame::continuation(vec![3, 4])).unwrap());
        assert_eq!(msg.kind, MessageKind::Binary);
        assert_eq!(msg.payload, Bytes::from(vec![1, 2, 3, 4]));
        assert_eq!(msg.frame_count, 2);
    }

    #[test]
    fn test_new_data_frame_while_accumulating() {
        let mut reassembler = Reassembler::new(1024);
        reassembler.push(Frame::text("a").with_fin(false)).unwrap();

        let err = reassembler.push(Frame::binary("b")).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFragment);
        assert_eq!(reassembler.state(), ReassemblyState::Error);
    }

    #[test]
    fn test_continuation_without_start() {
        let mut reassembler = Reassembler::new(1024);
        let err = reassembler.push(Frame::continuation("x")).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidContinuation);
    }

    #[test]
    fn test_error_state_is_terminal() {
        let mut reassembler = Reassembler::new(1024);
        reassembler.push(Frame::continuation("x")).unwrap_err();

        assert_eq!(
            reassembler.push(Frame::text("fine")).unwrap_err(),
            ProtocolError::Terminated
        );
        assert_eq!(
            reassembler.push(Frame::ping("")).unwrap_err(),
            ProtocolError::Terminated
        );
    }

    #[test]
    fn test_message_size_limit() {
        let mut reassembler = Reassembler::new(4);
        reassembler
            .push(Frame::binary(vec![0; 3]).with_fin(false))
            .unwrap();

        let err = reassembler.push(Frame::continuation(vec![0; 2])).unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooLarge);
    }

    #[test]
    fn test_fragment_timeout() {
        let mut reassembler = Reassembler::new(1024).with_fragment_timeout(Duration::ZERO);
        reassembler.push(Frame::text("a").with_fin(false)).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let err = reassembler.push(Frame::continuation("b")).unwrap_err();
        assert_eq!(err, ProtocolError::FragmentTimeout);
    }
}
