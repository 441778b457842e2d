//! # Pipeline
//!
//! Every session runs its traffic through an ordered chain of named [`Filter`]s. Inbound
//! [`Event`]s enter at the first filter and travel towards the last one; outbound writes enter
//! at the last filter and travel back towards the first, ending up as bytes in the session's
//! outbound buffer.
//!
//! ```text
//!            inbound (on_event)                       outbound (filter_write)
//!   bytes --> [exceptions] --> [ws#codec] --> [ws#framing] --> [service]
//!   bytes <-- [exceptions] <-- [ws#codec] <-- [ws#framing] <-- [service]
//! ```
//!
//! A filter decides what reaches the rest of the chain: it forwards an event with
//! [`NextFilter::fire`], transforms it first, or vetoes it by simply not forwarding it.
//!
//! Errors never escape the pipeline. An `Err` returned while dispatching is turned into
//! [`Event::ExceptionCaught`] and dispatched again from the first filter; an error raised while
//! dispatching `ExceptionCaught` itself is logged and dropped.
//!
//! Writes issued while an inbound event is being dispatched are queued and run, in submission
//! order, once that dispatch returns, so a filter never re-enters the chain below itself.
use std::{collections::VecDeque, fmt};

use bytes::Bytes;

use crate::{
    frame::Frame,
    message::Message,
    session::{SessionInfo, SessionState, SessionStatus},
    GatewayError, Result,
};

/// The unit travelling through the pipeline.
///
/// Each filter converts between the variants it understands: the codec filter turns
/// [`Payload::Raw`] into [`Payload::Frame`] and back, the framing filter turns frames into
/// [`Payload::Message`] and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Frame(Frame),
    Message(Message),
}

impl Payload {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(bytes) => bytes.len(),
            Self::Frame(frame) => frame.payload.len(),
            Self::Message(message) => message.payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) => write!(f, "RAW ({} bytes)", bytes.len()),
            Self::Frame(frame) => write!(
                f,
                "{:?} fin={} ({} bytes)",
                frame.opcode,
                frame.fin,
                frame.payload.len()
            ),
            Self::Message(message) => write!(
                f,
                "{:?} message ({} bytes)",
                message.kind,
                message.payload.len()
            ),
        }
    }
}

/// Why a session was reported idle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdleStatus {
    /// Nothing was read for the idle timeout.
    Reader,
    /// Nothing was written for the idle timeout.
    Writer,
    /// Neither reads nor writes happened for the idle timeout.
    Both,
}

/// Lifecycle and data events dispatched through a session's pipeline.
#[derive(Debug)]
pub enum Event {
    /// The session exists but the handshake has not been authorized yet.
    SessionCreated,
    /// The session passed the authorization gate and may exchange messages.
    SessionOpened,
    /// Data arrived, in whatever shape the previous filter produced.
    MessageReceived(Payload),
    /// A message was fully handed over to the transport.
    MessageSent(Message),
    /// An error occurred somewhere in the session.
    ExceptionCaught(GatewayError),
    /// The session saw no traffic for the idle timeout.
    SessionIdle(IdleStatus),
    /// The session is gone; fired exactly once.
    SessionClosed,
}

impl Event {
    /// Short name of the event, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated => "CREATED",
            Self::SessionOpened => "OPENED",
            Self::MessageReceived(_) => "RECEIVED",
            Self::MessageSent(_) => "SENT",
            Self::ExceptionCaught(_) => "EXCEPTION",
            Self::SessionIdle(_) => "IDLE",
            Self::SessionClosed => "CLOSED",
        }
    }
}

/// A stage of the pipeline.
///
/// Both methods forward by default, so a filter only overrides the direction it cares about.
pub trait Filter: Send {
    /// Handles an inbound event. Call [`NextFilter::fire`] to pass it on.
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        next.fire(event)
    }

    /// Handles an outbound write. Call [`NextWrite::write`] to pass it on.
    fn filter_write(&mut self, payload: Payload, next: &mut NextWrite<'_>) -> Result<()> {
        next.write(payload)
    }
}

struct Stage {
    name: String,
    filter: Box<dyn Filter>,
}

/// Continuation handed to [`Filter::on_event`]: the filters after the current one.
pub struct NextFilter<'a> {
    rest: &'a mut [Stage],
    state: &'a mut SessionState,
    index: usize,
}

impl NextFilter<'_> {
    /// Passes `event` to the next filter.
    pub fn fire(&mut self, event: Event) -> Result<()> {
        dispatch(self.rest, self.state, self.index + 1, event)
    }

    /// Queues `payload` to be written through the filters before the current one.
    ///
    /// The write runs after the current inbound dispatch returns.
    pub fn write(&mut self, payload: Payload) {
        self.state.queued.push_back((self.index, payload));
    }

    pub fn session(&self) -> &SessionInfo {
        &self.state.info
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        self.state
    }
}

/// Continuation handed to [`Filter::filter_write`]: the filters before the current one.
pub struct NextWrite<'a> {
    below: &'a mut [Stage],
    state: &'a mut SessionState,
}

impl NextWrite<'_> {
    /// Passes `payload` to the previous filter, or to the transport buffer when the current
    /// filter is the first one.
    pub fn write(&mut self, payload: Payload) -> Result<()> {
        write_down(self.below, self.state, payload)
    }

    pub fn session(&self) -> &SessionInfo {
        &self.state.info
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub(crate) fn state_mut(&mut self) -> &mut SessionState {
        self.state
    }
}

fn dispatch(stages: &mut [Stage], state: &mut SessionState, index: usize, event: Event) -> Result<()> {
    match stages.split_first_mut() {
        Some((stage, rest)) => {
            let mut next = NextFilter { rest, state, index };
            stage.filter.on_event(event, &mut next)
        }
        // the tail of the chain swallows whatever reaches it
        None => Ok(()),
    }
}

fn write_down(stages: &mut [Stage], state: &mut SessionState, payload: Payload) -> Result<()> {
    match stages.split_last_mut() {
        Some((stage, below)) => {
            let mut next = NextWrite { below, state };
            stage.filter.filter_write(payload, &mut next)
        }
        None => state.transmit(payload),
    }
}

/// The ordered, uniquely named chain of filters of one session.
///
/// Mutating the chain takes `&mut self`, so it can never overlap a dispatch.
#[derive(Default)]
pub struct FilterPipeline {
    stages: Vec<Stage>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Filter names, first to last.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Inserts a filter at the head of the chain.
    pub fn add_first(&mut self, name: impl Into<String>, filter: impl Filter + 'static) -> Result<()> {
        self.insert(0, name.into(), Box::new(filter))
    }

    /// Appends a filter at the tail of the chain.
    pub fn add_last(&mut self, name: impl Into<String>, filter: impl Filter + 'static) -> Result<()> {
        self.insert(self.stages.len(), name.into(), Box::new(filter))
    }

    /// Inserts a filter right before `base`.
    pub fn add_before(
        &mut self,
        base: &str,
        name: impl Into<String>,
        filter: impl Filter + 'static,
    ) -> Result<()> {
        let at = self
            .position(base)
            .ok_or_else(|| GatewayError::UnknownFilter(base.to_string()))?;
        self.insert(at, name.into(), Box::new(filter))
    }

    /// Inserts a filter right after `base`.
    pub fn add_after(
        &mut self,
        base: &str,
        name: impl Into<String>,
        filter: impl Filter + 'static,
    ) -> Result<()> {
        let at = self
            .position(base)
            .ok_or_else(|| GatewayError::UnknownFilter(base.to_string()))?;
        self.insert(at + 1, name.into(), Box::new(filter))
    }

    /// Removes the filter called `name` and hands it back.
    pub fn remove(&mut self, name: &str) -> Result<Box<dyn Filter>> {
        let at = self
            .position(name)
            .ok_or_else(|| GatewayError::UnknownFilter(name.to_string()))?;
        Ok(self.stages.remove(at).filter)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name == name)
    }

    fn insert(&mut self, at: usize, name: String, filter: Box<dyn Filter>) -> Result<()> {
        if self.contains(&name) {
            return Err(GatewayError::DuplicateFilter(name));
        }
        self.stages.insert(at, Stage { name, filter });
        Ok(())
    }

    /// Dispatches an inbound event from the first filter, then runs the writes it queued.
    pub(crate) fn fire(&mut self, state: &mut SessionState, event: Event) {
        let in_exception = matches!(event, Event::ExceptionCaught(_));
        if let Err(err) = dispatch(&mut self.stages, state, 0, event) {
            self.caught(state, err, in_exception);
        }
        self.flush(state);
    }

    /// Writes `payload` through the whole chain, last filter first.
    pub(crate) fn write(&mut self, state: &mut SessionState, payload: Payload) {
        state.queued.push_back((self.stages.len(), payload));
        self.flush(state);
    }

    fn caught(&mut self, state: &mut SessionState, err: GatewayError, in_exception: bool) {
        if in_exception {
            log::warn!("session {}: error while handling an exception: {}", state.info.id(), err);
            return;
        }

        if let Err(err) = dispatch(&mut self.stages, state, 0, Event::ExceptionCaught(err)) {
            log::warn!("session {}: error while handling an exception: {}", state.info.id(), err);
        }
    }

    fn flush(&mut self, state: &mut SessionState) {
        while let Some((origin, payload)) = state.queued.pop_front() {
            let origin = origin.min(self.stages.len());
            if let Err(err) = write_down(&mut self.stages[..origin], state, payload) {
                self.caught(state, err, false);
            }
        }
    }
}

impl fmt::Debug for FilterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Writes queued during inbound dispatch, tagged with the index of the filter that issued them.
pub(crate) type WriteQueue = VecDeque<(usize, Payload)>;
