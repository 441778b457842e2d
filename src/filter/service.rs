use crate::{
    close::CloseCode,
    frame::Frame,
    message::Message,
    pipeline::{Event, Filter, IdleStatus, NextFilter, Payload},
    session::SessionInfo,
    GatewayError, Result,
};

/// The application behind a session.
///
/// Callbacks run on the session's task, one at a time. Replies go through the [`Outbox`] and
/// are written once the callback returns; to push messages from elsewhere, keep the
/// [`SessionHandle`](crate::session::SessionHandle) found in [`SessionInfo::handle`].
///
/// Returning an error reports it to the pipeline as `ExceptionCaught`; the session stays open
/// unless the error is a protocol violation.
pub trait Service: Send {
    /// The session passed the authorization gate.
    fn session_opened(&mut self, _session: &SessionInfo, _out: &mut Outbox) -> Result<()> {
        Ok(())
    }

    /// A complete message arrived.
    fn message_received(
        &mut self,
        session: &SessionInfo,
        message: Message,
        out: &mut Outbox,
    ) -> Result<()>;

    /// The session saw no traffic for the idle timeout. It is closed right after.
    fn session_idle(
        &mut self,
        _session: &SessionInfo,
        _status: IdleStatus,
        _out: &mut Outbox,
    ) -> Result<()> {
        Ok(())
    }

    /// An error was reported on the session.
    fn exception_caught(&mut self, _session: &SessionInfo, _error: &GatewayError) {}

    /// The session is gone.
    fn session_closed(&mut self, _session: &SessionInfo) {}
}

/// Replies collected during a [`Service`] callback.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Payload>,
}

impl Outbox {
    /// Queues `message` for sending.
    pub fn send(&mut self, message: Message) {
        self.pending.push(Payload::Message(message));
    }

    /// Starts the close handshake once the queued messages are out.
    pub fn close(&mut self, code: CloseCode, reason: impl AsRef<str>) {
        self.pending.push(Payload::Frame(Frame::close(code, reason)));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn flush(self, next: &mut NextFilter<'_>) {
        for payload in self.pending {
            next.write(payload);
        }
    }
}

/// Last filter of a session: hands messages and lifecycle events to a [`Service`].
pub struct ServiceFilter<S> {
    service: S,
}

impl<S: Service> ServiceFilter<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}

impl<S: Service> Filter for ServiceFilter<S> {
    fn on_event(&mut self, event: Event, next: &mut NextFilter<'_>) -> Result<()> {
        let mut out = Outbox::default();

        let res = match event {
            Event::SessionOpened => self.service.session_opened(next.session(), &mut out),
            Event::MessageReceived(Payload::Message(message)) => {
                self.service
                    .message_received(next.session(), message, &mut out)
            }
            Event::SessionIdle(status) => {
                self.service.session_idle(next.session(), status, &mut out)
            }
            Event::ExceptionCaught(err) => {
                self.service.exception_caught(next.session(), &err);
                Ok(())
            }
            Event::SessionClosed => {
                self.service.session_closed(next.session());
                Ok(())
            }
            event => next.fire(event),
        };

        out.flush(next);
        res
    }
}
