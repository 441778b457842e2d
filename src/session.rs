//! # Session
//!
//! A [`Session`] is one WebSocket connection seen without any I/O: bytes go in through
//! [`Session::receive`], bytes to send come out of [`Session::take_outbound`], and every step in
//! between runs through the session's [`FilterPipeline`]. The tokio driver in the runtime module
//! feeds a session from a socket, but a session can just as well be driven by hand, which is how
//! most of the tests below exercise it.
//!
//! ## Lifecycle
//!
//! ```text
//! CREATED --open()--> OPEN --CLOSE sent or received--> CLOSING --both seen / timeout--> CLOSED
//!    |                  |                                                                 ^
//!    +--unauthorized----+------------------transport error or abort-----------------------+
//! ```
//!
//! `SessionClosed` is fired exactly once, and nothing received after that point is dispatched.
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::{
    address::ResourceAddress,
    auth::Authorizer,
    close::CloseCode,
    filter::{
        CodecFilter, ExceptionLoggingFilter, FramingFilter, LoggingFilter, Service, ServiceFilter,
    },
    frame::Frame,
    message::Message,
    pipeline::{Event, FilterPipeline, IdleStatus, Payload, WriteQueue},
    GatewayError, Options, Result, Role,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique session identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Open,
    Closing,
    Closed,
}

/// Traffic counters of a session.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Requests a [`SessionHandle`] delivers to the task driving the session.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Message),
    Close(CloseCode, String),
}

/// Pushes messages into a session from outside its pipeline, e.g. from another task.
///
/// Cheap to clone. Every method fails with [`GatewayError::ConnectionClosed`] once the session
/// is gone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues `message` for sending.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Command::Send(message))
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Starts the close handshake.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        self.tx
            .send(Command::Close(code, reason.into()))
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read-only description of a session, handed to filters and services.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    id: SessionId,
    role: Role,
    local: Arc<ResourceAddress>,
    remote: Option<SocketAddr>,
    principal: Option<String>,
    handle: Option<SessionHandle>,
}

impl SessionInfo {
    /// Describes a new session on `local`, with a fresh id.
    pub fn new(role: Role, local: Arc<ResourceAddress>) -> Self {
        Self {
            id: SessionId::next(),
            role,
            local,
            remote: None,
            principal: None,
            handle: None,
        }
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub(crate) fn with_handle(mut self, handle: SessionHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The resolved address this session runs on.
    pub fn local(&self) -> &Arc<ResourceAddress> {
        &self.local
    }

    /// The peer's socket address, when the session runs over a socket.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// The authenticated principal, once the session is open.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// A handle for pushing messages into the session from elsewhere.
    ///
    /// Only sessions driven by the runtime have one.
    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.id, self.role, self.local)?;
        if let Some(remote) = self.remote {
            write!(f, " <-> {remote}")?;
        }
        Ok(())
    }
}

/// Mutable session state the filters work on.
pub(crate) struct SessionState {
    pub(crate) info: SessionInfo,
    pub(crate) status: SessionStatus,
    /// Whether a CLOSE frame went out.
    pub(crate) close_sent: bool,
    /// Whether the peer's CLOSE frame arrived.
    pub(crate) close_received: bool,
    /// Set when the transport must go down without waiting for the peer.
    pub(crate) fatal: bool,
    pub(crate) queued: WriteQueue,
    /// Messages fully encoded into `outbound`, waiting for the transport to take them.
    pub(crate) written: Vec<Message>,
    pub(crate) stats: SessionStats,
    outbound: BytesMut,
    /// Bytes received before the session opened.
    early: BytesMut,
}

impl SessionState {
    pub(crate) fn new(info: SessionInfo) -> Self {
        Self {
            info,
            status: SessionStatus::Created,
            close_sent: false,
            close_received: false,
            fatal: false,
            queued: WriteQueue::new(),
            written: Vec::new(),
            stats: SessionStats::default(),
            outbound: BytesMut::new(),
            early: BytesMut::new(),
        }
    }

    /// Accepts whatever reached the bottom of the write chain.
    pub(crate) fn transmit(&mut self, payload: Payload) -> Result<()> {
        match payload {
            Payload::Raw(bytes) => {
                self.outbound.extend_from_slice(&bytes);
                Ok(())
            }
            _ => Err(GatewayError::UnencodedPayload),
        }
    }

    pub(crate) fn take_outbound(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    /// Records that a CLOSE frame was sent.
    pub(crate) fn mark_close_sent(&mut self) {
        self.close_sent = true;
        if self.status != SessionStatus::Closed {
            self.status = SessionStatus::Closing;
        }
    }

    /// Records that the peer's CLOSE frame arrived.
    pub(crate) fn mark_close_received(&mut self) {
        self.close_received = true;
        if self.status != SessionStatus::Closed {
            self.status = SessionStatus::Closing;
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let address = crate::address::ResourceAddressFactory::default()
            .resolve("ws://localhost:8000/test")
            .unwrap();
        Self::new(SessionInfo::new(Role::Server, address))
    }
}

/// A sans-io WebSocket session: state plus its filter pipeline.
pub struct Session {
    state: SessionState,
    pipeline: FilterPipeline,
}

impl Session {
    /// Creates a session running `pipeline` and fires `SessionCreated`.
    pub fn new(info: SessionInfo, pipeline: FilterPipeline) -> Self {
        let mut session = Self {
            state: SessionState::new(info),
            pipeline,
        };
        session.fire(Event::SessionCreated);
        session
    }

    /// Creates a WebSocket session with the standard pipeline for `info.local()`:
    ///
    /// 1. `exceptions`: [`ExceptionLoggingFilter`], when enabled in the options,
    /// 2. `{protocol}#codec`: [`CodecFilter`],
    /// 3. `{protocol}#framing`: [`FramingFilter`],
    /// 4. `logging`: [`LoggingFilter`], when a session logging target is set,
    /// 5. `service`: [`ServiceFilter`] around `service`.
    ///
    /// Fails with [`GatewayError::NotWebSocket`] when the address chain has no WebSocket layer.
    pub fn websocket<S>(info: SessionInfo, options: &Options, service: S) -> Result<Self>
    where
        S: Service + 'static,
    {
        let protocol = info
            .local()
            .find_transport("ws")
            .map(|layer| layer.protocol_name().to_string())
            .ok_or_else(|| GatewayError::NotWebSocket(info.local().to_string()))?;

        let mut pipeline = FilterPipeline::new();
        if options.exception_logging {
            pipeline.add_last("exceptions", ExceptionLoggingFilter::new("wsgate::session"))?;
        }
        pipeline.add_last(
            format!("{protocol}#codec"),
            CodecFilter::new(info.role(), options.max_payload_read()),
        )?;
        pipeline.add_last(format!("{protocol}#framing"), FramingFilter::from_options(options))?;
        if let Some(target) = &options.session_logging {
            pipeline.add_last("logging", LoggingFilter::new(target.as_str()))?;
        }
        pipeline.add_last("service", ServiceFilter::new(service))?;

        Ok(Self::new(info, pipeline))
    }

    pub fn info(&self) -> &SessionInfo {
        &self.state.info
    }

    pub fn id(&self) -> SessionId {
        self.state.info.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn stats(&self) -> SessionStats {
        self.state.stats
    }

    pub fn is_open(&self) -> bool {
        self.state.status == SessionStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state.status == SessionStatus::Closed
    }

    /// The session's filter chain.
    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    /// The session's filter chain, for adding or removing filters between dispatches.
    pub fn pipeline_mut(&mut self) -> &mut FilterPipeline {
        &mut self.pipeline
    }

    pub(crate) fn set_handle(&mut self, handle: SessionHandle) {
        let info = self.state.info.clone().with_handle(handle);
        self.state.info = info;
    }

    /// Passes the authorization gate and opens the session.
    ///
    /// An unauthorized session never sees `SessionOpened`: it is closed right away and
    /// [`GatewayError::Unauthorized`] is returned.
    pub fn open(&mut self, authorizer: &dyn Authorizer, principal: Option<&str>) -> Result<()> {
        if self.state.status != SessionStatus::Created {
            return Err(GatewayError::ConnectionClosed);
        }

        if !authorizer.is_authorized(principal) {
            log::debug!(
                "session {}: principal {:?} is not authorized",
                self.state.info.id,
                principal
            );
            self.state.early.clear();
            self.transport_closed();
            return Err(GatewayError::Unauthorized);
        }

        self.state.info.principal = principal.map(str::to_string);
        self.state.status = SessionStatus::Open;
        self.fire(Event::SessionOpened);

        if !self.state.early.is_empty() {
            let early = self.state.early.split().freeze();
            self.fire(Event::MessageReceived(Payload::Raw(early)));
        }

        Ok(())
    }

    /// Feeds bytes read from the transport.
    ///
    /// Bytes arriving before [`Session::open`] are held back until the session opens,
    /// and dropped if it never does. Bytes arriving after the session closed are discarded.
    pub fn receive(&mut self, bytes: Bytes) {
        match self.state.status {
            SessionStatus::Closed => return,
            SessionStatus::Created => {
                self.state.stats.bytes_read += bytes.len() as u64;
                self.state.early.extend_from_slice(&bytes);
                return;
            }
            _ => {}
        }
        self.state.stats.bytes_read += bytes.len() as u64;
        self.fire(Event::MessageReceived(Payload::Raw(bytes)));
    }

    /// Writes an application message through the pipeline.
    pub fn write(&mut self, message: Message) -> Result<()> {
        if self.state.status != SessionStatus::Open {
            return Err(GatewayError::ConnectionClosed);
        }
        self.pipeline
            .write(&mut self.state, Payload::Message(message));
        Ok(())
    }

    /// Starts the close handshake; a no-op once a CLOSE frame went out.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        if self.state.close_sent || self.state.status == SessionStatus::Closed {
            return;
        }
        self.pipeline
            .write(&mut self.state, Payload::Frame(Frame::close(code, reason)));
    }

    /// Applies a request made through a [`SessionHandle`].
    pub(crate) fn command(&mut self, command: Command) {
        match command {
            Command::Send(message) => {
                if let Err(err) = self.write(message) {
                    log::debug!("session {}: dropping message: {}", self.state.info.id, err);
                }
            }
            Command::Close(code, reason) => self.close(code, &reason),
        }
    }

    /// Whether bytes are waiting to be written to the transport.
    pub fn has_outbound(&self) -> bool {
        !self.state.outbound.is_empty()
    }

    /// Takes the bytes to write to the transport.
    pub fn take_outbound(&mut self) -> Bytes {
        self.state.take_outbound()
    }

    /// Reports that `written` bytes reached the transport, firing `MessageSent` for every
    /// message they completed.
    pub fn flushed(&mut self, written: usize) {
        self.state.stats.bytes_written += written as u64;
        for message in std::mem::take(&mut self.state.written) {
            self.state.stats.messages_sent += 1;
            self.fire(Event::MessageSent(message));
        }
    }

    /// Reports inactivity: fires `SessionIdle`, then closes the session without waiting for
    /// the peer.
    pub fn idle(&mut self, status: IdleStatus) {
        if self.state.status == SessionStatus::Closed {
            return;
        }
        self.fire(Event::SessionIdle(status));
        self.close(CloseCode::Away, "idle timeout");
        self.state.fatal = true;
    }

    /// Reports that the peer did not answer our CLOSE in time.
    pub fn close_timed_out(&mut self) {
        if self.state.status == SessionStatus::Closed {
            return;
        }
        self.fire(Event::ExceptionCaught(GatewayError::CloseTimeout));
        self.state.fatal = true;
    }

    /// Reports a transport failure; the session closes without a handshake.
    pub fn transport_error(&mut self, err: GatewayError) {
        if self.state.status == SessionStatus::Closed {
            return;
        }
        self.fire(Event::ExceptionCaught(err));
        self.transport_closed();
    }

    /// Reports that the transport is gone. Fires `SessionClosed` the first time only.
    pub fn transport_closed(&mut self) {
        if self.state.status == SessionStatus::Closed {
            return;
        }
        self.state.status = SessionStatus::Closed;
        self.state.queued.clear();
        self.pipeline.fire(&mut self.state, Event::SessionClosed);
    }

    /// Whether we sent CLOSE and are waiting for the peer's answer.
    pub fn awaiting_close(&self) -> bool {
        self.state.close_sent && !self.state.close_received && !self.state.fatal
    }

    /// Whether the transport should be shut down once the outbound bytes are written.
    pub fn should_shutdown(&self) -> bool {
        self.state.status == SessionStatus::Closed
            || self.state.fatal
            || (self.state.close_sent && self.state.close_received)
    }

    fn fire(&mut self, event: Event) {
        self.pipeline.fire(&mut self.state, event);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.state.info)
            .field("status", &self.state.status)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::ResourceAddressFactory,
        auth::{AllowAll, PrincipalRoles, RequireRole},
        codec::{Decoder, Encoder},
        filter::Outbox,
        frame::OpCode,
        message::MessageKind,
        pipeline::IdleStatus,
        reassembly::{Reassembled, Reassembler},
        ProtocolError,
    };
    use std::sync::Mutex;
    use tokio_util::codec::Encoder as _;

    #[derive(Default)]
    struct Calls {
        opened: usize,
        messages: Vec<Message>,
        exceptions: Vec<String>,
        idle: Vec<IdleStatus>,
        closed: usize,
    }

    /// Echoes every message and records every callback.
    struct Echo {
        calls: Arc<Mutex<Calls>>,
    }

    impl Service for Echo {
        fn session_opened(&mut self, _session: &SessionInfo, _out: &mut Outbox) -> Result<()> {
            self.calls.lock().unwrap().opened += 1;
            Ok(())
        }

        fn message_received(
            &mut self,
            _session: &SessionInfo,
            message: Message,
            out: &mut Outbox,
        ) -> Result<()> {
            self.calls.lock().unwrap().messages.push(message.clone());
            out.send(message);
            Ok(())
        }

        fn session_idle(
            &mut self,
            _session: &SessionInfo,
            status: IdleStatus,
            _out: &mut Outbox,
        ) -> Result<()> {
            self.calls.lock().unwrap().idle.push(status);
            Ok(())
        }

        fn exception_caught(&mut self, _session: &SessionInfo, error: &GatewayError) {
            self.calls.lock().unwrap().exceptions.push(error.to_string());
        }

        fn session_closed(&mut self, _session: &SessionInfo) {
            self.calls.lock().unwrap().closed += 1;
        }
    }

    fn server_session(options: &Options) -> (Session, Arc<Mutex<Calls>>) {
        let address = ResourceAddressFactory::default()
            .resolve("ws://localhost:8000/echo")
            .unwrap();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let service = Echo {
            calls: Arc::clone(&calls),
        };
        let session =
            Session::websocket(SessionInfo::new(Role::Server, address), options, service).unwrap();
        (session, calls)
    }

    fn open_session() -> (Session, Arc<Mutex<Calls>>) {
        let (mut session, calls) = server_session(&Options::default());
        session.open(&AllowAll, None).unwrap();
        (session, calls)
    }

    /// Encodes frames the way a client puts them on the wire.
    fn client_bytes(frames: impl IntoIterator<Item = Frame>) -> Bytes {
        let mut encoder = Encoder::new(Role::Client);
        let mut buf = BytesMut::new();
        for frame in frames {
            encoder.encode(frame, &mut buf).unwrap();
        }
        buf.freeze()
    }

    /// Decodes what the server wrote, the way a client reads it.
    fn server_frames(session: &mut Session) -> Vec<Frame> {
        let mut decoder = Decoder::new(Role::Client, 1 << 20);
        let mut buf = BytesMut::from(&session.take_outbound()[..]);
        decoder.decode_all(&mut buf).unwrap()
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn test_standard_pipeline() {
            let (session, _) = server_session(&Options::default());
            assert_eq!(
                session.pipeline().names().collect::<Vec<_>>(),
                ["exceptions", "ws/rfc6455#codec", "ws/rfc6455#framing", "service"]
            );
            assert_eq!(session.status(), SessionStatus::Created);
        }

        #[test]
        fn test_non_websocket_address() {
            let address = ResourceAddressFactory::default()
                .resolve("tcp://localhost:8000")
                .unwrap();
            let err = Session::websocket(
                SessionInfo::new(Role::Server, address),
                &Options::default(),
                Echo {
                    calls: Default::default(),
                },
            )
            .unwrap_err();

            assert!(matches!(err, GatewayError::NotWebSocket(_)));
        }

        #[test]
        fn test_open_fires_opened() {
            let (session, calls) = open_session();
            assert!(session.is_open());
            assert_eq!(calls.lock().unwrap().opened, 1);
        }

        #[test]
        fn test_unauthorized_never_opens() {
            let (mut session, calls) = server_session(&Options::default());
            let roles = PrincipalRoles::new().with_principal("joe", ["AUTHORIZED"]);
            let authorizer = RequireRole::new(roles, "AUTHORIZED");

            let err = session.open(&authorizer, Some("ann")).unwrap_err();
            assert!(matches!(err, GatewayError::Unauthorized));
            assert!(session.is_closed());

            let calls = calls.lock().unwrap();
            assert_eq!(calls.opened, 0);
            assert_eq!(calls.closed, 1);
        }

        #[test]
        fn test_authorized_principal_is_recorded() {
            let (mut session, _) = server_session(&Options::default());
            let roles = PrincipalRoles::new().with_principal("joe", ["AUTHORIZED"]);
            let authorizer = RequireRole::new(roles, "AUTHORIZED");

            session.open(&authorizer, Some("joe")).unwrap();
            assert_eq!(session.info().principal(), Some("joe"));
        }

        #[test]
        fn test_closed_fires_once_and_discards_input() {
            let (mut session, calls) = open_session();
            session.transport_closed();
            session.transport_closed();
            session.receive(client_bytes([Frame::text("late")]));

            let calls = calls.lock().unwrap();
            assert_eq!(calls.closed, 1);
            assert!(calls.messages.is_empty());
        }

        #[test]
        fn test_write_requires_open_session() {
            let (mut session, _) = server_session(&Options::default());
            assert!(matches!(
                session.write(Message::text("early")),
                Err(GatewayError::ConnectionClosed)
            ));
        }

        #[test]
        fn test_input_before_open_waits_for_open() {
            let (mut session, calls) = server_session(&Options::default());
            session.receive(client_bytes([Frame::text("early")]));

            assert_eq!(session.status(), SessionStatus::Created);
            assert!(calls.lock().unwrap().messages.is_empty());

            session.open(&AllowAll, None).unwrap();
            let calls = calls.lock().unwrap();
            assert_eq!(calls.opened, 1);
            assert_eq!(calls.messages, [Message::text("early")]);
        }

        #[test]
        fn test_input_before_unauthorized_open_is_dropped() {
            let (mut session, calls) = server_session(&Options::default());
            session.receive(client_bytes([Frame::text("early")]));

            let authorizer = RequireRole::new(PrincipalRoles::new(), "AUTHORIZED");
            assert!(session.open(&authorizer, None).is_err());

            let calls = calls.lock().unwrap();
            assert!(calls.messages.is_empty());
            assert_eq!(calls.closed, 1);
        }
    }

    mod traffic_tests {
        use super::*;

        #[test]
        fn test_echo() {
            let (mut session, calls) = open_session();
            session.receive(client_bytes([Frame::text("hello")]));

            let frames = server_frames(&mut session);
            assert_eq!(frames, [Frame::text("hello")]);
            assert_eq!(calls.lock().unwrap().messages, [Message::text("hello")]);

            session.flushed(7);
            let stats = session.stats();
            assert_eq!(stats.messages_received, 1);
            assert_eq!(stats.messages_sent, 1);
            assert_eq!(stats.bytes_written, 7);
        }

        #[test]
        fn test_bytes_split_anywhere() {
            let (mut session, calls) = open_session();
            let bytes = client_bytes([Frame::binary(vec![7u8; 300])]);

            for chunk in bytes.chunks(7) {
                session.receive(Bytes::copy_from_slice(chunk));
            }

            let calls = calls.lock().unwrap();
            assert_eq!(calls.messages.len(), 1);
            assert_eq!(calls.messages[0].payload.len(), 300);
        }

        #[test]
        fn test_fragmented_message_with_interleaved_ping() {
            let (mut session, calls) = open_session();
            session.receive(client_bytes([
                Frame::text("Hel").with_fin(false),
                Frame::ping("p"),
                Frame::continuation("lo, ").with_fin(false),
                Frame::continuation("world"),
            ]));

            let frames = server_frames(&mut session);
            assert_eq!(frames, [Frame::pong("p"), Frame::text("Hello, world")]);

            let calls = calls.lock().unwrap();
            assert_eq!(calls.messages.len(), 1);
            assert_eq!(calls.messages[0].frame_count, 3);
        }

        #[test]
        fn test_outgoing_fragmentation() {
            let options = Options::default().with_fragment_size(4);
            let (mut session, _) = server_session(&options);
            session.open(&AllowAll, None).unwrap();

            session.write(Message::text("abcdefghij")).unwrap();
            let frames = server_frames(&mut session);

            assert_eq!(
                frames,
                [
                    Frame::text("abcd").with_fin(false),
                    Frame::continuation("efgh").with_fin(false),
                    Frame::continuation("ij"),
                ]
            );
        }

        #[test]
        fn test_zero_fragment_size() {
            let mut options = Options::default();
            options.fragment_size = Some(0);
            let (mut session, _) = server_session(&options);
            session.open(&AllowAll, None).unwrap();

            session.write(Message::text("hello")).unwrap();
            let frames = server_frames(&mut session);
            assert_eq!(frames.len(), 5);
            assert!(frames[4].fin);
        }

        #[test]
        fn test_payload_lengths_survive_fragmentation() {
            let options = Options::default().with_fragment_size(1000);
            let (mut session, _) = server_session(&options);
            session.open(&AllowAll, None).unwrap();

            for len in [0usize, 1, 125, 126, 127, 128, 65535, 65536] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                session.write(Message::binary(payload.clone())).unwrap();

                let frames = server_frames(&mut session);
                assert_eq!(frames.len(), len.div_ceil(1000).max(1), "len {len}");

                let mut reassembler = Reassembler::new(1 << 20);
                let mut message = None;
                for frame in frames {
                    if let Reassembled::Message(done) = reassembler.push(frame).unwrap() {
                        message = Some(done);
                    }
                }
                let message = message.expect("reassembled message");
                assert_eq!(message.kind, MessageKind::Binary);
                assert_eq!(&message.payload[..], &payload[..], "len {len}");
            }
        }

        #[test]
        fn test_handle_commands() {
            let (mut session, _) = open_session();
            let (handle, mut rx) = SessionHandle::new(session.id());
            session.set_handle(handle.clone());
            assert!(session.info().handle().is_some());

            handle.send(Message::binary(vec![1, 2, 3])).unwrap();
            handle.close(CloseCode::Normal, "bye").unwrap();
            while let Ok(command) = rx.try_recv() {
                session.command(command);
            }

            let frames = server_frames(&mut session);
            assert_eq!(frames[0], Frame::binary(vec![1, 2, 3]));
            assert_eq!(frames[1].opcode, OpCode::Close);
            assert_eq!(session.status(), SessionStatus::Closing);
        }
    }

    mod close_tests {
        use super::*;

        #[test]
        fn test_peer_close_is_echoed() {
            let (mut session, _) = open_session();
            session.receive(client_bytes([Frame::close(CloseCode::Normal, "done")]));

            let frames = server_frames(&mut session);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].close_code(), Some(CloseCode::Normal));
            assert!(session.should_shutdown());

            session.transport_closed();
            assert!(session.is_closed());
        }

        #[test]
        fn test_empty_close_is_echoed_empty() {
            let (mut session, _) = open_session();
            session.receive(client_bytes([Frame::close_raw(Bytes::new())]));

            let frames = server_frames(&mut session);
            assert_eq!(frames, [Frame::close_raw(Bytes::new())]);
        }

        #[test]
        fn test_local_close_waits_for_peer() {
            let (mut session, _) = open_session();
            session.close(CloseCode::Normal, "bye");

            assert_eq!(session.status(), SessionStatus::Closing);
            assert!(session.awaiting_close());
            assert!(!session.should_shutdown());
            assert_eq!(server_frames(&mut session).len(), 1);

            // the peer's answer completes the handshake and is not echoed
            session.receive(client_bytes([Frame::close(CloseCode::Normal, "")]));
            assert!(session.should_shutdown());
            assert!(server_frames(&mut session).is_empty());

            // writes are refused once closing
            assert!(session.write(Message::text("late")).is_err());
        }

        #[test]
        fn test_close_timeout() {
            let (mut session, calls) = open_session();
            session.close(CloseCode::Normal, "bye");
            session.close_timed_out();

            assert!(session.should_shutdown());
            assert_eq!(
                calls.lock().unwrap().exceptions,
                ["Close handshake timed out"]
            );
        }

        #[test]
        fn test_idle_closes() {
            let (mut session, calls) = open_session();
            session.idle(IdleStatus::Both);

            assert_eq!(calls.lock().unwrap().idle, [IdleStatus::Both]);
            let frames = server_frames(&mut session);
            assert_eq!(frames[0].close_code(), Some(CloseCode::Away));
            assert!(session.should_shutdown());
        }

        #[test]
        fn test_transport_error_skips_handshake() {
            let (mut session, calls) = open_session();
            session.transport_error(GatewayError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )));

            assert!(session.is_closed());
            assert!(!session.has_outbound());

            let calls = calls.lock().unwrap();
            assert_eq!(calls.exceptions.len(), 1);
            assert_eq!(calls.closed, 1);
        }
    }

    mod violation_tests {
        use super::*;

        fn assert_closed_with(session: &mut Session, code: CloseCode) {
            let frames = server_frames(session);
            assert_eq!(frames.len(), 1, "{frames:?}");
            assert_eq!(frames[0].close_code(), Some(code));
            assert!(session.should_shutdown());
        }

        #[test]
        fn test_unmasked_client_frame() {
            let (mut session, calls) = open_session();

            let mut buf = BytesMut::new();
            Encoder::new(Role::Server)
                .encode(Frame::text("unmasked"), &mut buf)
                .unwrap();
            session.receive(buf.freeze());

            assert_closed_with(&mut session, CloseCode::Protocol);
            let calls = calls.lock().unwrap();
            assert!(calls.messages.is_empty());
            assert_eq!(
                calls.exceptions,
                [GatewayError::from(ProtocolError::UnmaskedFrame).to_string()]
            );
        }

        #[test]
        fn test_reserved_opcode() {
            let (mut session, _) = open_session();
            session.receive(Bytes::from_static(&[0x83, 0x80, 0, 0, 0, 0]));
            assert_closed_with(&mut session, CloseCode::Unsupported);
        }

        #[test]
        fn test_continuation_without_start() {
            let (mut session, _) = open_session();
            session.receive(client_bytes([Frame::continuation("orphan")]));
            assert_closed_with(&mut session, CloseCode::Protocol);
        }

        #[test]
        fn test_invalid_utf8_text() {
            let (mut session, calls) = open_session();
            session.receive(client_bytes([Frame::text(vec![0xFF, 0xFE])]));

            assert_closed_with(&mut session, CloseCode::Invalid);
            assert!(calls.lock().unwrap().messages.is_empty());
        }

        #[test]
        fn test_one_byte_close_payload() {
            let (mut session, _) = open_session();
            session.receive(client_bytes([Frame::close_raw(vec![0x03])]));
            assert_closed_with(&mut session, CloseCode::Protocol);
        }

        #[test]
        fn test_reserved_close_code() {
            let (mut session, _) = open_session();
            session.receive(client_bytes([Frame::close_raw(1005u16.to_be_bytes().to_vec())]));
            assert_closed_with(&mut session, CloseCode::Protocol);
        }

        #[test]
        fn test_message_too_large() {
            let options = Options::default().with_max_message_size(8);
            let (mut session, _) = server_session(&options);
            session.open(&AllowAll, None).unwrap();

            session.receive(client_bytes([
                Frame::binary(vec![0; 6]).with_fin(false),
                Frame::continuation(vec![0; 6]),
            ]));
            assert_closed_with(&mut session, CloseCode::Size);
        }

        #[test]
        fn test_errors_stay_in_their_session() {
            let (mut broken, broken_calls) = open_session();
            let (mut healthy, healthy_calls) = open_session();

            broken.receive(client_bytes([Frame::continuation("orphan")]));
            healthy.receive(client_bytes([Frame::text("fine")]));

            assert!(broken.should_shutdown());
            assert!(!healthy.should_shutdown());
            assert!(broken_calls.lock().unwrap().messages.is_empty());
            assert_eq!(
                healthy_calls.lock().unwrap().messages,
                [Message::text("fine")]
            );
            assert_eq!(server_frames(&mut healthy), [Frame::text("fine")]);
        }
    }
}
