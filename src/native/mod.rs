//! The tokio runtime: binding listeners, connecting to peers and driving sessions.
mod accept;
mod connect;
mod driver;
mod handshake;

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    address::{ResourceAddress, ResourceAddressFactory},
    auth::{AllowAll, Authorizer},
    close::CloseCode,
    filter::Service,
    message::Message,
    session::SessionHandle,
    GatewayError, Result,
};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit are rejected with
/// [`ProtocolError::FrameTooLarge`](crate::ProtocolError::FrameTooLarge).
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum size of a reassembled message, set to 2 MiB.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// How long we wait for the peer's CLOSE after sending ours.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration shared by every session a [`Gateway`] creates.
///
/// ```rust
/// use std::time::Duration;
/// use wsgate::Options;
///
/// let options = Options::default()
///     .with_max_payload_read(64 * 1024)
///     .with_fragment_size(16 * 1024)
///     .with_idle_timeout(Duration::from_secs(30));
///
/// assert_eq!(options.max_message_size(), 128 * 1024);
/// ```
#[derive(Clone)]
pub struct Options {
    /// Maximum payload size of a single incoming frame, in bytes.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`].
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled message.
    ///
    /// Default: 2 MiB as defined in [`MAX_MESSAGE_SIZE`], or twice the configured
    /// `max_payload_read` value if that is set.
    pub max_message_size: Option<usize>,

    /// Splits outgoing messages into frames of at most this many bytes. Default: no splitting.
    pub fragment_size: Option<usize>,

    /// Upper bound on the time between the first and last fragment of a message.
    pub fragment_timeout: Option<Duration>,

    /// Whether incoming text messages and close reasons are validated as UTF-8.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Closes sessions that saw no traffic in either direction for this long.
    pub idle_timeout: Option<Duration>,

    /// How long to wait for the peer's answer to our CLOSE.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Duration,

    /// Installs an [`ExceptionLoggingFilter`](crate::filter::ExceptionLoggingFilter) at the
    /// head of every session pipeline. Default: `true`
    pub exception_logging: bool,

    /// Installs a [`LoggingFilter`](crate::filter::LoggingFilter) logging under this target
    /// between the framing filter and the service.
    pub session_logging: Option<String>,

    /// Sets `TCP_NODELAY` on accepted and connected sockets. Default: `true`
    pub no_delay: bool,

    /// Terminates TLS for `wss` and `ws-draft+ssl` listeners.
    pub tls_acceptor: Option<TlsAcceptor>,

    /// Client side TLS. When unset, a connector trusting the webpki roots is built on demand.
    pub tls_connector: Option<TlsConnector>,

    /// The gate every accepted session must pass before it opens. Default: [`AllowAll`].
    pub authorizer: Arc<dyn Authorizer>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload_read: None,
            max_message_size: None,
            fragment_size: None,
            fragment_timeout: None,
            check_utf8: true,
            idle_timeout: None,
            close_timeout: CLOSE_TIMEOUT,
            exception_logging: true,
            session_logging: None,
            no_delay: true,
            tls_acceptor: None,
            tls_connector: None,
            authorizer: Arc::new(AllowAll),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("max_payload_read", &self.max_payload_read)
            .field("max_message_size", &self.max_message_size)
            .field("fragment_size", &self.fragment_size)
            .field("fragment_timeout", &self.fragment_timeout)
            .field("check_utf8", &self.check_utf8)
            .field("idle_timeout", &self.idle_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("exception_logging", &self.exception_logging)
            .field("session_logging", &self.session_logging)
            .field("no_delay", &self.no_delay)
            .field("tls_acceptor", &self.tls_acceptor.is_some())
            .field("tls_connector", &self.tls_connector.is_some())
            .finish_non_exhaustive()
    }
}

impl Options {
    /// The effective frame payload limit.
    pub fn max_payload_read(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    /// The effective message size limit.
    pub fn max_message_size(&self) -> usize {
        // at least 2 times the payload read if not specified
        self.max_message_size.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read * 2)
                .unwrap_or(MAX_MESSAGE_SIZE),
        )
    }

    /// Sets the maximum allowed payload size of incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled incoming message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Splits outgoing messages into frames carrying at most `size` bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size.max(1)),
            ..self
        }
    }

    /// Fails fragmented messages that take longer than `timeout` to complete.
    pub fn with_fragment_timeout(self, timeout: Duration) -> Self {
        Self {
            fragment_timeout: Some(timeout),
            ..self
        }
    }

    /// Enables UTF-8 validation of incoming text.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Disables UTF-8 validation of incoming text.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    /// Closes sessions idle for `timeout`.
    pub fn with_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: timeout,
            ..self
        }
    }

    /// Leaves the exception logging filter out of new pipelines.
    pub fn without_exception_logging(self) -> Self {
        Self {
            exception_logging: false,
            ..self
        }
    }

    /// Logs every event of every session under `target`.
    pub fn with_session_logging(self, target: impl Into<String>) -> Self {
        Self {
            session_logging: Some(target.into()),
            ..self
        }
    }

    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }

    pub fn with_tls_acceptor(self, acceptor: TlsAcceptor) -> Self {
        Self {
            tls_acceptor: Some(acceptor),
            ..self
        }
    }

    pub fn with_tls_connector(self, connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
            ..self
        }
    }

    pub fn with_authorizer(self, authorizer: impl Authorizer + 'static) -> Self {
        Self {
            authorizer: Arc::new(authorizer),
            ..self
        }
    }
}

/// Entry point of the runtime: resolves locations and binds or connects them.
///
/// # Example
/// ```no_run
/// use wsgate::{Gateway, Message, Options, Outbox, Service, SessionInfo};
///
/// struct Printer;
///
/// impl Service for Printer {
///     fn message_received(
///         &mut self,
///         _session: &SessionInfo,
///         message: Message,
///         _out: &mut Outbox,
///     ) -> wsgate::Result<()> {
///         println!("{}", message.as_str()?);
///         Ok(())
///     }
/// }
///
/// # async fn run() -> wsgate::Result<()> {
/// let gateway = Gateway::new(Options::default());
/// let connection = gateway.connect("ws://127.0.0.1:8080/echo", Printer).await?;
/// connection.send(Message::text("hello"))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Gateway {
    options: Options,
    addresses: Arc<ResourceAddressFactory>,
}

impl Gateway {
    /// A gateway using the built-in scheme table.
    pub fn new(options: Options) -> Self {
        Self {
            options,
            addresses: Arc::new(ResourceAddressFactory::default()),
        }
    }

    /// Replaces the scheme registry used to resolve locations.
    pub fn with_address_factory(self, addresses: ResourceAddressFactory) -> Self {
        Self {
            addresses: Arc::new(addresses),
            ..self
        }
    }

    pub fn addresses(&self) -> &ResourceAddressFactory {
        &self.addresses
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Binds `location` and accepts WebSocket sessions on it.
    ///
    /// Every accepted session gets its own service from `factory` and runs on its own task.
    /// The address chain must contain a WebSocket layer over `tcp`; secure chains need a
    /// TLS acceptor in the options.
    pub async fn bind<F, S>(&self, location: impl AsRef<str>, factory: F) -> Result<Listener>
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Service + 'static,
    {
        let address = self.addresses.resolve(location)?;
        let protocol = address
            .find_transport("ws")
            .and_then(ResourceAddress::protocol)
            .ok_or_else(|| GatewayError::NotWebSocket(address.to_string()))?;
        let tcp = address
            .find_transport("tcp")
            .ok_or_else(|| GatewayError::NotWebSocket(address.to_string()))?;

        if address.is_secure() && self.options.tls_acceptor.is_none() {
            return Err(GatewayError::MissingTlsAcceptor(address.to_string()));
        }

        let listener = TcpListener::bind(tcp.authority()).await?;
        let local_addr = listener.local_addr()?;
        log::debug!("listening on {} ({}) at {}", address, protocol, local_addr);

        let acceptor = Arc::new(accept::Acceptor {
            address: Arc::clone(&address),
            protocol,
            options: self.options.clone(),
            factory,
        });
        let task = tokio::spawn(accept::accept_loop(listener, acceptor));

        Ok(Listener {
            local_addr,
            address,
            task,
        })
    }

    /// Connects to `location` and opens a client session served by `service`.
    pub async fn connect<S>(&self, location: impl AsRef<str>, service: S) -> Result<Connection>
    where
        S: Service + 'static,
    {
        let address = self.addresses.resolve(location)?;
        connect::connect(address, &self.options, service).await
    }
}

/// A bound location accepting sessions in the background.
///
/// Awaiting the listener waits until the accept loop ends.
pub struct Listener {
    local_addr: SocketAddr,
    address: Arc<ResourceAddress>,
    task: JoinHandle<()>,
}

impl Listener {
    /// The socket address actually bound, useful when the location asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> &Arc<ResourceAddress> {
        &self.address
    }

    /// Stops accepting. Sessions already running are not affected.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Future for Listener {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task
            .poll_unpin(cx)
            .map(|res| res.map_err(|err| io::Error::new(io::ErrorKind::Other, err).into()))
    }
}

/// An open client session.
pub struct Connection {
    handle: SessionHandle,
    address: Arc<ResourceAddress>,
    task: JoinHandle<()>,
}

impl Connection {
    /// A handle to push messages from any task.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn address(&self) -> &Arc<ResourceAddress> {
        &self.address
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.handle.send(message)
    }

    /// Starts the close handshake.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        self.handle.close(code, reason)
    }

    /// Waits until the session is closed.
    pub async fn closed(self) -> Result<()> {
        self.task
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err).into())
    }
}
