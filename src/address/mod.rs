//! # Address
//!
//! Resource addresses describe *how* an endpoint is reached, not just where it is. Resolving
//! `wss://example.com/echo` yields a chain of three layers:
//!
//! ```text
//! wss://example.com/echo      (ws/rfc6455, transport "ws")
//!   -> ssl://example.com:443  (ssl)
//!     -> tcp://example.com:443 (tcp)
//! ```
//!
//! The chain is produced by a [`ResourceAddressFactory`] from its table of [`SchemeEntry`]s, where
//! each scheme names the [`ResourceFactory`] rewrite deriving the next layer's location. The
//! draft WebSocket schemes alias the standard ones, so `ws-draft+ssl://host/` resolves to
//! `ws-draft+ssl -> wss -> ssl -> tcp`.
mod factory;
mod registry;

use std::fmt;

use url::Url;

pub use factory::ResourceFactory;
pub use registry::{ResourceAddressFactory, SchemeEntry};

/// WebSocket protocol flavours the runtime can speak.
///
/// Both flavours share the RFC 6455 framing; they only differ in the versions accepted
/// during the opening handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `ws/rfc6455`, `Sec-WebSocket-Version: 13`.
    Rfc6455,
    /// `ws/draft-7x`, the hybi drafts 7 and 8 (and 13 from upgraded draft clients).
    Draft7x,
}

impl Protocol {
    /// The protocol label used in the scheme table.
    pub fn label(self) -> &'static str {
        match self {
            Self::Rfc6455 => "ws/rfc6455",
            Self::Draft7x => "ws/draft-7x",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "ws/rfc6455" => Some(Self::Rfc6455),
            "ws/draft-7x" => Some(Self::Draft7x),
            _ => None,
        }
    }

    /// Whether a client announcing `version` in `Sec-WebSocket-Version` may connect.
    pub fn accepts_version(self, version: &str) -> bool {
        match self {
            Self::Rfc6455 => version == "13",
            Self::Draft7x => matches!(version, "7" | "8" | "13"),
        }
    }

    /// The `Sec-WebSocket-Version` a client of this flavour announces.
    pub fn request_version(self) -> &'static str {
        match self {
            Self::Rfc6455 => "13",
            Self::Draft7x => "8",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An immutable, resolved resource address.
///
/// Each address owns at most one inner address, the layer it runs on top of, so a chain is
/// always linear and ends at a leaf transport such as `tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAddress {
    pub(crate) scheme: String,
    pub(crate) location: Url,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) transport_name: String,
    pub(crate) protocol_name: String,
    pub(crate) root_scheme: String,
    pub(crate) inner: Option<Box<ResourceAddress>>,
}

impl ResourceAddress {
    /// The scheme this address was resolved for.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The scheme this address is an alias of (`ws` for `ws-draft`), or its own scheme.
    pub fn root_scheme(&self) -> &str {
        &self.root_scheme
    }

    /// The resolved location.
    ///
    /// Default ports of the well known schemes are implied by the URL and therefore not part
    /// of its string form; use [`ResourceAddress::port`] for the effective port.
    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The effective port, explicit or the scheme default.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with the port always written out.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The path of the location (`/` when empty for hierarchical schemes).
    pub fn path(&self) -> &str {
        self.location.path()
    }

    /// Name of the runtime layer servicing this address: `ws`, `http`, `ssl` or `tcp`.
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Protocol label, e.g. `ws/rfc6455`.
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// The WebSocket flavour, when this address is a WebSocket layer.
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_label(&self.protocol_name)
    }

    /// The next layer down, if any.
    pub fn inner(&self) -> Option<&ResourceAddress> {
        self.inner.as_deref()
    }

    /// Iterates over this address and every inner layer, outermost first.
    pub fn layers(&self) -> Layers<'_> {
        Layers { next: Some(self) }
    }

    /// The leaf layer of the chain.
    pub fn innermost(&self) -> &ResourceAddress {
        let mut address = self;
        while let Some(inner) = address.inner() {
            address = inner;
        }
        address
    }

    /// Finds the first layer, starting with this one, serviced by `transport`.
    pub fn find_transport(&self, transport: &str) -> Option<&ResourceAddress> {
        self.layers()
            .find(|layer| layer.transport_name == transport)
    }

    /// Whether any layer of the chain is TLS.
    pub fn is_secure(&self) -> bool {
        self.find_transport("ssl").is_some()
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)
    }
}

/// Iterator over the layers of an address chain, see [`ResourceAddress::layers`].
#[derive(Debug, Clone)]
pub struct Layers<'a> {
    next: Option<&'a ResourceAddress>,
}

impl<'a> Iterator for Layers<'a> {
    type Item = &'a ResourceAddress;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.inner();
        Some(current)
    }
}
