//! The scheme table and the resolver built on it.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use url::Url;

use super::{factory::ResourceFactory, ResourceAddress};
use crate::{GatewayError, Result};

/// Longest address chain the resolver follows before assuming the table loops.
const MAX_DEPTH: usize = 8;

/// One row of the scheme table: how a scheme resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeEntry {
    pub(crate) scheme: String,
    pub(crate) protocol: String,
    pub(crate) transport: String,
    pub(crate) root: String,
    pub(crate) default_port: Option<u16>,
    pub(crate) inner: Option<ResourceFactory>,
}

impl SchemeEntry {
    /// Creates a leaf scheme whose root is itself.
    pub fn new(
        scheme: impl Into<String>,
        protocol: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        let scheme = scheme.into();
        Self {
            root: scheme.clone(),
            scheme,
            protocol: protocol.into(),
            transport: transport.into(),
            default_port: None,
            inner: None,
        }
    }

    /// Sets the scheme this one is an alias of.
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the port used when a location omits one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    /// Sets the rewrite that produces the location of the next layer down.
    pub fn with_inner(mut self, factory: ResourceFactory) -> Self {
        self.inner = Some(factory);
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }
}

/// Resolves locations into [`ResourceAddress`] chains.
///
/// The table is fixed once the factory is built; resolved addresses are cached per location,
/// so repeated lookups of the same URI share one `Arc`.
#[derive(Debug)]
pub struct ResourceAddressFactory {
    schemes: HashMap<String, SchemeEntry>,
    cache: RwLock<HashMap<String, Arc<ResourceAddress>>>,
}

impl Default for ResourceAddressFactory {
    /// The built-in table: `ws`, `wss`, `ws-draft`, `ws-draft+ssl`, `http`, `https`, `ssl`, `tcp`.
    fn default() -> Self {
        Self::empty()
            .with_scheme(
                SchemeEntry::new("ws", "ws/rfc6455", "ws")
                    .with_default_port(80)
                    .with_inner(ResourceFactory::keep_authority_only("tcp")),
            )
            .with_scheme(
                SchemeEntry::new("wss", "ws/rfc6455", "ws")
                    .with_default_port(443)
                    .with_inner(ResourceFactory::keep_authority_only("ssl")),
            )
            .with_scheme(
                SchemeEntry::new("ws-draft", "ws/draft-7x", "ws")
                    .with_root("ws")
                    .with_default_port(80)
                    .with_inner(ResourceFactory::change_scheme_only("ws")),
            )
            .with_scheme(
                SchemeEntry::new("ws-draft+ssl", "ws/draft-7x", "ws")
                    .with_root("wss")
                    .with_default_port(443)
                    .with_inner(ResourceFactory::change_scheme_only("wss")),
            )
            .with_scheme(
                SchemeEntry::new("http", "http/1.1", "http")
                    .with_default_port(80)
                    .with_inner(ResourceFactory::keep_authority_only("tcp")),
            )
            .with_scheme(
                SchemeEntry::new("https", "http/1.1", "http")
                    .with_default_port(443)
                    .with_inner(ResourceFactory::keep_authority_only("ssl")),
            )
            .with_scheme(
                SchemeEntry::new("ssl", "ssl", "ssl")
                    .with_inner(ResourceFactory::keep_authority_only("tcp")),
            )
            .with_scheme(SchemeEntry::new("tcp", "tcp", "tcp"))
    }
}

impl ResourceAddressFactory {
    /// A factory that knows no scheme at all.
    pub fn empty() -> Self {
        Self {
            schemes: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a scheme.
    pub fn with_scheme(mut self, spec: SchemeEntry) -> Self {
        self.schemes.insert(spec.scheme.clone(), spec);
        self
    }

    /// Returns whether `scheme` can be resolved.
    pub fn supports(&self, scheme: &str) -> bool {
        self.schemes.contains_key(scheme)
    }

    /// Looks up the table row for `scheme`.
    pub fn scheme(&self, scheme: &str) -> Option<&SchemeEntry> {
        self.schemes.get(scheme)
    }

    /// Resolves `location` into an address chain.
    ///
    /// Accepts anything that reads as a URI string, including [`Url`].
    ///
    /// # Errors
    /// - [`GatewayError::UnsupportedScheme`] when a scheme of the chain is not registered.
    /// - [`GatewayError::InvalidAddress`] when the location does not parse, has no host, or
    ///   has no port and its scheme no default.
    pub fn resolve(&self, location: impl AsRef<str>) -> Result<Arc<ResourceAddress>> {
        let location = location.as_ref();

        if let Some(address) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(location)
        {
            return Ok(Arc::clone(address));
        }

        let url = Url::parse(location).map_err(|_| GatewayError::InvalidAddress {
            location: location.to_string(),
            reason: "not a valid URI",
        })?;
        let address = Arc::new(self.resolve_url(url, 0)?);

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let address = cache.entry(location.to_string()).or_insert(address);

        Ok(Arc::clone(address))
    }

    fn resolve_url(&self, mut url: Url, depth: usize) -> Result<ResourceAddress> {
        if depth >= MAX_DEPTH {
            return Err(GatewayError::InvalidAddress {
                location: url.to_string(),
                reason: "address chain loops",
            });
        }

        let spec = self
            .schemes
            .get(url.scheme())
            .ok_or_else(|| GatewayError::UnsupportedScheme(url.scheme().to_string()))?;

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(GatewayError::InvalidAddress {
                    location: url.to_string(),
                    reason: "missing host",
                })
            }
        };

        let port = match url.port_or_known_default().or(spec.default_port) {
            Some(port) => port,
            None => {
                return Err(GatewayError::InvalidAddress {
                    location: url.to_string(),
                    reason: "missing port",
                })
            }
        };

        // well known defaults are implied by the URL itself; anything else is written out
        if url.port_or_known_default().is_none() && url.set_port(Some(port)).is_err() {
            return Err(GatewayError::InvalidAddress {
                location: url.to_string(),
                reason: "cannot carry a port",
            });
        }

        let inner = match &spec.inner {
            Some(factory) => {
                let next = factory.create(&url)?;
                Some(Box::new(self.resolve_url(next, depth + 1)?))
            }
            None => None,
        };

        Ok(ResourceAddress {
            scheme: spec.scheme.clone(),
            location: url,
            host,
            port,
            transport_name: spec.transport.clone(),
            protocol_name: spec.protocol.clone(),
            root_scheme: spec.root.clone(),
            inner,
        })
    }
}
