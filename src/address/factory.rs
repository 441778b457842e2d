//! Location rewrites that derive the URI of the next transport layer down.
use std::fmt;

use url::{Position, Url};

use crate::{GatewayError, Result};

/// A stateless `Url -> Url` rewrite.
///
/// - [`ResourceFactory::KeepAuthorityOnly`] switches to the new scheme and keeps only the
///   authority (user info, host and port); path, query and fragment are dropped. This is how a
///   WebSocket or HTTP location descends to its `ssl` or `tcp` transport.
/// - [`ResourceFactory::ChangeSchemeOnly`] switches to the new scheme and keeps everything else,
///   which is how the draft schemes alias the standard ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceFactory {
    KeepAuthorityOnly(String),
    ChangeSchemeOnly(String),
}

impl ResourceFactory {
    pub fn keep_authority_only(scheme: impl Into<String>) -> Self {
        Self::KeepAuthorityOnly(scheme.into())
    }

    pub fn change_scheme_only(scheme: impl Into<String>) -> Self {
        Self::ChangeSchemeOnly(scheme.into())
    }

    /// The scheme of every location this factory produces.
    pub fn scheme(&self) -> &str {
        match self {
            Self::KeepAuthorityOnly(scheme) | Self::ChangeSchemeOnly(scheme) => scheme,
        }
    }

    /// Rewrites `location`.
    ///
    /// `KeepAuthorityOnly` needs a host and a port (explicit or the scheme's well known
    /// default); without them the result would name no reachable endpoint.
    pub fn create(&self, location: &Url) -> Result<Url> {
        let rewritten = match self {
            Self::KeepAuthorityOnly(scheme) => {
                let host = location.host_str().ok_or_else(|| invalid(location, "missing host"))?;
                let port = location
                    .port_or_known_default()
                    .ok_or_else(|| invalid(location, "missing port"))?;

                let mut userinfo = String::new();
                if !location.username().is_empty() {
                    userinfo.push_str(location.username());
                    if let Some(password) = location.password() {
                        userinfo.push(':');
                        userinfo.push_str(password);
                    }
                    userinfo.push('@');
                }

                format!("{scheme}://{userinfo}{host}:{port}")
            }
            // `Url::set_scheme` refuses to move between special and non-special schemes
            Self::ChangeSchemeOnly(scheme) => {
                format!("{scheme}{}", &location[Position::AfterScheme..])
            }
        };

        Url::parse(&rewritten).map_err(|_| invalid(location, "rewritten location does not parse"))
    }
}

impl fmt::Display for ResourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepAuthorityOnly(scheme) => write!(f, "keepAuthorityOnly({scheme})"),
            Self::ChangeSchemeOnly(scheme) => write!(f, "changeSchemeOnly({scheme})"),
        }
    }
}

fn invalid(location: &Url, reason: &'static str) -> GatewayError {
    GatewayError::InvalidAddress {
        location: location.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_keep_authority_only_drops_path_and_query() {
        let factory = ResourceFactory::keep_authority_only("tcp");
        let out = factory.create(&url("wss://example.com:9000/path?q=1#frag")).unwrap();

        assert_eq!(out.scheme(), "tcp");
        assert_eq!(out.host_str(), Some("example.com"));
        assert_eq!(out.port(), Some(9000));
        assert!(out.path().is_empty());
        assert_eq!(out.query(), None);
        assert_eq!(out.fragment(), None);
    }

    #[test]
    fn test_keep_authority_only_makes_default_port_explicit() {
        let factory = ResourceFactory::keep_authority_only("ssl");
        let out = factory.create(&url("wss://example.com/echo")).unwrap();

        assert_eq!(out.as_str(), "ssl://example.com:443");
    }

    #[test]
    fn test_keep_authority_only_keeps_userinfo() {
        let factory = ResourceFactory::keep_authority_only("tcp");
        let out = factory.create(&url("ws://joe:secret@localhost:8000/x")).unwrap();

        assert_eq!(out.username(), "joe");
        assert_eq!(out.password(), Some("secret"));
        assert_eq!(out.port(), Some(8000));
    }

    #[test]
    fn test_keep_authority_only_ipv6() {
        let factory = ResourceFactory::keep_authority_only("tcp");
        let out = factory.create(&url("ws://[::1]:8080/")).unwrap();

        assert_eq!(out.host_str(), Some("[::1]"));
        assert_eq!(out.port(), Some(8080));
    }

    #[test]
    fn test_keep_authority_only_requires_port() {
        let factory = ResourceFactory::keep_authority_only("tcp");
        let err = factory.create(&url("custom://example.com/x")).unwrap_err();

        assert!(matches!(
            err,
            GatewayError::InvalidAddress {
                reason: "missing port",
                ..
            }
        ));
    }

    #[test]
    fn test_change_scheme_only_keeps_everything_else() {
        let factory = ResourceFactory::change_scheme_only("wss");
        let out = factory
            .create(&url("ws-draft+ssl://example.com:9000/path?q=1"))
            .unwrap();

        assert_eq!(out.as_str(), "wss://example.com:9000/path?q=1");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ResourceFactory::keep_authority_only("tcp").to_string(),
            "keepAuthorityOnly(tcp)"
        );
        assert_eq!(
            ResourceFactory::change_scheme_only("ws").to_string(),
            "changeSchemeOnly(ws)"
        );
    }
}
