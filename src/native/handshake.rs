//! The HTTP/1.1 opening handshake shared by the acceptor and the connector.
use base64::prelude::*;
use hyper::{header, HeaderMap, Response, StatusCode};
use sha1::{Digest, Sha1};

use crate::{address::Protocol, GatewayError, Result};

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn sec_websocket_accept(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11"); // magic string
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// A fresh random `Sec-WebSocket-Key`.
pub(crate) fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

fn header_is(headers: &HeaderMap, name: header::HeaderName, value: &str) -> bool {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case(value))
        .unwrap_or(false)
}

/// `Connection` is a token list, e.g. `keep-alive, Upgrade`.
fn connection_upgrades(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Validates a client upgrade request for `protocol` and returns the accept key to answer with.
pub(crate) fn negotiate(headers: &HeaderMap, protocol: Protocol) -> Result<String> {
    if !header_is(headers, header::UPGRADE, "websocket") {
        return Err(GatewayError::InvalidUpgradeHeader);
    }

    if !connection_upgrades(headers) {
        return Err(GatewayError::InvalidConnectionHeader);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(GatewayError::MissingSecWebSocketKey)?;

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    if !protocol.accepts_version(version.trim()) {
        return Err(GatewayError::InvalidSecWebsocketVersion);
    }

    Ok(sec_websocket_accept(key.as_bytes()))
}

/// Checks the server's answer to our upgrade request carrying `key`.
pub(crate) fn verify<B>(response: &Response<B>, key: &str) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(GatewayError::InvalidStatusCode(response.status().as_u16()));
    }

    let headers = response.headers();
    if !header_is(headers, header::UPGRADE, "websocket") {
        return Err(GatewayError::InvalidUpgradeHeader);
    }

    if !connection_upgrades(headers) {
        return Err(GatewayError::InvalidConnectionHeader);
    }

    let expected = sec_websocket_accept(key.as_bytes());
    if !header_is(headers, header::SEC_WEBSOCKET_ACCEPT, &expected) {
        return Err(GatewayError::InvalidSecWebsocketAccept);
    }

    Ok(())
}

/// The user name of an HTTP Basic `Authorization` header, if the request carries one.
///
/// The password is not checked here.
pub(crate) fn basic_auth_principal(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = BASE64_STANDARD.decode(credentials.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let user = decoded.split(':').next()?;
    (!user.is_empty()).then(|| user.to_string())
}

/// Builds a Basic `Authorization` value for `user` and `password`.
pub(crate) fn basic_auth(user: &str, password: Option<&str>) -> String {
    let credentials = format!("{}:{}", user, password.unwrap_or_default());
    format!("Basic {}", BASE64_STANDARD.encode(credentials))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn upgrade_headers(version: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static(version));
        headers
    }

    #[test]
    fn test_accept_key() {
        // RFC 6455 section 1.3
        assert_eq!(
            sec_websocket_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generated_keys_are_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_negotiate_versions() {
        assert!(negotiate(&upgrade_headers("13"), Protocol::Rfc6455).is_ok());
        assert!(matches!(
            negotiate(&upgrade_headers("8"), Protocol::Rfc6455),
            Err(GatewayError::InvalidSecWebsocketVersion)
        ));

        for version in ["7", "8", "13"] {
            assert_eq!(
                negotiate(&upgrade_headers(version), Protocol::Draft7x).unwrap(),
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
        }
    }

    #[test]
    fn test_negotiate_rejects_bad_requests() {
        let mut headers = upgrade_headers("13");
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert!(matches!(
            negotiate(&headers, Protocol::Rfc6455),
            Err(GatewayError::MissingSecWebSocketKey)
        ));

        let mut headers = upgrade_headers("13");
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(matches!(
            negotiate(&headers, Protocol::Rfc6455),
            Err(GatewayError::InvalidUpgradeHeader)
        ));

        let mut headers = upgrade_headers("13");
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(matches!(
            negotiate(&headers, Protocol::Rfc6455),
            Err(GatewayError::InvalidConnectionHeader)
        ));
    }

    #[test]
    fn test_verify() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_ACCEPT, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            .body(())
            .unwrap();
        assert!(verify(&response, key).is_ok());
        assert!(matches!(
            verify(&response, "AAAAAAAAAAAAAAAAAAAAAA=="),
            Err(GatewayError::InvalidSecWebsocketAccept)
        ));

        let response = Response::builder()
            .status(StatusCode::FORBIDDEN)
            .body(())
            .unwrap();
        assert!(matches!(
            verify(&response, key),
            Err(GatewayError::InvalidStatusCode(403))
        ));
    }

    #[test]
    fn test_basic_auth_principal() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_auth_principal(&headers), None);

        let value = basic_auth("joe", Some("welcome"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        assert_eq!(basic_auth_principal(&headers).as_deref(), Some("joe"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(basic_auth_principal(&headers), None);
    }
}
