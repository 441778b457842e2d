use std::{io, sync::Arc};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{header, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{ServerName, TrustAnchor},
    },
    TlsConnector,
};
use url::Position;

use super::{driver, handshake, Connection, Options};
use crate::{
    address::ResourceAddress,
    auth::AllowAll,
    filter::Service,
    session::{Session, SessionHandle, SessionInfo},
    stream::MaybeTlsStream,
    GatewayError, Result, Role,
};

/// Opens the transport stack of `address`, performs the upgrade and spawns the session.
pub(crate) async fn connect<S>(
    address: Arc<ResourceAddress>,
    options: &Options,
    service: S,
) -> Result<Connection>
where
    S: Service + 'static,
{
    let not_websocket = || GatewayError::NotWebSocket(address.to_string());
    let ws = address.find_transport("ws").ok_or_else(not_websocket)?;
    let protocol = ws.protocol().ok_or_else(not_websocket)?;
    let tcp = address.find_transport("tcp").ok_or_else(not_websocket)?;

    let tcp_stream = TcpStream::connect(tcp.authority()).await?;
    tcp_stream.set_nodelay(options.no_delay)?;
    let remote = tcp_stream.peer_addr()?;

    let stream = if address.is_secure() {
        let connector = match &options.tls_connector {
            Some(connector) => connector.clone(),
            None => tls_connector()?,
        };
        let domain = server_name(tcp.host())?;
        MaybeTlsStream::from(connector.connect(domain, tcp_stream).await?)
    } else {
        MaybeTlsStream::from(tcp_stream)
    };
    log::debug!("connected to {} ({}, tls: {})", remote, address, stream.is_tls());

    let location = ws.location();
    let key = handshake::generate_key();
    let mut builder = Request::builder()
        .method("GET")
        .uri(&location[Position::BeforePath..])
        .header(header::HOST, ws.authority())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_KEY, key.as_str())
        .header(header::SEC_WEBSOCKET_VERSION, protocol.request_version());

    let principal = Some(location.username()).filter(|user| !user.is_empty());
    if let Some(user) = principal {
        builder = builder.header(
            header::AUTHORIZATION,
            handshake::basic_auth(user, location.password()),
        );
    }
    let req = builder.body(Empty::<Bytes>::new())?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            log::error!("upgrading connection: {:?}", err);
        }
    });

    let mut response = sender.send_request(req).await?;
    handshake::verify(&response, &key)?;

    let upgraded = hyper::upgrade::on(&mut response).await?;

    let info = SessionInfo::new(Role::Client, Arc::clone(&address)).with_remote(remote);
    let mut session = Session::websocket(info, options, service)?;
    let (handle, commands) = SessionHandle::new(session.id());
    session.set_handle(handle.clone());
    session.open(&AllowAll, principal)?;

    let task = tokio::spawn(driver::run(
        TokioIo::new(upgraded),
        session,
        commands,
        options.clone(),
    ));

    Ok(Connection {
        handle,
        address,
        task,
    })
}

/// The TLS server name of `host`; IPv6 literals lose their URL brackets.
fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(host);
    ServerName::try_from(host.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid dnsname").into())
}

/// Creates a TLS connector trusting the webpki roots.
/// If the crypto provider hasn't been set, [*ring*](https://github.com/briansmith/ring) will be used.
fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    // define the provider if any, fallback to ring
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}
