use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{
    body::Incoming,
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};

use super::{driver, handshake, Options};
use crate::{
    address::{Protocol, ResourceAddress},
    filter::Service,
    session::{Session, SessionHandle, SessionInfo},
    stream::MaybeTlsStream,
    Role,
};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Everything an accept loop needs to turn connections into sessions.
pub(crate) struct Acceptor<F> {
    pub(crate) address: Arc<ResourceAddress>,
    pub(crate) protocol: Protocol,
    pub(crate) options: Options,
    pub(crate) factory: F,
}

pub(crate) async fn accept_loop<F, S>(listener: TcpListener, acceptor: Arc<Acceptor<F>>)
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service + 'static,
{
    let mut delay = ACCEPT_BACKOFF_MIN;
    loop {
        match listener.accept().await {
            Ok((tcp, remote)) => {
                tokio::spawn(Arc::clone(&acceptor).serve(tcp, remote));
                delay = ACCEPT_BACKOFF_MIN;
            }
            Err(err) => {
                // per connection failures (reset before accept, fd exhaustion) leave the socket usable
                log::warn!("accepting on {}: {}", acceptor.address, err);
                sleep(delay).await;
                delay = (delay * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }
}

impl<F, S> Acceptor<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Service + 'static,
{
    async fn serve(self: Arc<Self>, tcp: TcpStream, remote: SocketAddr) {
        if let Err(err) = tcp.set_nodelay(self.options.no_delay) {
            log::debug!("{}: setting TCP_NODELAY: {}", remote, err);
        }

        let stream = match (&self.options.tls_acceptor, self.address.is_secure()) {
            (Some(tls), true) => match tls.accept(tcp).await {
                Ok(stream) => MaybeTlsStream::from(stream),
                Err(err) => {
                    log::debug!("{}: TLS handshake failed: {}", remote, err);
                    return;
                }
            },
            _ => MaybeTlsStream::from(tcp),
        };

        let acceptor = Arc::clone(&self);
        let service = service_fn(move |req| {
            let acceptor = Arc::clone(&acceptor);
            async move { Ok::<_, Infallible>(acceptor.handle(req, remote)) }
        });

        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            log::debug!("{}: serving connection: {}", remote, err);
        }
    }

    /// Answers one HTTP request: either rejects it or switches it to a WebSocket session.
    fn handle(&self, mut req: Request<Incoming>, remote: SocketAddr) -> Response<Empty<Bytes>> {
        if req.uri().path() != self.address.path() {
            return status(StatusCode::NOT_FOUND);
        }

        let accept = match handshake::negotiate(req.headers(), self.protocol) {
            Ok(accept) => accept,
            Err(err) => {
                log::debug!("{}: rejecting upgrade: {}", remote, err);
                return status(StatusCode::BAD_REQUEST);
            }
        };

        let principal = handshake::basic_auth_principal(req.headers());
        if !self.options.authorizer.is_authorized(principal.as_deref()) {
            log::debug!("{}: principal {:?} is not authorized", remote, principal);
            return status(StatusCode::FORBIDDEN);
        }

        let Ok(accept) = HeaderValue::from_str(&accept) else {
            return status(StatusCode::INTERNAL_SERVER_ERROR);
        };

        let info = SessionInfo::new(Role::Server, Arc::clone(&self.address)).with_remote(remote);
        let mut session = match Session::websocket(info, &self.options, (self.factory)()) {
            Ok(session) => session,
            Err(err) => {
                log::warn!("{}: creating session: {}", remote, err);
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let (handle, commands) = SessionHandle::new(session.id());
        session.set_handle(handle);

        let on_upgrade = hyper::upgrade::on(&mut req);
        let options = self.options.clone();
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    session.transport_error(err.into());
                    return;
                }
            };

            if session
                .open(options.authorizer.as_ref(), principal.as_deref())
                .is_err()
            {
                return;
            }

            driver::run(TokioIo::new(upgraded), session, commands, options).await;
        });

        let mut response = status(StatusCode::SWITCHING_PROTOCOLS);
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        response
    }
}

fn status(code: StatusCode) -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = code;
    response
}
