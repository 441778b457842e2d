//! A WebSocket echo gateway.
//! Binds `ws://0.0.0.0:8080/echo` and `ws-draft://0.0.0.0:8081/echo` and echoes back every
//! text or binary message it receives.

use wsgate::{Gateway, Message, Options, Outbox, Service, SessionInfo};

struct Echo;

impl Service for Echo {
    fn session_opened(&mut self, session: &SessionInfo, _out: &mut Outbox) -> wsgate::Result<()> {
        log::info!("client connected: {}", session);
        Ok(())
    }

    fn message_received(
        &mut self,
        _session: &SessionInfo,
        message: Message,
        out: &mut Outbox,
    ) -> wsgate::Result<()> {
        out.send(message);
        Ok(())
    }

    fn session_closed(&mut self, session: &SessionInfo) {
        log::debug!("client disconnected: {}", session);
    }
}

/// Main entry point for the echo gateway.
///
/// Initializes logging and serves both protocol flavours until interrupted.
#[tokio::main]
async fn main() -> wsgate::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let gateway = Gateway::new(
        Options::default()
            .with_max_payload_read(100 * 1024 * 1024)
            .with_max_message_size(200 * 1024 * 1024),
    );

    let rfc6455 = gateway.bind("ws://0.0.0.0:8080/echo", || Echo).await?;
    let draft = gateway.bind("ws-draft://0.0.0.0:8081/echo", || Echo).await?;
    log::debug!(
        "Listening on {} and {}",
        rfc6455.local_addr(),
        draft.local_addr()
    );

    // every event of these sessions is logged
    let traced = Gateway::new(gateway.options().clone().with_session_logging("echo_server"))
        .bind("ws://0.0.0.0:8082/echo", || Echo)
        .await?;
    log::debug!("Tracing sessions on {}", traced.local_addr());

    tokio::try_join!(rfc6455, draft, traced)?;
    Ok(())
}
