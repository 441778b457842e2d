//! Connects to the echo gateway, sends a few messages and closes.
//!
//! Usage: `cargo run --example client -- ws://127.0.0.1:8080/echo`

use tokio::sync::mpsc;
use wsgate::{CloseCode, Gateway, Message, Options, Outbox, Service, SessionInfo};

/// Forwards every message to the main task.
struct Forward(mpsc::UnboundedSender<Message>);

impl Service for Forward {
    fn message_received(
        &mut self,
        _session: &SessionInfo,
        message: Message,
        _out: &mut Outbox,
    ) -> wsgate::Result<()> {
        let _ = self.0.send(message);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Debug)?;

    let location = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080/echo".to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let gateway = Gateway::new(Options::default());
    let connection = gateway.connect(&location, Forward(tx)).await?;

    for i in 0..3 {
        connection.send(Message::text(format!("hello {i}")))?;
        if let Some(message) = rx.recv().await {
            log::info!("received: {}", message.as_str()?);
        }
    }

    connection.close(CloseCode::Normal, "done")?;
    connection.closed().await?;
    Ok(())
}
