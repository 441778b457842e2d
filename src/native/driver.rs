use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedReceiver,
    time::{sleep_until, Instant},
};

use super::Options;
use crate::{
    pipeline::IdleStatus,
    session::{Command, Session},
};

const READ_CHUNK: usize = 8 * 1024;

/// Drives `session` over `io` until it is closed.
///
/// One loop iteration writes whatever the session queued, then waits for the first of: bytes
/// from the peer, a command from a [`SessionHandle`](crate::session::SessionHandle), the close
/// deadline or the idle deadline.
pub(crate) async fn run<IO>(
    mut io: IO,
    mut session: Session,
    mut commands: UnboundedReceiver<Command>,
    options: Options,
) where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    log::debug!("session {}: running ({})", session.id(), session.info());

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut last_activity = Instant::now();
    let mut close_deadline: Option<Instant> = None;

    loop {
        if let Err(err) = flush(&mut io, &mut session, &mut last_activity).await {
            session.transport_error(err.into());
            break;
        }

        if session.should_shutdown() {
            if let Err(err) = io.shutdown().await {
                log::trace!("session {}: shutdown: {}", session.id(), err);
            }
            break;
        }

        if session.awaiting_close() && close_deadline.is_none() {
            close_deadline = Some(Instant::now() + options.close_timeout);
        }
        let idle_deadline = options.idle_timeout.map(|timeout| last_activity + timeout);

        buf.reserve(READ_CHUNK);
        tokio::select! {
            res = io.read_buf(&mut buf) => match res {
                Ok(0) => {
                    log::debug!("session {}: peer hung up", session.id());
                    break;
                }
                Ok(_) => {
                    last_activity = Instant::now();
                    session.receive(buf.split().freeze());
                }
                Err(err) => {
                    session.transport_error(err.into());
                    break;
                }
            },
            Some(command) = commands.recv() => session.command(command),
            _ = deadline(close_deadline) => session.close_timed_out(),
            _ = deadline(idle_deadline) => session.idle(IdleStatus::Both),
        }
    }

    session.transport_closed();
    log::debug!("session {}: closed ({:?})", session.id(), session.stats());
}

/// Writes every queued byte, reporting each batch to the session.
async fn flush<IO>(
    io: &mut IO,
    session: &mut Session,
    last_activity: &mut Instant,
) -> std::io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    if !session.has_outbound() {
        return Ok(());
    }

    while session.has_outbound() {
        let bytes = session.take_outbound();
        io.write_all(&bytes).await?;
        session.flushed(bytes.len());
    }
    io.flush().await?;

    *last_activity = Instant::now();
    Ok(())
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::ResourceAddressFactory,
        close::CloseCode,
        codec::{Decoder, Encoder},
        filter::{Outbox, Service},
        frame::{Frame, OpCode},
        message::Message,
        session::{SessionHandle, SessionInfo},
        Result, Role,
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio_util::codec::Encoder as _;

    struct Echo;

    impl Service for Echo {
        fn message_received(
            &mut self,
            _session: &SessionInfo,
            message: Message,
            out: &mut Outbox,
        ) -> Result<()> {
            out.send(message);
            Ok(())
        }
    }

    fn spawn_server(options: Options) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<()>) {
        let address = ResourceAddressFactory::default()
            .resolve("ws://localhost:8080/echo")
            .unwrap();
        let info = SessionInfo::new(Role::Server, address);
        let mut session = Session::websocket(info, &options, Echo).unwrap();
        let (handle, commands) = SessionHandle::new(session.id());
        session.set_handle(handle);
        session.open(&crate::AllowAll, None).unwrap();

        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(run(server, session, commands, options));
        (client, task)
    }

    async fn read_frames(io: &mut tokio::io::DuplexStream, decoder: &mut Decoder) -> Vec<Frame> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            let n = io.read_buf(&mut buf).await.unwrap();
            assert_ne!(n, 0, "server hung up before sending a frame");
            let frames = decoder.decode_all(&mut buf).unwrap();
            if !frames.is_empty() {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_echo_and_close() {
        let (mut client, task) = spawn_server(Options::default());
        let mut encoder = Encoder::new(Role::Client);
        let mut decoder = Decoder::new(Role::Client, 1024);

        let mut out = BytesMut::new();
        encoder.encode(Frame::text("hello"), &mut out).unwrap();
        client.write_all(&out).await.unwrap();

        let frames = read_frames(&mut client, &mut decoder).await;
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(frames[0].payload, Bytes::from("hello"));

        let mut out = BytesMut::new();
        encoder
            .encode(Frame::close(CloseCode::Normal, "bye"), &mut out)
            .unwrap();
        client.write_all(&out).await.unwrap();

        let frames = read_frames(&mut client, &mut decoder).await;
        assert_eq!(frames[0].close_code(), Some(CloseCode::Normal));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let options = Options::default().with_idle_timeout(Duration::from_millis(50));
        let (mut client, task) = spawn_server(options);
        let mut decoder = Decoder::new(Role::Client, 1024);

        let frames = read_frames(&mut client, &mut decoder).await;
        assert_eq!(frames[0].close_code(), Some(CloseCode::Away));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_timeout() {
        let options = Options::default().with_close_timeout(Duration::from_millis(50));
        let address = ResourceAddressFactory::default()
            .resolve("ws://localhost:8080/echo")
            .unwrap();
        let info = SessionInfo::new(Role::Server, address);
        let mut session = Session::websocket(info, &options, Echo).unwrap();
        let (handle, commands) = SessionHandle::new(session.id());
        session.set_handle(handle.clone());
        session.open(&crate::AllowAll, None).unwrap();

        let (mut client, server) = duplex(64 * 1024);
        let task = tokio::spawn(run(server, session, commands, options));

        handle.close(CloseCode::Normal, "done").unwrap();
        let mut decoder = Decoder::new(Role::Client, 1024);
        let frames = read_frames(&mut client, &mut decoder).await;
        assert_eq!(frames[0].close_code(), Some(CloseCode::Normal));

        // never answered: the deadline tears the session down
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
