//! The per-connection I/O task.
//!
//! Each connection gets exactly one task on the I/O runtime. It owns the
//! socket halves, the frame decoder and the session cipher, performs the
//! handshake, then multiplexes socket reads with outbound commands until
//! either side ends the session. Whatever the cause, it reports `Closed`
//! before the socket is dropped.

use super::framing::{self, FrameDecoder, DEFAULT_MAX_UNIT_SIZE};
use super::{handshake, Command, Connection, ConnectionRole, ConnectionStatus, Direction};
use crate::crypto::{DhParameters, SessionCipher};
use crate::error::{PacketError, ProtocolError};
use crate::message::{Message, PacketMessage};
use crate::queue::MessageQueue;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Why a connection ended.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// `close()` was called locally.
    Requested,
    /// The peer shut the stream down cleanly between units.
    PeerClosed,
    Transport(io::Error),
    Protocol(ProtocolError),
    /// The task stopped without reaching a normal exit: it panicked or its
    /// runtime dropped it.
    Aborted,
}

impl From<io::Error> for CloseReason {
    fn from(err: io::Error) -> Self {
        CloseReason::Transport(err)
    }
}

impl From<ProtocolError> for CloseReason {
    fn from(err: ProtocolError) -> Self {
        CloseReason::Protocol(err)
    }
}

impl From<PacketError> for CloseReason {
    fn from(err: PacketError) -> Self {
        CloseReason::Protocol(err.into())
    }
}

/// Tunables shared by every connection of a process.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Upper bound on the whole handshake
    pub handshake_timeout: Duration,
    /// Largest transmission unit accepted from a peer
    pub max_unit_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
        }
    }
}

/// Dials outbound connections on a Tokio runtime.
///
/// Used by processes that have no [`crate::Server`] of their own, such as a
/// game client.
#[derive(Debug, Clone)]
pub struct Connector {
    runtime: Handle,
    settings: ConnectionSettings,
}

impl Connector {
    pub fn new(runtime: Handle) -> Self {
        Self::with_settings(runtime, ConnectionSettings::default())
    }

    pub fn with_settings(runtime: Handle, settings: ConnectionSettings) -> Self {
        Self { runtime, settings }
    }

    /// Starts connecting to `address` and returns immediately.
    ///
    /// The result arrives on `queue` as `Encrypted` or `Closed`. A failed
    /// attempt is not retried.
    pub fn connect(
        &self,
        address: SocketAddr,
        role: ConnectionRole,
        queue: &Arc<MessageQueue>,
    ) -> Arc<Connection> {
        let (connection, commands) = Connection::new(role, Direction::Outbound, address, queue);
        self.runtime.spawn(run_outbound(
            connection.clone(),
            commands,
            self.settings.clone(),
        ));
        connection
    }
}

/// Drives a freshly accepted socket until it closes.
pub(crate) async fn run_inbound(
    connection: Arc<Connection>,
    stream: TcpStream,
    commands: UnboundedReceiver<Command>,
    params: Arc<DhParameters>,
    settings: ConnectionSettings,
) {
    if !connection.advance(ConnectionStatus::Connecting) {
        return;
    }
    let _guard = CloseGuard(connection.clone());
    debug!(connection = %connection.id(), remote = %connection.remote_addr(), role = %connection.role(), "accepted");
    drive(connection, stream, commands, Some(params), settings).await;
}

/// Dials the connection's remote address, then drives it until it closes.
pub(crate) async fn run_outbound(
    connection: Arc<Connection>,
    mut commands: UnboundedReceiver<Command>,
    settings: ConnectionSettings,
) {
    if !connection.advance(ConnectionStatus::Connecting) {
        return;
    }
    let _guard = CloseGuard(connection.clone());
    let address = connection.remote_addr();
    debug!(connection = %connection.id(), remote = %address, "connecting");

    let stream = tokio::select! {
        result = TcpStream::connect(address) => match result {
            Ok(stream) => stream,
            Err(e) => {
                finish(&connection, CloseReason::Transport(e));
                return;
            }
        },
        _ = wait_for_close(&mut commands) => {
            finish(&connection, CloseReason::Requested);
            return;
        }
    };

    drive(connection, stream, commands, None, settings).await;
}

async fn drive(
    connection: Arc<Connection>,
    stream: TcpStream,
    mut commands: UnboundedReceiver<Command>,
    params: Option<Arc<DhParameters>>,
    settings: ConnectionSettings,
) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(connection = %connection.id(), "set_nodelay failed: {e}");
    }
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(settings.max_unit_size);

    connection.advance(ConnectionStatus::Connected);

    let handshake = async {
        match &params {
            Some(params) => handshake::accept(params, &mut reader, &mut writer, &mut decoder).await,
            None => handshake::initiate(&mut reader, &mut writer, &mut decoder).await,
        }
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout(settings.handshake_timeout, handshake) => match result {
            Ok(result) => result,
            Err(_) => Err(CloseReason::Protocol(ProtocolError::HandshakeTimeout)),
        },
        _ = wait_for_close(&mut commands) => Err(CloseReason::Requested),
    };

    let cipher = match outcome {
        Ok(cipher) => cipher,
        Err(reason) => {
            finish(&connection, reason);
            return;
        }
    };

    if !connection.advance(ConnectionStatus::Encrypted) {
        finish(&connection, CloseReason::Requested);
        return;
    }
    debug!(connection = %connection.id(), remote = %connection.remote_addr(), "encrypted");
    connection.report_encrypted();

    let reason = session(
        &connection,
        &mut reader,
        &mut writer,
        &mut decoder,
        &mut commands,
        &cipher,
    )
    .await;

    finish(&connection, reason);
    drop(reader);
    drop(writer);
}

async fn session(
    connection: &Arc<Connection>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    decoder: &mut FrameDecoder,
    commands: &mut UnboundedReceiver<Command>,
    cipher: &SessionCipher,
) -> CloseReason {
    // The peer may have sent traffic right behind its last handshake unit.
    if let Err(reason) = deliver(connection, decoder, cipher) {
        return reason;
    }

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    return match decoder.finish() {
                        Ok(()) => CloseReason::PeerClosed,
                        Err(e) => CloseReason::Protocol(e),
                    };
                }
                Ok(n) => {
                    decoder.extend(&buf[..n]);
                    if let Err(reason) = deliver(connection, decoder, cipher) {
                        return reason;
                    }
                }
                Err(e) => return CloseReason::Transport(e),
            },
            command = commands.recv() => match command {
                Some(Command::Send(logical)) => {
                    let unit = match framing::seal(cipher, &logical) {
                        Ok(unit) => unit,
                        Err(e) => return CloseReason::Protocol(e),
                    };
                    if let Err(e) = writer.write_all(&unit).await {
                        return CloseReason::Transport(e);
                    }
                }
                Some(Command::Close) | None => {
                    let _ = writer.shutdown().await;
                    return CloseReason::Requested;
                }
            },
        }
    }
}

/// Decrypts every complete unit and enqueues its packets in order.
fn deliver(
    connection: &Arc<Connection>,
    decoder: &mut FrameDecoder,
    cipher: &SessionCipher,
) -> Result<(), CloseReason> {
    while let Some(unit) = decoder.next_unit()? {
        let packets = framing::open(cipher, unit)?;
        connection.touch();

        for (code, packet) in packets {
            trace!(connection = %connection.id(), code = format_args!("0x{code:04X}"), "packet received");
            connection.report(Message::Packet(PacketMessage {
                connection: connection.clone(),
                code,
                packet,
            }));
        }
    }
    Ok(())
}

/// Resolves once a close is requested; outbound data cannot exist before
/// encryption, so anything else is ignored.
async fn wait_for_close(commands: &mut UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Close) | None => return,
            Some(Command::Send(_)) => continue,
        }
    }
}

/// Reports `Closed` for a connection whose task is dropped before it
/// finished normally.
struct CloseGuard(Arc<Connection>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if !self.0.is_finished() {
            finish(&self.0, CloseReason::Aborted);
        }
    }
}

fn finish(connection: &Connection, reason: CloseReason) {
    match &reason {
        CloseReason::Requested => {
            debug!(connection = %connection.id(), remote = %connection.remote_addr(), "closed locally")
        }
        CloseReason::PeerClosed => {
            debug!(connection = %connection.id(), remote = %connection.remote_addr(), "closed by peer")
        }
        CloseReason::Transport(e) => {
            debug!(connection = %connection.id(), remote = %connection.remote_addr(), "socket error: {e}")
        }
        CloseReason::Protocol(e) => {
            warn!(connection = %connection.id(), remote = %connection.remote_addr(), "protocol error: {e}")
        }
        CloseReason::Aborted => {
            warn!(connection = %connection.id(), remote = %connection.remote_addr(), "I/O task ended abnormally")
        }
    }

    if connection.mark_closed() {
        connection.report_closed();
    } else {
        trace!(connection = %connection.id(), "connection already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::detached;
    use crate::message::ConnectionMessage;

    fn fail() {
        panic!("connection task failed");
    }

    fn expect_closed(queue: &MessageQueue, connection: &Connection) {
        match queue.try_dequeue() {
            Some(Message::Connection(ConnectionMessage::Closed(closed))) => {
                assert_eq!(closed.id, connection.id())
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn panicking_task_still_reports_closed() {
        let queue = Arc::new(MessageQueue::new());
        let (connection, _commands) = detached(ConnectionRole::Internal, &queue);
        assert!(connection.advance(ConnectionStatus::Connecting));

        let guard = CloseGuard(connection.clone());
        let result = tokio::spawn(async move {
            let _guard = guard;
            fail()
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(connection.status(), ConnectionStatus::NotConnected);
        expect_closed(&queue, &connection);
    }

    #[tokio::test]
    async fn cancelled_task_still_reports_closed() {
        let queue = Arc::new(MessageQueue::new());
        let (connection, _commands) = detached(ConnectionRole::Client, &queue);
        assert!(connection.advance(ConnectionStatus::Connecting));

        let guard = CloseGuard(connection.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await
        });
        task.abort();

        assert!(task.await.unwrap_err().is_cancelled());
        expect_closed(&queue, &connection);
    }

    #[test]
    fn guard_is_silent_after_a_normal_finish() {
        let queue = Arc::new(MessageQueue::new());
        let (connection, _commands) = detached(ConnectionRole::Client, &queue);
        assert!(connection.advance(ConnectionStatus::Connecting));

        let guard = CloseGuard(connection.clone());
        finish(&connection, CloseReason::Requested);
        drop(guard);

        expect_closed(&queue, &connection);
    }
}
