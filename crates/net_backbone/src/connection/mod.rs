//! Encrypted TCP connections.
//!
//! A [`Connection`] is the handle that workers and managers see. The socket
//! and the session cipher never leave the connection's I/O task (see
//! [`io`]); handlers reach the wire only through [`Connection::send_packet`],
//! [`Connection::queue_packet`] / [`Connection::flush_outgoing`] and
//! [`Connection::close`], all of which hand work to that task over a channel
//! and are safe to call from any thread.
//!
//! ## Lifecycle
//!
//! ```text
//! NotConnected -> Connecting -> Connected -> Encrypted
//!        ^             |            |           |
//!        +-------------+------------+-----------+   (terminal)
//! ```
//!
//! Reaching `Encrypted` enqueues [`ConnectionMessage::Encrypted`] on the
//! assigned queue. Reaching the terminal `NotConnected` enqueues
//! [`ConnectionMessage::Closed`] exactly once. The I/O task is the only
//! producer of messages for its connection, so those two events and every
//! packet in between arrive in wire order.
//!
//! The I/O task holds the strong reference to its connection while it runs.
//! The connection keeps only a weak reference to itself and to its queue.

mod framing;
mod handshake;
mod io;

pub use framing::DEFAULT_MAX_UNIT_SIZE;
pub use io::{ConnectionSettings, Connector};

pub(crate) use io::{run_inbound, run_outbound};

use crate::error::ConnectionError;
use crate::message::{ClosedConnection, ConnectionMessage, Message};
use crate::packet::{Packet, PacketRead};
use crate::queue::MessageQueue;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuilds an id from [`ConnectionId::get`], e.g. when read back from a log.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which packet-code table a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// A game client
    Client,
    /// Another server process
    Internal,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionRole::Client => "client",
            ConnectionRole::Internal => "internal",
        })
    }
}

impl FromStr for ConnectionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(ConnectionRole::Client),
            "internal" => Ok(ConnectionRole::Internal),
            other => Err(format!("unknown connection role '{other}'")),
        }
    }
}

/// Whether the connection was accepted or dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Where a connection is in its lifecycle. See the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected,
    Encrypted,
}

impl ConnectionStatus {
    /// Legal single steps of the lifecycle, ignoring whether the connection
    /// has already finished once.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Encrypted)
                | (Connecting, NotConnected)
                | (Connected, NotConnected)
                | (Encrypted, NotConnected)
        )
    }
}

struct StatusCell {
    status: ConnectionStatus,
    finished: bool,
}

/// Work handed to the I/O task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Coalesced logical packets to encrypt as one transmission unit.
    Send(Vec<u8>),
    Close,
}

/// Shared handle to one encrypted TCP link.
///
/// Created by the server's accept loop or by a dial, always behind an `Arc`.
pub struct Connection {
    id: ConnectionId,
    role: ConnectionRole,
    direction: Direction,
    remote_addr: SocketAddr,
    name: RwLock<String>,
    state: Mutex<StatusCell>,
    queue: RwLock<Weak<MessageQueue>>,
    outgoing: Mutex<Vec<u8>>,
    commands: mpsc::UnboundedSender<Command>,
    last_activity: Mutex<Instant>,
    deadline: Mutex<Option<Instant>>,
    self_ref: Weak<Connection>,
}

impl Connection {
    /// Creates a connection in `NotConnected` reporting into `queue`, plus the
    /// command receiver its I/O task must own.
    pub(crate) fn new(
        role: ConnectionRole,
        direction: Direction,
        remote_addr: SocketAddr,
        queue: &Arc<MessageQueue>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::next();

        let connection = Arc::new_cyclic(|self_ref| Self {
            id,
            role,
            direction,
            remote_addr,
            name: RwLock::new(format!("{role}-{}", id.0)),
            state: Mutex::new(StatusCell {
                status: ConnectionStatus::NotConnected,
                finished: false,
            }),
            queue: RwLock::new(Arc::downgrade(queue)),
            outgoing: Mutex::new(Vec::new()),
            commands,
            last_activity: Mutex::new(Instant::now()),
            deadline: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Human-readable label used in logs.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Replaces the log label, e.g. with the account name after login.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_encrypted(&self) -> bool {
        self.status() == ConnectionStatus::Encrypted
    }

    /// A strong handle to this connection, if it is still alive.
    pub fn handle(&self) -> Option<Arc<Connection>> {
        self.self_ref.upgrade()
    }

    /// The queue this connection reports into, unless it has been dropped.
    pub fn message_queue(&self) -> Option<Arc<MessageQueue>> {
        self.queue.read().upgrade()
    }

    /// Redirects future lifecycle and packet messages to another queue.
    pub fn set_message_queue(&self, queue: &Arc<MessageQueue>) {
        *self.queue.write() = Arc::downgrade(queue);
    }

    /// Appends one logical packet to the outgoing buffer without sending it.
    ///
    /// The packet must start with its 16-bit packet code.
    pub fn queue_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        if self.is_finished() {
            return Err(ConnectionError::Closed);
        }
        let mut outgoing = self.outgoing.lock();
        framing::append_logical(&mut outgoing, packet.bytes())
    }

    /// Sends everything queued so far as one encrypted transmission unit.
    pub fn flush_outgoing(&self) -> Result<(), ConnectionError> {
        match self.status() {
            ConnectionStatus::Encrypted => {}
            ConnectionStatus::NotConnected if self.is_finished() => {
                return Err(ConnectionError::Closed)
            }
            _ => return Err(ConnectionError::NotEncrypted),
        }

        let pending = std::mem::take(&mut *self.outgoing.lock());
        if pending.is_empty() {
            return Ok(());
        }

        trace!(connection = %self.id, bytes = pending.len(), "flushing outgoing packets");
        self.commands
            .send(Command::Send(pending))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Queues `packet` and flushes it as its own transmission unit.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the unit is handed to the I/O task
    /// * `Err(ConnectionError::NotEncrypted)` before the handshake completes
    /// * `Err(ConnectionError::Closed)` once the connection has finished
    pub fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.queue_packet(packet)?;
        self.flush_outgoing()
    }

    /// Queues several packets and sends them coalesced into one unit.
    pub fn send_packets(&self, packets: &[Packet]) -> Result<(), ConnectionError> {
        for packet in packets {
            self.queue_packet(packet)?;
        }
        self.flush_outgoing()
    }

    /// Asks the I/O task to drop the socket. Safe to call repeatedly and from
    /// any thread; the `Closed` message follows asynchronously.
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            trace!(connection = %self.id, "close requested after I/O task ended");
        }
    }

    /// Sets an explicit liveness deadline `seconds` after `now`.
    pub fn refresh_timeout(&self, now: Instant, seconds: u64) {
        *self.deadline.lock() = Some(now + Duration::from_secs(seconds));
    }

    /// The deadline set by [`Connection::refresh_timeout`], if any.
    pub fn timeout_deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// When the last packet arrived on this connection.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether the connection has gone quiet: past its explicit deadline if one
    /// was set, otherwise `timeout` after its last received packet.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        match self.timeout_deadline() {
            Some(deadline) => deadline <= now,
            None => self.last_activity() + timeout <= now,
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Moves to `next` if that is a legal step. Returns whether it moved.
    pub(crate) fn advance(&self, next: ConnectionStatus) -> bool {
        let mut state = self.state.lock();
        if state.finished || !state.status.can_transition_to(next) {
            trace!(connection = %self.id, from = ?state.status, to = ?next, "rejected status change");
            return false;
        }
        state.status = next;
        if next == ConnectionStatus::NotConnected {
            state.finished = true;
        }
        true
    }

    /// Enters the terminal state. Only the first call returns `true`.
    pub(crate) fn mark_closed(&self) -> bool {
        self.advance(ConnectionStatus::NotConnected)
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Delivers a message to the assigned queue, if it is still around.
    pub(crate) fn report(&self, message: Message) {
        let Some(queue) = self.message_queue() else {
            debug!(connection = %self.id, subtype = message.subtype(), "no queue assigned, dropping message");
            return;
        };
        if queue.enqueue(message).is_err() {
            debug!(connection = %self.id, "queue shut down, dropping message");
        }
    }

    pub(crate) fn report_encrypted(&self) {
        if let Some(this) = self.handle() {
            self.report(Message::Connection(ConnectionMessage::Encrypted(this)));
        }
    }

    pub(crate) fn report_closed(&self) {
        self.report(Message::Connection(ConnectionMessage::Closed(
            ClosedConnection {
                id: self.id,
                role: self.role,
                remote_addr: self.remote_addr,
                handle: self.self_ref.clone(),
            },
        )));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status())
            .finish()
    }
}
