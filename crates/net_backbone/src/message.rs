//! Messages carried by worker queues.
//!
//! Every unit of work a worker sees is a [`Message`]. The outer variant is the
//! routing discriminant ([`MessageType`]); managers declare which
//! discriminants they accept and the worker never inspects anything deeper.

use crate::connection::{Connection, ConnectionId, ConnectionRole};
use crate::packet::{PacketRead, ReadOnlyPacket};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Routing discriminant of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A decoded packet received on a connection
    Packet,
    /// Connection lifecycle events
    Connection,
    /// Control-plane messages for the worker itself
    System,
    /// Events exchanged with the game client's logic
    Client,
    /// Events exchanged between server processes
    Internal,
}

/// A unit of work placed on a [`crate::MessageQueue`].
pub enum Message {
    Packet(PacketMessage),
    Connection(ConnectionMessage),
    System(SystemMessage),
    Client(ClientMessage),
    Internal(InternalMessage),
}

impl Message {
    /// Wraps a closure to be run directly on the worker thread that dequeues it.
    pub fn execute<F>(task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Message::System(SystemMessage::Execute(Task(Box::new(task))))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Packet(_) => MessageType::Packet,
            Message::Connection(_) => MessageType::Connection,
            Message::System(_) => MessageType::System,
            Message::Client(_) => MessageType::Client,
            Message::Internal(_) => MessageType::Internal,
        }
    }

    /// Finer-grained name of the concrete message kind, for logs.
    pub fn subtype(&self) -> &'static str {
        match self {
            Message::Packet(_) => "packet",
            Message::Connection(ConnectionMessage::Encrypted(_)) => "encrypted",
            Message::Connection(ConnectionMessage::Closed(_)) => "connection-closed",
            Message::System(SystemMessage::Init) => "init",
            Message::System(SystemMessage::Shutdown) => "shutdown",
            Message::System(SystemMessage::Execute(_)) => "execute",
            Message::Client(ClientMessage::ConnectToLobby { .. }) => "connect-to-lobby",
            Message::Client(ClientMessage::ConnectToChannel { .. }) => "connect-to-channel",
            Message::Client(ClientMessage::ConnectedToLobby { .. }) => "connected-to-lobby",
            Message::Client(ClientMessage::ConnectedToChannel { .. }) => "connected-to-channel",
            Message::Client(ClientMessage::Disconnected { .. }) => "disconnected",
            Message::Internal(InternalMessage::WorldNotification { .. }) => "world-notification",
        }
    }

    /// The only message with loop-control significance.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Message::System(SystemMessage::Shutdown))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Packet(packet) => f
                .debug_struct("Packet")
                .field("connection", &packet.connection.id())
                .field("code", &format_args!("0x{:04X}", packet.code))
                .field("size", &packet.packet.size())
                .finish(),
            Message::Connection(ConnectionMessage::Encrypted(connection)) => {
                f.debug_tuple("Encrypted").field(&connection.id()).finish()
            }
            Message::Connection(ConnectionMessage::Closed(closed)) => {
                f.debug_tuple("Closed").field(&closed.id).finish()
            }
            Message::System(_) => write!(f, "System({})", self.subtype()),
            Message::Client(client) => fmt::Debug::fmt(client, f),
            Message::Internal(internal) => fmt::Debug::fmt(internal, f),
        }
    }
}

/// A decoded logical packet and the connection it arrived on.
pub struct PacketMessage {
    pub connection: Arc<Connection>,
    pub code: u16,
    /// The bytes following the packet code.
    pub packet: ReadOnlyPacket,
}

/// Connection lifecycle events.
pub enum ConnectionMessage {
    /// The handshake finished; the connection can now send packets.
    Encrypted(Arc<Connection>),
    /// The connection reached its terminal state.
    Closed(ClosedConnection),
}

/// Identity of a connection that has closed.
///
/// Holds only a weak handle, since the connection may already be gone by the
/// time a worker looks at this.
#[derive(Debug, Clone)]
pub struct ClosedConnection {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub remote_addr: SocketAddr,
    pub handle: Weak<Connection>,
}

impl ClosedConnection {
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.handle.upgrade()
    }
}

pub enum SystemMessage {
    /// First message seen by the main worker when the server starts running.
    Init,
    /// Routed like any other message, then ends the worker loop.
    Shutdown,
    /// Run by the worker itself instead of being routed to managers.
    Execute(Task),
}

/// Deferred work for a worker thread.
pub struct Task(Box<dyn FnOnce() + Send>);

impl Task {
    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task(..)")
    }
}

/// Messages between a game client's connection manager and its game logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ConnectToLobby {
        connection_id: String,
        address: SocketAddr,
    },
    ConnectToChannel {
        connection_id: String,
        address: SocketAddr,
    },
    ConnectedToLobby {
        connection_id: String,
    },
    ConnectedToChannel {
        connection_id: String,
    },
    Disconnected {
        connection_id: String,
    },
}

/// Messages exchanged between server processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalMessage {
    /// A world server announced itself; open an internal link back to it.
    WorldNotification { address: SocketAddr },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn discriminants_follow_the_outer_variant() {
        let shutdown = Message::System(SystemMessage::Shutdown);
        assert_eq!(shutdown.message_type(), MessageType::System);
        assert!(shutdown.is_shutdown());
        assert_eq!(shutdown.subtype(), "shutdown");

        let notify = Message::Internal(InternalMessage::WorldNotification {
            address: "127.0.0.1:18666".parse().unwrap(),
        });
        assert_eq!(notify.message_type(), MessageType::Internal);
        assert!(!notify.is_shutdown());

        let client = Message::Client(ClientMessage::ConnectedToLobby {
            connection_id: "lobby".into(),
        });
        assert_eq!(client.message_type(), MessageType::Client);
        assert_eq!(client.subtype(), "connected-to-lobby");
    }

    #[test]
    fn execute_runs_the_wrapped_closure_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let message = Message::execute(move || flag.store(true, Ordering::SeqCst));

        assert_eq!(message.subtype(), "execute");
        match message {
            Message::System(SystemMessage::Execute(task)) => task.run(),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
