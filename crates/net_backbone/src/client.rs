//! Connection handling for a game client process.
//!
//! A client talks to one server at a time: the lobby first, then a channel.
//! [`ClientConnectionManager`] owns that single link. Game logic asks it to
//! connect with `ConnectToLobby` / `ConnectToChannel` messages and hears back
//! through `ConnectedToLobby`, `ConnectedToChannel` and `Disconnected` on a
//! separate notification queue.

use crate::connection::{Connection, ConnectionId, ConnectionRole, Connector};
use crate::error::ConnectionError;
use crate::manager::Manager;
use crate::message::{ClientMessage, ConnectionMessage, Message, MessageType};
use crate::packet::Packet;
use crate::queue::MessageQueue;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Lobby,
    Channel,
}

struct ActiveLink {
    connection: Arc<Connection>,
    connection_id: String,
    kind: LinkKind,
}

pub struct ClientConnectionManager {
    connector: Connector,
    /// Queue the link reports into; the worker this manager is registered on.
    own_queue: Weak<MessageQueue>,
    notify_queue: Weak<MessageQueue>,
    active: Mutex<Option<ActiveLink>>,
}

impl ClientConnectionManager {
    pub fn new(
        connector: Connector,
        own_queue: &Arc<MessageQueue>,
        notify_queue: &Arc<MessageQueue>,
    ) -> Self {
        Self {
            connector,
            own_queue: Arc::downgrade(own_queue),
            notify_queue: Arc::downgrade(notify_queue),
            active: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| link.connection.is_encrypted())
    }

    /// The current link, connected or still handshaking.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.active.lock().as_ref().map(|link| link.connection.clone())
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<(), ConnectionError> {
        self.connection()
            .ok_or(ConnectionError::Closed)?
            .send_packet(packet)
    }

    pub fn send_packets(&self, packets: &[Packet]) -> Result<(), ConnectionError> {
        self.connection()
            .ok_or(ConnectionError::Closed)?
            .send_packets(packets)
    }

    /// Closes the current link. `Disconnected` follows once it is down.
    pub fn close_connection(&self) {
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    fn connect(&self, kind: LinkKind, connection_id: &str, address: SocketAddr) {
        let Some(queue) = self.own_queue.upgrade() else {
            debug!("client queue is gone, ignoring connect request");
            return;
        };

        let connection = self.connector.connect(address, ConnectionRole::Client, &queue);
        info!(connection = %connection.id(), server = %address, kind = ?kind, "connecting");

        let previous = self.active.lock().replace(ActiveLink {
            connection,
            connection_id: connection_id.to_string(),
            kind,
        });
        if let Some(previous) = previous {
            previous.connection.close();
        }
    }

    fn notify(&self, message: ClientMessage) {
        if let Some(queue) = self.notify_queue.upgrade() {
            if queue.enqueue(Message::Client(message)).is_err() {
                debug!("notification queue shut down");
            }
        }
    }

    fn on_encrypted(&self, id: ConnectionId) -> bool {
        let link = self
            .active
            .lock()
            .as_ref()
            .filter(|link| link.connection.id() == id)
            .map(|link| (link.kind, link.connection_id.clone()));

        let Some((kind, connection_id)) = link else {
            return false;
        };
        self.notify(match kind {
            LinkKind::Lobby => ClientMessage::ConnectedToLobby { connection_id },
            LinkKind::Channel => ClientMessage::ConnectedToChannel { connection_id },
        });
        true
    }

    fn on_closed(&self, id: ConnectionId) -> bool {
        let closed = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|link| link.connection.id() == id) {
                active.take()
            } else {
                None
            }
        };

        match closed {
            Some(link) => {
                self.notify(ClientMessage::Disconnected {
                    connection_id: link.connection_id,
                });
                true
            }
            // A link replaced by a newer connect request; nothing to report.
            None => true,
        }
    }
}

impl Manager for ClientConnectionManager {
    fn supported_types(&self) -> &[MessageType] {
        &[MessageType::Connection, MessageType::Client]
    }

    fn process_message(&self, message: &Message) -> bool {
        match message {
            Message::Client(ClientMessage::ConnectToLobby {
                connection_id,
                address,
            }) => {
                self.connect(LinkKind::Lobby, connection_id, *address);
                true
            }
            Message::Client(ClientMessage::ConnectToChannel {
                connection_id,
                address,
            }) => {
                self.connect(LinkKind::Channel, connection_id, *address);
                true
            }
            Message::Connection(ConnectionMessage::Encrypted(connection)) => {
                self.on_encrypted(connection.id())
            }
            Message::Connection(ConnectionMessage::Closed(closed)) => self.on_closed(closed.id),
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        "ClientConnectionManager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(own: &Arc<MessageQueue>, notify: &Arc<MessageQueue>) -> ClientConnectionManager {
        ClientConnectionManager::new(
            Connector::new(tokio::runtime::Handle::current()),
            own,
            notify,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_lobby_connect_reports_disconnected() {
        let own = Arc::new(MessageQueue::new());
        let notify = Arc::new(MessageQueue::new());
        let manager = manager(&own, &notify);

        // Bind then drop a listener so the port refuses connections.
        let address = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        assert!(manager.process_message(&Message::Client(ClientMessage::ConnectToLobby {
            connection_id: "lobby".to_string(),
            address,
        })));
        assert!(!manager.is_connected());

        let closed = tokio::task::spawn_blocking(move || own.dequeue_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("closed message");
        assert_eq!(closed.subtype(), "connection-closed");
        assert!(manager.process_message(&closed));

        assert_eq!(
            notify.try_dequeue().map(|message| message.subtype()),
            Some("disconnected")
        );
        assert!(manager.connection().is_none());
        assert_eq!(
            manager.send_packet(&Packet::with_code(1)),
            Err(ConnectionError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encrypted_from_a_stale_link_is_not_claimed() {
        let own = Arc::new(MessageQueue::new());
        let notify = Arc::new(MessageQueue::new());
        let manager = manager(&own, &notify);

        let (stranger, _commands) =
            crate::connection::tests::encrypted(ConnectionRole::Client, &own);
        assert!(!manager.process_message(&Message::Connection(ConnectionMessage::Encrypted(
            stranger
        ))));
        assert!(notify.try_dequeue().is_none());
    }
}
