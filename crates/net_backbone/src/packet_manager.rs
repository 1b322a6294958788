//! Routes received packets to parsers by connection role and packet code.

use crate::connection::{Connection, ConnectionRole};
use crate::manager::Manager;
use crate::message::{Message, MessageType};
use crate::packet::ReadOnlyPacket;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Handles one packet code. Returning `false` marks the packet as malformed.
pub type PacketParser = Box<dyn Fn(&Arc<Connection>, &mut ReadOnlyPacket) -> bool + Send + Sync>;

/// A [`Manager`] for `Packet` messages backed by per-role parser tables.
///
/// Tables are fixed once built. An unknown code is a routing miss and the
/// packet is dropped; a parser that rejects its packet gets the connection
/// closed.
pub struct PacketManager {
    client: HashMap<u16, PacketParser>,
    internal: HashMap<u16, PacketParser>,
}

impl PacketManager {
    pub fn builder() -> PacketManagerBuilder {
        PacketManagerBuilder::default()
    }

    fn table(&self, role: ConnectionRole) -> &HashMap<u16, PacketParser> {
        match role {
            ConnectionRole::Client => &self.client,
            ConnectionRole::Internal => &self.internal,
        }
    }

    pub fn handles(&self, role: ConnectionRole, code: u16) -> bool {
        self.table(role).contains_key(&code)
    }
}

impl Manager for PacketManager {
    fn supported_types(&self) -> &[MessageType] {
        &[MessageType::Packet]
    }

    fn process_message(&self, message: &Message) -> bool {
        let Message::Packet(packet) = message else {
            return false;
        };
        let connection = &packet.connection;

        let Some(parser) = self.table(connection.role()).get(&packet.code) else {
            trace!(connection = %connection.id(), code = format_args!("0x{:04X}", packet.code), "no parser registered");
            return false;
        };

        // Each dispatch gets its own cursor over the shared bytes.
        let mut body = packet.packet.clone();
        if parser(connection, &mut body) {
            return true;
        }

        warn!(
            connection = %connection.id(),
            remote = %connection.remote_addr(),
            code = format_args!("0x{:04X}", packet.code),
            "malformed packet, closing connection"
        );
        connection.close();
        false
    }

    fn name(&self) -> &'static str {
        "PacketManager"
    }
}

#[derive(Default)]
pub struct PacketManagerBuilder {
    client: HashMap<u16, PacketParser>,
    internal: HashMap<u16, PacketParser>,
}

impl PacketManagerBuilder {
    /// Registers a parser for a client-facing packet code.
    pub fn client<F>(mut self, code: u16, parser: F) -> Self
    where
        F: Fn(&Arc<Connection>, &mut ReadOnlyPacket) -> bool + Send + Sync + 'static,
    {
        self.client.insert(code, Box::new(parser));
        self
    }

    /// Registers a parser for a server-to-server packet code.
    pub fn internal<F>(mut self, code: u16, parser: F) -> Self
    where
        F: Fn(&Arc<Connection>, &mut ReadOnlyPacket) -> bool + Send + Sync + 'static,
    {
        self.internal.insert(code, Box::new(parser));
        self
    }

    pub fn build(self) -> PacketManager {
        PacketManager {
            client: self.client,
            internal: self.internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::encrypted;
    use crate::message::PacketMessage;
    use crate::packet::PacketRead;
    use crate::queue::MessageQueue;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn packet_message(connection: &Arc<Connection>, code: u16, body: &[u8]) -> Message {
        Message::Packet(PacketMessage {
            connection: connection.clone(),
            code,
            packet: ReadOnlyPacket::new(body.to_vec()),
        })
    }

    #[test]
    fn parsers_are_selected_by_role_and_code() {
        let seen = Arc::new(AtomicU32::new(0));
        let client_seen = seen.clone();
        let manager = PacketManager::builder()
            .client(0x0003, move |_, packet| match packet.read_u32_le() {
                Ok(value) => {
                    client_seen.store(value, Ordering::SeqCst);
                    true
                }
                Err(_) => false,
            })
            .build();

        let queue = Arc::new(MessageQueue::new());
        let (client, _client_commands) = encrypted(ConnectionRole::Client, &queue);
        let (internal, _internal_commands) = encrypted(ConnectionRole::Internal, &queue);

        assert!(manager.process_message(&packet_message(&client, 0x0003, &[9, 0, 0, 0])));
        assert_eq!(seen.load(Ordering::SeqCst), 9);

        // Same code, wrong table.
        assert!(!manager.process_message(&packet_message(&internal, 0x0003, &[1, 0, 0, 0])));
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert!(manager.handles(ConnectionRole::Client, 0x0003));
        assert!(!manager.handles(ConnectionRole::Internal, 0x0003));
    }

    #[test]
    fn unknown_codes_leave_the_connection_open() {
        let manager = PacketManager::builder().build();
        let queue = Arc::new(MessageQueue::new());
        let (client, mut commands) = encrypted(ConnectionRole::Client, &queue);

        assert!(!manager.process_message(&packet_message(&client, 0x7777, &[])));
        assert!(commands.try_recv().is_err());
    }

    #[test]
    fn rejected_packets_close_the_connection() {
        let manager = PacketManager::builder()
            .internal(0x1001, |_, packet| packet.read_u8().is_ok())
            .build();
        let queue = Arc::new(MessageQueue::new());
        let (internal, mut commands) = encrypted(ConnectionRole::Internal, &queue);

        assert!(!manager.process_message(&packet_message(&internal, 0x1001, &[])));
        assert!(matches!(
            commands.try_recv(),
            Ok(crate::connection::Command::Close)
        ));
    }
}
