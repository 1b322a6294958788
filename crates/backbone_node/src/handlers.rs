//! Packet tables for the node
//!
//! Client table:
//!
//! | code     | packet      | reply                            |
//! |----------|-------------|----------------------------------|
//! | `0x0001` | Login       | `0x0002` LoginReply `u32 result` |
//! | `0x0003` | KeepAlive   | `0x0004` echoing the `u32` stamp |
//!
//! Internal table:
//!
//! | code     | packet          | reply                          |
//! |----------|-----------------|--------------------------------|
//! | `0x1001` | DescribeRequest | `0x1002` DescribeReply `name`  |
//! | `0x1002` | DescribeReply   | none, the name is logged       |

use net_backbone::{
    Connection, Encoding, ManagerConnection, Packet, PacketManager, PacketRead, ReadOnlyPacket,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const LOGIN: u16 = 0x0001;
pub const LOGIN_REPLY: u16 = 0x0002;
pub const KEEP_ALIVE: u16 = 0x0003;
pub const KEEP_ALIVE_REPLY: u16 = 0x0004;
pub const DESCRIBE_REQUEST: u16 = 0x1001;
pub const DESCRIBE_REPLY: u16 = 0x1002;

pub const LOGIN_OK: u32 = 0;
pub const LOGIN_EMPTY_NAME: u32 = 1;

/// Seconds a keep-alive extends the client's deadline by.
pub const KEEP_ALIVE_EXTENSION_SECS: u64 = 10;

pub fn packet_manager(registry: Arc<ManagerConnection>, node_name: String) -> PacketManager {
    PacketManager::builder()
        .client(LOGIN, move |connection, packet| {
            login(&registry, connection, packet)
        })
        .client(KEEP_ALIVE, keep_alive)
        .internal(DESCRIBE_REQUEST, move |connection, _| {
            describe(&node_name, connection)
        })
        .internal(DESCRIBE_REPLY, describe_reply)
        .build()
}

/// Hook for the upstream link: introduce ourselves as soon as it encrypts.
pub fn request_upstream_description(connection: &Arc<Connection>) {
    if let Err(e) = connection.send_packet(&Packet::with_code(DESCRIBE_REQUEST)) {
        warn!(connection = %connection.id(), "failed to query upstream: {}", e);
    }
}

fn login(
    registry: &ManagerConnection,
    connection: &Arc<Connection>,
    packet: &mut ReadOnlyPacket,
) -> bool {
    let Ok(username) = packet.read_string16(Encoding::Utf8) else {
        return false;
    };

    let result = if username.is_empty() {
        LOGIN_EMPTY_NAME
    } else {
        connection.set_name(username.as_str());
        if registry.set_client_connection(&username, connection).is_some() {
            info!(username = %username, "login displaced an older session");
        }
        info!(connection = %connection.id(), username = %username, "client logged in");
        LOGIN_OK
    };

    let mut reply = Packet::with_code(LOGIN_REPLY);
    reply.write_u32_le(result).is_ok() && send_reply(connection, &reply)
}

fn keep_alive(connection: &Arc<Connection>, packet: &mut ReadOnlyPacket) -> bool {
    if packet.left() != 4 {
        return false;
    }
    let Ok(stamp) = packet.read_u32_le() else {
        return false;
    };

    connection.refresh_timeout(Instant::now(), KEEP_ALIVE_EXTENSION_SECS);

    let mut reply = Packet::with_code(KEEP_ALIVE_REPLY);
    reply.write_u32_le(stamp).is_ok() && send_reply(connection, &reply)
}

fn describe(node_name: &str, connection: &Arc<Connection>) -> bool {
    let mut reply = Packet::with_code(DESCRIBE_REPLY);
    reply.write_string16(Encoding::Utf8, node_name, false).is_ok() && send_reply(connection, &reply)
}

/// Sends `reply`. The request itself was well formed, so a connection that is
/// already closing only gets a log line.
fn send_reply(connection: &Arc<Connection>, reply: &Packet) -> bool {
    if let Err(e) = connection.send_packet(reply) {
        debug!(connection = %connection.id(), "reply dropped: {}", e);
    }
    true
}

fn describe_reply(connection: &Arc<Connection>, packet: &mut ReadOnlyPacket) -> bool {
    let Ok(name) = packet.read_string16(Encoding::Utf8) else {
        return false;
    };
    debug!(connection = %connection.id(), "peer described itself");
    info!(remote = %connection.remote_addr(), peer = %name, "connected to {}", name);
    connection.set_name(name);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use net_backbone::{
        ConnectionMessage, ConnectionRole, Connector, ListenerConfig, Message, MessageQueue,
        Server, ServerConfig, ServerHandle,
    };
    use std::net::SocketAddr;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    struct Node {
        handle: ServerHandle,
        client: SocketAddr,
        internal: SocketAddr,
        registry: Arc<ManagerConnection>,
        runner: Option<JoinHandle<()>>,
    }

    impl Node {
        fn start() -> Self {
            let mut server = Server::new(ServerConfig {
                name: "lobby-test".to_string(),
                listeners: vec![
                    ListenerConfig {
                        address: "127.0.0.1:0".parse().unwrap(),
                        role: ConnectionRole::Client,
                    },
                    ListenerConfig {
                        address: "127.0.0.1:0".parse().unwrap(),
                        role: ConnectionRole::Internal,
                    },
                ],
                worker_count: 1,
                io_threads: 1,
                ..ServerConfig::default()
            })
            .unwrap();

            let handle = server.handle();
            let registry = Arc::new(ManagerConnection::new(handle.clone()));
            let packets = Arc::new(packet_manager(registry.clone(), "lobby-test".to_string()));
            server.add_worker_manager(registry.clone());
            server.add_worker_manager(packets);
            server.add_manager(registry.clone());

            let addrs = server.bind().unwrap().to_vec();
            let runner = thread::spawn(move || server.run().unwrap());

            Self {
                handle,
                client: addrs[0],
                internal: addrs[1],
                registry,
                runner: Some(runner),
            }
        }
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.handle.shutdown();
            if let Some(runner) = self.runner.take() {
                let _ = runner.join();
            }
        }
    }

    fn dial(address: SocketAddr, role: ConnectionRole) -> (tokio::runtime::Runtime, Arc<Connection>, Arc<MessageQueue>) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = Arc::new(MessageQueue::new());
        let connection = Connector::new(runtime.handle().clone()).connect(address, role, &queue);
        match queue.dequeue_timeout(Duration::from_secs(5)) {
            Some(Message::Connection(ConnectionMessage::Encrypted(_))) => {}
            other => panic!("expected encrypted, got {other:?}"),
        }
        (runtime, connection, queue)
    }

    fn reply(queue: &MessageQueue, code: u16) -> ReadOnlyPacket {
        match queue.dequeue_timeout(Duration::from_secs(5)) {
            Some(Message::Packet(message)) => {
                assert_eq!(message.code, code);
                message.packet
            }
            other => panic!("expected packet 0x{code:04X}, got {other:?}"),
        }
    }

    #[test]
    fn test_login_binds_username() {
        let node = Node::start();
        let (_runtime, connection, queue) = dial(node.client, ConnectionRole::Client);

        let mut login = Packet::with_code(LOGIN);
        login.write_string16(Encoding::Utf8, "alice", false).unwrap();
        connection.send_packet(&login).unwrap();

        let mut answer = reply(&queue, LOGIN_REPLY);
        assert_eq!(answer.read_u32_le().unwrap(), LOGIN_OK);
        assert!(node.registry.get_client_connection("alice").is_some());
    }

    #[test]
    fn test_empty_login_is_refused() {
        let node = Node::start();
        let (_runtime, connection, queue) = dial(node.client, ConnectionRole::Client);

        let mut login = Packet::with_code(LOGIN);
        login.write_string16(Encoding::Utf8, "", false).unwrap();
        connection.send_packet(&login).unwrap();

        let mut answer = reply(&queue, LOGIN_REPLY);
        assert_eq!(answer.read_u32_le().unwrap(), LOGIN_EMPTY_NAME);
        assert!(node.registry.get_client_connection("").is_none());
    }

    #[test]
    fn test_keep_alive_echoes_stamp() {
        let node = Node::start();
        let (_runtime, connection, queue) = dial(node.client, ConnectionRole::Client);

        let mut ping = Packet::with_code(KEEP_ALIVE);
        ping.write_u32_le(77).unwrap();
        connection.send_packet(&ping).unwrap();

        let mut answer = reply(&queue, KEEP_ALIVE_REPLY);
        assert_eq!(answer.read_u32_le().unwrap(), 77);
    }

    #[test]
    fn test_short_keep_alive_closes_connection() {
        let node = Node::start();
        let (_runtime, connection, queue) = dial(node.client, ConnectionRole::Client);

        let mut ping = Packet::with_code(KEEP_ALIVE);
        ping.write_u16_le(77).unwrap();
        connection.send_packet(&ping).unwrap();

        match queue.dequeue_timeout(Duration::from_secs(5)) {
            Some(Message::Connection(ConnectionMessage::Closed(closed))) => {
                assert_eq!(closed.id, connection.id())
            }
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_to_a_closed_connection_is_not_malformed() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = Arc::new(MessageQueue::new());
        let refused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = refused.local_addr().unwrap();
        drop(refused);

        let connection =
            Connector::new(runtime.handle().clone()).connect(address, ConnectionRole::Client, &queue);
        match queue.dequeue_timeout(Duration::from_secs(5)) {
            Some(Message::Connection(ConnectionMessage::Closed(_))) => {}
            other => panic!("expected closed, got {other:?}"),
        }

        let mut ping = Packet::new();
        ping.write_u32_le(5).unwrap();
        assert!(keep_alive(&connection, &mut ping.freeze()));
        assert!(describe("lobby-test", &connection));

        let mut short = Packet::new();
        short.write_u16_le(5).unwrap();
        assert!(!keep_alive(&connection, &mut short.freeze()));
    }

    #[test]
    fn test_internal_peer_gets_node_name() {
        let node = Node::start();
        let (_runtime, connection, queue) = dial(node.internal, ConnectionRole::Internal);

        request_upstream_description(&connection);

        let mut answer = reply(&queue, DESCRIBE_REPLY);
        assert_eq!(answer.read_string16(Encoding::Utf8).unwrap(), "lobby-test");
    }
}
