//! # Network Backbone
//!
//! The networking and dispatch layer shared by every server process of the
//! game suite: lobby, channel and world servers, and the links between them.
//! It accepts TCP connections, negotiates an encrypted session on each one,
//! frames and decodes the binary packet protocol, and hands every decoded
//! unit of work to a handler running on a dedicated worker thread. Handlers
//! never touch sockets, ciphers or threads directly.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **[`Packet`] / [`ReadOnlyPacket`]** - Byte buffers with independent read
//!   and write cursors and little-endian codecs
//! * **[`Message`]** - The closed set of work items a worker can receive
//! * **[`MessageQueue`]** - Blocking FIFO with an explicit shutdown signal
//! * **[`Manager`]** - The handler contract: supported types plus one entry point
//! * **[`Worker`]** - One queue, one thread, first-match-wins dispatch
//! * **[`Connection`]** - An encrypted TCP link driven by its own I/O task
//! * **[`Server`]** - Listeners, the worker pool and the main worker
//! * **[`ManagerConnection`]** - Registry of live connections by identity
//!
//! ### Message Flow
//!
//! 1. A listener accepts a socket and the pool assigns it a worker queue
//! 2. The connection performs the Diffie-Hellman handshake
//! 3. `Encrypted` is queued on the assigned worker
//! 4. Every decoded packet becomes a `Packet` message on the same queue
//! 5. The worker offers each message to its managers in registration order
//! 6. When the socket goes away, `Closed` is queued exactly once
//!
//! A handler answers through [`Connection::send_packet`] or
//! [`Connection::queue_packet`] followed by [`Connection::flush_outgoing`].
//!
//! ## Wire Format
//!
//! Every transmission unit is a little-endian `u32` length followed by the
//! body. Handshake units are plaintext control packets. After the handshake
//! each body is Blowfish ciphertext carrying one or more logical packets,
//! each a `u16` size, a `u16` packet code and the packet body. See
//! [`connection`] for the details.
//!
//! ## Error Handling
//!
//! Errors never cross a queue. Transport and protocol failures end the
//! connection and surface as a `Closed` message; managers report failure by
//! returning `false`; unclaimed messages are logged and dropped. Losing the
//! upstream internal link shuts the whole server down.

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod manager;
pub mod manager_connection;
pub mod message;
pub mod packet;
pub mod packet_manager;
pub mod queue;
pub mod server;
pub mod worker;

pub use client::ClientConnectionManager;
pub use config::{AssignmentPolicy, ListenerConfig, ServerConfig, UpstreamConfig};
pub use connection::{
    Connection, ConnectionId, ConnectionRole, ConnectionSettings, ConnectionStatus, Connector,
    Direction,
};
pub use crypto::{DhKeyPair, DhParameters, SessionCipher, SharedSecret};
pub use error::{ConnectionError, PacketError, ProtocolError, QueueClosed, ServerError};
pub use manager::Manager;
pub use manager_connection::ManagerConnection;
pub use message::{
    ClientMessage, ClosedConnection, ConnectionMessage, InternalMessage, Message, MessageType,
    PacketMessage, SystemMessage, Task,
};
pub use packet::{Encoding, Packet, PacketRead, ReadOnlyPacket, MAX_PACKET_SIZE};
pub use packet_manager::{PacketManager, PacketManagerBuilder, PacketParser};
pub use queue::MessageQueue;
pub use server::{Server, ServerHandle};
pub use worker::Worker;
