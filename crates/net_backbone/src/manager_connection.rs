//! Connection bookkeeping for a server process.
//!
//! [`ManagerConnection`] reacts to connection lifecycle messages and keeps the
//! registry other handlers use to find the live connection for an account,
//! an entity, or the upstream internal link. Register the same instance on
//! the main worker and on every pool worker so it sees every connection.
//!
//! The registry lock is only ever held for map operations. Connections are
//! closed, hooks are run and new links are dialed after it is released.

use crate::connection::{Connection, ConnectionId, ConnectionRole};
use crate::error::ServerError;
use crate::manager::Manager;
use crate::message::{ConnectionMessage, InternalMessage, Message, MessageType, SystemMessage};
use crate::server::ServerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the client liveness sweep runs.
pub const CLIENT_TIMEOUT_SWEEP_PERIOD: Duration = Duration::from_secs(10);

type UpstreamHook = Box<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    /// Encrypted client connections that have not logged in yet.
    pending: HashMap<ConnectionId, Arc<Connection>>,
    by_username: HashMap<String, Arc<Connection>>,
    usernames: HashMap<ConnectionId, String>,
    by_world_cid: HashMap<i32, Arc<Connection>>,
    by_entity: HashMap<i32, Arc<Connection>>,
    /// `(entity_id, world_cid)` bound to each connection.
    entity_keys: HashMap<ConnectionId, (i32, i32)>,
    upstream: Option<Arc<Connection>>,
    internal_links: HashMap<ConnectionId, Arc<Connection>>,
}

impl Registry {
    fn remove_entity_keys(&mut self, id: ConnectionId) {
        if let Some((entity_id, world_cid)) = self.entity_keys.remove(&id) {
            if self.by_entity.get(&entity_id).is_some_and(|c| c.id() == id) {
                self.by_entity.remove(&entity_id);
            }
            if self.by_world_cid.get(&world_cid).is_some_and(|c| c.id() == id) {
                self.by_world_cid.remove(&world_cid);
            }
        }
    }

    /// Drops every entry that refers to `id`. Returns whether it was the
    /// upstream link.
    fn remove(&mut self, id: ConnectionId) -> bool {
        self.pending.remove(&id);
        if let Some(username) = self.usernames.remove(&id) {
            self.by_username.remove(&username);
        }
        self.remove_entity_keys(id);
        self.internal_links.remove(&id);

        if self.upstream.as_ref().is_some_and(|c| c.id() == id) {
            self.upstream = None;
            return true;
        }
        false
    }

    fn clients(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.pending.values().chain(self.by_username.values())
    }
}

pub struct ManagerConnection {
    server: ServerHandle,
    registry: Mutex<Registry>,
    upstream_hook: Option<UpstreamHook>,
    sweep_scheduled: AtomicBool,
}

impl ManagerConnection {
    pub fn new(server: ServerHandle) -> Self {
        Self {
            server,
            registry: Mutex::new(Registry::default()),
            upstream_hook: None,
            sweep_scheduled: AtomicBool::new(false),
        }
    }

    /// Runs `hook` on the main worker each time the upstream link encrypts.
    pub fn with_upstream_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.upstream_hook = Some(Box::new(hook));
        self
    }

    /// Dials `address` and designates the result as the upstream link.
    pub fn connect_upstream(&self, address: SocketAddr) -> Result<Arc<Connection>, ServerError> {
        info!(upstream = %address, "connecting to upstream");
        let connection = self.server.connect(address, ConnectionRole::Internal)?;
        self.set_upstream_connection(&connection);
        Ok(connection)
    }

    pub fn set_upstream_connection(&self, connection: &Arc<Connection>) {
        self.registry.lock().upstream = Some(connection.clone());
    }

    pub fn get_upstream_connection(&self) -> Option<Arc<Connection>> {
        self.registry.lock().upstream.clone()
    }

    /// Binds `username` to `connection`.
    ///
    /// A different connection already bound to the name is displaced, closed
    /// and returned.
    pub fn set_client_connection(
        &self,
        username: &str,
        connection: &Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let displaced = {
            let mut registry = self.registry.lock();
            let id = connection.id();
            registry.pending.remove(&id);

            if let Some(previous) = registry.usernames.remove(&id) {
                registry.by_username.remove(&previous);
            }

            let displaced = registry
                .by_username
                .insert(username.to_string(), connection.clone())
                .filter(|old| old.id() != id);
            if let Some(old) = &displaced {
                registry.usernames.remove(&old.id());
                registry.remove_entity_keys(old.id());
            }
            registry.usernames.insert(id, username.to_string());
            displaced
        };

        if let Some(old) = &displaced {
            info!(username, old = %old.id(), new = %connection.id(), "account logged in again, closing previous connection");
            old.close();
        }
        displaced
    }

    pub fn get_client_connection(&self, username: &str) -> Option<Arc<Connection>> {
        self.registry.lock().by_username.get(username).cloned()
    }

    /// Forgets every registry entry for `connection` without closing it.
    pub fn remove_client_connection(&self, connection: &Arc<Connection>) {
        self.registry.lock().remove(connection.id());
    }

    /// Binds a logged-in connection to its entity and world character ids.
    pub fn set_entity_client(&self, connection: &Arc<Connection>, entity_id: i32, world_cid: i32) {
        let mut registry = self.registry.lock();
        let id = connection.id();
        registry.remove_entity_keys(id);
        registry.by_entity.insert(entity_id, connection.clone());
        registry.by_world_cid.insert(world_cid, connection.clone());
        registry.entity_keys.insert(id, (entity_id, world_cid));
    }

    /// Looks a client up by world character id or by local entity id.
    pub fn get_entity_client(&self, id: i32, by_world_id: bool) -> Option<Arc<Connection>> {
        let registry = self.registry.lock();
        if by_world_id {
            registry.by_world_cid.get(&id).cloned()
        } else {
            registry.by_entity.get(&id).cloned()
        }
    }

    /// Encrypted client connections, logged in or not.
    pub fn client_count(&self) -> usize {
        let registry = self.registry.lock();
        registry.pending.len() + registry.by_username.len()
    }

    /// Internal links other than the upstream.
    pub fn internal_link_count(&self) -> usize {
        self.registry.lock().internal_links.len()
    }

    /// Closes every client connection that has gone quiet. Returns how many
    /// were closed.
    pub fn handle_client_timeouts(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<Arc<Connection>> = self
            .registry
            .lock()
            .clients()
            .filter(|connection| connection.is_idle(now, timeout))
            .cloned()
            .collect();

        for connection in &expired {
            info!(connection = %connection.id(), remote = %connection.remote_addr(), "client timed out");
            connection.close();
        }
        expired.len()
    }

    /// Runs [`ManagerConnection::handle_client_timeouts`] on the main worker
    /// every [`CLIENT_TIMEOUT_SWEEP_PERIOD`]. Later calls do nothing.
    pub fn schedule_client_timeout_handler(self: &Arc<Self>, timeout: Duration) -> Result<(), ServerError> {
        if self.sweep_scheduled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let queue = self
            .server
            .main_queue()
            .ok_or_else(|| ServerError::Internal("server is gone".to_string()))?;

        let manager = Arc::downgrade(self);
        let scheduled = self
            .server
            .schedule_recurring(CLIENT_TIMEOUT_SWEEP_PERIOD, &queue, move || {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_client_timeouts(Instant::now(), timeout);
                }
            });
        if scheduled.is_err() {
            self.sweep_scheduled.store(false, Ordering::Release);
        }
        scheduled
    }

    fn on_encrypted(&self, connection: &Arc<Connection>) {
        let is_upstream = {
            let mut registry = self.registry.lock();
            if registry.upstream.as_ref().is_some_and(|c| c.id() == connection.id()) {
                true
            } else {
                match connection.role() {
                    ConnectionRole::Client => {
                        registry.pending.insert(connection.id(), connection.clone());
                    }
                    ConnectionRole::Internal => {
                        registry
                            .internal_links
                            .insert(connection.id(), connection.clone());
                    }
                }
                false
            }
        };

        if is_upstream {
            info!(connection = %connection.id(), remote = %connection.remote_addr(), "upstream link established");
            if let Some(hook) = &self.upstream_hook {
                hook(connection);
            }
        } else {
            debug!(connection = %connection.id(), role = %connection.role(), "connection registered");
        }
    }

    fn on_closed(&self, id: ConnectionId) {
        let was_upstream = self.registry.lock().remove(id);
        if was_upstream {
            error!(connection = %id, "upstream link lost, shutting down");
            self.server.shutdown();
        } else {
            debug!(connection = %id, "connection unregistered");
        }
    }

    fn on_world_notification(&self, address: SocketAddr) {
        match self.server.connect(address, ConnectionRole::Internal) {
            Ok(connection) => {
                info!(connection = %connection.id(), world = %address, "connecting to announced world");
            }
            Err(e) => warn!(world = %address, "failed to connect to announced world: {e}"),
        }
    }
}

impl Manager for ManagerConnection {
    fn supported_types(&self) -> &[MessageType] {
        &[MessageType::Connection, MessageType::Internal, MessageType::System]
    }

    fn process_message(&self, message: &Message) -> bool {
        match message {
            Message::Connection(ConnectionMessage::Encrypted(connection)) => {
                self.on_encrypted(connection);
                true
            }
            Message::Connection(ConnectionMessage::Closed(closed)) => {
                self.on_closed(closed.id);
                true
            }
            Message::Internal(InternalMessage::WorldNotification { address }) => {
                self.on_world_notification(*address);
                true
            }
            Message::System(SystemMessage::Init) => {
                if let Some(address) = self.server.upstream_address() {
                    if let Err(e) = self.connect_upstream(address) {
                        error!(upstream = %address, "failed to start upstream connection: {e}");
                        self.server.shutdown();
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn name(&self) -> &'static str {
        "ManagerConnection"
    }
}
