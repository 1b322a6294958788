//! The server: listeners, the worker pool, the main worker, and the I/O
//! runtime that drives every connection.
//!
//! # Threads
//!
//! * **I/O runtime**: a multi-threaded Tokio runtime owned by the server.
//!   Accept loops, connection tasks and recurring timers run here.
//! * **Pool workers**: one OS thread each. Accepted connections report into
//!   one of them, picked by the configured [`AssignmentPolicy`].
//! * **Main worker**: runs on the thread that calls [`Server::run`] and
//!   handles control-plane messages such as `Init`, scheduled tasks and the
//!   lifecycle of outbound links.
//!
//! # Shutdown
//!
//! [`ServerHandle::shutdown`] may be called from anywhere, any number of
//! times. It stops the accept loops and queues `Shutdown` on the main
//! worker. Once the main worker has processed it, [`Server::run`] closes
//! every connection, stops the pool and the runtime, and returns.

mod listener;
mod pool;

use crate::config::{AssignmentPolicy, ServerConfig};
use crate::connection::{
    run_inbound, run_outbound, Connection, ConnectionId, ConnectionRole, ConnectionSettings,
    Connector, Direction,
};
use crate::crypto::DhParameters;
use crate::error::ServerError;
use crate::manager::Manager;
use crate::message::{Message, SystemMessage};
use crate::queue::MessageQueue;
use crate::worker::Worker;
use dashmap::DashMap;
use pool::WorkerPool;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How long [`Server::run`] waits for connections to report `Closed` before
/// the pool is stopped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct ServerShared {
    config: ServerConfig,
    dh: Arc<DhParameters>,
    settings: ConnectionSettings,
    runtime: Handle,
    main_worker: Worker,
    pool: WorkerPool,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Accepted sockets still running; outbound links are not counted.
    inbound: AtomicUsize,
    shutdown_sender: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl ServerShared {
    fn request_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(server = %self.config.name, "shutdown requested");
        let _ = self.shutdown_sender.send(());
        self.main_worker.shutdown();
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, address: SocketAddr, role: ConnectionRole) {
        if self.inbound.fetch_add(1, Ordering::AcqRel) >= self.config.max_connections {
            self.inbound.fetch_sub(1, Ordering::AcqRel);
            warn!(remote = %address, limit = self.config.max_connections, "connection limit reached, dropping");
            return;
        }

        let queue = match self.pool.assign() {
            Ok(queue) => queue,
            Err(e) => {
                self.inbound.fetch_sub(1, Ordering::AcqRel);
                error!(remote = %address, "failed to assign a worker: {e}");
                return;
            }
        };

        let (connection, commands) = Connection::new(role, Direction::Inbound, address, &queue);
        self.track(&connection);
        let task = run_inbound(
            connection.clone(),
            stream,
            commands,
            self.dh.clone(),
            self.settings.clone(),
        );
        self.spawn_tracked(&connection, task);
    }

    fn connect(
        self: &Arc<Self>,
        address: SocketAddr,
        role: ConnectionRole,
        queue: &Arc<MessageQueue>,
    ) -> Result<Arc<Connection>, ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::Internal("server is shutting down".to_string()));
        }

        let (connection, commands) = Connection::new(role, Direction::Outbound, address, queue);
        self.track(&connection);
        let task = run_outbound(connection.clone(), commands, self.settings.clone());
        self.spawn_tracked(&connection, task);
        Ok(connection)
    }

    fn track(&self, connection: &Arc<Connection>) {
        self.connections.insert(connection.id(), connection.clone());
    }

    /// Runs a connection task and forgets the connection once it ends, even
    /// if the task panicked.
    fn spawn_tracked<F>(self: &Arc<Self>, connection: &Arc<Connection>, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = connection.id();
        let inbound = connection.direction() == Direction::Inbound;
        let shared = Arc::downgrade(self);
        let task = self.runtime.spawn(task);

        self.runtime.spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(connection = %id, "connection task panicked");
                }
            }
            if let Some(shared) = shared.upgrade() {
                shared.forget(id, inbound);
            }
        });
    }

    fn forget(&self, id: ConnectionId, inbound: bool) {
        if self.connections.remove(&id).is_some() && inbound {
            self.inbound.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    role: ConnectionRole,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => shared.accept(stream, address, role),
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    error!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => {
                debug!(role = %role, "accept loop stopped");
                break;
            }
        }
    }
}

/// A network server process.
///
/// ```no_run
/// use net_backbone::{Server, ServerConfig};
///
/// let server = Server::new(ServerConfig::default())?;
/// let handle = server.handle();
/// // register managers, hand `handle` to whatever triggers shutdown ...
/// server.run()?;
/// # Ok::<(), net_backbone::ServerError>(())
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    runtime: Option<Runtime>,
    bound: Vec<SocketAddr>,
    stopped: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let dh = Arc::new(config.dh_parameters()?);

        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name(format!("{}-io", config.name));
        if config.io_threads > 0 {
            builder.worker_threads(config.io_threads);
        }
        let runtime = builder
            .build()
            .map_err(|e| ServerError::Internal(format!("Failed to start I/O runtime: {e}")))?;

        let pool = WorkerPool::new(&config.name, config.effective_worker_count(), config.assignment);
        let (shutdown_sender, _) = broadcast::channel(1);

        info!(
            server = %config.name,
            workers = pool.len(),
            assignment = %config.assignment,
            "server created"
        );

        let shared = Arc::new(ServerShared {
            settings: config.connection_settings(),
            main_worker: Worker::new(format!("{}-main", config.name)),
            runtime: runtime.handle().clone(),
            config,
            dh,
            pool,
            connections: DashMap::new(),
            inbound: AtomicUsize::new(0),
            shutdown_sender,
            shutting_down: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            runtime: Some(runtime),
            bound: Vec::new(),
            stopped: false,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Registers a manager on the main worker.
    pub fn add_manager(&self, manager: Arc<dyn Manager>) {
        self.shared.main_worker.add_manager(manager);
    }

    /// Registers a manager on every pool worker.
    pub fn add_worker_manager(&self, manager: Arc<dyn Manager>) {
        self.shared.pool.add_manager(manager);
    }

    pub fn main_queue(&self) -> Arc<MessageQueue> {
        self.shared.main_worker.message_queue()
    }

    pub fn runtime_handle(&self) -> Handle {
        self.shared.runtime.clone()
    }

    /// Addresses actually bound, in listener order. Empty before [`Server::bind`].
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }

    /// Binds every configured listener and starts accepting.
    ///
    /// Called by [`Server::run`] if it has not been called already; calling it
    /// first lets the caller learn ephemeral ports before blocking.
    pub fn bind(&mut self) -> Result<&[SocketAddr], ServerError> {
        if !self.bound.is_empty() || self.shared.config.listeners.is_empty() {
            return Ok(&self.bound);
        }
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ServerError::Internal("server already stopped".to_string()))?;
        let _guard = runtime.enter();

        let mut bound = Vec::with_capacity(self.shared.config.listeners.len());
        for listener_config in &self.shared.config.listeners {
            let listeners = listener::bind(listener_config.address, self.shared.config.use_reuse_port)?;
            if let Some(first) = listeners.first() {
                bound.push(first.local_addr()?);
            }

            for listener in listeners {
                let shutdown = self.shared.shutdown_sender.subscribe();
                runtime.spawn(accept_loop(
                    self.shared.clone(),
                    listener,
                    listener_config.role,
                    shutdown,
                ));
            }
        }

        self.bound = bound;
        Ok(&self.bound)
    }

    /// Runs the main worker on the calling thread until shutdown, then tears
    /// everything down.
    pub fn run(mut self) -> Result<(), ServerError> {
        self.bind()?;
        info!(server = %self.shared.config.name, addresses = ?self.bound, "server running");

        if self
            .shared
            .main_worker
            .message_queue()
            .enqueue(Message::System(SystemMessage::Init))
            .is_err()
        {
            debug!("shutdown requested before startup");
        }
        self.shared.main_worker.run();

        self.stop();
        info!(server = %self.shared.config.name, "server stopped");
        Ok(())
    }

    /// Same as [`ServerHandle::shutdown`].
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.request_shutdown();

        // Let connections report `Closed` while the pool still listens.
        self.shared.close_all();
        let deadline = Instant::now() + CLOSE_GRACE;
        while !self.shared.connections.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !self.shared.connections.is_empty() {
            warn!(remaining = self.shared.connections.len(), "connections still open at shutdown");
        }

        self.shared.pool.shutdown();
        self.shared.pool.join();

        if let Some(runtime) = self.runtime.take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(CLOSE_GRACE);
            }
        }
        self.shared.connections.clear();
        self.shared.inbound.store(0, Ordering::Release);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A cheap, clonable reference to a running [`Server`].
///
/// Holds only a weak reference; every operation becomes a no-op or an error
/// once the server is gone.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Weak<ServerShared>,
}

impl ServerHandle {
    /// A handle to no server at all.
    pub fn detached() -> Self {
        Self { shared: Weak::new() }
    }

    fn upgrade(&self) -> Result<Arc<ServerShared>, ServerError> {
        self.shared
            .upgrade()
            .ok_or_else(|| ServerError::Internal("server is gone".to_string()))
    }

    /// Stops accepting and asks the main worker to finish. Idempotent.
    pub fn shutdown(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.request_shutdown();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_shutting_down())
            .unwrap_or(true)
    }

    pub fn name(&self) -> Option<String> {
        self.shared.upgrade().map(|shared| shared.config.name.clone())
    }

    pub fn upstream_address(&self) -> Option<SocketAddr> {
        self.shared
            .upgrade()
            .and_then(|shared| shared.config.upstream.as_ref().map(|upstream| upstream.address))
    }

    pub fn assignment_policy(&self) -> Option<AssignmentPolicy> {
        self.shared.upgrade().map(|shared| shared.config.assignment)
    }

    pub fn main_queue(&self) -> Option<Arc<MessageQueue>> {
        self.shared
            .upgrade()
            .map(|shared| shared.main_worker.message_queue())
    }

    /// Number of connections, accepted or dialed, whose I/O task is still
    /// running.
    pub fn connection_count(&self) -> usize {
        self.shared
            .upgrade()
            .map(|shared| shared.connections.len())
            .unwrap_or(0)
    }

    /// Dials an internal or client link that reports to the main worker.
    pub fn connect(
        &self,
        address: SocketAddr,
        role: ConnectionRole,
    ) -> Result<Arc<Connection>, ServerError> {
        let shared = self.upgrade()?;
        let queue = shared.main_worker.message_queue();
        shared.connect(address, role, &queue)
    }

    /// Dials a link that reports to `queue`.
    pub fn connect_to(
        &self,
        address: SocketAddr,
        role: ConnectionRole,
        queue: &Arc<MessageQueue>,
    ) -> Result<Arc<Connection>, ServerError> {
        self.upgrade()?.connect(address, role, queue)
    }

    /// A connector sharing this server's runtime and connection settings.
    pub fn connector(&self) -> Result<Connector, ServerError> {
        let shared = self.upgrade()?;
        Ok(Connector::with_settings(
            shared.runtime.clone(),
            shared.settings.clone(),
        ))
    }

    /// Runs `task` on the worker that owns `queue` every `period`, starting one
    /// period from now.
    ///
    /// Stops when the queue shuts down or the server begins shutting down.
    pub fn schedule_recurring<F>(
        &self,
        period: Duration,
        queue: &Arc<MessageQueue>,
        task: F,
    ) -> Result<(), ServerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(ServerError::Config("recurring period must be non-zero".to_string()));
        }
        let shared = self.upgrade()?;
        if shared.is_shutting_down() {
            return Err(ServerError::Internal("server is shutting down".to_string()));
        }

        let queue = Arc::downgrade(queue);
        let task = Arc::new(task);
        let mut shutdown = shared.shutdown_sender.subscribe();

        shared.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(queue) = queue.upgrade() else { break };
                        let task = task.clone();
                        if queue.enqueue(Message::execute(move || task())).is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("recurring action stopped");
        });
        Ok(())
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}
