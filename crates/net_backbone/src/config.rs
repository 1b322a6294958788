//! Server configuration.
//!
//! [`ServerConfig`] is a plain struct; loading it from files or the command
//! line is up to the embedding process.

use crate::connection::{ConnectionRole, ConnectionSettings, DEFAULT_MAX_UNIT_SIZE};
use crate::crypto::{DhParameters, DEFAULT_DH_PRIME};
use crate::error::ServerError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// One listening socket and the packet table its connections speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    pub role: ConnectionRole,
}

/// The internal link this process dials at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub address: SocketAddr,
}

/// How accepted connections are spread over the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentPolicy {
    #[default]
    RoundRobin,
    /// The worker with the fewest connections currently assigned.
    LeastBusy,
}

impl fmt::Display for AssignmentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssignmentPolicy::RoundRobin => "round-robin",
            AssignmentPolicy::LeastBusy => "least-busy",
        })
    }
}

impl FromStr for AssignmentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(AssignmentPolicy::RoundRobin),
            "least-busy" => Ok(AssignmentPolicy::LeastBusy),
            other => Err(format!("unknown assignment policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of this process, used in logs and thread names
    pub name: String,
    pub listeners: Vec<ListenerConfig>,
    pub upstream: Option<UpstreamConfig>,
    /// Size of the worker pool; `0` picks one per spare CPU core
    pub worker_count: usize,
    pub assignment: AssignmentPolicy,
    /// Diffie-Hellman prime as 256 hex digits
    pub dh_prime: String,
    pub handshake_timeout: Duration,
    /// Accepted connections beyond this are dropped immediately
    pub max_connections: usize,
    /// Largest transmission unit accepted from a peer
    pub max_unit_size: usize,
    /// Threads of the I/O runtime; `0` lets Tokio decide
    pub io_threads: usize,
    /// Run one accept loop per core on each listener with SO_REUSEPORT
    pub use_reuse_port: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "backbone".to_string(),
            listeners: vec![ListenerConfig {
                address: SocketAddr::from(([127, 0, 0, 1], 10666)),
                role: ConnectionRole::Client,
            }],
            upstream: None,
            worker_count: 0,
            assignment: AssignmentPolicy::RoundRobin,
            dh_prime: DEFAULT_DH_PRIME.to_string(),
            handshake_timeout: Duration::from_secs(10),
            max_connections: 4096,
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
            io_threads: 0,
            use_reuse_port: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.listeners.is_empty() && self.upstream.is_none() {
            return Err(ServerError::Config(
                "at least one listener or an upstream is required".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config("handshake timeout must be non-zero".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be non-zero".to_string()));
        }
        if self.max_unit_size < 8 {
            return Err(ServerError::Config(format!(
                "max_unit_size {} is smaller than one cipher block",
                self.max_unit_size
            )));
        }
        self.dh_parameters()?;
        Ok(())
    }

    /// Number of pool workers to create.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            self.worker_count
        } else {
            num_cpus::get().saturating_sub(1).max(1)
        }
    }

    pub fn dh_parameters(&self) -> Result<DhParameters, ServerError> {
        DhParameters::from_hex(&self.dh_prime)
            .map_err(|e| ServerError::Config(format!("dh_prime: {e}")))
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: self.handshake_timeout,
            max_unit_size: self.max_unit_size,
        }
    }
}
