//! Configuration file handling
//!
//! The node reads a TOML file with `[server]`, `[[listeners]]`, `[upstream]`,
//! `[liveness]` and `[logging]` sections. A missing file is replaced by the
//! defaults, written to disk so they can be edited.

use crate::cli::Args;
use anyhow::{bail, Context, Result};
use net_backbone::crypto::DEFAULT_DH_PRIME;
use net_backbone::{
    AssignmentPolicy, ConnectionRole, ListenerConfig, ServerConfig, UpstreamConfig,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub listeners: Vec<ListenerSettings>,
    pub upstream: Option<UpstreamSettings>,
    #[serde(default)]
    pub liveness: LivenessSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    /// Process name used in logs and thread names
    pub name: String,
    /// Pool workers; 0 picks one per spare CPU core
    #[serde(default)]
    pub worker_count: usize,
    /// "round-robin" or "least-busy"
    #[serde(default = "default_assignment")]
    pub assignment: String,
    /// I/O runtime threads; 0 lets the runtime decide
    #[serde(default)]
    pub io_threads: usize,
    pub max_connections: usize,
    pub handshake_timeout_secs: u64,
    pub max_unit_size: usize,
    #[serde(default)]
    pub use_reuse_port: bool,
    /// Diffie-Hellman prime as 256 hex digits
    #[serde(default)]
    pub dh_prime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerSettings {
    pub address: String,
    /// "client" or "internal"
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamSettings {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LivenessSettings {
    /// Client connections silent for this long are closed
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

fn default_assignment() -> String {
    AssignmentPolicy::RoundRobin.to_string()
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            client_timeout_secs: 30,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                name: "backbone".to_string(),
                worker_count: 0,
                assignment: default_assignment(),
                io_threads: 0,
                max_connections: 4096,
                handshake_timeout_secs: 10,
                max_unit_size: 1024 * 1024,
                use_reuse_port: false,
                dh_prime: None,
            },
            listeners: vec![ListenerSettings {
                address: "127.0.0.1:10666".to_string(),
                role: ConnectionRole::Client.to_string(),
            }],
            upstream: None,
            liveness: LivenessSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or writes and returns the defaults if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
        } else {
            warn!("Configuration file not found: {}, using defaults", path.display());
            let config = AppConfig::default();
            let content = toml::to_string_pretty(&config).context("failed to render default config")?;
            std::fs::write(path, content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            match self.listeners.first_mut() {
                Some(first) => first.address = listen.to_string(),
                None => self.listeners.push(ListenerSettings {
                    address: listen.to_string(),
                    role: ConnectionRole::Client.to_string(),
                }),
            }
        }
        if let Some(upstream) = args.upstream {
            self.upstream = Some(UpstreamSettings {
                address: upstream.to_string(),
            });
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            bail!("unknown log level '{}'", self.logging.level);
        }
        if self.liveness.client_timeout_secs == 0 {
            bail!("liveness.client_timeout_secs must be non-zero");
        }
        self.to_server_config()?
            .validate()
            .context("invalid server configuration")?;
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness.client_timeout_secs)
    }

    pub fn to_server_config(&self) -> Result<ServerConfig> {
        let listeners = self
            .listeners
            .iter()
            .map(|listener| {
                let address: SocketAddr = listener
                    .address
                    .parse()
                    .with_context(|| format!("invalid listener address '{}'", listener.address))?;
                let role: ConnectionRole = listener.role.parse().map_err(anyhow::Error::msg)?;
                Ok(ListenerConfig { address, role })
            })
            .collect::<Result<Vec<_>>>()?;

        let upstream = self
            .upstream
            .as_ref()
            .map(|upstream| {
                upstream
                    .address
                    .parse()
                    .map(|address| UpstreamConfig { address })
                    .with_context(|| format!("invalid upstream address '{}'", upstream.address))
            })
            .transpose()?;

        let assignment: AssignmentPolicy = self
            .server
            .assignment
            .parse()
            .map_err(anyhow::Error::msg)?;

        Ok(ServerConfig {
            name: self.server.name.clone(),
            listeners,
            upstream,
            worker_count: self.server.worker_count,
            assignment,
            dh_prime: self
                .server
                .dh_prime
                .clone()
                .unwrap_or_else(|| DEFAULT_DH_PRIME.to_string()),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            max_connections: self.server.max_connections,
            max_unit_size: self.server.max_unit_size,
            io_threads: self.server.io_threads,
            use_reuse_port: self.server.use_reuse_port,
        })
    }
}
