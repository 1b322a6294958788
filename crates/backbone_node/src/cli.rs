//! Command-line argument parsing
//!
//! Every option overrides the matching value from the configuration file.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments for a backbone node
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// If the file doesn't exist, a default configuration is written there.
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Address of the first listener, e.g. "0.0.0.0:10666"
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Internal server to connect to at startup
    #[arg(short, long)]
    pub upstream: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config.toml"),
            listen: None,
            upstream: None,
            log_level: None,
            json_logs: false,
        }
    }
}
