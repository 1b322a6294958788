//! Backbone node
//!
//! A runnable server process built on `net_backbone`: it accepts client and
//! internal links, answers the login and keep-alive packets, introduces
//! itself to an upstream server and closes idle clients.

mod cli;
mod config;
mod handlers;
mod logging;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use config::AppConfig;
use net_backbone::{ManagerConnection, Server};
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_create(&args.config)?;
    config.apply_args(&args);
    config.validate().context("invalid configuration")?;

    logging::setup_logging(&config.logging.level, config.logging.json_format)?;
    info!(
        "Starting {} v{} with {}",
        config.server.name,
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let server_config = config.to_server_config()?;
    let node_name = server_config.name.clone();
    let mut server = Server::new(server_config).context("failed to create server")?;
    let handle = server.handle();

    let registry = Arc::new(
        ManagerConnection::new(handle.clone())
            .with_upstream_hook(handlers::request_upstream_description),
    );
    let packets = Arc::new(handlers::packet_manager(registry.clone(), node_name));

    // Outbound links report to the main queue, so it parses packets too.
    server.add_manager(registry.clone());
    server.add_manager(packets.clone());
    server.add_worker_manager(registry.clone());
    server.add_worker_manager(packets);

    registry
        .schedule_client_timeout_handler(config.client_timeout())
        .context("failed to schedule client timeouts")?;

    let signal_handle = handle.clone();
    server.runtime_handle().spawn(async move {
        match signals::wait_for_shutdown_signal().await {
            Ok(()) => signal_handle.shutdown(),
            Err(e) => error!("Signal handling failed: {}", e),
        }
    });

    for address in server.bind().context("failed to bind listeners")? {
        info!("Listening on {}", address);
    }

    server.run().context("server terminated with an error")?;
    info!("Server shutdown complete");
    Ok(())
}
