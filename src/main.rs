//! dispatch-loop: demo server for the dispatch runtime
//!
//! Serves one of the bundled protocols on a pool of single-threaded event
//! loops:
//! - `ping`: PING/PONG health check
//! - `echo`: length-prefixed echo
//!
//! Configuration via CLI arguments or TOML file.

use dispatch_loop::config::Config;
use dispatch_loop::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        mechanism = ?config.event_loop.mechanism,
        timeout_ms = config.event_loop.timeout.as_millis() as u64,
        workers = config.workers,
        high_water = ?config.high_water,
        "Starting dispatch-loop server"
    );

    let server = Server::bind(config)?;
    server.run()?;
    Ok(())
}
