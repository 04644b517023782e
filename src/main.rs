//! pollnet server binary.
//!
//! Runs the server core with a built-in echo route on every configured
//! listen schema:
//! - operate 1: echoes the request body back with the same content type
//! - operate 2: liveness probe answering `"pong"`

use pollnet::{Config, Payload, Schema, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ECHO: i16 = 1;
const PING: i16 = 2;

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
        listen = ?config.listen,
        shards = config.shard_count,
        max_workers = config.max_workers,
        max_read_buffer_size = config.max_read_buffer_size,
        "Starting pollnet server"
    );

    let schemas = config
        .listen
        .iter()
        .map(|s| s.parse::<Schema>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut server = Server::new(config)?;
    server
        .router()
        .route(ECHO, |ctx| Ok(ctx.codec().unmarshal(ctx.packet())?))
        .route(PING, |_ctx| Ok(Payload::json(&"pong")?));
    for schema in schemas {
        server.listen(schema);
    }

    // Nothing sends on or drops this channel; the process runs until killed.
    let (_stop, stop_rx) = crossbeam_channel::bounded::<()>(0);
    server.run(stop_rx)?;
    Ok(())
}
