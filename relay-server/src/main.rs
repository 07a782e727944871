//! Relay server binary
//!
//! Usage: relay-server [--bind <addr:port>] [--config <file.json>]
//!                     [--max-line-bytes <n>] [--no-presence]

use std::sync::Arc;
use std::thread;

use relay_server::{CredentialStore, RelayServer, ServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("Relay server starting...");
    log::info!("  Bind:     {}", config.bind);
    log::info!("  Max line: {} bytes", config.max_line_bytes);
    log::info!("  Presence: {}", if config.broadcast_presence { "broadcast" } else { "on request" });

    let server = RelayServer::bind(config, Arc::new(CredentialStore::new()))?;

    // SIGINT/SIGTERM wake the accept loop, which closes every connection
    let handle = server.handle();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                log::info!("Received signal {}, shutting down", signal);
                handle.shutdown();
            }
        })?;

    server.run()?;
    log::info!("Relay server stopped");
    Ok(())
}
