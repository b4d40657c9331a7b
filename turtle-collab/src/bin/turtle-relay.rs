//! Turtle relay: hosts group channels for collaborating turtle peers.
//!
//! Usage: `turtle-relay [BIND_ADDR]` (defaults to `127.0.0.1:9190`).
//! Log output is controlled with `RUST_LOG`.

use log::info;
use turtle_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RelayConfig::default();
    if let Some(bind_addr) = std::env::args().nth(1) {
        config.bind_addr = bind_addr;
    }
    info!(
        "Starting relay on {} (max {} members per channel)",
        config.bind_addr, config.max_members_per_channel
    );

    RelayServer::new(config).run().await
}
