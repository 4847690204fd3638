//! Standalone WebSocket relay.
//!
//! ```text
//! LOGOS_RELAY_ADDR=0.0.0.0:9091 LOGOS_RELAY_CAPACITY=512 logos-relay
//! ```

use log::info;
use logos_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting Logos relay on {} (capacity {} per room)",
        config.bind_addr, config.broadcast_capacity
    );

    RelayServer::new(config).run().await
}
