//! Battle map sync server.
//!
//! Configuration comes from `BATTLEMAP_*` environment variables (see
//! [`ServerConfig::from_env`]); log filtering from `RUST_LOG`.

use log::{error, info};

use battlemap_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting battle map server on {} ({})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory store".to_string(), |p| format!("rocksdb at {}", p.display()))
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot open the map store: {e}");
            return Err(e.into());
        }
    };
    server.run().await
}
