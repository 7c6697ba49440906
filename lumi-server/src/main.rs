use std::error::Error;
use std::sync::Arc;

use log::info;
use lumi_sync::{FsNoteStore, Hub, NoteServer, PeerManager, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting lumi server {}...", config.server_id);

    let store = Arc::new(FsNoteStore::open(&config.root_dir)?);
    info!("Notes stored in {}", config.root_dir.display());

    let hub = Hub::spawn(config.server_id.clone(), config.hub_config());
    let peers = PeerManager::new(hub.clone(), store, config.peer_config());

    if !config.peers.is_empty() {
        peers.start(config.peers.iter().cloned());
        info!("Started {} peer connection(s)", config.peers.len());
    }

    NoteServer::new(&config, hub, peers).run().await?;
    Ok(())
}
