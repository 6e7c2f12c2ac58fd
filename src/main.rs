use std::sync::Arc;

use mls_bridge::backend::{InMemoryFactory, InMemoryNetwork};
use mls_bridge::broadcast::BroadcastHub;
use mls_bridge::config::Config;
use mls_bridge::server::{self, AppState};
use mls_bridge::service::GroupService;
use mls_bridge::session::SessionStore;
use mls_bridge::signer::ChallengeSigner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::from_env();

    let signer = match &config.wallet_key {
        Some(key) => ChallengeSigner::from_key(key)?,
        None => ChallengeSigner::ephemeral(),
    };

    let network = InMemoryNetwork::new();
    let factory = InMemoryFactory::new(network);
    let store = Arc::new(SessionStore::new(
        factory,
        config.cache_dir.clone(),
        config.env_tag.clone(),
    ));
    let hub = BroadcastHub::new(128);
    let service = Arc::new(GroupService::new(store.clone(), hub.clone()));

    let state = AppState {
        store,
        service,
        signer: Arc::new(signer),
        hub,
    };
    server::serve(config.port, state).await
}
