mod bloom;
mod config;
mod handler;
mod inventory;
mod mempool;
mod message;
mod peer;
mod registry;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meridian_chainstate::{ChainEngine, MemoryChainState};
use meridian_consensus::constants::PROTOCOL_VERSION;
use meridian_primitives::Asset;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::handler::{PeerHandler, SYNC_BLK_REQ_PERMITS};
use crate::inventory::RequestTracker;
use crate::mempool::TxPool;
use crate::message::VersionPayload;
use crate::peer::Peer;
use crate::registry::{
    NullAddressManager, NullConnectionManager, PeerRegistry, RegistryHandle,
};
use crate::transport::run_peer;

const DEFAULT_CONFIG_FILE: &str = "meridian.json";

struct Node {
    chain: Arc<MemoryChainState>,
    tx_pool: Arc<TxPool<MemoryChainState>>,
    tracker: Arc<RequestTracker>,
    registry: RegistryHandle,
    sync_blk_req: Arc<Semaphore>,
    magic: [u8; 4],
    services: u64,
    listen_port: u16,
}

impl Node {
    fn local_version(&self) -> VersionPayload {
        let (_, height) = self.chain.best_tip();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        VersionPayload {
            version: PROTOCOL_VERSION,
            services: self.services,
            timestamp,
            port: self.listen_port,
            nonce: rand::random(),
            height,
            relay: true,
        }
    }

    fn spawn_peer(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, inbound: bool) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let id = loop {
                let candidate: u64 = rand::random();
                if candidate != 0 {
                    break candidate;
                }
            };
            let (peer, outbound_rx) = Peer::new(id, addr, inbound, false, false);
            let peer = Arc::new(peer);
            let handler = PeerHandler::new(
                Arc::clone(&peer),
                Arc::clone(&node.chain),
                Arc::clone(&node.tx_pool),
                node.registry.clone(),
                Arc::clone(&node.tracker),
                Arc::clone(&node.sync_blk_req),
                node.services,
            );
            let result = run_peer(
                stream,
                Arc::clone(&peer),
                outbound_rx,
                handler,
                node.registry.clone(),
                node.magic,
                node.local_version(),
            )
            .await;
            match result {
                Ok(()) => debug!(peer = id, %addr, "peer session closed"),
                Err(err) => debug!(peer = id, %addr, %err, "peer session failed"),
            }
        });
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let config = match NodeConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, path = %config_path, "falling back to default config");
            NodeConfig::default()
        }
    };

    let params = match config.chain_params() {
        Ok(params) => Arc::new(params),
        Err(err) => {
            error!(%err, "invalid chain parameters");
            return;
        }
    };

    let chain = Arc::new(MemoryChainState::new());
    chain.register_asset(
        params.asset_id,
        Asset {
            name: "meridian".to_string(),
            precision: 8,
        },
    );

    let (registry, registry_join) = PeerRegistry::start(
        Arc::clone(&chain),
        Arc::new(NullConnectionManager),
        Arc::new(NullAddressManager),
    );

    let node = Arc::new(Node {
        tx_pool: Arc::new(TxPool::new(Arc::clone(&chain), params)),
        tracker: Arc::new(RequestTracker::new()),
        registry: registry.clone(),
        sync_blk_req: Arc::new(Semaphore::new(SYNC_BLK_REQ_PERMITS)),
        magic: config.magic,
        services: config.services(),
        listen_port: config.listen.port(),
        chain,
    });

    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %config.listen, "failed to bind p2p listener");
            return;
        }
    };
    info!(addr = %config.listen, "p2p listening");

    {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => node.spawn_peer(stream, addr, true),
                    Err(err) => warn!(%err, "p2p accept failed"),
                }
            }
        });
    }

    for seed in &config.seeds {
        let node = Arc::clone(&node);
        let seed = *seed;
        tokio::spawn(async move {
            match TcpStream::connect(seed).await {
                Ok(stream) => {
                    info!(addr = %seed, "connected to seed");
                    node.spawn_peer(stream, seed, false);
                }
                Err(err) => warn!(%err, addr = %seed, "seed connect failed"),
            }
        });
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to wait for shutdown signal");
    }
    info!(peers = registry.peer_count().await, "shutting down");
    registry.quit().await;
    let _ = registry_join.await;
}
