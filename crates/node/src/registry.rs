//! The peer registry: a single task owning the peer set. All mutations run
//! inside the task; readers query over reply channels. The sync-peer id is
//! additionally mirrored into an atomic so handlers may read it racily when
//! deciding whether to ignore an unsolicited inv.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_chainstate::ChainEngine;
use meridian_consensus::constants::DEFAULT_MAX_PEERS;
use meridian_primitives::{Hash256, Transaction, ZERO_HASH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{InvVect, Message};
use crate::peer::Peer;

const REGISTRY_QUEUE_SIZE: usize = 256;

/// Hooks into the external connection and address managers.
pub trait ConnectionManager: Send + Sync {
    fn disconnected(&self, peer_id: u64);
    fn stop(&self);
}

pub trait AddressManager: Send + Sync {
    /// Records an address as known-good once the handshake completed.
    fn connected(&self, addr: SocketAddr);
    fn stop(&self);
}

#[derive(Default)]
pub struct NullConnectionManager;

impl ConnectionManager for NullConnectionManager {
    fn disconnected(&self, _peer_id: u64) {}
    fn stop(&self) {}
}

#[derive(Default)]
pub struct NullAddressManager;

impl AddressManager for NullAddressManager {
    fn connected(&self, _addr: SocketAddr) {}
    fn stop(&self) {}
}

pub enum RelayObject {
    Block(Hash256),
    Tx(Transaction),
}

enum RegistryEvent {
    NewPeer(Arc<Peer>),
    DonePeer(Arc<Peer>),
    Query(Query),
    Quit,
}

enum Query {
    GetPeer {
        id: u64,
        reply: oneshot::Sender<Option<Arc<Peer>>>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<Arc<Peer>>>,
    },
    GetPeerCount {
        reply: oneshot::Sender<usize>,
    },
    GetOutboundGroup {
        key: String,
        reply: oneshot::Sender<usize>,
    },
}

#[derive(Default)]
struct PeerSet {
    inbound: HashMap<u64, Arc<Peer>>,
    outbound: HashMap<u64, Arc<Peer>>,
    persistent: HashMap<u64, Arc<Peer>>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerSet {
    fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Peer>> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.persistent.values())
    }

    fn get(&self, id: u64) -> Option<&Arc<Peer>> {
        self.inbound
            .get(&id)
            .or_else(|| self.outbound.get(&id))
            .or_else(|| self.persistent.get(&id))
    }
}

#[derive(Clone)]
pub struct RegistryHandle {
    events: mpsc::Sender<RegistryEvent>,
    sync_peer: Arc<AtomicU64>,
}

impl RegistryHandle {
    pub async fn new_peer(&self, peer: Arc<Peer>) {
        let _ = self.events.send(RegistryEvent::NewPeer(peer)).await;
    }

    pub async fn done_peer(&self, peer: Arc<Peer>) {
        let _ = self.events.send(RegistryEvent::DonePeer(peer)).await;
    }

    pub async fn quit(&self) {
        let _ = self.events.send(RegistryEvent::Quit).await;
    }

    pub async fn get_peer(&self, id: u64) -> Option<Arc<Peer>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(RegistryEvent::Query(Query::GetPeer { id, reply }))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn is_neighbor(&self, id: u64) -> bool {
        self.get_peer(id).await.is_some()
    }

    /// Connected peers, sorted by id ascending.
    pub async fn get_peers(&self) -> Vec<Arc<Peer>> {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(RegistryEvent::Query(Query::GetPeers { reply }))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn peer_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(RegistryEvent::Query(Query::GetPeerCount { reply }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    #[allow(dead_code)]
    pub async fn outbound_group_count(&self, key: String) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .events
            .send(RegistryEvent::Query(Query::GetOutboundGroup { key, reply }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Racy read of the current sync peer; staleness costs at most an extra
    /// round-trip.
    pub fn sync_peer_id(&self) -> Option<u64> {
        match self.sync_peer.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    /// Pushes an inv announcing the object to every other established peer.
    pub async fn relay(&self, origin: u64, object: RelayObject) {
        let peers = self.get_peers().await;
        match object {
            RelayObject::Block(hash) => {
                for peer in peers {
                    if peer.id() == origin {
                        continue;
                    }
                    let _ = peer
                        .send_message(Message::Inv(vec![InvVect::block(hash)]))
                        .await;
                }
            }
            RelayObject::Tx(tx) => {
                let hash = tx.hash();
                for peer in peers {
                    if peer.id() == origin {
                        continue;
                    }
                    let wanted = if peer.filter_loaded() {
                        peer.with_filter(|filter| match filter {
                            Some(filter) => filter.match_tx_and_update(&tx),
                            None => false,
                        })
                    } else {
                        peer.relay_enabled()
                    };
                    if wanted {
                        let _ = peer
                            .send_message(Message::Inv(vec![InvVect::tx(hash)]))
                            .await;
                    }
                }
            }
        }
    }
}

pub struct PeerRegistry<C> {
    chain: Arc<C>,
    conn_manager: Arc<dyn ConnectionManager>,
    addr_manager: Arc<dyn AddressManager>,
    events: mpsc::Receiver<RegistryEvent>,
    sync_peer: Arc<AtomicU64>,
    state: PeerSet,
}

impl<C: ChainEngine + 'static> PeerRegistry<C> {
    pub fn start(
        chain: Arc<C>,
        conn_manager: Arc<dyn ConnectionManager>,
        addr_manager: Arc<dyn AddressManager>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_QUEUE_SIZE);
        let sync_peer = Arc::new(AtomicU64::new(0));
        let handle = RegistryHandle {
            events: sender,
            sync_peer: Arc::clone(&sync_peer),
        };
        let registry = Self {
            chain,
            conn_manager,
            addr_manager,
            events: receiver,
            sync_peer,
            state: PeerSet::default(),
        };
        let join = tokio::spawn(registry.run());
        (handle, join)
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                RegistryEvent::NewPeer(peer) => {
                    if self.handle_new_peer(peer) {
                        self.start_sync().await;
                    }
                }
                RegistryEvent::DonePeer(peer) => {
                    self.handle_done_peer(&peer);
                    if self.sync_peer.load(Ordering::Relaxed) == peer.id() {
                        self.sync_peer.store(0, Ordering::Relaxed);
                        self.start_sync().await;
                    }
                }
                RegistryEvent::Query(query) => self.handle_query(query),
                RegistryEvent::Quit => break,
            }
        }

        // Disconnect everything on shutdown, then drain whatever is still
        // queued so no sender is left waiting.
        for peer in self.state.all() {
            peer.disconnect();
        }
        self.conn_manager.stop();
        self.addr_manager.stop();
        while let Ok(event) = self.events.try_recv() {
            if let RegistryEvent::DonePeer(peer) = event {
                self.handle_done_peer(&peer);
            }
        }
    }

    fn handle_new_peer(&mut self, peer: Arc<Peer>) -> bool {
        if !peer.is_persistent() && self.state.count() >= DEFAULT_MAX_PEERS {
            info!(
                max = DEFAULT_MAX_PEERS,
                peer = peer.id(),
                "max peers reached, disconnecting"
            );
            peer.disconnect();
            return false;
        }

        debug!(peer = peer.id(), addr = %peer.addr(), "new peer");
        if peer.is_inbound() {
            self.state.inbound.insert(peer.id(), peer);
        } else {
            *self
                .state
                .outbound_groups
                .entry(peer.group_key())
                .or_insert(0) += 1;
            if peer.is_persistent() {
                self.state.persistent.insert(peer.id(), peer);
            } else {
                self.state.outbound.insert(peer.id(), peer);
            }
        }
        true
    }

    fn handle_done_peer(&mut self, peer: &Arc<Peer>) {
        let list = if peer.is_persistent() {
            &mut self.state.persistent
        } else if peer.is_inbound() {
            &mut self.state.inbound
        } else {
            &mut self.state.outbound
        };

        if list.remove(&peer.id()).is_some() {
            if !peer.is_inbound() && peer.version_known() {
                if let Some(count) = self.state.outbound_groups.get_mut(&peer.group_key()) {
                    *count = count.saturating_sub(1);
                }
            }
            debug!(peer = peer.id(), "removed peer");
        }

        self.conn_manager.disconnected(peer.id());

        // Only record the address once the peer acknowledged our version and
        // sent its own.
        if peer.ver_ack_received() && peer.version_known() {
            self.addr_manager.connected(peer.addr());
        }
    }

    fn handle_query(&mut self, query: Query) {
        match query {
            Query::GetPeer { id, reply } => {
                let _ = reply.send(self.state.get(id).cloned());
            }
            Query::GetPeers { reply } => {
                let mut peers: Vec<Arc<Peer>> = self
                    .state
                    .all()
                    .filter(|peer| peer.is_connected())
                    .cloned()
                    .collect();
                peers.sort_by_key(|peer| peer.id());
                let _ = reply.send(peers);
            }
            Query::GetPeerCount { reply } => {
                let connected = self
                    .state
                    .all()
                    .filter(|peer| peer.is_connected())
                    .count();
                let _ = reply.send(connected);
            }
            Query::GetOutboundGroup { key, reply } => {
                let _ = reply.send(self.state.outbound_groups.get(&key).copied().unwrap_or(0));
            }
        }
    }

    /// Picks the first candidate whose advertised height beats the local
    /// best and pushes a getblocks to it. No-op while a sync peer is active.
    async fn start_sync(&mut self) {
        if self.sync_peer.load(Ordering::Relaxed) != 0 {
            return;
        }

        let (_, best_height) = self.chain.best_tip();
        let candidate = self
            .state
            .all()
            .find(|peer| !peer.is_disconnected() && peer.height() > best_height)
            .cloned();

        match candidate {
            Some(peer) => {
                let locator = self.chain.latest_block_locator();
                info!(
                    height = peer.height(),
                    peer = peer.id(),
                    "syncing from peer"
                );
                let _ = peer
                    .send_message(Message::GetBlocks {
                        locator,
                        hash_stop: ZERO_HASH,
                    })
                    .await;
                peer.start_stall_timer();
                self.sync_peer.store(peer.id(), Ordering::Relaxed);
            }
            None => warn!("no sync peer candidates available"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testutil::{drain, established_peer};
    use meridian_chainstate::MemoryChainState;

    fn start_registry() -> (RegistryHandle, Arc<MemoryChainState>) {
        let chain = Arc::new(MemoryChainState::new());
        let (handle, _join) = PeerRegistry::start(
            Arc::clone(&chain),
            Arc::new(NullConnectionManager),
            Arc::new(NullAddressManager),
        );
        (handle, chain)
    }

    #[tokio::test]
    async fn first_tall_peer_becomes_sync_peer() {
        let (handle, _chain) = start_registry();

        let (first, mut first_rx) = established_peer(1, 5);
        let (second, mut second_rx) = established_peer(2, 50);
        handle.new_peer(Arc::clone(&first)).await;
        handle.get_peers().await; // barrier: NewPeer processed
        assert_eq!(handle.sync_peer_id(), Some(1));

        // A taller later arrival is not promoted.
        handle.new_peer(Arc::clone(&second)).await;
        handle.get_peers().await;
        assert_eq!(handle.sync_peer_id(), Some(1));

        let sent = drain(&mut first_rx);
        assert!(matches!(sent.as_slice(), [Message::GetBlocks { .. }]));
        assert!(drain(&mut second_rx).is_empty());
    }

    #[tokio::test]
    async fn sync_peer_is_replaced_when_it_leaves() {
        let (handle, _chain) = start_registry();

        let (first, _first_rx) = established_peer(1, 5);
        let (second, mut second_rx) = established_peer(2, 50);
        handle.new_peer(Arc::clone(&first)).await;
        handle.new_peer(Arc::clone(&second)).await;
        handle.get_peers().await;
        assert_eq!(handle.sync_peer_id(), Some(1));

        handle.done_peer(Arc::clone(&first)).await;
        handle.get_peers().await;
        assert_eq!(handle.sync_peer_id(), Some(2));
        let sent = drain(&mut second_rx);
        assert!(matches!(sent.as_slice(), [Message::GetBlocks { .. }]));
    }

    #[tokio::test]
    async fn peers_without_taller_height_are_not_selected() {
        let (handle, _chain) = start_registry();
        let (flat, _rx) = established_peer(3, 0);
        handle.new_peer(flat).await;
        handle.get_peers().await;
        assert_eq!(handle.sync_peer_id(), None);
    }

    #[tokio::test]
    async fn registry_caps_non_persistent_peers() {
        let (handle, _chain) = start_registry();

        let mut receivers = Vec::new();
        for id in 1..=DEFAULT_MAX_PEERS as u64 {
            let (peer, rx) = established_peer(id, 0);
            receivers.push(rx);
            handle.new_peer(peer).await;
        }
        assert_eq!(handle.peer_count().await, DEFAULT_MAX_PEERS);

        let (overflow, _rx) = established_peer(9000, 0);
        handle.new_peer(Arc::clone(&overflow)).await;
        handle.get_peers().await;
        assert!(overflow.is_disconnected());
        assert_eq!(handle.peer_count().await, DEFAULT_MAX_PEERS);

        // Persistent peers bypass the cap.
        let (persistent, _prx) = {
            let addr: SocketAddr = "10.9.9.9:20866".parse().expect("addr");
            let (peer, rx) = Peer::new(9001, addr, false, true, false);
            peer.set_version_info(0, 0, 0, true);
            peer.set_ver_ack_received();
            peer.set_state(crate::peer::PeerState::Established);
            (Arc::new(peer), rx)
        };
        handle.new_peer(Arc::clone(&persistent)).await;
        handle.get_peers().await;
        assert!(!persistent.is_disconnected());
        assert_eq!(handle.peer_count().await, DEFAULT_MAX_PEERS + 1);
    }

    #[tokio::test]
    async fn get_peers_is_sorted_and_connected_only() {
        let (handle, _chain) = start_registry();
        let (a, _arx) = established_peer(7, 0);
        let (b, _brx) = established_peer(3, 0);
        let (c, _crx) = established_peer(5, 0);
        c.set_state(crate::peer::PeerState::HandShake);

        handle.new_peer(a).await;
        handle.new_peer(b).await;
        handle.new_peer(c).await;

        let peers = handle.get_peers().await;
        let ids: Vec<u64> = peers.iter().map(|peer| peer.id()).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[tokio::test]
    async fn outbound_groups_track_adds_and_removes() {
        let (handle, _chain) = start_registry();
        let (a, _arx) = established_peer(0x0101, 0);
        let (b, _brx) = established_peer(0x0102, 0);
        let key = a.group_key();
        assert_eq!(key, b.group_key());

        handle.new_peer(Arc::clone(&a)).await;
        handle.new_peer(Arc::clone(&b)).await;
        assert_eq!(handle.outbound_group_count(key.clone()).await, 2);

        handle.done_peer(a).await;
        assert_eq!(handle.outbound_group_count(key).await, 1);
    }

    #[tokio::test]
    async fn relay_skips_the_origin() {
        let (handle, _chain) = start_registry();
        let (a, mut arx) = established_peer(1, 0);
        let (b, mut brx) = established_peer(2, 0);
        handle.new_peer(Arc::clone(&a)).await;
        handle.new_peer(Arc::clone(&b)).await;

        handle.relay(1, RelayObject::Block([0x99; 32])).await;
        assert!(drain(&mut arx).is_empty());
        let to_b = drain(&mut brx);
        assert_eq!(
            to_b,
            vec![Message::Inv(vec![InvVect::block([0x99; 32])])]
        );
    }
}
