//! Per-peer message dispatch.
//!
//! One handler instance exists per peer and runs on that peer's read task,
//! so `continue_hash` needs no locking. Cross-peer state goes through the
//! registry handle and the shared request tracker.

use std::sync::Arc;

use meridian_chainstate::validation::RuleErrorKind;
use meridian_chainstate::{ChainEngine, ChainStore};
use meridian_consensus::constants::{MAX_BLOCKS_PER_MSG, OPEN_SERVICE};
use meridian_primitives::{hash256_to_hex, Block, Hash256, Transaction, ZERO_HASH};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::bloom::{build_merkle_block, BloomFilter};
use crate::inventory::RequestTracker;
use crate::mempool::TxPool;
use crate::message::{FilterLoadPayload, InvType, InvVect, Message, RejectCode};
use crate::peer::{Peer, PeerGone};
use crate::registry::{RegistryHandle, RelayObject};

/// Concurrent getblocks responders across all peers.
pub const SYNC_BLK_REQ_PERMITS: usize = 2;

pub struct PeerHandler<C> {
    peer: Arc<Peer>,
    chain: Arc<C>,
    tx_pool: Arc<TxPool<C>>,
    registry: RegistryHandle,
    tracker: Arc<RequestTracker>,
    sync_blk_req: Arc<Semaphore>,
    local_services: u64,
    continue_hash: Option<Hash256>,
}

impl<C: ChainStore + ChainEngine> PeerHandler<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Arc<Peer>,
        chain: Arc<C>,
        tx_pool: Arc<TxPool<C>>,
        registry: RegistryHandle,
        tracker: Arc<RequestTracker>,
        sync_blk_req: Arc<Semaphore>,
        local_services: u64,
    ) -> Self {
        Self {
            peer,
            chain,
            tx_pool,
            registry,
            tracker,
            sync_blk_req,
            local_services,
            continue_hash: None,
        }
    }

    pub async fn handle(&mut self, message: Message) -> Result<(), PeerGone> {
        match message {
            Message::FilterLoad(payload) => self.on_filter_load(payload),
            Message::GetBlocks { locator, hash_stop } => {
                self.on_get_blocks(locator, hash_stop).await?
            }
            Message::Inv(vectors) => self.on_inv(vectors).await?,
            Message::GetData(vectors) => self.on_get_data(vectors).await?,
            Message::Block(block) => self.on_block(block).await?,
            Message::Tx(tx) => self.on_tx(tx).await?,
            Message::NotFound(vectors) => self.on_not_found(vectors),
            Message::MemPool => self.on_mem_pool().await?,
            Message::Reject {
                message,
                code,
                reason,
                hash,
            } => self.on_reject(message, code, reason, hash),
            other => debug!(command = other.command(), "unhandled message"),
        }
        Ok(())
    }

    fn on_filter_load(&mut self, payload: FilterLoadPayload) {
        match BloomFilter::from_payload(&payload) {
            Some(filter) => self.peer.load_filter(Some(filter)),
            None => {
                warn!(peer = self.peer.id(), "rejecting oversized bloom filter");
                self.peer.disconnect();
            }
        }
    }

    async fn on_get_blocks(
        &mut self,
        locator: Vec<Hash256>,
        hash_stop: Hash256,
    ) -> Result<(), PeerGone> {
        let _permit = Arc::clone(&self.sync_blk_req)
            .acquire_owned()
            .await
            .map_err(|_| PeerGone)?;

        let start = self.chain.latest_locator_hash(&locator);
        let hashes = match self.chain.get_block_hashes(start, hash_stop, MAX_BLOCKS_PER_MSG) {
            Ok(hashes) => hashes,
            Err(err) => {
                warn!(%err, "getblocks enumeration failed");
                return Ok(());
            }
        };

        if hashes.is_empty() {
            return Ok(());
        }
        if hashes.len() == MAX_BLOCKS_PER_MSG {
            // Remember where a full reply ended so the follow-up getdata can
            // trigger the next inventory push.
            self.continue_hash = Some(hashes[hashes.len() - 1]);
        }
        let vectors = hashes.into_iter().map(InvVect::block).collect();
        self.peer.send_message(Message::Inv(vectors)).await
    }

    async fn on_inv(&mut self, vectors: Vec<InvVect>) -> Result<(), PeerGone> {
        debug!(count = vectors.len(), "inv received");

        // While syncing, inventory from anyone but the sync peer is noise.
        if let Some(sync_id) = self.registry.sync_peer_id() {
            if sync_id != self.peer.id() {
                return Ok(());
            }
        }

        let last_block = vectors
            .iter()
            .rposition(|vector| vector.inv_type == InvType::Block);

        let mut get_data = Vec::new();
        for (index, vector) in vectors.iter().enumerate() {
            let hash = vector.hash;
            match vector.inv_type {
                InvType::Block => {
                    if self.peer.is_external() {
                        debug!("ignoring block inventory from external peer");
                        return Ok(());
                    }

                    let have = self.chain.block_exists(&hash)
                        || self.chain.is_known_orphan(&hash)
                        || self.tracker.is_requested_block(&hash);

                    if !have {
                        self.tracker.add_requested_block(hash);
                        get_data.push(*vector);
                        continue;
                    }

                    // A known orphan means a fork we have not connected yet;
                    // walk back from its root.
                    if self.chain.is_known_orphan(&hash) {
                        let orphan_root = self.chain.get_orphan_root(&hash);
                        let locator = self.chain.latest_block_locator();
                        self.peer
                            .send_message(Message::GetBlocks {
                                locator,
                                hash_stop: orphan_root,
                            })
                            .await?;
                        continue;
                    }

                    if Some(index) == last_block {
                        let locator = self.chain.block_locator_from_hash(&hash);
                        self.peer
                            .send_message(Message::GetBlocks {
                                locator,
                                hash_stop: ZERO_HASH,
                            })
                            .await?;
                    }
                }
                InvType::Tx => {
                    if !self.tx_pool.existed_id(&hash) {
                        get_data.push(*vector);
                    }
                }
                InvType::FilteredBlock => continue,
            }
        }

        if !get_data.is_empty() {
            self.peer.send_message(Message::GetData(get_data)).await?;
        }
        Ok(())
    }

    async fn on_get_data(&mut self, vectors: Vec<InvVect>) -> Result<(), PeerGone> {
        let mut not_found = Vec::new();

        for vector in vectors {
            match vector.inv_type {
                InvType::Block => {
                    let block = match self.chain.get_block(&vector.hash) {
                        Ok(block) => block,
                        Err(_) => {
                            debug!(
                                hash = %hash256_to_hex(&vector.hash),
                                "block not found for getdata"
                            );
                            not_found.push(vector);
                            continue;
                        }
                    };
                    self.peer.send_message(Message::Block(block)).await?;

                    if self.continue_hash == Some(vector.hash) {
                        let (tip, _) = self.chain.best_tip();
                        self.peer
                            .send_message(Message::Inv(vec![InvVect::block(tip)]))
                            .await?;
                        self.continue_hash = None;
                    }
                }
                InvType::Tx => match self.tx_pool.get(&vector.hash) {
                    Some(tx) => self.peer.send_message(Message::Tx(tx)).await?,
                    None => not_found.push(vector),
                },
                InvType::FilteredBlock => {
                    if !self.peer.filter_loaded() {
                        return Ok(());
                    }
                    let block = match self.chain.get_block(&vector.hash) {
                        Ok(block) => block,
                        Err(_) => {
                            not_found.push(vector);
                            continue;
                        }
                    };
                    let built = self.peer.with_filter(|filter| {
                        filter.map(|filter| build_merkle_block(&block, filter))
                    });
                    let Some((merkle, matched)) = built else {
                        return Ok(());
                    };
                    self.peer.send_message(Message::MerkleBlock(merkle)).await?;
                    for index in matched {
                        let tx = block.transactions[index].clone();
                        self.peer.send_message(Message::Tx(tx)).await?;
                    }
                }
            }
        }

        if !not_found.is_empty() {
            self.peer.send_message(Message::NotFound(not_found)).await?;
        }
        Ok(())
    }

    async fn on_block(&mut self, block: Block) -> Result<(), PeerGone> {
        let hash = block.hash();

        if !self.registry.is_neighbor(self.peer.id()).await {
            warn!("received block message from unknown peer");
            self.peer.disconnect();
            return Ok(());
        }

        if self.chain.block_exists(&hash) {
            debug!(hash = %hash256_to_hex(&hash), "received duplicated block");
            return Ok(());
        }

        self.peer.update_stall_timer();
        self.chain.remove_header_list_element(&hash);
        self.tracker.delete_requested_block(&hash);

        let is_orphan = match self.chain.add_block(block) {
            Ok((_, is_orphan)) => is_orphan,
            Err(err) => {
                warn!(%err, hash = %hash256_to_hex(&hash), "block add failed");
                return self
                    .peer
                    .send_message(Message::Reject {
                        message: "block".to_string(),
                        code: RejectCode::Invalid,
                        reason: err.to_string(),
                        hash,
                    })
                    .await;
            }
        };

        if is_orphan {
            let orphan_root = self.chain.get_orphan_root(&hash);
            let locator = self.chain.latest_block_locator();
            self.peer
                .send_message(Message::GetBlocks {
                    locator,
                    hash_stop: orphan_root,
                })
                .await?;
        }

        if self.registry.sync_peer_id().is_none() && self.tracker.note_relayed(hash) {
            debug!("relaying block");
            self.registry
                .relay(self.peer.id(), RelayObject::Block(hash))
                .await;
        }
        Ok(())
    }

    async fn on_tx(&mut self, tx: Transaction) -> Result<(), PeerGone> {
        if !self.registry.is_neighbor(self.peer.id()).await {
            warn!("received transaction message from unknown peer");
            self.peer.disconnect();
            return Ok(());
        }

        // Transactions are not accepted while a chain sync is in progress.
        if self.registry.sync_peer_id().is_some() {
            return Ok(());
        }

        let hash = tx.hash();
        if self.tx_pool.existed_id(&hash) {
            debug!(hash = %hash256_to_hex(&hash), "transaction already known");
            return self
                .peer
                .send_message(Message::Reject {
                    message: "tx".to_string(),
                    code: RejectCode::Duplicate,
                    reason: "duplicate transaction".to_string(),
                    hash,
                })
                .await;
        }

        if let Err(err) = self.tx_pool.append_to_txn_pool(tx.clone()) {
            debug!(%err, "transaction rejected by the pool");
            let code = match err.kind {
                RuleErrorKind::TransactionDuplicate => RejectCode::Duplicate,
                _ => RejectCode::Invalid,
            };
            return self
                .peer
                .send_message(Message::Reject {
                    message: "tx".to_string(),
                    code,
                    reason: err.message,
                    hash,
                })
                .await;
        }

        self.registry
            .relay(self.peer.id(), RelayObject::Tx(tx))
            .await;
        let received = self.tx_pool.inc_rx_txn_cnt();
        debug!(
            hash = %hash256_to_hex(&hash),
            received,
            "relayed transaction"
        );
        Ok(())
    }

    fn on_not_found(&self, vectors: Vec<InvVect>) {
        for vector in vectors {
            warn!(
                kind = ?vector.inv_type,
                hash = %hash256_to_hex(&vector.hash),
                "peer reported data not found"
            );
        }
    }

    async fn on_mem_pool(&mut self) -> Result<(), PeerGone> {
        // Mempool queries are an SPV service; without it the request is a
        // protocol violation.
        if self.local_services & OPEN_SERVICE != OPEN_SERVICE {
            debug!(
                peer = self.peer.id(),
                "mempool request with SPV service disabled"
            );
            self.peer.disconnect();
            return Ok(());
        }

        if self.tx_pool.is_empty() {
            return Ok(());
        }
        debug!(pool = self.tx_pool.len(), "answering mempool request");
        let pool = self.tx_pool.get_transaction_pool(false);
        let mut vectors = Vec::new();
        for (hash, tx) in pool {
            let wanted = if self.peer.filter_loaded() {
                self.peer.with_filter(|filter| match filter {
                    Some(filter) => filter.match_tx_and_update(&tx),
                    None => false,
                })
            } else {
                true
            };
            if wanted {
                vectors.push(InvVect::tx(hash));
            }
        }

        if !vectors.is_empty() {
            self.peer.send_message(Message::Inv(vectors)).await?;
        }
        Ok(())
    }

    fn on_reject(&self, message: String, code: RejectCode, reason: String, hash: Hash256) {
        debug!(
            peer = self.peer.id(),
            message,
            ?code,
            reason,
            hash = %hash256_to_hex(&hash),
            "reject received"
        );
    }
}
