//! In-memory chain state used by tests and the default node wiring.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use meridian_primitives::{Asset, Block, Hash256, Input, Output, Transaction, ZERO_HASH};

use crate::store::{ChainEngine, ChainStore, StoreError};

#[derive(Default)]
struct State {
    main_chain: Vec<Hash256>,
    main_heights: HashMap<Hash256, u32>,
    blocks: HashMap<Hash256, Block>,
    transactions: HashMap<Hash256, (Transaction, u32)>,
    spent: HashSet<[u8; 34]>,
    sidechain_hashes: HashSet<Hash256>,
    orphans: HashMap<Hash256, Hash256>,
    assets: HashMap<Hash256, Asset>,
    header_list: HashSet<Hash256>,
    height_override: Option<u32>,
}

#[derive(Default)]
pub struct MemoryChainState {
    inner: Mutex<State>,
}

impl MemoryChainState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asset(&self, id: Hash256, asset: Asset) {
        self.lock().assets.insert(id, asset);
    }

    /// Appends a block to the main chain unconditionally, indexing its
    /// transactions and marking their inputs spent.
    pub fn push_main_block(&self, block: Block) {
        let mut state = self.lock();
        let hash = block.hash();
        let height = state.main_chain.len() as u32;
        for tx in &block.transactions {
            index_transaction(&mut state, tx, height);
        }
        state.main_chain.push(hash);
        state.main_heights.insert(hash, height);
        state.blocks.insert(hash, block);
    }

    /// Seeds a confirmed transaction without a containing block.
    pub fn insert_transaction(&self, tx: Transaction, height: u32) {
        let mut state = self.lock();
        index_transaction(&mut state, &tx, height);
    }

    pub fn mark_spent(&self, refer_key: [u8; 34]) {
        self.lock().spent.insert(refer_key);
    }

    pub fn add_sidechain_hash(&self, hash: Hash256) {
        self.lock().sidechain_hashes.insert(hash);
    }

    pub fn add_orphan(&self, hash: Hash256, parent: Hash256) {
        self.lock().orphans.insert(hash, parent);
    }

    pub fn add_header_list_element(&self, hash: Hash256) {
        self.lock().header_list.insert(hash);
    }

    pub fn header_list_contains(&self, hash: &Hash256) -> bool {
        self.lock().header_list.contains(hash)
    }

    /// Pins the reported chain height regardless of stored blocks.
    pub fn set_height(&self, height: u32) {
        self.lock().height_override = Some(height);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().expect("chain state lock poisoned")
    }
}

fn index_transaction(state: &mut State, tx: &Transaction, height: u32) {
    let hash = tx.hash();
    for input in &tx.inputs {
        if !input.previous.is_coinbase_sentinel() {
            state.spent.insert(input.previous.refer_key());
        }
    }
    state.transactions.insert(hash, (tx.clone(), height));
}

impl ChainStore for MemoryChainState {
    fn get_height(&self) -> u32 {
        let state = self.lock();
        if let Some(height) = state.height_override {
            return height;
        }
        state.main_chain.len().saturating_sub(1) as u32
    }

    fn get_block(&self, hash: &Hash256) -> Result<Block, StoreError> {
        self.lock()
            .blocks
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_transaction(&self, hash: &Hash256) -> Result<(Transaction, u32), StoreError> {
        self.lock()
            .transactions
            .get(hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get_tx_reference(
        &self,
        tx: &Transaction,
    ) -> Result<BTreeMap<Input, Output>, StoreError> {
        let state = self.lock();
        let mut references = BTreeMap::new();
        for input in &tx.inputs {
            let (refer_tx, _) = state
                .transactions
                .get(&input.previous.tx_id)
                .ok_or(StoreError::NotFound)?;
            let output = refer_tx
                .outputs
                .get(input.previous.index as usize)
                .ok_or(StoreError::NotFound)?;
            references.insert(*input, output.clone());
        }
        Ok(references)
    }

    fn is_tx_hash_duplicate(&self, hash: &Hash256) -> bool {
        self.lock().transactions.contains_key(hash)
    }

    fn is_double_spend(&self, tx: &Transaction) -> bool {
        let state = self.lock();
        tx.inputs
            .iter()
            .any(|input| state.spent.contains(&input.previous.refer_key()))
    }

    fn is_sidechain_tx_hash_duplicate(&self, hash: &Hash256) -> bool {
        self.lock().sidechain_hashes.contains(hash)
    }

    fn get_asset(&self, id: &Hash256) -> Result<Asset, StoreError> {
        self.lock()
            .assets
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn remove_header_list_element(&self, hash: &Hash256) {
        self.lock().header_list.remove(hash);
    }
}

impl ChainEngine for MemoryChainState {
    fn add_block(&self, block: Block) -> Result<(bool, bool), StoreError> {
        let mut state = self.lock();
        let hash = block.hash();
        if state.blocks.contains_key(&hash) {
            return Ok((false, false));
        }

        let prev = block.header.prev_block;
        let extends_tip = match state.main_chain.last() {
            Some(tip) => *tip == prev,
            None => prev == ZERO_HASH,
        };
        if extends_tip {
            let height = state.main_chain.len() as u32;
            for tx in &block.transactions {
                index_transaction(&mut state, tx, height);
            }
            state.main_chain.push(hash);
            state.main_heights.insert(hash, height);
            state.blocks.insert(hash, block);
            state.orphans.remove(&hash);
            return Ok((true, false));
        }

        if !state.blocks.contains_key(&prev) {
            state.orphans.insert(hash, prev);
            return Ok((false, true));
        }

        // Side-chain block: stored but not connected.
        state.blocks.insert(hash, block);
        Ok((false, false))
    }

    fn block_exists(&self, hash: &Hash256) -> bool {
        self.lock().blocks.contains_key(hash)
    }

    fn is_known_orphan(&self, hash: &Hash256) -> bool {
        self.lock().orphans.contains_key(hash)
    }

    fn get_orphan_root(&self, hash: &Hash256) -> Hash256 {
        let state = self.lock();
        let mut root = *hash;
        let mut cursor = *hash;
        while let Some(parent) = state.orphans.get(&cursor) {
            root = cursor;
            cursor = *parent;
        }
        root
    }

    fn best_tip(&self) -> (Hash256, u32) {
        let state = self.lock();
        match state.main_chain.last() {
            Some(hash) => (*hash, state.main_chain.len() as u32 - 1),
            None => (ZERO_HASH, 0),
        }
    }

    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256> {
        let state = self.lock();
        let Some(&height) = state.main_heights.get(hash) else {
            return vec![*hash];
        };
        build_locator(&state.main_chain, height)
    }

    fn latest_block_locator(&self) -> Vec<Hash256> {
        let state = self.lock();
        match state.main_chain.len() {
            0 => Vec::new(),
            len => build_locator(&state.main_chain, len as u32 - 1),
        }
    }

    fn latest_locator_hash(&self, locator: &[Hash256]) -> Hash256 {
        let state = self.lock();
        for hash in locator {
            if state.main_heights.contains_key(hash) {
                return *hash;
            }
        }
        state.main_chain.first().copied().unwrap_or(ZERO_HASH)
    }

    fn get_block_hashes(
        &self,
        start: Hash256,
        stop: Hash256,
        max: usize,
    ) -> Result<Vec<Hash256>, StoreError> {
        let state = self.lock();
        let start_height = match state.main_heights.get(&start) {
            Some(height) => *height as usize + 1,
            None if start == ZERO_HASH => 0,
            None => return Err(StoreError::NotFound),
        };
        let mut hashes = Vec::new();
        for hash in state.main_chain.iter().skip(start_height) {
            if hashes.len() >= max {
                break;
            }
            hashes.push(*hash);
            if *hash == stop {
                break;
            }
        }
        Ok(hashes)
    }
}

/// Backward-sparse locator: dense for the last ten blocks, then doubling
/// steps back to genesis.
fn build_locator(main_chain: &[Hash256], from_height: u32) -> Vec<Hash256> {
    let mut locator = Vec::new();
    let mut height = from_height as i64;
    let mut step = 1i64;
    while height >= 0 {
        locator.push(main_chain[height as usize]);
        if locator.len() >= 10 {
            step *= 2;
        }
        height -= step;
    }
    let genesis = main_chain[0];
    if locator.last() != Some(&genesis) {
        locator.push(genesis);
    }
    locator
}
