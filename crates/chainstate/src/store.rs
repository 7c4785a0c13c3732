//! Traits the validator and sync layer consume. Persistence lives behind
//! these; the node never touches a database directly.

use std::collections::BTreeMap;

use meridian_primitives::{Asset, Block, Hash256, Input, Output, Transaction};
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read access to committed chain state.
pub trait ChainStore: Send + Sync {
    fn get_height(&self) -> u32;

    fn get_block(&self, hash: &Hash256) -> Result<Block, StoreError>;

    /// The transaction together with the height it was confirmed at.
    fn get_transaction(&self, hash: &Hash256) -> Result<(Transaction, u32), StoreError>;

    /// Resolves every input of a non-coinbase transaction to the output it
    /// spends.
    fn get_tx_reference(&self, tx: &Transaction)
        -> Result<BTreeMap<Input, Output>, StoreError>;

    fn is_tx_hash_duplicate(&self, hash: &Hash256) -> bool;

    /// Whether any input of the transaction spends an already-spent output.
    fn is_double_spend(&self, tx: &Transaction) -> bool;

    fn is_sidechain_tx_hash_duplicate(&self, hash: &Hash256) -> bool;

    fn get_asset(&self, id: &Hash256) -> Result<Asset, StoreError>;

    /// Drops a hash from the header download list once its block arrives.
    fn remove_header_list_element(&self, hash: &Hash256);
}

/// Block acceptance and best-chain geometry, owned by the external chain
/// engine.
pub trait ChainEngine: Send + Sync {
    /// Returns `(on_main_chain, is_orphan)`.
    fn add_block(&self, block: Block) -> Result<(bool, bool), StoreError>;

    fn block_exists(&self, hash: &Hash256) -> bool;

    fn is_known_orphan(&self, hash: &Hash256) -> bool;

    /// The oldest known ancestor of an orphan block.
    fn get_orphan_root(&self, hash: &Hash256) -> Hash256;

    fn best_tip(&self) -> (Hash256, u32);

    fn block_locator_from_hash(&self, hash: &Hash256) -> Vec<Hash256>;

    fn latest_block_locator(&self) -> Vec<Hash256>;

    /// The most recent locator entry present on the main chain, falling back
    /// to the genesis hash.
    fn latest_locator_hash(&self, locator: &[Hash256]) -> Hash256;

    fn get_block_hashes(
        &self,
        start: Hash256,
        stop: Hash256,
        max: usize,
    ) -> Result<Vec<Hash256>, StoreError>;
}
