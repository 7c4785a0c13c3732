//! Read-only façade the transaction validator runs against.

use std::collections::BTreeMap;

use meridian_consensus::ChainParams;
use meridian_primitives::{Asset, Hash256, Input, Output, Transaction};

use crate::store::{ChainStore, StoreError};

/// Bundles chain state access with the active chain parameters. Constructed
/// at the call site and passed explicitly; there is no ambient ledger.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub store: &'a dyn ChainStore,
    pub params: &'a ChainParams,
}

impl<'a> ValidationContext<'a> {
    pub fn new(store: &'a dyn ChainStore, params: &'a ChainParams) -> Self {
        Self { store, params }
    }

    pub fn get_height(&self) -> u32 {
        self.store.get_height()
    }

    pub fn is_tx_hash_duplicate(&self, hash: &Hash256) -> bool {
        self.store.is_tx_hash_duplicate(hash)
    }

    pub fn get_transaction(&self, hash: &Hash256) -> Result<(Transaction, u32), StoreError> {
        self.store.get_transaction(hash)
    }

    pub fn get_tx_reference(
        &self,
        tx: &Transaction,
    ) -> Result<BTreeMap<Input, Output>, StoreError> {
        self.store.get_tx_reference(tx)
    }

    pub fn is_double_spend(&self, tx: &Transaction) -> bool {
        self.store.is_double_spend(tx)
    }

    pub fn is_sidechain_tx_hash_duplicate(&self, hash: &Hash256) -> bool {
        self.store.is_sidechain_tx_hash_duplicate(hash)
    }

    pub fn get_asset(&self, id: &Hash256) -> Result<Asset, StoreError> {
        self.store.get_asset(id)
    }
}
