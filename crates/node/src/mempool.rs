//! Node-side transaction pool. Admission runs the full two-phase validator
//! and then guards against in-pool input conflicts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meridian_chainstate::validation::{
    check_transaction_context, check_transaction_sanity, RuleError, RuleErrorKind,
};
use meridian_chainstate::{ChainStore, ValidationContext};
use meridian_consensus::constants::CHECK_TX_OUT;
use meridian_consensus::ChainParams;
use meridian_primitives::{Hash256, Transaction};

pub struct TxPool<C> {
    chain: Arc<C>,
    params: Arc<ChainParams>,
    check_version: u32,
    pool: Mutex<PoolState>,
    rx_txn_count: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<Hash256, Transaction>,
    spent: HashMap<[u8; 34], Hash256>,
}

impl<C: ChainStore> TxPool<C> {
    pub fn new(chain: Arc<C>, params: Arc<ChainParams>) -> Self {
        Self {
            chain,
            params,
            check_version: CHECK_TX_OUT,
            pool: Mutex::new(PoolState::default()),
            rx_txn_count: AtomicU64::new(0),
        }
    }

    /// Validates and admits a transaction. The returned kind feeds straight
    /// into the reject message sent back to the announcing peer.
    pub fn append_to_txn_pool(&self, tx: Transaction) -> Result<(), RuleError> {
        let hash = tx.hash();
        if self.existed_id(&hash) {
            return Err(RuleError::new(
                RuleErrorKind::TransactionDuplicate,
                "transaction already in the pool",
            ));
        }

        let ctx = ValidationContext::new(self.chain.as_ref(), self.params.as_ref());
        check_transaction_sanity(self.check_version, &tx, &ctx)?;
        check_transaction_context(&tx, &ctx)?;

        let mut pool = self.lock();
        if pool.entries.contains_key(&hash) {
            return Err(RuleError::new(
                RuleErrorKind::TransactionDuplicate,
                "transaction already in the pool",
            ));
        }
        for input in &tx.inputs {
            if pool.spent.contains_key(&input.previous.refer_key()) {
                return Err(RuleError::new(
                    RuleErrorKind::DoubleSpend,
                    "input already spent by a pooled transaction",
                ));
            }
        }
        for input in &tx.inputs {
            pool.spent.insert(input.previous.refer_key(), hash);
        }
        pool.entries.insert(hash, tx);
        Ok(())
    }

    pub fn existed_id(&self, hash: &Hash256) -> bool {
        self.lock().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<Transaction> {
        self.lock().entries.get(hash).cloned()
    }

    pub fn get_transaction_pool(&self, _filtered: bool) -> HashMap<Hash256, Transaction> {
        self.lock().entries.clone()
    }

    #[allow(dead_code)]
    pub fn remove(&self, hash: &Hash256) -> Option<Transaction> {
        let mut pool = self.lock();
        let tx = pool.entries.remove(hash)?;
        for input in &tx.inputs {
            if pool.spent.get(&input.previous.refer_key()) == Some(hash) {
                pool.spent.remove(&input.previous.refer_key());
            }
        }
        Some(tx)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Bumps and returns the received-transaction counter.
    pub fn inc_rx_txn_cnt(&self) -> u64 {
        self.rx_txn_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.pool.lock().expect("tx pool lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_chainstate::MemoryChainState;
    use meridian_primitives::program_hash::OP_CHECKSIG;
    use meridian_primitives::{
        sha256, to_program_hash, Asset, Fixed64, Input, OutPoint, Output, Payload, Program,
    };
    use secp256k1::{Message as SecpMessage, PublicKey, Secp256k1, SecretKey};

    const NATIVE_ASSET: Hash256 = [0xEE; 32];

    fn setup() -> (Arc<MemoryChainState>, Arc<ChainParams>) {
        let state = Arc::new(MemoryChainState::new());
        state.register_asset(
            NATIVE_ASSET,
            Asset {
                name: "native".to_string(),
                precision: 8,
            },
        );
        let mut params = ChainParams::mainnet();
        params.asset_id = NATIVE_ASSET;
        params.min_tx_fee = Fixed64::new(100);
        (state, Arc::new(params))
    }

    fn keyed_code(byte: u8) -> (SecretKey, Vec<u8>) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
        let public = PublicKey::from_secret_key(&secp, &secret);
        let mut code = vec![0x21];
        code.extend_from_slice(&public.serialize());
        code.push(OP_CHECKSIG);
        (secret, code)
    }

    fn sign_tx(tx: &mut Transaction, secret: &SecretKey, code: &[u8]) {
        let secp = Secp256k1::signing_only();
        let digest = sha256(&tx.serialize_unsigned());
        let msg = SecpMessage::from_digest_slice(&digest).expect("digest");
        let signature = secp.sign_ecdsa(&msg, secret).serialize_compact().to_vec();
        tx.programs = vec![Program {
            code: code.to_vec(),
            parameter: signature,
        }];
    }

    fn signed_spend(
        state: &MemoryChainState,
        secret: &SecretKey,
        code: &[u8],
        salt: u8,
    ) -> Transaction {
        let owner = to_program_hash(code).expect("hash");
        let funding = Transaction {
            payload: Payload::TransferAsset,
            payload_version: 0,
            attributes: Vec::new(),
            inputs: vec![Input {
                previous: OutPoint::new([salt; 32], 0),
                sequence: 0,
            }],
            outputs: vec![Output {
                asset_id: NATIVE_ASSET,
                value: Fixed64::new(1000),
                output_lock: 0,
                program_hash: owner,
            }],
            lock_time: u32::from(salt),
            programs: vec![Program {
                code: code.to_vec(),
                parameter: vec![0x01],
            }],
        };
        let funding_hash = funding.hash();
        state.insert_transaction(funding, 1);

        let mut tx = Transaction {
            payload: Payload::TransferAsset,
            payload_version: 0,
            attributes: Vec::new(),
            inputs: vec![Input {
                previous: OutPoint::new(funding_hash, 0),
                sequence: 0,
            }],
            outputs: vec![Output {
                asset_id: NATIVE_ASSET,
                value: Fixed64::new(800),
                output_lock: 0,
                program_hash: owner,
            }],
            lock_time: 0,
            programs: Vec::new(),
        };
        sign_tx(&mut tx, secret, code);
        tx
    }

    #[test]
    fn admits_then_rejects_duplicate() {
        let (state, params) = setup();
        let pool = TxPool::new(Arc::clone(&state), params);
        let (secret, code) = keyed_code(0x23);
        let tx = signed_spend(&state, &secret, &code, 0x51);
        let hash = tx.hash();

        pool.append_to_txn_pool(tx.clone()).expect("first admission");
        assert!(pool.existed_id(&hash));
        assert_eq!(pool.len(), 1);

        let err = pool
            .append_to_txn_pool(tx)
            .expect_err("resubmission is a duplicate");
        assert_eq!(err.kind, RuleErrorKind::TransactionDuplicate);
        // No state change on rejection.
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pooled_inputs_conflict() {
        let (state, params) = setup();
        let pool = TxPool::new(Arc::clone(&state), params);
        let (secret, code) = keyed_code(0x24);
        let tx = signed_spend(&state, &secret, &code, 0x52);

        // Same funding output, different spender.
        let mut rival = tx.clone();
        rival.outputs[0].value = Fixed64::new(700);
        sign_tx(&mut rival, &secret, &code);

        pool.append_to_txn_pool(tx).expect("first spend");
        let err = pool
            .append_to_txn_pool(rival)
            .expect_err("second spend of the same output");
        assert_eq!(err.kind, RuleErrorKind::DoubleSpend);
    }

    #[test]
    fn remove_releases_spent_inputs() {
        let (state, params) = setup();
        let pool = TxPool::new(Arc::clone(&state), params);
        let (secret, code) = keyed_code(0x25);
        let tx = signed_spend(&state, &secret, &code, 0x53);
        let hash = tx.hash();

        pool.append_to_txn_pool(tx.clone()).expect("admit");
        pool.remove(&hash).expect("present");
        assert!(pool.is_empty());
        pool.append_to_txn_pool(tx).expect("slot released");
    }
}
