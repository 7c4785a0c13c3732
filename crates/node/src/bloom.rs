//! Bloom filters installed by SPV peers and the merkle blocks served back
//! to them.

use meridian_primitives::{merkle_hash_pair, Block, Hash256, Transaction};

use crate::message::{FilterLoadPayload, MerkleBlockPayload};

/// Largest accepted filter, in bytes.
pub const MAX_FILTER_SIZE: usize = 36_000;
/// Most hash functions a filter may request.
pub const MAX_HASH_FUNCS: u32 = 50;

const MURMUR_SEED_FACTOR: u32 = 0xFBA4_C795;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    filter: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    pub fn from_payload(payload: &FilterLoadPayload) -> Option<Self> {
        if payload.filter.is_empty()
            || payload.filter.len() > MAX_FILTER_SIZE
            || payload.hash_funcs == 0
            || payload.hash_funcs > MAX_HASH_FUNCS
        {
            return None;
        }
        Some(Self {
            filter: payload.filter.clone(),
            hash_funcs: payload.hash_funcs,
            tweak: payload.tweak,
        })
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|n| {
            let bit = self.bit_index(n, data);
            self.filter[bit >> 3] & (1 << (bit & 7)) != 0
        })
    }

    pub fn insert(&mut self, data: &[u8]) {
        for n in 0..self.hash_funcs {
            let bit = self.bit_index(n, data);
            self.filter[bit >> 3] |= 1 << (bit & 7);
        }
    }

    /// Matches a transaction against the filter; on an output match the
    /// spending outpoint is folded in so follow-up spends match too.
    pub fn match_tx_and_update(&mut self, tx: &Transaction) -> bool {
        let txid = tx.hash();
        let mut matched = self.contains(&txid);

        for (index, output) in tx.outputs.iter().enumerate() {
            if self.contains(output.program_hash.as_bytes()) {
                matched = true;
                let outpoint =
                    meridian_primitives::OutPoint::new(txid, index as u16).refer_key();
                self.insert(&outpoint);
            }
        }

        for input in &tx.inputs {
            if self.contains(&input.previous.refer_key()) {
                matched = true;
            }
        }

        matched
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n
            .wrapping_mul(MURMUR_SEED_FACTOR)
            .wrapping_add(self.tweak);
        murmur3_32(seed, data) as usize % (self.filter.len() * 8)
    }
}

fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash = (hash ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (shift, byte) in tail.iter().enumerate() {
            k |= u32::from(*byte) << (8 * shift);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85EB_CA6B);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xC2B2_AE35);
    hash ^ (hash >> 16)
}

/// Builds the partial merkle tree a filtered-block response carries, plus
/// the indexes of the matched transactions.
pub fn build_merkle_block(
    block: &Block,
    filter: &mut BloomFilter,
) -> (MerkleBlockPayload, Vec<usize>) {
    let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.hash()).collect();
    if txids.is_empty() {
        return (
            MerkleBlockPayload {
                header: block.header.clone(),
                total_transactions: 0,
                hashes: Vec::new(),
                flags: Vec::new(),
            },
            Vec::new(),
        );
    }
    let mut matches = vec![false; txids.len()];
    let mut matched_indexes = Vec::new();
    for (index, tx) in block.transactions.iter().enumerate() {
        if filter.match_tx_and_update(tx) {
            matches[index] = true;
            matched_indexes.push(index);
        }
    }

    let mut builder = PartialMerkleBuilder {
        txids: &txids,
        matches: &matches,
        bits: Vec::new(),
        hashes: Vec::new(),
    };
    let mut height = 0u32;
    while builder.width(height) > 1 {
        height += 1;
    }
    builder.traverse(height, 0);

    let mut flags = vec![0u8; (builder.bits.len() + 7) / 8];
    for (index, bit) in builder.bits.iter().enumerate() {
        if *bit {
            flags[index >> 3] |= 1 << (index & 7);
        }
    }

    (
        MerkleBlockPayload {
            header: block.header.clone(),
            total_transactions: txids.len() as u32,
            hashes: builder.hashes,
            flags,
        },
        matched_indexes,
    )
}

struct PartialMerkleBuilder<'a> {
    txids: &'a [Hash256],
    matches: &'a [bool],
    bits: Vec<bool>,
    hashes: Vec<Hash256>,
}

impl PartialMerkleBuilder<'_> {
    fn width(&self, height: u32) -> usize {
        (self.txids.len() + (1 << height) - 1) >> height
    }

    fn traverse(&mut self, height: u32, pos: usize) {
        let parent_of_match = self.subtree_has_match(height, pos);
        self.bits.push(parent_of_match);
        if height == 0 || !parent_of_match {
            self.hashes.push(self.subtree_hash(height, pos));
        } else {
            self.traverse(height - 1, pos * 2);
            if pos * 2 + 1 < self.width(height - 1) {
                self.traverse(height - 1, pos * 2 + 1);
            }
        }
    }

    fn subtree_has_match(&self, height: u32, pos: usize) -> bool {
        let start = pos << height;
        let end = ((pos + 1) << height).min(self.txids.len());
        self.matches[start..end].iter().any(|matched| *matched)
    }

    fn subtree_hash(&self, height: u32, pos: usize) -> Hash256 {
        if height == 0 {
            return self.txids[pos];
        }
        let left = self.subtree_hash(height - 1, pos * 2);
        let right = if pos * 2 + 1 < self.width(height - 1) {
            self.subtree_hash(height - 1, pos * 2 + 1)
        } else {
            left
        };
        merkle_hash_pair(&left, &right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_primitives::{
        compute_merkle_root, BlockHeader, Fixed64, Input, OutPoint, Output, Payload, Program,
        ProgramHash,
    };

    fn filter_with(items: &[&[u8]]) -> BloomFilter {
        let mut filter = BloomFilter::from_payload(&FilterLoadPayload {
            filter: vec![0u8; 128],
            hash_funcs: 5,
            tweak: 0xDEAD_BEEF,
            flags: 0,
        })
        .expect("valid payload");
        for item in items {
            filter.insert(item);
        }
        filter
    }

    fn simple_tx(nonce: u8) -> Transaction {
        Transaction {
            payload: Payload::TransferAsset,
            payload_version: 0,
            attributes: Vec::new(),
            inputs: vec![Input {
                previous: OutPoint::new([nonce; 32], 0),
                sequence: 0,
            }],
            outputs: vec![Output {
                asset_id: [0xEE; 32],
                value: Fixed64::new(10),
                output_lock: 0,
                program_hash: ProgramHash::new([nonce; 21]),
            }],
            lock_time: 0,
            programs: vec![Program {
                code: vec![0x21, 0xAC],
                parameter: vec![0x01],
            }],
        }
    }

    #[test]
    fn inserted_items_match() {
        let filter = filter_with(&[b"hello"]);
        assert!(filter.contains(b"hello"));
        assert!(!filter.contains(b"goodbye"));
    }

    #[test]
    fn payload_caps_are_enforced() {
        assert!(BloomFilter::from_payload(&FilterLoadPayload {
            filter: vec![0u8; MAX_FILTER_SIZE + 1],
            hash_funcs: 5,
            tweak: 0,
            flags: 0,
        })
        .is_none());
        assert!(BloomFilter::from_payload(&FilterLoadPayload {
            filter: vec![0u8; 8],
            hash_funcs: MAX_HASH_FUNCS + 1,
            tweak: 0,
            flags: 0,
        })
        .is_none());
    }

    #[test]
    fn matching_output_folds_in_outpoint() {
        let tx = simple_tx(0x42);
        let txid = tx.hash();
        let mut filter = filter_with(&[tx.outputs[0].program_hash.as_bytes()]);
        assert!(filter.match_tx_and_update(&tx));
        // The spend of the matched output now matches as well.
        assert!(filter.contains(&OutPoint::new(txid, 0).refer_key()));
    }

    #[test]
    fn merkle_block_root_matches_full_tree() {
        let transactions = vec![simple_tx(1), simple_tx(2), simple_tx(3)];
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: compute_merkle_root(&txids),
                timestamp: 0,
                bits: 0,
                nonce: 0,
                height: 9,
            },
            transactions,
        };

        let mut filter = filter_with(&[&txids[1]]);
        let (payload, matched) = build_merkle_block(&block, &mut filter);
        assert_eq!(matched, vec![1]);
        assert_eq!(payload.total_transactions, 3);
        // The matched leaf is carried explicitly.
        assert!(payload.hashes.contains(&txids[1]));
    }

    #[test]
    fn merkle_block_with_no_matches_carries_only_root() {
        let transactions = vec![simple_tx(1), simple_tx(2)];
        let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: [0u8; 32],
                merkle_root: compute_merkle_root(&txids),
                timestamp: 0,
                bits: 0,
                nonce: 0,
                height: 9,
            },
            transactions,
        };

        let mut filter = filter_with(&[]);
        let (payload, matched) = build_merkle_block(&block, &mut filter);
        assert!(matched.is_empty());
        assert_eq!(payload.hashes, vec![compute_merkle_root(&txids)]);
    }
}
