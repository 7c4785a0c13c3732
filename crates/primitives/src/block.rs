//! Block types, header hashing and the merkle root.

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256d, Hash256};
use crate::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: u32,
}

impl BlockHeader {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.height);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            timestamp: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
            height: decoder.read_u32_le()?,
        })
    }

    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.encode(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            encoder.write_bytes(&tx.serialize());
        }
        encoder.into_inner()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::Overflow)?;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::decode(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }
}

pub fn compute_merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = *layer.last().expect("non-empty");
            layer.push(last);
        }
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            next.push(merkle_hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
    }
    layer[0]
}

pub fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_txid_is_its_own_root() {
        let txid = [0x42; 32];
        assert_eq!(compute_merkle_root(&[txid]), txid);
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let ab = merkle_hash_pair(&a, &b);
        let cc = merkle_hash_pair(&c, &c);
        assert_eq!(compute_merkle_root(&[a, b, c]), merkle_hash_pair(&ab, &cc));
    }
}
