//! Chain parameters consumed by validation and sync.

use meridian_primitives::{Fixed64, Hash256, ProgramHash};

/// Program hash of the foundation destruction address. Spending from it is
/// forbidden even with a valid signature.
pub const DESTRUCTION_ADDRESS: ProgramHash = ProgramHash::new([
    33, 32, 254, 229, 215, 235, 62, 92, 125, 49, 151, 254, 207, 108, 13, 227, 15, 136, 154, 206,
    247,
]);

#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Upper bound on serialized transaction and block size, in bytes.
    pub max_block_size: usize,
    /// Blocks a coinbase-funded output stays locked after its lock-time
    /// height.
    pub coinbase_lock_time: u32,
    /// Minimum fee any non-coinbase transaction must pay.
    pub min_tx_fee: Fixed64,
    /// Minimum fee a cross-chain transfer must pay.
    pub min_cross_chain_tx_fee: Fixed64,
    /// The chain's native asset id; every output must carry it.
    pub asset_id: Hash256,
    /// Receives at least 30% of every coinbase reward.
    pub foundation_address: ProgramHash,
    /// Burn address whose outputs may never be spent.
    pub destruction_address: ProgramHash,
    /// Rotating sidechain arbitrator public keys, indexed by height.
    pub arbitrators: Vec<Vec<u8>>,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            max_block_size: 8_000_000,
            coinbase_lock_time: 100,
            min_tx_fee: Fixed64::new(100),
            min_cross_chain_tx_fee: Fixed64::new(10_000),
            asset_id: mainnet_asset_id(),
            foundation_address: mainnet_foundation_address(),
            destruction_address: DESTRUCTION_ADDRESS,
            arbitrators: Vec::new(),
        }
    }

    /// The arbitrator responsible for the given height, or `None` when the
    /// rotation list is empty.
    pub fn current_arbitrator(&self, height: u32) -> Option<&[u8]> {
        if self.arbitrators.is_empty() {
            return None;
        }
        let index = height as usize % self.arbitrators.len();
        Some(self.arbitrators[index].as_slice())
    }
}

fn mainnet_asset_id() -> Hash256 {
    let mut id = [0u8; 32];
    id[0] = 0xB0;
    id[31] = 0x37;
    id
}

fn mainnet_foundation_address() -> ProgramHash {
    let mut bytes = [0u8; 21];
    bytes[0] = meridian_primitives::PREFIX_STANDARD;
    bytes[1..].copy_from_slice(&[
        0x12, 0x9E, 0x9C, 0xF1, 0xC5, 0xF3, 0x36, 0xFC, 0xF3, 0xA6, 0xC9, 0x54, 0x44, 0x4E, 0xD4,
        0x82, 0xC5, 0xD9, 0x16, 0xE5,
    ]);
    ProgramHash::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitrator_rotation_wraps() {
        let mut params = ChainParams::mainnet();
        params.arbitrators = vec![vec![1], vec![2], vec![3]];
        assert_eq!(params.current_arbitrator(0), Some(&[1u8][..]));
        assert_eq!(params.current_arbitrator(4), Some(&[2u8][..]));
        assert_eq!(params.current_arbitrator(299), Some(&[3u8][..]));
    }

    #[test]
    fn empty_rotation_has_no_arbitrator() {
        let params = ChainParams::mainnet();
        assert!(params.current_arbitrator(42).is_none());
    }
}
