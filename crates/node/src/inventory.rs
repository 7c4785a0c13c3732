//! Tracks block hashes with an outstanding getdata and hashes already
//! relayed to neighbors.

use std::collections::HashSet;
use std::sync::Mutex;

use meridian_primitives::Hash256;

#[derive(Default)]
pub struct RequestTracker {
    requested_blocks: Mutex<HashSet<Hash256>>,
    relayed: Mutex<HashSet<Hash256>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the hash was already requested, so a block is
    /// fetched from at most one peer at a time.
    pub fn add_requested_block(&self, hash: Hash256) -> bool {
        self.requested().insert(hash)
    }

    pub fn is_requested_block(&self, hash: &Hash256) -> bool {
        self.requested().contains(hash)
    }

    /// Called on both successful and failed block receipt.
    pub fn delete_requested_block(&self, hash: &Hash256) {
        self.requested().remove(hash);
    }

    /// Returns true the first time a hash is recorded for relay.
    pub fn note_relayed(&self, hash: Hash256) -> bool {
        self.relayed
            .lock()
            .expect("relay set lock poisoned")
            .insert(hash)
    }

    fn requested(&self) -> std::sync::MutexGuard<'_, HashSet<Hash256>> {
        self.requested_blocks
            .lock()
            .expect("requested set lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_blocks_are_unique() {
        let tracker = RequestTracker::new();
        assert!(tracker.add_requested_block([1u8; 32]));
        assert!(!tracker.add_requested_block([1u8; 32]));
        assert!(tracker.is_requested_block(&[1u8; 32]));

        tracker.delete_requested_block(&[1u8; 32]);
        assert!(!tracker.is_requested_block(&[1u8; 32]));
        // Receipt clears the slot, so the hash may be requested again.
        assert!(tracker.add_requested_block([1u8; 32]));
    }

    #[test]
    fn relay_notes_fire_once() {
        let tracker = RequestTracker::new();
        assert!(tracker.note_relayed([7u8; 32]));
        assert!(!tracker.note_relayed([7u8; 32]));
    }
}
