//! Flood memoization: recently seen flooded messages and who already has
//! them.

use std::collections::HashMap;

use crate::crypto::Hash;
use crate::overlay::message::StellarMessage;

#[derive(Debug, Clone)]
pub struct FloodRecord {
    pub message: StellarMessage,
    pub ledger_index: u32,
    /// Peers that already saw this message: the originator plus anyone we
    /// forwarded to.
    pub told_peers: Vec<u64>,
}

/// Keyed table of recently flooded messages, garbage-collected by ledger
/// age. Per-ledger GC bounds memory; the told-peer set prevents duplicate
/// delivery without global deduplication state on each peer.
#[derive(Default)]
pub struct Floodgate {
    flood_map: HashMap<Hash, FloodRecord>,
}

impl Floodgate {
    pub fn new() -> Self {
        Floodgate::default()
    }

    /// Record a flooded message, replacing any previous record for the
    /// same index with a fresh one that only knows `first_peer`.
    pub fn add_record(
        &mut self,
        index: Hash,
        message: StellarMessage,
        ledger_index: u32,
        first_peer: u64,
    ) {
        self.flood_map.insert(
            index,
            FloodRecord {
                message,
                ledger_index,
                told_peers: vec![first_peer],
            },
        );
    }

    pub fn contains(&self, index: &Hash) -> bool {
        self.flood_map.contains_key(index)
    }

    /// Hand the recorded message and its exclusion list to the overlay's
    /// fan-out. No-op when the index is unknown.
    pub fn broadcast<F>(&self, index: &Hash, mut send: F)
    where
        F: FnMut(&StellarMessage, &[u64]),
    {
        if let Some(record) = self.flood_map.get(index) {
            send(&record.message, &record.told_peers);
        }
    }

    /// Remove old flood records once their ledger has closed.
    pub fn clear_below(&mut self, current_ledger: u32) {
        self.flood_map
            .retain(|_, record| record.ledger_index >= current_ledger);
    }

    pub fn len(&self) -> usize {
        self.flood_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flood_map.is_empty()
    }
}
