//! Consensus-engine seam.
//!
//! The overlay delivers transactions, transaction sets, quorum sets, and
//! SCP envelopes to the herder and answers peer queries from it. Only the
//! interface the overlay consumes is defined here; [`InMemoryHerder`] is
//! the minimal implementation the node binary and tests run against.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::crypto::{hex_abbrev, sha256, Hash};
use crate::overlay::message::{MessageType, ScpEnvelope, ScpQuorumSet, TransactionEnvelope, TxSet};

/// Outcome of submitting a transaction. Only `Pending` triggers
/// rebroadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Duplicate,
    Error,
}

/// A transaction set under consideration, addressed by its contents hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSetFrame {
    pub previous_ledger_hash: Hash,
    pub txs: Vec<TransactionEnvelope>,
}

impl TxSetFrame {
    pub fn from_wire(wire: TxSet) -> Self {
        TxSetFrame {
            previous_ledger_hash: wire.previous_ledger_hash,
            txs: wire.txs,
        }
    }

    pub fn to_wire(&self) -> TxSet {
        TxSet {
            previous_ledger_hash: self.previous_ledger_hash,
            txs: self.txs.clone(),
        }
    }

    /// Contents hash: SHA-256 over the previous ledger hash and the
    /// envelopes in hash order, so the same set always addresses the same.
    pub fn contents_hash(&self) -> Hash {
        let mut sorted: Vec<&TransactionEnvelope> = self.txs.iter().collect();
        sorted.sort_by_key(|tx| tx.contents_hash());
        let mut bytes = Vec::with_capacity(32 + self.txs.iter().map(|t| t.0.len()).sum::<usize>());
        bytes.extend_from_slice(&self.previous_ledger_hash);
        for tx in sorted {
            bytes.extend_from_slice(&tx.0);
        }
        sha256(&bytes)
    }
}

#[async_trait]
pub trait Herder: Send + Sync {
    async fn recv_transaction(&self, tx: TransactionEnvelope) -> TxStatus;

    async fn recv_tx_set(&self, hash: Hash, frame: TxSetFrame);

    async fn recv_scp_envelope(&self, envelope: ScpEnvelope);

    async fn recv_scp_quorum_set(&self, hash: Hash, qset: ScpQuorumSet);

    async fn get_tx_set(&self, hash: &Hash) -> Option<TxSetFrame>;

    async fn get_qset(&self, hash: &Hash) -> Option<ScpQuorumSet>;

    /// A peer answered one of our fetches with DONT_HAVE.
    async fn peer_doesnt_have(&self, message_type: MessageType, req_hash: Hash, peer: u64);
}

/// Hash-indexed herder state, enough to answer overlay fetches.
#[derive(Default)]
pub struct InMemoryHerder {
    seen_txs: Mutex<HashSet<Hash>>,
    tx_sets: Mutex<HashMap<Hash, TxSetFrame>>,
    qsets: Mutex<HashMap<Hash, ScpQuorumSet>>,
}

impl InMemoryHerder {
    pub fn new() -> Self {
        InMemoryHerder::default()
    }
}

#[async_trait]
impl Herder for InMemoryHerder {
    async fn recv_transaction(&self, tx: TransactionEnvelope) -> TxStatus {
        let hash = tx.contents_hash();
        let mut seen = self.seen_txs.lock().expect("herder state poisoned");
        if seen.insert(hash) {
            TxStatus::Pending
        } else {
            TxStatus::Duplicate
        }
    }

    async fn recv_tx_set(&self, hash: Hash, frame: TxSetFrame) {
        self.tx_sets
            .lock()
            .expect("herder state poisoned")
            .insert(hash, frame);
    }

    async fn recv_scp_envelope(&self, envelope: ScpEnvelope) {
        debug!(envelope = %hex_abbrev(&sha256(&envelope.0)), "received SCP envelope");
    }

    async fn recv_scp_quorum_set(&self, hash: Hash, qset: ScpQuorumSet) {
        self.qsets
            .lock()
            .expect("herder state poisoned")
            .insert(hash, qset);
    }

    async fn get_tx_set(&self, hash: &Hash) -> Option<TxSetFrame> {
        self.tx_sets
            .lock()
            .expect("herder state poisoned")
            .get(hash)
            .cloned()
    }

    async fn get_qset(&self, hash: &Hash) -> Option<ScpQuorumSet> {
        self.qsets
            .lock()
            .expect("herder state poisoned")
            .get(hash)
            .cloned()
    }

    async fn peer_doesnt_have(&self, message_type: MessageType, req_hash: Hash, peer: u64) {
        debug!(
            msg_type = message_type.name(),
            req_hash = %hex_abbrev(&req_hash),
            peer,
            "peer does not have requested item"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_submission_is_pending_then_duplicate() {
        let herder = InMemoryHerder::new();
        let tx = TransactionEnvelope(vec![1, 2, 3]);
        assert_eq!(herder.recv_transaction(tx.clone()).await, TxStatus::Pending);
        assert_eq!(herder.recv_transaction(tx).await, TxStatus::Duplicate);
    }

    #[tokio::test]
    async fn test_tx_set_lookup_by_hash() {
        let herder = InMemoryHerder::new();
        let frame = TxSetFrame {
            previous_ledger_hash: [1; 32],
            txs: vec![TransactionEnvelope(vec![9])],
        };
        let hash = frame.contents_hash();
        assert!(herder.get_tx_set(&hash).await.is_none());
        herder.recv_tx_set(hash, frame.clone()).await;
        assert_eq!(herder.get_tx_set(&hash).await, Some(frame));
    }

    #[test]
    fn test_contents_hash_ignores_submission_order() {
        let a = TransactionEnvelope(vec![1]);
        let b = TransactionEnvelope(vec![2]);
        let one = TxSetFrame {
            previous_ledger_hash: [0; 32],
            txs: vec![a.clone(), b.clone()],
        };
        let two = TxSetFrame {
            previous_ledger_hash: [0; 32],
            txs: vec![b, a],
        };
        assert_eq!(one.contents_hash(), two.contents_hash());
    }

    #[test]
    fn test_contents_hash_binds_previous_ledger() {
        let tx = TransactionEnvelope(vec![1]);
        let one = TxSetFrame {
            previous_ledger_hash: [0; 32],
            txs: vec![tx.clone()],
        };
        let two = TxSetFrame {
            previous_ledger_hash: [1; 32],
            txs: vec![tx],
        };
        assert_ne!(one.contents_hash(), two.contents_hash());
    }
}
