//! Change-tracking seam between the store and the ledger close machinery.

use crate::ledger::account::{AccountEntry, AccountFrame, LedgerKey};

/// Externally supplied change set. The store notifies it of every committed
/// mutation; rolling back on abort is the implementor's concern.
pub trait LedgerDelta: Send {
    /// Index of the ledger currently being closed; stamped onto every
    /// stored entry.
    fn current_ledger(&self) -> u32;

    fn add_entry(&mut self, frame: &AccountFrame);

    fn mod_entry(&mut self, frame: &AccountFrame);

    fn delete_entry(&mut self, key: &LedgerKey);
}

/// Delta that records every notification, for tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingDelta {
    ledger: u32,
    pub added: Vec<AccountEntry>,
    pub modified: Vec<AccountEntry>,
    pub deleted: Vec<LedgerKey>,
}

impl RecordingDelta {
    pub fn new(ledger: u32) -> Self {
        RecordingDelta {
            ledger,
            ..Default::default()
        }
    }
}

impl LedgerDelta for RecordingDelta {
    fn current_ledger(&self) -> u32 {
        self.ledger
    }

    fn add_entry(&mut self, frame: &AccountFrame) {
        self.added.push(frame.account().clone());
    }

    fn mod_entry(&mut self, frame: &AccountFrame) {
        self.modified.push(frame.account().clone());
    }

    fn delete_entry(&mut self, key: &LedgerKey) {
        self.deleted.push(*key);
    }
}
