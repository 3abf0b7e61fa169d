//! In-memory account entry and its invariants.

use eyre::{eyre, Result};

use crate::crypto::PublicKey;
use crate::ledger::LedgerManager;

pub type AccountId = PublicKey;

/// Identifies a ledger entry by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerKey {
    Account { account_id: AccountId },
}

impl LedgerKey {
    pub fn account(account_id: AccountId) -> Self {
        LedgerKey::Account { account_id }
    }

    pub fn account_id(&self) -> &AccountId {
        match self {
            LedgerKey::Account { account_id } => account_id,
        }
    }
}

pub const THRESHOLD_MASTER_WEIGHT: usize = 0;
pub const THRESHOLD_LOW: usize = 1;
pub const THRESHOLD_MED: usize = 2;
pub const THRESHOLD_HIGH: usize = 3;

/// Flags bitset: bit 0 requires issuer authorization of trust.
pub const AUTH_REQUIRED_FLAG: u32 = 0x1;

/// A (publicKey, weight) tuple authorising operations up to its weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signer {
    pub pub_key: PublicKey,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEntry {
    pub account_id: AccountId,
    pub balance: i64,
    pub seq_num: u64,
    pub num_sub_entries: u32,
    pub inflation_dest: Option<PublicKey>,
    pub home_domain: String,
    /// [master, low, medium, high] weights.
    pub thresholds: [u8; 4],
    pub flags: u32,
    pub last_modified: u32,
    /// Sorted by pub_key ascending; unique pub_key.
    pub signers: Vec<Signer>,
}

impl AccountEntry {
    pub fn new(account_id: AccountId) -> Self {
        AccountEntry {
            account_id,
            balance: 0,
            seq_num: 0,
            num_sub_entries: 0,
            inflation_dest: None,
            home_domain: String::new(),
            // by default, master key's weight is 1
            thresholds: [1, 0, 0, 0],
            flags: 0,
            last_modified: 0,
            signers: Vec::new(),
        }
    }
}

/// Account entry plus the transient load/store state that never reaches
/// disk. The frame is sole owner of its entry; mutation goes through
/// [`AccountFrame::account_mut`].
#[derive(Debug, Clone)]
pub struct AccountFrame {
    entry: AccountEntry,
    is_new: bool,
    update_signers: bool,
}

impl AccountFrame {
    pub fn new(account_id: AccountId) -> Self {
        AccountFrame {
            entry: AccountEntry::new(account_id),
            is_new: false,
            update_signers: false,
        }
    }

    /// Wrap an existing entry. A populated signer list may differ from disk,
    /// so it flags the signer diff on the next store.
    pub fn from_entry(entry: AccountEntry) -> Self {
        let update_signers = !entry.signers.is_empty();
        AccountFrame {
            entry,
            is_new: false,
            update_signers,
        }
    }

    /// Non-persistable placeholder for signature validation only: the
    /// negative balance trips the store's balance check on any attempt to
    /// save it.
    pub fn make_auth_only_account(account_id: AccountId) -> Self {
        let mut frame = AccountFrame::new(account_id);
        frame.entry.balance = i64::MIN;
        frame
    }

    pub fn account(&self) -> &AccountEntry {
        &self.entry
    }

    pub fn account_mut(&mut self) -> &mut AccountEntry {
        &mut self.entry
    }

    pub fn id(&self) -> &AccountId {
        &self.entry.account_id
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::account(self.entry.account_id)
    }

    pub fn balance(&self) -> i64 {
        self.entry.balance
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn set_is_new(&mut self, v: bool) {
        self.is_new = v;
    }

    pub fn update_signers(&self) -> bool {
        self.update_signers
    }

    pub fn set_update_signers(&mut self, v: bool) {
        self.update_signers = v;
    }

    pub fn is_auth_required(&self) -> bool {
        self.entry.flags & AUTH_REQUIRED_FLAG != 0
    }

    pub fn master_weight(&self) -> u32 {
        self.entry.thresholds[THRESHOLD_MASTER_WEIGHT] as u32
    }

    pub fn low_threshold(&self) -> u32 {
        self.entry.thresholds[THRESHOLD_LOW] as u32
    }

    pub fn medium_threshold(&self) -> u32 {
        self.entry.thresholds[THRESHOLD_MED] as u32
    }

    pub fn high_threshold(&self) -> u32 {
        self.entry.thresholds[THRESHOLD_HIGH] as u32
    }

    pub fn minimum_balance(&self, lm: &dyn LedgerManager) -> i64 {
        lm.min_balance(self.entry.num_sub_entries)
    }

    /// Balance spendable above the reserve, clamped at zero: nothing can
    /// leave an account that fell below the reserve after a reserve raise.
    pub fn balance_above_reserve(&self, lm: &dyn LedgerManager) -> i64 {
        let avail = self.entry.balance - self.minimum_balance(lm);
        avail.max(0)
    }

    /// Adjust the subentry count. Returns `Ok(false)` without mutating when
    /// the balance cannot cover the reserve for the grown count; a negative
    /// resulting count is a caller bug and errors out.
    pub fn add_num_entries(&mut self, count: i32, lm: &dyn LedgerManager) -> Result<bool> {
        let new_count = self.entry.num_sub_entries as i64 + count as i64;
        if new_count < 0 {
            return Err(eyre!("invalid account state"));
        }
        // only check the reserve when attempting to add subentries
        if count > 0 && self.entry.balance < lm.min_balance(new_count as u32) {
            return Ok(false);
        }
        self.entry.num_sub_entries = new_count as u32;
        Ok(true)
    }

    /// Sort signers by public key ascending. Must be called after any
    /// construction that populates the signer list.
    pub fn normalize(&mut self) {
        self.entry.signers.sort_by(|a, b| a.pub_key.cmp(&b.pub_key));
    }
}
