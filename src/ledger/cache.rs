//! Entry cache: latest committed frame or tombstone per ledger key.

use std::collections::HashMap;

use crate::ledger::account::{AccountFrame, LedgerKey};

/// Mapping from ledger key to either the latest committed frame or a
/// tombstone (`None`) recording that the entry is known to be absent.
/// Owned by the [`Database`](crate::db::Database) handle, one per instance.
#[derive(Default)]
pub struct EntryCache {
    map: HashMap<LedgerKey, Option<AccountFrame>>,
}

impl EntryCache {
    pub fn new() -> Self {
        EntryCache::default()
    }

    /// True when the key has any cached state, including a tombstone.
    pub fn entry_exists(&self, key: &LedgerKey) -> bool {
        self.map.contains_key(key)
    }

    /// Outer `None`: nothing cached. Inner `None`: tombstone.
    pub fn get_entry(&self, key: &LedgerKey) -> Option<Option<AccountFrame>> {
        self.map.get(key).cloned()
    }

    pub fn put_entry(&mut self, key: LedgerKey, value: Option<AccountFrame>) {
        self.map.insert(key, value);
    }

    pub fn flush_entry(&mut self, key: &LedgerKey) {
        self.map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PublicKey;

    fn key(n: u8) -> LedgerKey {
        LedgerKey::account(PublicKey([n; 32]))
    }

    #[test]
    fn test_empty_cache_has_no_entry() {
        let cache = EntryCache::new();
        assert!(!cache.entry_exists(&key(1)));
        assert!(cache.get_entry(&key(1)).is_none());
    }

    #[test]
    fn test_put_and_get_frame() {
        let mut cache = EntryCache::new();
        let frame = AccountFrame::new(PublicKey([1; 32]));
        cache.put_entry(key(1), Some(frame));
        assert!(cache.entry_exists(&key(1)));
        let cached = cache.get_entry(&key(1)).unwrap().unwrap();
        assert_eq!(cached.id(), &PublicKey([1; 32]));
    }

    #[test]
    fn test_tombstone_is_present_but_empty() {
        let mut cache = EntryCache::new();
        cache.put_entry(key(2), None);
        assert!(cache.entry_exists(&key(2)));
        assert!(cache.get_entry(&key(2)).unwrap().is_none());
    }

    #[test]
    fn test_flush_removes_entry() {
        let mut cache = EntryCache::new();
        cache.put_entry(key(3), None);
        cache.flush_entry(&key(3));
        assert!(!cache.entry_exists(&key(3)));
        // flushing an absent key is a no-op
        cache.flush_entry(&key(3));
    }

    #[test]
    fn test_put_replaces_existing() {
        let mut cache = EntryCache::new();
        cache.put_entry(key(4), None);
        cache.put_entry(key(4), Some(AccountFrame::new(PublicKey([4; 32]))));
        assert!(cache.get_entry(&key(4)).unwrap().is_some());
        assert_eq!(cache.len(), 1);
    }
}
