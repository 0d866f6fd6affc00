//! Prefix-addressable index from unique keys to opaque items.
//!
//! The kubelet habitually abbreviates pod, container, and image ids the way
//! `kubectl` users do, so every lookup in the runtime goes through this
//! index: a full key always wins, a unique prefix resolves, and a shared
//! prefix is reported as ambiguous rather than guessed at.
//!
//! The index carries no domain knowledge. Items are stored behind [`Arc`] so
//! a resolved item stays valid after the entry is deleted.
//!
//! Keys are kept in an ordered map; a prefix lookup is a range scan from the
//! prefix, which visits exactly the keys a radix-tree subtree walk would.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Thread-safe map from unique string keys to shared items, addressable by
/// unambiguous key prefixes. Many concurrent readers, exclusive writers.
#[derive(Debug)]
pub struct TruncIndex<T> {
    entries: RwLock<BTreeMap<String, Arc<T>>>,
}

impl<T> Default for TruncIndex<T> {
    fn default() -> Self {
        TruncIndex {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T> TruncIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entry under a unique key.
    ///
    /// Keys must be non-empty printable strings without spaces; a duplicate
    /// key is rejected so ids can never be silently rebound.
    pub fn add(&self, key: &str, item: T) -> Result<()> {
        if key.is_empty() || key.contains(' ') || key.chars().any(|c| c.is_control()) {
            return Err(Error::InvalidConfig(format!("illegal index key {key:?}")));
        }
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(key) {
            return Err(Error::AlreadyExists(format!("key {key}")));
        }
        entries.insert(key.to_string(), Arc::new(item));
        Ok(())
    }

    /// Delete the entry stored under the exact key.
    pub fn delete(&self, key: &str) -> Result<Arc<T>> {
        self.entries
            .write()
            .unwrap()
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("key {key}")))
    }

    /// Resolve a key prefix to the unique item whose key starts with it.
    ///
    /// A prefix equal to a full key is unambiguous and wins even when longer
    /// keys share it.
    pub fn get(&self, prefix: &str) -> Result<Arc<T>> {
        if prefix.is_empty() {
            return Err(Error::not_found("empty id"));
        }
        let entries = self.entries.read().unwrap();
        if let Some(item) = entries.get(prefix) {
            return Ok(item.clone());
        }

        let mut matches = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some((_, item)), None) => Ok(item.clone()),
            (Some(_), Some(_)) => Err(Error::Ambiguous(prefix.to_string())),
            (None, _) => Err(Error::not_found(format!("id {prefix}"))),
        }
    }

    /// Visit every entry under the read lock.
    ///
    /// The callback must not re-enter the index: adds and deletes from
    /// inside it would deadlock on the lock this iteration holds.
    pub fn iterate(&self, mut f: impl FnMut(&str, &Arc<T>)) {
        for (key, item) in self.entries.read().unwrap().iter() {
            f(key, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(keys: &[&str]) -> TruncIndex<String> {
        let index = TruncIndex::new();
        for key in keys {
            index.add(key, key.to_string()).unwrap();
        }
        index
    }

    #[test]
    fn add_rejects_duplicates_and_illegal_keys() {
        let index = index_of(&["abc123"]);

        assert!(matches!(
            index.add("abc123", String::new()),
            Err(Error::AlreadyExists(_))
        ));
        for bad in ["", "has space", "has\ttab"] {
            assert!(matches!(
                index.add(bad, String::new()),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn unique_prefix_resolves() {
        let index = index_of(&["abc123", "abc456", "def789"]);

        assert_eq!(*index.get("abc1").unwrap(), "abc123");
        assert_eq!(*index.get("d").unwrap(), "def789");
        assert_eq!(*index.get("abc456").unwrap(), "abc456");
    }

    #[test]
    fn shared_prefix_is_ambiguous() {
        let index = index_of(&["abc123", "abc456"]);

        assert!(matches!(index.get("abc"), Err(Error::Ambiguous(_))));
        assert!(matches!(index.get("zzz"), Err(Error::NotFound(_))));
        assert!(matches!(index.get(""), Err(Error::NotFound(_))));
    }

    #[test]
    fn exact_key_wins_over_longer_neighbors() {
        let index = index_of(&["abc", "abcd", "abcde"]);

        assert_eq!(*index.get("abc").unwrap(), "abc");
        assert!(matches!(index.get("abcd"), Err(Error::Ambiguous(_))));
        // Delete frees the prefix for the remaining key.
        index.delete("abc").unwrap();
        index.delete("abcd").unwrap();
        assert_eq!(*index.get("abc").unwrap(), "abcde");
    }

    #[test]
    fn delete_then_lookup_reports_not_found() {
        let index = index_of(&["abc123"]);

        index.delete("abc123").unwrap();
        assert!(matches!(index.delete("abc123"), Err(Error::NotFound(_))));
        assert!(matches!(index.get("abc"), Err(Error::NotFound(_))));
    }

    #[test]
    fn iterate_visits_all_entries() {
        let index = index_of(&["a1", "b2", "c3"]);

        let mut seen = Vec::new();
        index.iterate(|key, item| seen.push((key.to_string(), item.as_ref().clone())));
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|(key, item)| key == item));
    }
}
