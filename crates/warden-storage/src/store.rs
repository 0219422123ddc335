//! Key-value policy store.
//!
//! Every component reads and writes policy through [`PolicyStore`]. Each
//! operation touches a single key and is atomic with respect to other
//! operations on that key. Expired keys behave exactly like absent keys.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

/// Single-key atomic operations over strings and string sets.
pub trait PolicyStore: Send + Sync {
    /// Returns the string stored at `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores a string, replacing any previous value.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>);

    /// Stores a string only if the key is absent. Returns true if written.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;

    /// Stores a string only if the key is present. Returns true if written.
    fn set_if_present(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;

    /// Re-arms the TTL of a present key. Returns true if the key exists.
    fn touch(&self, key: &str, ttl: Duration) -> bool;

    /// Removes a key. Returns true if something was removed.
    fn delete(&self, key: &str) -> bool;

    /// Returns the members of the set at `key`.
    fn members(&self, key: &str) -> Vec<String>;

    /// True if `member` is in the set at `key`.
    fn is_member(&self, key: &str, member: &str) -> bool;

    /// Adds a member to a set. Returns true if it was not already present.
    fn add_member(&self, key: &str, member: &str) -> bool;

    /// Removes a member from a set. Returns true if it was present.
    fn remove_member(&self, key: &str, member: &str) -> bool;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store backed by a sharded concurrent map.
///
/// Expiry is lazy: an expired entry is dropped when next read, or in bulk by
/// [`MemoryStore::purge_expired`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all expired entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// True if no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .and_then(|at| at.checked_duration_since(now))
    }

    fn expire(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
    }
}

impl PolicyStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                return match &entry.value {
                    Value::Str(s) => Some(s.clone()),
                    Value::Set(_) => None,
                };
            }
            Some(_) => {}
            None => return None,
        }
        self.expire(key, now);
        None
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl));
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let entry = Entry::new(Value::Str(value.to_string()), ttl);
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(entry);
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    fn set_if_present(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(occupied) if occupied.get().is_expired(now) => {
                occupied.remove();
                false
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(Entry::new(Value::Str(value.to_string()), ttl));
                true
            }
            MapEntry::Vacant(_) => false,
        }
    }

    fn touch(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                return true;
            }
            Some(_) => {}
            None => return false,
        }
        self.expire(key, now);
        false
    }

    fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired(now))
    }

    fn members(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                Value::Set(set) => set.iter().cloned().collect(),
                Value::Str(_) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn is_member(&self, key: &str, member: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|entry| {
            !entry.is_expired(now)
                && matches!(&entry.value, Value::Set(set) if set.contains(member))
        })
    }

    fn add_member(&self, key: &str, member: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(HashSet::new()), None));
        if entry.is_expired(now) || !matches!(entry.value, Value::Set(_)) {
            *entry = Entry::new(Value::Set(HashSet::new()), None);
        }
        match &mut entry.value {
            Value::Set(set) => set.insert(member.to_string()),
            Value::Str(_) => false,
        }
    }

    fn remove_member(&self, key: &str, member: &str) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                Value::Set(set) => set.remove(member),
                Value::Str(_) => false,
            },
            _ => false,
        }
    }
}
