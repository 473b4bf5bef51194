//! In-process store backed by DashMap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{CounterSnapshot, SharedStore, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Bytes(Arc<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Single-instance store. Each operation holds the shard lock for its key, so
/// increments are linearizable within the process.
///
/// Expired entries are treated as absent and dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_within_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> StoreResult<CounterSnapshot> {
        let now = Instant::now();
        if limit == 0 {
            return Ok(CounterSnapshot {
                count: 0,
                expires_in: window,
                admitted: false,
            });
        }
        let fresh = CounterSnapshot {
            count: 1,
            expires_in: window,
            admitted: true,
        };
        let new_entry = || StoredEntry {
            value: Value::Counter(1),
            expires_at: now + window,
        };

        let snapshot = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let live = match entry.value {
                    Value::Counter(count) if !entry.is_expired(now) => Some(count),
                    _ => None,
                };
                match live {
                    Some(count) if count < limit => {
                        entry.value = Value::Counter(count + 1);
                        CounterSnapshot {
                            count: count + 1,
                            expires_in: entry.expires_at - now,
                            admitted: true,
                        }
                    }
                    Some(count) => CounterSnapshot {
                        count,
                        expires_in: entry.expires_at - now,
                        admitted: false,
                    },
                    // Expired, or a non-counter value: start a new window.
                    None => {
                        *entry = new_entry();
                        fresh
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(new_entry());
                fresh
            }
        };
        Ok(snapshot)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(match &entry.value {
                    Value::Bytes(data) => Some(data.as_ref().clone()),
                    Value::Counter(count) => Some(count.to_string().into_bytes()),
                });
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: Value::Bytes(Arc::new(value.to_vec())),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) {
        self.entries.clear();
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
