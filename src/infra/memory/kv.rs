//! Key-value store held in process, with expiry and blocking list pops.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::application::repos::{KeyValueStore, SetMode, StoreError};

use super::lock::mutex_lock;

const SOURCE: &str = "infra::memory::kv";

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Held {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Held {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Mirrors the Redis commands the cache and coordination layers rely on.
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance it.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Held>>,
    pushed: Notify,
    offline: AtomicBool,
    writes: AtomicUsize,
}

fn live<'a>(entries: &'a mut HashMap<String, Held>, key: &str) -> Option<&'a mut Held> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|held| !held.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable server.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful mutating commands.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of a list, head first. Empty for missing or non-list keys.
    pub fn list(&self, key: &str) -> Vec<String> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "list");
        match live(&mut entries, key) {
            Some(Held {
                slot: Slot::List(items),
                ..
            }) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory kv offline"));
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn push(&self, key: &str, value: &str, head: bool) -> Result<u64, StoreError> {
        self.ensure_online()?;
        let len = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "push");
            if live(&mut entries, key).is_none() {
                entries.insert(
                    key.to_string(),
                    Held {
                        slot: Slot::List(VecDeque::new()),
                        expires_at: None,
                    },
                );
            }
            match live(&mut entries, key).map(|held| &mut held.slot) {
                Some(Slot::List(items)) => {
                    if head {
                        items.push_front(value.to_string());
                    } else {
                        items.push_back(value.to_string());
                    }
                    items.len() as u64
                }
                _ => return Err(StoreError::WrongType { key: key.to_string() }),
            }
        };
        self.wrote();
        self.pushed.notify_waiters();
        Ok(len)
    }

    fn try_pop(&self, keys: &[String]) -> Result<Option<(String, String)>, StoreError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "pop");
        for key in keys {
            let popped = match live(&mut entries, key).map(|held| &mut held.slot) {
                None => continue,
                Some(Slot::Text(_)) => return Err(StoreError::WrongType { key: key.clone() }),
                Some(Slot::List(items)) => {
                    let value = items.pop_back();
                    (value, items.is_empty())
                }
            };
            if let (Some(value), drained) = popped {
                if drained {
                    entries.remove(key);
                }
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_online()?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        match live(&mut entries, key).map(|held| &held.slot) {
            None => Ok(None),
            Some(Slot::Text(value)) => Ok(Some(value.clone())),
            Some(Slot::List(_)) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        self.ensure_online()?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "multi_get");
        Ok(keys
            .iter()
            .map(|key| match live(&mut entries, key).map(|held| &held.slot) {
                Some(Slot::Text(value)) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.ensure_online()?;
        {
            let mut entries = mutex_lock(&self.entries, SOURCE, "set");
            if mode == SetMode::IfAbsent && live(&mut entries, key).is_some() {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Held {
                    slot: Slot::Text(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
        self.wrote();
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.ensure_online()?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "ttl");
        let now = Instant::now();
        Ok(live(&mut entries, key)
            .and_then(|held| held.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let updated = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "expire");
            match live(&mut entries, key) {
                Some(held) => {
                    held.expires_at = Some(Instant::now() + ttl);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.wrote();
        }
        Ok(updated)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.ensure_online()?;
        let removed = {
            let mut entries = mutex_lock(&self.entries, SOURCE, "delete");
            keys.iter()
                .filter(|key| {
                    let present = live(&mut entries, key).is_some();
                    present && entries.remove(key.as_str()).is_some()
                })
                .count() as u64
        };
        if removed > 0 {
            self.wrote();
        }
        Ok(removed)
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, true)
    }

    async fn push_right(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        self.push(key, value, false)
    }

    async fn blocking_pop_right(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        self.ensure_online()?;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop(keys)? {
                self.wrote();
                return Ok(Some(popped));
            }
            if timeout.is_zero() || Instant::now() >= deadline {
                return Ok(None);
            }
            // Elapsed deadlines fall through to one last pop attempt.
            let _ = tokio::time::timeout_at(deadline, notified.as_mut()).await;
        }
    }
}
