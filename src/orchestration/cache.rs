//! Result cache for cacheable tasks.
//!
//! Each cache key owns a slot guarded by an async mutex. The first caller
//! for a key holds the slot while it computes; callers arriving meanwhile
//! wait on the same slot and reuse whatever it was filled with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::core::task::{Task, Values};
use crate::util::render_template;
use crate::alog_debug;

type Slot = Arc<Mutex<Option<Values>>>;

/// Key text for a placeholder with no input value.
const ABSENT: &str = "<none>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key of `task` for `inputs`, or None when the task is not
    /// cacheable. Input values render as JSON, absent inputs as `<none>`.
    pub fn key_for(task: &Task, inputs: &Values) -> Option<String> {
        if !task.performance.cacheable {
            return None;
        }
        let template = task.performance.cache_key.as_deref()?;
        Some(render_template(template, |name| {
            if name == "task" {
                Some(task.id.to_string())
            } else {
                Some(
                    inputs
                        .get(name)
                        .map_or_else(|| ABSENT.to_string(), |v| v.to_string()),
                )
            }
        }))
    }

    /// Take the slot for `key`, waiting while another caller computes it.
    pub async fn slot(&self, key: &str) -> CacheSlot {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let guard = slot.lock_owned().await;
        if guard.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            alog_debug!("cache hit '{}'", key);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        CacheSlot {
            key: key.to_string(),
            guard,
        }
    }

    /// Stored outputs for `key`, without waiting on a slot being computed.
    pub async fn peek(&self, key: &str) -> Option<Values> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    pub async fn stats(&self) -> CacheStats {
        let slots = self.slots.lock().await;
        let mut entries = 0;
        for slot in slots.values() {
            if slot.try_lock().map(|g| g.is_some()).unwrap_or(false) {
                entries += 1;
            }
        }
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive access to one cache entry. Dropping it unfilled lets the next
/// waiter compute the value.
pub struct CacheSlot {
    key: String,
    guard: OwnedMutexGuard<Option<Values>>,
}

impl CacheSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> Option<&Values> {
        self.guard.as_ref()
    }

    pub fn fill(mut self, outputs: Values) {
        alog_debug!("cache store '{}'", self.key);
        *self.guard = Some(outputs);
    }
}

impl std::fmt::Debug for CacheSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("key", &self.key)
            .field("filled", &self.guard.is_some())
            .finish()
    }
}
