//! Short-lived cache in front of the bulk status query.
//!
//! Readers share the last snapshot while it is younger than the TTL. A stale
//! read funnels through a single-flight gate: the first reader re-checks
//! freshness, performs the one backend call with no snapshot lock held, then
//! commits the result. Readers queued behind it find the fresh snapshot and
//! return without calling the backend.
//!
//! Invalidation bumps an epoch. A refresh that started before the bump still
//! answers its own caller but is not committed, so a mutation is never masked
//! by a poll that raced it.

use insta_runtime::{ContainerStatusRecord, RuntimeError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Container identity to its last observed record.
pub type StatusSnapshot = Arc<HashMap<String, ContainerStatusRecord>>;

struct Entry {
    snapshot: StatusSnapshot,
    fetched_at: Instant,
    epoch: u64,
}

pub struct StatusCache {
    ttl: Duration,
    entry: RwLock<Option<Entry>>,
    refresh_gate: Mutex<()>,
    epoch: AtomicU64,
}

impl StatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current invalidation epoch. A snapshot obtained after reading epoch `n`
    /// was fetched no earlier than the invalidation that produced `n`.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The cached snapshot if it is still fresh. Never calls the backend.
    pub fn peek(&self) -> Option<StatusSnapshot> {
        let entry = self.entry.read().unwrap_or_else(PoisonError::into_inner);
        let current = self.epoch.load(Ordering::SeqCst);
        entry
            .as_ref()
            .filter(|e| e.epoch == current && e.fetched_at.elapsed() < self.ttl)
            .map(|e| Arc::clone(&e.snapshot))
    }

    /// A fresh snapshot, calling `fetch` at most once across concurrent
    /// callers when the cached one has expired.
    pub fn get_or_refresh<F>(&self, fetch: F) -> Result<StatusSnapshot, RuntimeError>
    where
        F: FnOnce() -> Result<Vec<ContainerStatusRecord>, RuntimeError>,
    {
        if let Some(snapshot) = self.peek() {
            return Ok(snapshot);
        }

        let _gate = self
            .refresh_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(snapshot) = self.peek() {
            return Ok(snapshot);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let records = fetch()?;
        debug!("status cache refreshed with {} containers", records.len());
        let snapshot: StatusSnapshot = Arc::new(
            records
                .into_iter()
                .map(|r| (r.container.clone(), r))
                .collect(),
        );

        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            *entry = Some(Entry {
                snapshot: Arc::clone(&snapshot),
                fetched_at: Instant::now(),
                epoch,
            });
        } else {
            debug!("status cache invalidated during refresh; result not cached");
        }
        Ok(snapshot)
    }

    /// Drop the snapshot so the next read polls the backend.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
