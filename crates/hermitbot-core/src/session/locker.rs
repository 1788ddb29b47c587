//! Per-session operation locks.
//!
//! Guarantees at-most-one in-flight high-level operation per session id
//! without a global queue: a map from session id to a reference-counted
//! `tokio::sync::Mutex`. Dropping the returned guard releases the lock and
//! decrements the refcount; the entry is removed when the refcount reaches
//! zero, so the map never grows beyond the set of sessions with live
//! interest.
//!
//! Cancellation is safe by construction: abandoning the acquisition future
//! removes the waiter from the mutex queue, and the refcount is decremented
//! on the cancellation path before returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DomainError, Sentinel};

#[derive(Debug)]
struct LockEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

#[derive(Default, Debug)]
struct LockerInner {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockerInner {
    fn acquire_entry(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.entries.lock().unwrap();
        let entry = map.entry(session_id.to_string()).or_insert_with(|| LockEntry {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.mutex)
    }

    fn release(&self, session_id: &str) {
        let mut map = self.entries.lock().unwrap();
        if let Some(entry) = map.get_mut(session_id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(session_id);
            }
        }
    }
}

/// Process-wide per-session mutual exclusion.
#[derive(Clone, Default)]
pub struct SessionLocker {
    inner: Arc<LockerInner>,
}

impl SessionLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the per-session mutex is acquired or `cancel` fires.
    ///
    /// The returned guard releases the lock on drop.
    pub async fn lock(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionLockGuard, DomainError> {
        let mutex = self.inner.acquire_entry(session_id);

        tokio::select! {
            guard = mutex.lock_owned() => {
                debug!(session = session_id, "Session lock acquired");
                Ok(SessionLockGuard {
                    inner: Arc::clone(&self.inner),
                    session_id: session_id.to_string(),
                    guard: Some(guard),
                })
            }
            _ = cancel.cancelled() => {
                self.inner.release(session_id);
                Err(DomainError::new("SessionLocker.Lock", Sentinel::Cancelled))
            }
        }
    }

    /// Number of session ids with live lock interest (held or waited on).
    pub fn active_count(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }
}

/// RAII release handle for one acquired session lock.
#[derive(Debug)]
pub struct SessionLockGuard {
    inner: Arc<LockerInner>,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        // Release the mutex before dropping the refcount so a waiter never
        // observes an entry without its mutex.
        self.guard.take();
        self.inner.release(&self.session_id);
    }
}
