//! Intercept queue: the rendezvous between paused proxy connections and the operator

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

use crate::http::{HttpRequest, HttpTransaction};

/// Decision made by the operator for an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    /// Send the request on, optionally replaced by an edited version
    Forward { edited: Option<HttpRequest> },

    /// Answer the client without contacting the origin
    Drop,
}

impl InterceptDecision {
    pub fn forward() -> Self {
        InterceptDecision::Forward { edited: None }
    }

    pub fn forward_edited(request: HttpRequest) -> Self {
        InterceptDecision::Forward {
            edited: Some(request),
        }
    }
}

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Released,
}

/// A paused transaction as seen by observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptQueueEntry {
    /// Queue ID, unique for the life of the queue
    pub id: u64,

    /// The paused transaction
    pub transaction: HttpTransaction,

    /// Entry status
    pub status: EntryStatus,

    /// When the entry was queued
    pub queued_at: DateTime<Utc>,
}

struct Slot {
    entry: InterceptQueueEntry,
    wake: oneshot::Sender<InterceptDecision>,
}

/// Keyed store of paused transactions
///
/// The queue holds no policy: whether to forward or drop travels with
/// [`InterceptQueue::remove`], which is the only way a waiting connection resumes.
pub struct InterceptQueue {
    entries: Mutex<BTreeMap<u64, Slot>>,
    next_id: AtomicU64,
}

impl InterceptQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pause a transaction. The returned receiver resolves when the entry is removed.
    ///
    /// If the sender is dropped instead (see [`InterceptQueue::clear`]) the
    /// receiver errors, which waiters treat as "forward original".
    pub fn add(&self, transaction: HttpTransaction) -> (u64, oneshot::Receiver<InterceptDecision>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (wake, rx) = oneshot::channel();

        let entry = InterceptQueueEntry {
            id,
            transaction,
            status: EntryStatus::Pending,
            queued_at: Utc::now(),
        };

        self.entries.lock().insert(id, Slot { entry, wake });
        tracing::debug!(id, "Transaction queued for interception");
        (id, rx)
    }

    /// Release an entry with the operator's decision.
    ///
    /// Hands back the entry marked [`EntryStatus::Released`], or `None` if no
    /// such entry is queued.
    pub fn remove(&self, id: u64, decision: InterceptDecision) -> Option<InterceptQueueEntry> {
        let Slot { mut entry, wake } = self.entries.lock().remove(&id)?;
        entry.status = EntryStatus::Released;

        let dropped = matches!(decision, InterceptDecision::Drop);
        if wake.send(decision).is_err() {
            // Connection gave up waiting (timeout or client hung up)
            tracing::debug!(id, "Intercept waiter already gone");
        } else {
            tracing::debug!(id, dropped, "Intercepted transaction released");
        }
        Some(entry)
    }

    pub fn get(&self, id: u64) -> Option<InterceptQueueEntry> {
        self.entries.lock().get(&id).map(|s| s.entry.clone())
    }

    /// All queued entries in arrival order
    pub fn get_all(&self) -> Vec<InterceptQueueEntry> {
        self.entries.lock().values().map(|s| s.entry.clone()).collect()
    }

    /// Drop every entry, resuming all waiters with their original request
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.entries.lock());
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Intercept queue cleared");
        }
    }

    /// Forget an entry without deciding, used when its waiter timed out
    pub(crate) fn discard(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for InterceptQueue {
    fn default() -> Self {
        Self::new()
    }
}
