//! Outstanding-request table shared by both ends of the bridge.
//!
//! Each entry owns a single-fire completion handle. An entry is removed
//! exactly once: by the matching response, by its waiter giving up, or by a
//! bulk failure (session lost, connection lost, deadline sweep).

use crate::protocol::ErrorPayload;
use crate::{BridgeError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::warn;

/// How a remote peer answered a command.
#[derive(Debug)]
pub(crate) enum Reply {
    Result(Value),
    Error(ErrorPayload),
}

pub(crate) struct Waiter<T> {
    pub method: String,
    pub owner: T,
    pub timeout: Duration,
    pub deadline: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

impl<T> Waiter<T> {
    /// Release the waiting caller. A caller that already gave up is ignored.
    pub fn complete(self, outcome: Result<Value>) {
        let _ = self.tx.send(outcome);
    }
}

pub(crate) struct PendingTable<T> {
    entries: Mutex<HashMap<String, Waiter<T>>>,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PendingTable<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Waiter<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`.
    pub fn insert(
        &self,
        id: &str,
        method: &str,
        owner: T,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            method: method.to_string(),
            owner,
            timeout,
            deadline: Instant::now() + timeout,
            tx,
        };
        self.lock().insert(id.to_string(), waiter);
        rx
    }

    pub fn remove(&self, id: &str) -> Option<Waiter<T>> {
        self.lock().remove(id)
    }

    /// Resolve the waiter for `correlation_id`. Returns false when nobody was
    /// waiting (late, duplicate or fire-and-forget response).
    pub fn resolve(&self, correlation_id: &str, reply: Reply) -> bool {
        let Some(waiter) = self.remove(correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                "Dropping reply with no waiting caller"
            );
            return false;
        };
        let outcome = match reply {
            Reply::Result(value) => Ok(value),
            Reply::Error(payload) => Err(BridgeError::from_payload(&waiter.method, payload)),
        };
        waiter.complete(outcome);
        true
    }

    /// Remove and return every waiter matching `predicate`.
    pub fn drain_where(&self, mut predicate: impl FnMut(&Waiter<T>) -> bool) -> Vec<Waiter<T>> {
        let mut entries = self.lock();
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, waiter)| predicate(waiter))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| entries.remove(id)).collect()
    }

    /// Fail every waiter whose deadline is before `now` with `Timeout`.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue = self.drain_where(|waiter| waiter.deadline <= now);
        let count = overdue.len();
        for waiter in overdue {
            let timeout = waiter.timeout;
            waiter.complete(Err(BridgeError::Timeout(timeout)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn count_where(&self, mut predicate: impl FnMut(&Waiter<T>) -> bool) -> usize {
        self.lock().values().filter(|waiter| predicate(waiter)).count()
    }
}

/// Removes an entry when the waiting future is dropped before completion.
pub(crate) struct PendingGuard<'a, T> {
    table: &'a PendingTable<T>,
    id: String,
}

impl<'a, T> PendingGuard<'a, T> {
    pub fn new(table: &'a PendingTable<T>, id: &str) -> Self {
        Self {
            table,
            id: id.to_string(),
        }
    }
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Wait for a registered reply, removing the entry on timeout or abandonment.
pub(crate) async fn await_reply<T>(
    table: &PendingTable<T>,
    id: &str,
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Duration,
    on_dropped: impl FnOnce() -> BridgeError,
) -> Result<Value> {
    let _guard = PendingGuard::new(table, id);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        // Sender dropped without completing: the table was torn down.
        Ok(Err(_)) => Err(on_dropped()),
        Err(_) => Err(BridgeError::Timeout(timeout)),
    }
}
