//! Correlation engine.
//!
//! Owns the outstanding-call table. Callers register a waiter, enqueue a
//! `command` through the session's connection channel and wait on their own
//! one-shot handle; the connection loop resolves waiters by `correlation_id`.

use super::registry::{Session, SessionRegistry};
use crate::pending::{await_reply, PendingTable, Reply};
use crate::protocol::{Envelope, ErrorPayload};
use crate::{BridgeError, Result};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which connection a pending call was sent on.
#[derive(Debug, Clone)]
pub(crate) struct CallOwner {
    pub session_id: String,
    pub epoch: u64,
}

#[derive(Default)]
pub struct CorrelationEngine {
    pending: PendingTable<CallOwner>,
}

impl CorrelationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `method` to the session and wait up to `timeout` for its result.
    pub async fn call(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let session = connected_session(registry, session_id)?;

        let (id, envelope) = Envelope::command(method, params);
        // Register under the session lock so the owner epoch is the one the
        // command is actually written on.
        let sent = session.send_tracked(envelope, |epoch| {
            let owner = CallOwner {
                session_id: session_id.to_string(),
                epoch,
            };
            self.pending.insert(&id, method, owner, timeout)
        });
        let rx = match sent {
            Ok(rx) => rx,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };
        debug!(session_id = %session_id, method = %method, id = %id, "Command sent");

        await_reply(&self.pending, &id, rx, timeout, || BridgeError::SessionLost {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Send `method` without waiting for, or keeping, its result.
    ///
    /// Returns whether the command was enqueued. Never fails.
    pub fn fire(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> bool {
        let session = match connected_session(registry, session_id) {
            Ok(session) => session,
            Err(e) => {
                warn!(session_id = %session_id, method = %method, "fire skipped: {}", e);
                return false;
            }
        };
        let (id, envelope) = Envelope::command(method, params);
        match session.send(envelope) {
            Ok(_) => {
                debug!(session_id = %session_id, method = %method, id = %id, "Command fired");
                true
            }
            Err(e) => {
                warn!(session_id = %session_id, method = %method, "fire skipped: {}", e);
                false
            }
        }
    }

    /// `fire` to every connected session. Returns how many accepted the command.
    pub fn broadcast(&self, registry: &SessionRegistry, method: &str, params: Value) -> usize {
        let sessions = registry.connected();
        let total = sessions.len();
        let delivered = sessions
            .iter()
            .filter(|session| self.fire(registry, session.id(), method, params.clone()))
            .count();
        if delivered < total {
            warn!(method = %method, delivered, total, "Broadcast partially delivered");
        }
        delivered
    }

    pub(crate) fn resolve_response(&self, correlation_id: &str, result: Value) -> bool {
        self.pending.resolve(correlation_id, Reply::Result(result))
    }

    pub(crate) fn resolve_error(&self, correlation_id: &str, error: ErrorPayload) -> bool {
        self.pending.resolve(correlation_id, Reply::Error(error))
    }

    /// Fail every call addressed to `session_id` with `SessionLost`.
    pub(crate) fn fail_session(&self, session_id: &str) -> usize {
        self.fail_matching(session_id, |_| true)
    }

    /// Fail calls sent on connections older than `current_epoch`.
    pub(crate) fn fail_stale_connections(&self, session_id: &str, current_epoch: u64) -> usize {
        self.fail_matching(session_id, |owner| owner.epoch < current_epoch)
    }

    fn fail_matching(&self, session_id: &str, predicate: impl Fn(&CallOwner) -> bool) -> usize {
        let lost = self
            .pending
            .drain_where(|waiter| waiter.owner.session_id == session_id && predicate(&waiter.owner));
        let count = lost.len();
        for waiter in lost {
            waiter.complete(Err(BridgeError::SessionLost {
                session_id: session_id.to_string(),
            }));
        }
        if count > 0 {
            warn!(session_id = %session_id, count, "Failed pending calls for lost session");
        }
        count
    }

    /// Fail every outstanding call with `Shutdown`.
    pub(crate) fn fail_all_shutdown(&self) -> usize {
        let waiters = self.pending.drain_where(|_| true);
        let count = waiters.len();
        for waiter in waiters {
            waiter.complete(Err(BridgeError::Shutdown));
        }
        count
    }

    /// Fail calls whose deadline has passed. Normally the caller's own timeout
    /// gets there first; this covers waiters that stopped being polled.
    pub(crate) fn expire_overdue(&self, now: Instant) -> usize {
        self.pending.expire_overdue(now)
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, session_id: &str) -> usize {
        self.pending
            .count_where(|waiter| waiter.owner.session_id == session_id)
    }
}

fn connected_session(registry: &SessionRegistry, session_id: &str) -> Result<std::sync::Arc<Session>> {
    match registry.get(session_id) {
        Some(session) if session.is_connected() => Ok(session),
        _ => Err(BridgeError::NotConnected {
            session_id: session_id.to_string(),
        }),
    }
}
