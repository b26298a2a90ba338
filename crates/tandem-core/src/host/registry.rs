//! Session registry.
//!
//! A [`Session`] is a reconnect-durable identity for one client. The registry
//! creates sessions lazily and is the only owner that removes them, either
//! through the reaper or an explicit close.

use crate::protocol::Envelope;
use crate::{BridgeError, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Callback invoked for every `event` envelope a session receives.
///
/// Runs on the bridge I/O thread; keep it short and hand heavy work off.
pub type EventCallback = Arc<dyn Fn(&str, &str, Value) -> anyhow::Result<()> + Send + Sync>;

struct Connection {
    outbound: mpsc::UnboundedSender<Envelope>,
    close_tx: Option<oneshot::Sender<()>>,
}

struct SessionState {
    connection: Option<Connection>,
    last_heartbeat: Instant,
    epoch: u64,
    time_synced: bool,
}

/// One client session as seen by the host.
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    event_callback: RwLock<Option<EventCallback>>,
}

/// Serializable view of a session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub connected: bool,
    pub last_heartbeat_age_ms: u64,
    pub connection_epoch: u64,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(SessionState {
                connection: None,
                last_heartbeat: Instant::now(),
                epoch: 0,
                time_synced: false,
            }),
            event_callback: RwLock::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.lock().last_heartbeat
    }

    /// Identifies the current (or most recent) physical connection.
    pub fn connection_epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Install the callback for this session's events, replacing any previous one.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&str, &str, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self
            .event_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.lock();
        SessionInfo {
            session_id: self.id.clone(),
            connected: state.connection.is_some(),
            last_heartbeat_age_ms: state.last_heartbeat.elapsed().as_millis() as u64,
            connection_epoch: state.epoch,
        }
    }

    /// Bind a new physical connection. Any previous connection is told to close.
    ///
    /// Returns the new connection epoch.
    pub(crate) fn attach(
        &self,
        outbound: mpsc::UnboundedSender<Envelope>,
        close_tx: oneshot::Sender<()>,
    ) -> u64 {
        let mut state = self.lock();
        if let Some(mut previous) = state.connection.take() {
            warn!(session_id = %self.id, epoch = state.epoch, "Replacing live connection");
            if let Some(tx) = previous.close_tx.take() {
                let _ = tx.send(());
            }
        }
        state.epoch += 1;
        state.connection = Some(Connection {
            outbound,
            close_tx: Some(close_tx),
        });
        state.last_heartbeat = Instant::now();
        state.time_synced = false;
        state.epoch
    }

    /// Mark the connection with `epoch` closed. A newer connection is left alone.
    pub(crate) fn detach(&self, epoch: u64) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch || state.connection.is_none() {
            return false;
        }
        state.connection = None;
        true
    }

    /// Ask the live connection, if any, to close.
    pub(crate) fn close_connection(&self) -> bool {
        let mut state = self.lock();
        match state.connection.as_mut().and_then(|conn| conn.close_tx.take()) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat. Returns true the first time for a connection,
    /// meaning a `time_sync` is due.
    pub(crate) fn record_heartbeat(&self) -> bool {
        let mut state = self.lock();
        state.last_heartbeat = Instant::now();
        let first = !state.time_synced;
        state.time_synced = true;
        first
    }

    /// Enqueue an envelope for the connection owner to write.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<u64> {
        self.send_tracked(envelope, |epoch| epoch)
    }

    /// Enqueue an envelope, calling `register` with the epoch of the
    /// connection it goes out on just before it is handed over.
    ///
    /// The session lock is held across both steps, so a concurrent
    /// [`attach`](Self::attach) sees either neither or both. `register` is
    /// not called when there is no connection; if the enqueue itself fails
    /// after `register` ran, the caller must undo the registration.
    pub(crate) fn send_tracked<T>(
        &self,
        envelope: Envelope,
        register: impl FnOnce(u64) -> T,
    ) -> Result<T> {
        let state = self.lock();
        let Some(conn) = state.connection.as_ref() else {
            return Err(BridgeError::NotConnected {
                session_id: self.id.clone(),
            });
        };
        let registered = register(state.epoch);
        conn.outbound
            .send(envelope)
            .map_err(|_| BridgeError::NotConnected {
                session_id: self.id.clone(),
            })?;
        Ok(registered)
    }

    fn callback(&self) -> Option<EventCallback> {
        self.event_callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        let state = self.lock();
        state.connection.is_none() && now.saturating_duration_since(state.last_heartbeat) > timeout
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// All sessions known to a host.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    default_callback: RwLock<Option<EventCallback>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session, creating it on first contact.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(session_id) {
            return session;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id = %session_id, "Session created");
                Arc::new(Session::new(session_id))
            })
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            info!(session_id = %session_id, "Session removed");
        }
        removed
    }

    /// All sessions, sorted by id.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn connected(&self) -> Vec<Arc<Session>> {
        self.list().into_iter().filter(|s| s.is_connected()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Callback used for sessions that have none of their own.
    pub fn set_default_event_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self
            .default_callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Deliver an event to the session's callback. Failures are logged only.
    pub(crate) fn dispatch_event(&self, session: &Session, event_name: &str, event_data: Value) {
        let callback = session.callback().or_else(|| {
            self.default_callback
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        });
        let Some(callback) = callback else {
            debug!(session_id = %session.id, event = %event_name, "No event callback registered");
            return;
        };

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            callback(&session.id, event_name, event_data)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %session.id, event = %event_name, "Event callback failed: {:#}", e);
            }
            Err(_) => {
                warn!(session_id = %session.id, event = %event_name, "Event callback panicked");
            }
        }
    }

    /// Remove every disconnected session whose last heartbeat is older than
    /// `timeout`. Connected sessions are never reaped.
    pub(crate) fn reap_expired(&self, now: Instant, timeout: Duration) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_stale(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .inspect(|session| {
                info!(session_id = %session.id, "Reaped session after heartbeat timeout");
            })
            .collect()
    }
}
