//! Client side of the bridge.
//!
//! A [`BridgeClient`] keeps one logical session alive across transport
//! failures. It executes commands from the host through its [`Dispatcher`],
//! emits events, and can issue its own calls to the host.
//!
//! # Example
//!
//! ```rust,ignore
//! let client = BridgeClient::new("s1", TcpConnector::new("127.0.0.1:7100"), BridgeConfig::default())?;
//! client.register_handler("ping", |_params| async { Ok(json!("pong")) });
//! client.connect()?;
//! client.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)).await?;
//! client.emit("selection_changed", json!({"count": 2}));
//! ```

mod backoff;
mod connector;
mod driver;
mod liveness;

pub use backoff::ReconnectPolicy;
pub use connector::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use liveness::ConnectionState;

use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::pending::{await_reply, PendingTable};
use crate::protocol::Envelope;
use crate::{BridgeError, Result};
use driver::Driver;
use liveness::ClockSync;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Channels into a running driver. Dropping the handle stops the driver.
struct DriverHandle {
    generation: u64,
    frames: mpsc::UnboundedSender<Envelope>,
    _stop: oneshot::Sender<()>,
}

pub(crate) struct ClientInner {
    session_id: String,
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    pending: PendingTable<()>,
    clock: ClockSync,
    state_tx: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    generations: AtomicU64,
    driver: Mutex<Option<DriverHandle>>,
}

impl ClientInner {
    fn driver(&self) -> MutexGuard<'_, Option<DriverHandle>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn transition(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(session_id = %self.session_id, from = %previous, to = %state, "Connection state changed");
        }
    }

    /// Publish a state on behalf of driver `generation`. A driver that has
    /// been replaced or stopped no longer gets a say.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let driver = self.driver();
        if driver.as_ref().map(|d| d.generation) != Some(generation) {
            return false;
        }
        self.transition(state);
        true
    }

    /// A driver gave up on its own.
    fn finish(&self, generation: u64) {
        let mut driver = self.driver();
        if driver.as_ref().map(|d| d.generation) == Some(generation) {
            *driver = None;
            self.transition(ConnectionState::Disconnected);
        }
    }

    fn set_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::SeqCst);
    }

    /// Hand a frame to the driver for writing.
    fn enqueue(&self, envelope: Envelope) -> bool {
        match self.driver().as_ref() {
            Some(driver) => driver.frames.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding call with `ConnectionLost`.
    fn fail_pending(&self) -> usize {
        let waiters = self.pending.drain_where(|_| true);
        let count = waiters.len();
        for waiter in waiters {
            waiter.complete(Err(BridgeError::ConnectionLost));
        }
        if count > 0 {
            warn!(session_id = %self.session_id, count, "Failed pending calls after connection loss");
        }
        count
    }

    /// A frame that could not be written. Its caller, if any, is released.
    fn reject_unsent(&self, frame: Envelope) {
        match frame {
            Envelope::Command { id, .. } => {
                if let Some(waiter) = self.pending.remove(&id) {
                    waiter.complete(Err(BridgeError::ConnectionLost));
                }
            }
            other => debug!(kind = other.kind(), "Dropping frame: not connected"),
        }
    }
}

/// The client end of a bridge session.
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    pub fn new<C: Connector>(
        session_id: impl Into<String>,
        connector: C,
        config: BridgeConfig,
    ) -> Result<Self> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(BridgeError::Config {
                message: "session_id must not be empty".to_string(),
            });
        }
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(ClientInner {
                session_id,
                config,
                connector: Arc::new(connector),
                dispatcher: Dispatcher::new(),
                pending: PendingTable::default(),
                clock: ClockSync::default(),
                state_tx,
                attempts: AtomicU32::new(0),
                generations: AtomicU64::new(0),
                driver: Mutex::new(None),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Start connecting. Returns immediately; watch the state for progress.
    ///
    /// Must be called from within a Tokio runtime. Does nothing if the
    /// client is already connecting or connected.
    pub fn connect(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::Config {
            message: "connect() must be called from within a Tokio runtime".to_string(),
        })?;

        let mut driver = self.inner.driver();
        if driver.is_some() {
            debug!(session_id = %self.inner.session_id, "connect() while already active");
            return Ok(());
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        *driver = Some(DriverHandle {
            generation,
            frames: frames_tx,
            _stop: stop_tx,
        });
        self.inner.set_attempts(0);
        self.inner.transition(ConnectionState::Connecting);
        drop(driver);

        runtime.spawn(Driver::new(self.inner.clone(), generation, stop_rx, frames_rx).run());
        Ok(())
    }

    /// Stop the connection and all retries. In-flight handlers are dropped
    /// and pending calls fail with `ConnectionLost`.
    pub fn disconnect(&self) {
        let stopped = self.inner.driver().take();
        if stopped.is_none() && self.inner.state() == ConnectionState::Disconnected {
            return;
        }
        drop(stopped);
        self.inner.transition(ConnectionState::Disconnected);
        self.inner.set_attempts(0);
        self.inner.fail_pending();
    }

    /// Handlers for commands sent by the host.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.inner.dispatcher.register_handler(method, handler)
    }

    /// Send an event to the host. Returns false, without failing, when not connected.
    pub fn emit(&self, event_name: &str, event_data: Value) -> bool {
        if !self.state().is_connected() {
            debug!(session_id = %self.inner.session_id, event = %event_name, "emit skipped: not connected");
            return false;
        }
        self.inner.enqueue(Envelope::event(event_name, event_data))
    }

    /// Call a handler registered on the host.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let not_connected = || BridgeError::NotConnected {
            session_id: self.inner.session_id.clone(),
        };
        if !self.state().is_connected() {
            return Err(not_connected());
        }

        let (id, envelope) = Envelope::command(method, params);
        let rx = self.inner.pending.insert(&id, method, (), timeout);
        if !self.inner.enqueue(envelope) {
            self.inner.pending.remove(&id);
            return Err(not_connected());
        }

        await_reply(&self.inner.pending, &id, rx, timeout, || {
            BridgeError::ConnectionLost
        })
        .await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut states = self.subscribe_state();
        let reached = tokio::time::timeout(timeout, states.wait_for(|state| *state == target))
            .await
            .map(|waited| waited.map(|_| ()));
        match reached {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::Shutdown),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }

    /// Host clock minus local clock, in milliseconds. `None` before the first sync.
    pub fn clock_offset_ms(&self) -> Option<i64> {
        self.inner.clock.offset_ms()
    }

    /// Current time on the host's clock, as far as we know it.
    pub fn server_time_ms(&self) -> i64 {
        self.inner.clock.server_time_ms()
    }

    /// Failed retries since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Unreachable;

    #[async_trait::async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<BoxedStream> {
            Err(BridgeError::Io {
                message: "unreachable".to_string(),
                source: None,
            })
        }
    }

    fn fast_config(max_attempts: Option<u32>) -> BridgeConfig {
        BridgeConfig::default().with_reconnect(
            ReconnectPolicy::new()
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_max_attempts(max_attempts),
        )
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let result = BridgeClient::new("", Unreachable, BridgeConfig::default());
        assert!(matches!(result, Err(BridgeError::Config { .. })));
    }

    #[test]
    fn test_connect_outside_runtime_fails() {
        let client = BridgeClient::new("s1", Unreachable, BridgeConfig::default()).unwrap();
        assert!(matches!(client.connect(), Err(BridgeError::Config { .. })));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_not_connected_operations_fail_softly() {
        let client = BridgeClient::new("s1", Unreachable, BridgeConfig::default()).unwrap();

        assert!(!client.emit("saved", json!({})));
        assert!(matches!(
            client.call("version", json!({}), Duration::from_secs(1)).await,
            Err(BridgeError::NotConnected { .. })
        ));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_state_returns_or_times_out() {
        let client = BridgeClient::new("s1", Unreachable, BridgeConfig::default()).unwrap();

        client
            .wait_for_state(ConnectionState::Disconnected, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(
            client
                .wait_for_state(ConnectionState::Connected, Duration::from_millis(20))
                .await,
            Err(BridgeError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let client = BridgeClient::new("s1", Unreachable, fast_config(Some(3))).unwrap();
        let mut states = client.subscribe_state();
        client.connect().unwrap();

        client
            .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(client.reconnect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_disconnect_stops_retrying() {
        let client = BridgeClient::new("s1", Unreachable, fast_config(None)).unwrap();
        client.connect().unwrap();
        client
            .wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(5))
            .await
            .unwrap();

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.reconnect_attempts(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
