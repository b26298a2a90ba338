//! Host side of the bridge.
//!
//! [`HostBridge`] owns the session registry, the correlation engine and a
//! dedicated I/O worker thread. It is cheap to clone and every method may be
//! called from any thread.
//!
//! # Example
//!
//! ```rust,ignore
//! let host = HostBridge::start(BridgeConfig::default())?;
//! let addr = host.listen("127.0.0.1:0")?;
//!
//! // Later, from any synchronous thread:
//! let pong = host.call("s1", "ping", json!({}), Duration::from_secs(5))?;
//! ```

mod connection;
mod correlation;
mod registry;
mod worker;

pub use correlation::CorrelationEngine;
pub use registry::{EventCallback, Session, SessionInfo, SessionRegistry};
pub use worker::IO_THREAD_NAME;

use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::Result;
use serde_json::Value;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use worker::IoWorker;

/// State shared by the host facade and its background tasks.
pub(crate) struct HostShared {
    pub config: BridgeConfig,
    pub registry: SessionRegistry,
    pub correlation: CorrelationEngine,
    pub dispatcher: Dispatcher,
}

impl HostShared {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
            correlation: CorrelationEngine::new(),
            dispatcher: Dispatcher::new(),
        }
    }

    /// One reaper pass. Returns the number of sessions removed.
    pub fn reap(&self, now: Instant) -> usize {
        let reaped = self
            .registry
            .reap_expired(now, self.config.session_timeout);
        for session in &reaped {
            self.correlation.fail_session(session.id());
        }
        let expired = self.correlation.expire_overdue(now);
        if expired > 0 {
            debug!(expired, "Expired overdue calls");
        }
        reaped.len()
    }
}

struct HostInner {
    shared: Arc<HostShared>,
    worker: IoWorker,
}

impl HostInner {
    fn shutdown(&self) {
        if self.worker.is_stopped() {
            return;
        }
        self.worker.shutdown();
        let failed = self.shared.correlation.fail_all_shutdown();
        info!(failed_calls = failed, "Host bridge shut down");
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running host bridge. Clones share the same bridge; the last
/// clone dropped shuts it down.
#[derive(Clone)]
pub struct HostBridge {
    inner: Arc<HostInner>,
}

impl HostBridge {
    /// Validate `config`, start the I/O worker and the session reaper.
    pub fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let reap_interval = config.reap_interval;
        let shared = Arc::new(HostShared::new(config));
        let worker = IoWorker::start()?;
        worker.spawn(reap_loop(Arc::downgrade(&shared), reap_interval))?;

        Ok(Self {
            inner: Arc::new(HostInner { shared, worker }),
        })
    }

    fn shared(&self) -> &Arc<HostShared> {
        &self.inner.shared
    }

    /// Accept client connections on `addr`. Returns the bound address.
    pub fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        self.inner
            .worker
            .spawn(accept_loop(listener, self.shared().clone()))?;
        info!("Host bridge listening on {}", local);
        Ok(local)
    }

    /// Serve an already-open stream as a client connection.
    pub fn attach<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.inner
            .worker
            .spawn(connection::serve_connection(stream, self.shared().clone()))
    }

    /// Blocking call. Fails with `WouldDeadlock` on the bridge I/O thread.
    pub fn call(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.run_blocking(self.call_async(session_id, method, params, timeout))?
    }

    /// Like [`call`](Self::call), with the configured response timeout.
    pub fn call_default(&self, session_id: &str, method: &str, params: Value) -> Result<Value> {
        self.call(
            session_id,
            method,
            params,
            self.shared().config.response_timeout,
        )
    }

    pub async fn call_async(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let shared = self.shared();
        shared
            .correlation
            .call(&shared.registry, session_id, method, params, timeout)
            .await
    }

    fn run_blocking<F: Future>(&self, future: F) -> Result<F::Output> {
        self.inner.worker.block_on(future)
    }

    pub fn fire(&self, session_id: &str, method: &str, params: Value) -> bool {
        let shared = self.shared();
        shared
            .correlation
            .fire(&shared.registry, session_id, method, params)
    }

    pub fn broadcast(&self, method: &str, params: Value) -> usize {
        let shared = self.shared();
        shared.correlation.broadcast(&shared.registry, method, params)
    }

    pub fn get_or_create_session(&self, session_id: &str) -> Arc<Session> {
        self.shared().registry.get_or_create(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.shared().registry.get(session_id)
    }

    /// Snapshot of every session, sorted by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared()
            .registry
            .list()
            .iter()
            .map(|session| session.info())
            .collect()
    }

    /// Install the event callback for `session_id`, creating the session if needed.
    pub fn on_event<F>(&self, session_id: &str, callback: F)
    where
        F: Fn(&str, &str, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.get_or_create_session(session_id).on_event(callback);
    }

    pub fn set_default_event_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &str, Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared().registry.set_default_event_callback(callback);
    }

    /// Handlers for commands sent by clients to the host.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared().dispatcher
    }

    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.shared().dispatcher.register_handler(method, handler)
    }

    /// Close the connection, forget the session and fail its pending calls.
    pub fn close_session(&self, session_id: &str) -> bool {
        let shared = self.shared();
        let Some(session) = shared.registry.remove(session_id) else {
            return false;
        };
        session.close_connection();
        shared.correlation.fail_session(session_id);
        true
    }

    /// Drop the live connection but keep the session for a reconnect.
    pub fn disconnect_session(&self, session_id: &str) -> bool {
        self.session(session_id)
            .is_some_and(|session| session.close_connection())
    }

    /// Run one reaper pass now. Returns the number of sessions removed.
    pub fn reap_now(&self) -> usize {
        self.shared().reap(Instant::now())
    }

    pub fn pending_calls(&self) -> usize {
        self.shared().correlation.pending_count()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared().config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.worker.is_stopped()
    }

    /// Stop the I/O worker. Outstanding calls fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("sessions", &self.shared().registry.len())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

async fn accept_loop(listener: std::net::TcpListener, shared: Arc<HostShared>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listener: {}", e);
            return;
        }
    };
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                debug!("Connection from {}", peer_addr);
                tokio::spawn(connection::serve_connection(stream, shared.clone()));
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn reap_loop(shared: Weak<HostShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.reap(Instant::now());
    }
}
