//! Command dispatch.
//!
//! A [`Dispatcher`] maps method names to async handlers and turns an incoming
//! `command` into exactly one `response` or `error` envelope. Handler
//! failures, including panics, never escape the dispatcher.

use crate::protocol::{Envelope, ErrorPayload};
use crate::Result;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Handler for one RPC method.
///
/// Implemented automatically for async closures, so most callers use
/// [`Dispatcher::register_handler`]:
///
/// ```rust,ignore
/// dispatcher.register_handler("ping", |_params| async { Ok(json!("pong")) });
/// ```
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, params: Value) -> Result<Value>;
}

#[async_trait::async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, params: Value) -> Result<Value> {
        (self)(params).await
    }
}

type HandlerMap = HashMap<String, Arc<dyn CommandHandler>>;

/// Method-name to handler registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HandlerMap>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `method`, replacing any existing handler.
    ///
    /// Returns true if a previous handler was replaced.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(method, Arc::new(handler))
    }

    /// Register a handler object for `method`, replacing any existing one.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn CommandHandler>) -> bool {
        let method = method.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.clone(), handler)
            .is_some();
        if replaced {
            debug!(method = %method, "Replaced command handler");
        }
        replaced
    }

    pub fn unregister_handler(&self, method: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(method)
            .is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Execute a command and build the envelope that answers it.
    ///
    /// The registry lock is released before the handler runs, so handlers may
    /// register or replace handlers themselves.
    pub async fn dispatch(&self, id: String, method: String, params: Value) -> Envelope {
        let Some(handler) = self.lookup(&method) else {
            warn!(method = %method, "No handler registered");
            return Envelope::error(id, ErrorPayload::method_not_found(&method));
        };

        debug!(method = %method, id = %id, "Dispatching command");
        match AssertUnwindSafe(handler.handle(params)).catch_unwind().await {
            Ok(Ok(result)) => Envelope::response(id, result),
            Ok(Err(e)) => {
                debug!(method = %method, error = %e, "Handler returned error");
                Envelope::error(id, e.to_payload())
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(method = %method, "Handler panicked: {}", detail);
                Envelope::error(
                    id,
                    ErrorPayload::new(
                        ErrorPayload::INTERNAL_ERROR,
                        format!("Handler for {} panicked: {}", method, detail),
                    ),
                )
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}
