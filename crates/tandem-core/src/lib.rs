//! Tandem Core - bidirectional RPC bridge between a host process and its clients.
//!
//! The host issues commands that a client executes and answers; clients
//! report state changes back as fire-and-forget events. The bridge lets
//! synchronous host code block on a call without stalling connection
//! processing, correlates out-of-order responses, detects silent
//! disconnects and keeps sessions alive across reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_core::{BridgeClient, BridgeConfig, ConnectionState, HostBridge, TcpConnector};
//!
//! let host = HostBridge::start(BridgeConfig::default())?;
//! let addr = host.listen("127.0.0.1:0")?;
//!
//! let client = BridgeClient::new("s1", TcpConnector::new(addr.to_string()), BridgeConfig::default())?;
//! client.register_handler("ping", |_params| async { Ok(serde_json::json!("pong")) });
//! client.connect()?;
//! client.wait_for_state(ConnectionState::Connected, Duration::from_secs(5)).await?;
//!
//! let pong = host.call_async("s1", "ping", serde_json::json!({}), Duration::from_secs(5)).await?;
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod protocol;

mod pending;

// Re-export commonly used types
pub use client::{BridgeClient, ConnectionState, Connector, ReconnectPolicy, TcpConnector};
pub use config::BridgeConfig;
pub use dispatch::{CommandHandler, Dispatcher};
pub use error::{BridgeError, Result};
pub use host::{HostBridge, Session, SessionInfo};
pub use protocol::{Envelope, ErrorPayload};
