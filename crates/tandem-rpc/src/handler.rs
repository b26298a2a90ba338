//! JSON-RPC request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{BridgeError, ErrorPayload, HostBridge};
use tracing::{debug, warn};

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.host.sessions().len(),
    }))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = request.method.as_str();
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id;

    debug!("RPC call: {}({:?})", method, params);

    if method == "health_check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    match dispatch_method(&state.host, method, &params).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            warn!("RPC error for {}: {}", method, e);
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

// ============================================================================
// Helper macros for extracting parameters
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
macro_rules! get_str_param {
    ($params:expr, $snake:literal, $camel:literal) => {
        $params
            .get($snake)
            .or_else(|| $params.get($camel))
            .and_then(|v| v.as_str())
    };
}

/// Extract a required string parameter or return an error.
macro_rules! require_str_param {
    ($params:expr, $snake:literal, $camel:literal) => {
        match get_str_param!($params, $snake, $camel) {
            Some(s) => s.to_string(),
            None => {
                return Err(BridgeError::handler(
                    ErrorPayload::INVALID_PARAMS,
                    format!("Missing required parameter: {}", $snake),
                ));
            }
        }
    };
}

/// Extract an optional u64 parameter.
macro_rules! get_u64_param {
    ($params:expr, $snake:literal, $camel:literal) => {
        $params
            .get($snake)
            .or_else(|| $params.get($camel))
            .and_then(|v| v.as_u64())
    };
}

/// Parameters forwarded to the client; defaults to an empty object.
fn forwarded_params(params: &Value) -> Value {
    params
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Dispatch a control method to the host bridge.
pub(crate) async fn dispatch_method(
    host: &HostBridge,
    method: &str,
    params: &Value,
) -> tandem_core::Result<Value> {
    match method {
        // ====================================================================
        // Commands to clients
        // ====================================================================
        "call" => {
            let session_id = require_str_param!(params, "session_id", "sessionId");
            let target = require_str_param!(params, "method", "method");
            let timeout = get_u64_param!(params, "timeout_ms", "timeoutMs")
                .map(Duration::from_millis)
                .unwrap_or(host.config().response_timeout);

            let result = host
                .call_async(&session_id, &target, forwarded_params(params), timeout)
                .await?;
            Ok(result)
        }

        "fire" => {
            let session_id = require_str_param!(params, "session_id", "sessionId");
            let target = require_str_param!(params, "method", "method");
            let sent = host.fire(&session_id, &target, forwarded_params(params));
            Ok(json!({ "sent": sent }))
        }

        "broadcast" => {
            let target = require_str_param!(params, "method", "method");
            let delivered = host.broadcast(&target, forwarded_params(params));
            Ok(json!({ "delivered": delivered }))
        }

        // ====================================================================
        // Sessions
        // ====================================================================
        "list_sessions" => Ok(serde_json::to_value(host.sessions())?),

        "get_session" => {
            let session_id = require_str_param!(params, "session_id", "sessionId");
            match host.session(&session_id) {
                Some(session) => Ok(serde_json::to_value(session.info())?),
                None => Err(BridgeError::handler(
                    ErrorPayload::INVALID_PARAMS,
                    format!("Unknown session: {}", session_id),
                )),
            }
        }

        "close_session" => {
            let session_id = require_str_param!(params, "session_id", "sessionId");
            Ok(json!({ "closed": host.close_session(&session_id) }))
        }

        "disconnect_session" => {
            let session_id = require_str_param!(params, "session_id", "sessionId");
            Ok(json!({ "disconnected": host.disconnect_session(&session_id) }))
        }

        _ => Err(BridgeError::MethodNotFound {
            method: method.to_string(),
        }),
    }
}
