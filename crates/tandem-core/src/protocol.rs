//! Wire envelope and framing.
//!
//! Every message exchanged between host and client is an [`Envelope`],
//! JSON-encoded and sent as one length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The envelope is a tagged union keyed by `kind`:
//!
//! ```text
//! { "kind": "command", "id": "<uuid>", "method": "ping", "params": {} }
//! { "kind": "response", "correlation_id": "<uuid>", "result": "pong" }
//! { "kind": "error", "correlation_id": "<uuid>", "error": {"code": -32601, "message": "..."} }
//! { "kind": "event", "event_name": "selection_changed", "event_data": {} }
//! { "kind": "time_sync", "server_time": 1700000000000 }
//! ```

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame on every connection; names the session it belongs to.
    Hello { session_id: String },
    Command {
        id: String,
        method: String,
        #[serde(default = "empty_object")]
        params: Value,
    },
    Response {
        correlation_id: String,
        #[serde(default)]
        result: Value,
    },
    Error {
        correlation_id: String,
        error: ErrorPayload,
    },
    Event {
        event_name: String,
        #[serde(default = "empty_object")]
        event_data: Value,
    },
    Heartbeat,
    HeartbeatAck,
    /// Host wall-clock time in milliseconds since the Unix epoch.
    TimeSync { server_time: i64 },
}

impl Envelope {
    /// Build a command with a freshly generated id. Returns the id alongside.
    pub fn command(method: impl Into<String>, params: Value) -> (String, Self) {
        let id = Uuid::new_v4().to_string();
        let envelope = Envelope::Command {
            id: id.clone(),
            method: method.into(),
            params,
        };
        (id, envelope)
    }

    pub fn response(correlation_id: impl Into<String>, result: Value) -> Self {
        Envelope::Response {
            correlation_id: correlation_id.into(),
            result,
        }
    }

    pub fn error(correlation_id: impl Into<String>, error: ErrorPayload) -> Self {
        Envelope::Error {
            correlation_id: correlation_id.into(),
            error,
        }
    }

    pub fn event(event_name: impl Into<String>, event_data: Value) -> Self {
        Envelope::Event {
            event_name: event_name.into(),
            event_data,
        }
    }

    /// A `time_sync` stamped with the current wall-clock time.
    pub fn time_sync_now() -> Self {
        Envelope::TimeSync {
            server_time: now_millis(),
        }
    }

    /// The wire `kind` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Command { .. } => "command",
            Envelope::Response { .. } => "response",
            Envelope::Error { .. } => "error",
            Envelope::Event { .. } => "event",
            Envelope::Heartbeat => "heartbeat",
            Envelope::HeartbeatAck => "heartbeat_ack",
            Envelope::TimeSync { .. } => "time_sync",
        }
    }
}

/// Structured error carried by an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

impl ErrorPayload {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_frame_size {
        return Err(BridgeError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len, max_frame_size
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| BridgeError::Protocol {
        message: format!("frame of {} bytes cannot be length-prefixed", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Outcome of reading one frame as an envelope.
#[derive(Debug)]
pub enum Inbound {
    Envelope(Envelope),
    /// The frame arrived intact but did not decode; the stream is still usable.
    Malformed(String),
    Closed,
}

/// Read the next frame and decode it as an envelope.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Inbound> {
    let Some(frame) = read_frame(reader, max_frame_size).await? else {
        return Ok(Inbound::Closed);
    };
    match serde_json::from_slice::<Envelope>(&frame) {
        Ok(envelope) => Ok(Inbound::Envelope(envelope)),
        Err(e) => Ok(Inbound::Malformed(e.to_string())),
    }
}

/// Encode an envelope and write it as one frame.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let bytes = serde_json::to_vec(envelope)?;
    write_frame(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MAX: usize = 1024;

    #[test]
    fn test_command_wire_shape() {
        let (id, envelope) = Envelope::command("ping", json!({"x": 1}));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["kind"], "command");
        assert_eq!(value["id"], json!(id));
        assert_eq!(value["method"], "ping");
        assert_eq!(value["params"], json!({"x": 1}));
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_unit_kinds_serialize_as_bare_tags() {
        assert_eq!(
            serde_json::to_value(Envelope::Heartbeat).unwrap(),
            json!({"kind": "heartbeat"})
        );
        assert_eq!(
            serde_json::to_value(Envelope::HeartbeatAck).unwrap(),
            json!({"kind": "heartbeat_ack"})
        );
    }

    #[test]
    fn test_error_envelope_wire_shape() {
        let envelope = Envelope::error("abc", ErrorPayload::method_not_found("missing"));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["kind"], "error");
        assert_eq!(value["correlation_id"], "abc");
        assert_eq!(value["error"]["code"], -32601);
    }

    #[test]
    fn test_missing_params_default_to_empty_object() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"kind":"command","id":"1","method":"ping"}"#).unwrap();
        match parsed {
            Envelope::Command { params, .. } => assert_eq!(params, json!({})),
            other => panic!("Expected command, got: {:?}", other),
        }

        let parsed: Envelope =
            serde_json::from_str(r#"{"kind":"event","event_name":"saved"}"#).unwrap();
        assert_eq!(parsed, Envelope::event("saved", json!({})));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed = serde_json::from_str::<Envelope>(r#"{"kind":"gossip"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_time_sync_uses_wall_clock() {
        let before = now_millis();
        match Envelope::time_sync_now() {
            Envelope::TimeSync { server_time } => assert!(server_time >= before),
            other => panic!("Expected time_sync, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_envelope_frame_roundtrip() {
        let envelope = Envelope::response("abc", json!("pong"));
        let mut buf = Vec::new();
        write_envelope(&mut buf, &envelope).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        match read_envelope(&mut cursor, MAX).await.unwrap() {
            Inbound::Envelope(read_back) => assert_eq!(read_back, envelope),
            other => panic!("Expected envelope, got: {:?}", other),
        }
        assert!(matches!(
            read_envelope(&mut cursor, MAX).await.unwrap(),
            Inbound::Closed
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_poison_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"not valid json").await.unwrap();
        write_envelope(&mut buf, &Envelope::Heartbeat).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_envelope(&mut cursor, MAX).await.unwrap(),
            Inbound::Malformed(_)
        ));
        assert!(matches!(
            read_envelope(&mut cursor, MAX).await.unwrap(),
            Inbound::Envelope(Envelope::Heartbeat)
        ));
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (MAX + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor, MAX).await;
        assert!(matches!(result, Err(BridgeError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_none());
    }
}
