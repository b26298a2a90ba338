//! Per-connection loop on the host.
//!
//! One task owns each physical connection. Outbound frames from any thread
//! arrive through the session's channel and are written by a companion
//! writer task; inbound frames are handled strictly in arrival order.

use super::registry::Session;
use super::HostShared;
use crate::protocol::{read_envelope, write_envelope, Envelope, Inbound};
use crate::{BridgeError, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Serve one client connection until it closes, idles out or is replaced.
pub(crate) async fn serve_connection<S>(stream: S, shared: Arc<HostShared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if let Err(e) = run(stream, &shared).await {
        debug!("Connection ended: {}", e);
    }
}

async fn run<S>(stream: S, shared: &Arc<HostShared>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let max_frame_size = shared.config.max_frame_size;

    let hello = tokio::time::timeout(
        shared.config.connect_timeout,
        read_envelope(&mut reader, max_frame_size),
    )
    .await
    .map_err(|_| BridgeError::Protocol {
        message: "no hello before connect timeout".to_string(),
    })??;

    let session_id = match hello {
        Inbound::Envelope(Envelope::Hello { session_id }) if !session_id.is_empty() => session_id,
        Inbound::Envelope(Envelope::Hello { .. }) => {
            return Err(BridgeError::Protocol {
                message: "hello with empty session_id".to_string(),
            })
        }
        Inbound::Envelope(other) => {
            return Err(BridgeError::Protocol {
                message: format!("expected hello, got {}", other.kind()),
            })
        }
        Inbound::Malformed(e) => {
            return Err(BridgeError::Protocol {
                message: format!("malformed hello: {}", e),
            })
        }
        Inbound::Closed => return Ok(()),
    };

    let session = shared.registry.get_or_create(&session_id);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (close_tx, mut close_rx) = oneshot::channel();
    let epoch = session.attach(outbound_tx.clone(), close_tx);
    shared.correlation.fail_stale_connections(&session_id, epoch);
    info!(session_id = %session_id, epoch, "Client connected");

    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx, session_id.clone()));
    let idle_timeout = shared.config.session_timeout;

    let reason = loop {
        tokio::select! {
            _ = &mut close_rx => break "closed by host",
            _ = &mut writer_task => break "write failed",
            inbound = tokio::time::timeout(idle_timeout, read_envelope(&mut reader, max_frame_size)) => {
                match inbound {
                    Err(_) => break "idle timeout",
                    Ok(Err(e)) => {
                        debug!(session_id = %session_id, "Read failed: {}", e);
                        break "read failed";
                    }
                    Ok(Ok(Inbound::Closed)) => break "peer closed",
                    Ok(Ok(Inbound::Malformed(e))) => {
                        warn!(session_id = %session_id, "Skipping malformed frame: {}", e);
                    }
                    Ok(Ok(Inbound::Envelope(envelope))) => {
                        handle_frame(shared, &session, &outbound_tx, envelope);
                    }
                }
            }
        }
    };

    writer_task.abort();
    session.detach(epoch);
    info!(session_id = %session_id, epoch, reason, "Client disconnected");
    Ok(())
}

fn handle_frame(
    shared: &Arc<HostShared>,
    session: &Arc<Session>,
    reply: &mpsc::UnboundedSender<Envelope>,
    envelope: Envelope,
) {
    match envelope {
        Envelope::Heartbeat => {
            let first = session.record_heartbeat();
            let _ = reply.send(Envelope::HeartbeatAck);
            if first {
                let _ = reply.send(Envelope::time_sync_now());
            }
        }
        Envelope::Response {
            correlation_id,
            result,
        } => {
            shared.correlation.resolve_response(&correlation_id, result);
        }
        Envelope::Error {
            correlation_id,
            error,
        } => {
            shared.correlation.resolve_error(&correlation_id, error);
        }
        Envelope::Event {
            event_name,
            event_data,
        } => {
            debug!(session_id = %session.id(), event = %event_name, "Event received");
            shared.registry.dispatch_event(session, &event_name, event_data);
        }
        Envelope::Command { id, method, params } => {
            let dispatcher = shared.dispatcher.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                let answer = dispatcher.dispatch(id, method, params).await;
                if reply.send(answer).is_err() {
                    debug!("Connection closed before command reply");
                }
            });
        }
        other => {
            debug!(session_id = %session.id(), kind = other.kind(), "Ignoring frame");
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    session_id: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        debug!(session_id = %session_id, kind = envelope.kind(), "Sending frame");
        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            warn!(session_id = %session_id, "Write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
