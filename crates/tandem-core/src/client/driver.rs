//! The client's connection driver.
//!
//! One task owns the whole connection lifecycle: opening the transport,
//! heartbeats, silence detection, frame writes, backoff between attempts and
//! the futures of in-flight command handlers. Frame reads happen in a
//! helper task so that a read is never cancelled halfway through a frame.

use super::connector::BoxedStream;
use super::{ClientInner, ConnectionState};
use crate::pending::Reply;
use crate::protocol::{read_envelope, write_envelope, Envelope, Inbound};
use crate::{BridgeError, Result};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

enum Exit {
    Stopped,
    Lost(&'static str),
}

struct Link {
    writer: WriteHalf<BoxedStream>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub(super) struct Driver {
    inner: Arc<ClientInner>,
    generation: u64,
    stop: oneshot::Receiver<()>,
    frames: mpsc::UnboundedReceiver<Envelope>,
    handlers: FuturesUnordered<BoxFuture<'static, Envelope>>,
}

impl Driver {
    pub fn new(
        inner: Arc<ClientInner>,
        generation: u64,
        stop: oneshot::Receiver<()>,
        frames: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            inner,
            generation,
            stop,
            frames,
            handlers: FuturesUnordered::new(),
        }
    }

    pub async fn run(mut self) {
        let policy = self.inner.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            let opened = match self.idle(open(self.inner.clone())).await {
                Some(opened) => opened,
                None => return,
            };

            match opened {
                Ok(link) => {
                    attempt = 0;
                    self.inner.set_attempts(0);
                    self.publish(ConnectionState::Connected);

                    match self.serve(link).await {
                        Exit::Stopped => return,
                        Exit::Lost(reason) => {
                            warn!(session_id = %self.inner.session_id, reason, "Connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(session_id = %self.inner.session_id, attempt, "Connection attempt failed: {}", e);
                }
            }

            self.inner.fail_pending();

            if !policy.allows(attempt) {
                warn!(
                    session_id = %self.inner.session_id,
                    attempts = attempt,
                    "Giving up on reconnection"
                );
                self.inner.finish(self.generation);
                return;
            }

            self.publish(ConnectionState::Reconnecting);
            let delay = policy.delay_for(attempt);
            attempt += 1;
            self.inner.set_attempts(attempt);
            debug!(session_id = %self.inner.session_id, attempt, ?delay, "Reconnecting after backoff");

            if self.idle(tokio::time::sleep(delay)).await.is_none() {
                return;
            }
        }
    }

    fn publish(&self, state: ConnectionState) {
        self.inner.publish(self.generation, state);
    }

    /// Drive `future` while no connection is open. Handler replies and
    /// queued frames have nowhere to go and are dropped.
    async fn idle<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                _ = &mut self.stop => return None,
                output = &mut future => return Some(output),
                Some(reply) = self.handlers.next(), if !self.handlers.is_empty() => {
                    debug!(kind = reply.kind(), "Dropping handler reply: not connected");
                }
                Some(frame) = self.frames.recv() => self.inner.reject_unsent(frame),
            }
        }
    }

    async fn serve(&mut self, mut link: Link) -> Exit {
        let config = &self.inner.config;
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_timeout = config.heartbeat_timeout;
        let silence = tokio::time::sleep(heartbeat_timeout);
        tokio::pin!(silence);

        loop {
            let outgoing = tokio::select! {
                _ = &mut self.stop => return Exit::Stopped,
                _ = &mut silence => return Exit::Lost("heartbeat timeout"),
                _ = heartbeat.tick() => Envelope::Heartbeat,
                inbound = link.inbound.recv() => match inbound {
                    None | Some(Inbound::Closed) => return Exit::Lost("closed by host"),
                    Some(Inbound::Malformed(e)) => {
                        warn!(session_id = %self.inner.session_id, "Skipping malformed frame: {}", e);
                        continue;
                    }
                    Some(Inbound::Envelope(envelope)) => {
                        silence.as_mut().reset(Instant::now() + heartbeat_timeout);
                        self.handle_inbound(envelope);
                        continue;
                    }
                },
                Some(reply) = self.handlers.next(), if !self.handlers.is_empty() => reply,
                Some(frame) = self.frames.recv() => frame,
            };

            if let Err(e) = write_envelope(&mut link.writer, &outgoing).await {
                debug!(session_id = %self.inner.session_id, "Write failed: {}", e);
                // The frame never left; fail its caller right away.
                self.inner.reject_unsent(outgoing);
                return Exit::Lost("write failed");
            }
        }
    }

    fn handle_inbound(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Command { id, method, params } => {
                let dispatcher = self.inner.dispatcher.clone();
                self.handlers
                    .push(async move { dispatcher.dispatch(id, method, params).await }.boxed());
            }
            Envelope::Response {
                correlation_id,
                result,
            } => {
                self.inner.pending.resolve(&correlation_id, Reply::Result(result));
            }
            Envelope::Error {
                correlation_id,
                error,
            } => {
                self.inner.pending.resolve(&correlation_id, Reply::Error(error));
            }
            Envelope::TimeSync { server_time } => {
                self.inner.clock.update(server_time);
            }
            Envelope::HeartbeatAck => {}
            other => {
                debug!(kind = other.kind(), "Ignoring frame from host");
            }
        }
    }
}

/// Open a transport, start its reader and introduce ourselves.
async fn open(inner: Arc<ClientInner>) -> Result<Link> {
    let stream = tokio::time::timeout(inner.config.connect_timeout, inner.connector.connect())
        .await
        .map_err(|_| BridgeError::Timeout(inner.config.connect_timeout))??;

    let (reader, mut writer) = tokio::io::split(stream);
    write_envelope(
        &mut writer,
        &Envelope::Hello {
            session_id: inner.session_id.clone(),
        },
    )
    .await?;

    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_loop(reader, inner.config.max_frame_size, inbound_tx));
    info!(session_id = %inner.session_id, "Connected to host");

    Ok(Link {
        writer,
        inbound,
        reader,
    })
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    max_frame_size: usize,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        let frame = match read_envelope(&mut reader, max_frame_size).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Read failed: {}", e);
                Inbound::Closed
            }
        };
        let closed = matches!(frame, Inbound::Closed);
        if inbound.send(frame).is_err() || closed {
            return;
        }
    }
}
