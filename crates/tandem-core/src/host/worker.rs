//! Dedicated I/O worker for the host.
//!
//! All connection loops, the reaper and host-side handlers run on one
//! current-thread Tokio runtime owned by a named OS thread. Synchronous
//! callers never run on this thread; they hand work to it and wait on their
//! own completion handle.

use crate::{BridgeError, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Name of the host I/O thread.
pub const IO_THREAD_NAME: &str = "tandem-host-io";

pub(crate) struct IoWorker {
    handle: Handle,
    stopped: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IoWorker {
    pub fn start() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(IO_THREAD_NAME.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Host I/O worker stopped");
            })?;

        info!("Host I/O worker started");
        Ok(Self {
            handle,
            stopped: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// True when called from any bridge I/O thread.
    pub fn on_io_thread() -> bool {
        std::thread::current().name() == Some(IO_THREAD_NAME)
    }

    pub fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(BridgeError::Shutdown);
        }
        drop(self.handle.spawn(future));
        Ok(())
    }

    /// Drive `future` to completion from a synchronous caller.
    ///
    /// Timers used by the future are serviced by the worker thread, so the
    /// caller only parks. That also holds for a task on some other runtime:
    /// its thread blocks until the future is done.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        if Self::on_io_thread() {
            return Err(BridgeError::WouldDeadlock);
        }
        if self.is_stopped() {
            return Err(BridgeError::Shutdown);
        }
        // `Handle::block_on` panics inside another runtime's context.
        let _context = self.handle.enter();
        Ok(futures::executor::block_on(future))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            // Joining from the worker itself would never return.
            if !Self::on_io_thread() {
                let _ = thread.join();
            }
        }
        info!("Host I/O worker shut down");
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
