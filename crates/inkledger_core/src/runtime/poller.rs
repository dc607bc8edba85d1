//! Background projection catch-up loop.

use super::cancel::CancellationToken;
use super::worker::WorkerError;
use crate::projection::ProjectionOrchestrator;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs `catch_up` every `interval` until cancelled.
pub struct ProjectionPoller {
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ProjectionPoller {
    pub fn spawn(
        orchestrator: Arc<ProjectionOrchestrator>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let thread_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("inkledger-projection-poller".to_string())
            .spawn(move || {
                info!(
                    "event=projection_poller module=runtime status=start interval_ms={}",
                    interval.as_millis()
                );
                loop {
                    if thread_cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = orchestrator.catch_up() {
                        warn!(
                            "event=projection_poller module=runtime status=error error={}",
                            err
                        );
                    }
                    if thread_cancel.wait_timeout(interval) {
                        break;
                    }
                }
                info!("event=projection_poller module=runtime status=stopped");
            })
            .map_err(|err| WorkerError::Spawn {
                name: "projection-poller",
                message: err.to_string(),
            })?;

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            cancel,
        })
    }

    /// Cancels the shared token and joins the poll thread.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("event=projection_poller module=runtime status=join_error");
            }
        }
    }
}

impl Drop for ProjectionPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
