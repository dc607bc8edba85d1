//! Single-thread bounded job queue.
//!
//! # Invariants
//! - At most `capacity` jobs wait; `submit` blocks while the queue is full.
//! - `shutdown` cancels, stops accepting jobs and joins the thread. Jobs
//!   still queued at that point are dropped.

use super::cancel::CancellationToken;
use crossbeam::channel::{bounded, select, Sender};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker `{0}` is shut down")]
    Closed(&'static str),
    #[error("failed to spawn worker `{name}`: {message}")]
    Spawn {
        name: &'static str,
        message: String,
    },
}

pub struct BackgroundWorker<J: Send + 'static> {
    name: &'static str,
    sender: Mutex<Option<Sender<J>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl<J: Send + 'static> BackgroundWorker<J> {
    /// Spawns the worker thread. `handler` runs once per job and receives the
    /// token so long jobs can stop between steps.
    pub fn spawn<F>(
        name: &'static str,
        capacity: usize,
        cancel: CancellationToken,
        mut handler: F,
    ) -> Result<Self, WorkerError>
    where
        F: FnMut(J, &CancellationToken) + Send + 'static,
    {
        let (sender, receiver) = bounded::<J>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let thread_pending = Arc::clone(&pending);
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name(format!("inkledger-{name}"))
            .spawn(move || {
                info!("event=worker_start module=runtime status=ok worker={}", name);
                loop {
                    select! {
                        recv(receiver) -> job => match job {
                            Ok(job) => {
                                handler(job, &thread_cancel);
                                thread_pending.fetch_sub(1, Ordering::SeqCst);
                            }
                            Err(_) => break,
                        },
                        recv(thread_cancel.receiver()) -> _ => break,
                    }
                    if thread_cancel.is_cancelled() {
                        break;
                    }
                }
                info!("event=worker_stop module=runtime status=ok worker={}", name);
            })
            .map_err(|err| WorkerError::Spawn {
                name,
                message: err.to_string(),
            })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            cancel,
            pending,
        })
    }

    pub fn submit(&self, job: J) -> Result<(), WorkerError> {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) if !self.cancel.is_cancelled() => sender.clone(),
            _ => return Err(WorkerError::Closed(self.name)),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        sender.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            WorkerError::Closed(self.name)
        })
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Polls until every submitted job has finished. Returns `false` on
    /// timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Cancels and joins the worker thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sender.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The last owner may be dropped from inside the worker itself.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(
                    "event=worker_join module=runtime status=error worker={}",
                    self.name
                );
            }
        }
    }
}

impl<J: Send + 'static> Drop for BackgroundWorker<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{BackgroundWorker, WorkerError};
    use crate::runtime::CancellationToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn runs_jobs_in_order_and_rejects_after_shutdown() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let worker =
            BackgroundWorker::spawn("test", 4, CancellationToken::new(), move |job: u32, _| {
                sink.lock().push(job);
            })
            .unwrap();

        for job in 0..3 {
            worker.submit(job).unwrap();
        }
        assert!(worker.wait_idle(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![0, 1, 2]);

        let cancel = worker.cancel.clone();
        worker.shutdown();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn submit_after_cancel_is_rejected() {
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let worker = BackgroundWorker::spawn("cancelled", 1, cancel.clone(), move |_: (), _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        cancel.cancel();
        assert_eq!(worker.submit(()), Err(WorkerError::Closed("cancelled")));
        worker.shutdown();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
