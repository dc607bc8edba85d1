//! Debounced background scheduling of reconciliation passes.
//!
//! # Invariants
//! - Saves of one document inside the debounce window coalesce; only the
//!   latest notification is handled.
//! - Different documents are debounced independently.
//! - Notifications still waiting when cancelled are dropped.

use super::service::{DocumentSaved, SaveHandler};
use crate::model::DocumentId;
use crate::runtime::{CancellationToken, Debouncer, WorkerError};
use crossbeam::channel::{bounded, select, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub struct ReconciliationScheduler {
    sender: Mutex<Option<Sender<DocumentSaved>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
}

impl ReconciliationScheduler {
    pub fn spawn(
        handler: Arc<dyn SaveHandler>,
        window: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let (sender, receiver) = bounded::<DocumentSaved>(NOTIFICATION_QUEUE_CAPACITY);
        let pending = Arc::new(AtomicUsize::new(0));
        let thread_pending = Arc::clone(&pending);
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("inkledger-reconcile".to_string())
            .spawn(move || {
                info!(
                    "event=reconcile_scheduler module=reconcile status=start window_ms={}",
                    window.as_millis()
                );
                let mut debouncer: Debouncer<DocumentId, DocumentSaved> = Debouncer::new(window);
                loop {
                    let timeout = debouncer
                        .next_deadline()
                        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                        .unwrap_or(IDLE_WAIT);
                    select! {
                        recv(receiver) -> saved => match saved {
                            Ok(saved) => {
                                let document_id = saved.document_id;
                                if debouncer.push(document_id, saved, Instant::now()) {
                                    thread_pending.fetch_sub(1, Ordering::SeqCst);
                                    debug!(
                                        "event=reconcile_debounce module=reconcile status=coalesced document_id={}",
                                        document_id
                                    );
                                }
                            }
                            Err(_) => break,
                        },
                        recv(thread_cancel.receiver()) -> _ => break,
                        default(timeout) => {}
                    }

                    for saved in debouncer.take_due(Instant::now()) {
                        if thread_cancel.is_cancelled() {
                            break;
                        }
                        handler.handle_saved(saved);
                        thread_pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    if thread_cancel.is_cancelled() {
                        break;
                    }
                }
                let dropped = debouncer.drain().len();
                info!(
                    "event=reconcile_scheduler module=reconcile status=stopped dropped={}",
                    dropped
                );
            })
            .map_err(|err| WorkerError::Spawn {
                name: "reconcile-scheduler",
                message: err.to_string(),
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
            cancel,
            pending,
        })
    }

    pub fn notify(&self, saved: DocumentSaved) -> Result<(), WorkerError> {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) if !self.cancel.is_cancelled() => sender.clone(),
            _ => return Err(WorkerError::Closed("reconcile-scheduler")),
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        sender.send(saved).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            WorkerError::Closed("reconcile-scheduler")
        })
    }

    /// Notifications accepted but not yet handled or coalesced away.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

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

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sender.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("event=reconcile_scheduler module=reconcile status=join_error");
            }
        }
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::ReconciliationScheduler;
    use crate::reconcile::{DocumentSaved, SaveHandler};
    use crate::runtime::CancellationToken;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        handled: Mutex<Vec<DocumentSaved>>,
    }

    impl SaveHandler for Recording {
        fn handle_saved(&self, saved: DocumentSaved) {
            self.handled.lock().push(saved);
        }
    }

    fn saved(document_id: Uuid, timestamp: i64) -> DocumentSaved {
        DocumentSaved {
            document_id,
            file_path: "Notes/today.txt".to_string(),
            timestamp,
        }
    }

    #[test]
    fn rapid_saves_of_one_document_run_once_with_the_latest() {
        let recording = Arc::new(Recording::default());
        let scheduler = ReconciliationScheduler::spawn(
            recording.clone(),
            Duration::from_millis(150),
            CancellationToken::new(),
        )
        .unwrap();

        let document_id = Uuid::new_v4();
        for timestamp in 1..=5 {
            scheduler.notify(saved(document_id, timestamp)).unwrap();
        }
        assert!(scheduler.wait_idle(Duration::from_secs(5)));

        let handled = recording.handled.lock().clone();
        assert_eq!(handled, vec![saved(document_id, 5)]);
        scheduler.shutdown();
    }

    #[test]
    fn cancelled_scheduler_drops_waiting_saves() {
        let recording = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        let scheduler = ReconciliationScheduler::spawn(
            recording.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        )
        .unwrap();

        scheduler.notify(saved(Uuid::new_v4(), 1)).unwrap();
        cancel.cancel();
        scheduler.shutdown();

        assert!(recording.handled.lock().is_empty());
        assert!(scheduler.notify(saved(Uuid::new_v4(), 2)).is_err());
    }
}
