use inkledger_core::{
    CoreConfig, CoreRuntime, DocumentId, DocumentSaved, DocumentTextSource, FileTextSource,
    ReconcileError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct CountingText {
    reads: AtomicUsize,
    text: Mutex<String>,
}

impl DocumentTextSource for CountingText {
    fn plain_text(&self, _saved: &DocumentSaved) -> Result<String, ReconcileError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.text.lock().clone())
    }
}

fn config() -> CoreConfig {
    CoreConfig {
        debounce_ms: 100,
        poll_interval_ms: 50,
        ..CoreConfig::default()
    }
}

fn saved(document_id: DocumentId, file_path: &str, timestamp: i64) -> DocumentSaved {
    DocumentSaved {
        document_id,
        file_path: file_path.to_string(),
        timestamp,
    }
}

#[test]
fn rapid_saves_coalesce_into_one_reconciliation_pass() {
    let text = Arc::new(CountingText::default());
    *text.text.lock() = "[book flights]\n[renew insurance]\n".to_string();
    let runtime = CoreRuntime::open_in_memory(config(), text.clone()).unwrap();

    let document_id = Uuid::new_v4();
    for timestamp in 1..=6 {
        runtime
            .notify_document_saved(saved(document_id, "Travel/trip.txt", timestamp))
            .unwrap();
    }
    assert!(runtime.wait_idle(Duration::from_secs(10)));

    assert_eq!(text.reads.load(Ordering::SeqCst), 1);
    let live = runtime
        .with_queries(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();
    assert_eq!(live.len(), 2);

    let cached = runtime.task(live[0].task_id).unwrap().unwrap();
    assert_eq!(cached.text, "book flights");
    runtime.shutdown();
}

#[test]
fn shutdown_cancels_workers_and_rejects_new_saves() {
    let runtime = CoreRuntime::open_in_memory(config(), Arc::new(CountingText::default())).unwrap();
    assert!(!runtime.is_shut_down());

    runtime.shutdown();
    assert!(runtime.is_shut_down());
    assert!(runtime
        .notify_document_saved(saved(Uuid::new_v4(), "a.txt", 1))
        .is_err());

    runtime.shutdown();
}

#[test]
fn file_backed_runtime_reconciles_files_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let note = dir.path().join("groceries.txt");
    std::fs::write(&note, "Shopping\n[buy oat milk]\n[get coffee beans]\n").unwrap();
    let config = CoreConfig {
        db_path: dir.path().join("ledger.sqlite3"),
        ..config()
    };

    let document_id = Uuid::new_v4();
    let file_path = note.to_str().unwrap().to_string();
    {
        let runtime = CoreRuntime::open(config.clone(), Arc::new(FileTextSource)).unwrap();
        let report = runtime
            .reconcile_now(&saved(document_id, &file_path, 1))
            .unwrap();
        assert_eq!(report.created, 2);
        runtime.shutdown();
    }

    let runtime = CoreRuntime::open(config, Arc::new(FileTextSource)).unwrap();
    let live = runtime
        .with_queries(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();
    let texts: Vec<&str> = live.iter().map(|task| task.text.as_str()).collect();
    assert_eq!(texts, vec!["buy oat milk", "get coffee beans"]);
    runtime.shutdown();
}
