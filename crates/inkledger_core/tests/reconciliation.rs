use inkledger_core::db::{open_db_in_memory, share, SharedConnection};
use inkledger_core::model::now_epoch_ms;
use inkledger_core::projection::{OrchestratorOptions, ProjectionOrchestrator};
use inkledger_core::reconcile::{purge_orphaned_tasks, ReconcileReport};
use inkledger_core::store::SqliteEventStore;
use inkledger_core::{
    CategoryCommand, CategoryId, CommandBus, CommandBusOptions, DocumentCommand, DocumentId,
    DocumentSaved, DocumentTextSource, ReconcileError, ReconciliationService, TaskCommand,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const MEETING_PATH: &str = "Notes/Projects/A/meeting.rtf";

#[derive(Default)]
struct MemoryText {
    texts: Mutex<HashMap<DocumentId, String>>,
}

impl MemoryText {
    fn set(&self, document_id: DocumentId, text: &str) {
        self.texts.lock().insert(document_id, text.to_string());
    }
}

impl DocumentTextSource for MemoryText {
    fn plain_text(&self, saved: &DocumentSaved) -> Result<String, ReconcileError> {
        Ok(self
            .texts
            .lock()
            .get(&saved.document_id)
            .cloned()
            .unwrap_or_default())
    }
}

struct Fixture {
    conn: SharedConnection,
    bus: Arc<CommandBus>,
    texts: Arc<MemoryText>,
    service: ReconciliationService,
}

fn fixture() -> Fixture {
    let conn = share(open_db_in_memory().unwrap());
    let orchestrator = Arc::new(
        ProjectionOrchestrator::new(Arc::clone(&conn), OrchestratorOptions::default()).unwrap(),
    );
    let bus = Arc::new(CommandBus::new(
        Arc::clone(&conn),
        orchestrator,
        CommandBusOptions::default(),
    ));
    let texts = Arc::new(MemoryText::default());
    let service = ReconciliationService::new(Arc::clone(&bus), texts.clone());
    Fixture {
        conn,
        bus,
        texts,
        service,
    }
}

fn category(bus: &CommandBus, name: &str, parent_id: Option<CategoryId>) -> CategoryId {
    let category_id = Uuid::new_v4();
    bus.dispatch_category(
        category_id,
        CategoryCommand::Create {
            category_id,
            name: name.to_string(),
            parent_id,
            tags: Vec::new(),
            inherit_to_children: true,
        },
    )
    .unwrap();
    category_id
}

fn saved(document_id: DocumentId, timestamp: i64) -> DocumentSaved {
    DocumentSaved {
        document_id,
        file_path: MEETING_PATH.to_string(),
        timestamp,
    }
}

fn head(fixture: &Fixture) -> u64 {
    SqliteEventStore::new(&fixture.conn.lock())
        .head_position()
        .unwrap()
}

fn meeting_text(line_seven: &str) -> String {
    format!("Meeting notes\n\n[call Alice]\nagenda\n\n\n{line_seven}\n")
}

#[test]
fn edited_line_orphans_old_task_and_creates_new_one() {
    let fixture = fixture();
    let notes = category(&fixture.bus, "Notes", None);
    let projects = category(&fixture.bus, "Projects", Some(notes));
    let a = category(&fixture.bus, "A", Some(projects));
    let document_id = Uuid::new_v4();

    fixture.texts.set(document_id, &meeting_text("[email Bob]"));
    let first = fixture.service.reconcile(&saved(document_id, now_epoch_ms())).unwrap();
    assert_eq!(
        first,
        ReconcileReport {
            created: 2,
            ..ReconcileReport::default()
        }
    );

    let live = fixture
        .bus
        .read(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|task| task.category_id == Some(a)));
    assert_eq!(live[0].source_line_number, Some(3));
    assert_eq!(live[1].source_line_number, Some(7));
    assert_ne!(live[0].source_stable_id, live[1].source_stable_id);
    let alice = live[0].clone();
    let bob = live[1].clone();

    fixture.texts.set(document_id, &meeting_text("[email Bob and Carol]"));
    let resaved_at = now_epoch_ms() + 60_000;
    let second = fixture.service.reconcile(&saved(document_id, resaved_at)).unwrap();
    assert_eq!(
        second,
        ReconcileReport {
            created: 1,
            orphaned: 1,
            touched: 1,
            failed: 0,
        }
    );

    let (live, orphaned) = fixture
        .bus
        .read(|queries| {
            Ok((
                queries.live_tasks_for_document(document_id)?,
                queries.orphaned_tasks_for_document(document_id)?,
            ))
        })
        .unwrap();
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].task_id, bob.task_id);
    assert_eq!(orphaned[0].text, "email Bob");

    let alice_now = live.iter().find(|task| task.task_id == alice.task_id).unwrap();
    assert_eq!(alice_now.text, alice.text);
    assert_eq!(alice_now.last_seen_at, Some(resaved_at));
    let carol = live.iter().find(|task| task.task_id != alice.task_id).unwrap();
    assert_eq!(carol.text, "email Bob and Carol");
    assert_eq!(carol.source_line_number, Some(7));
}

#[test]
fn removed_document_is_restored_and_reconciled_on_the_next_save() {
    let fixture = fixture();
    let document_id = Uuid::new_v4();
    fixture.texts.set(document_id, &meeting_text("[book room]"));
    let first = fixture.service.reconcile(&saved(document_id, now_epoch_ms())).unwrap();
    assert_eq!(first.created, 2);

    fixture
        .bus
        .dispatch_document(document_id, DocumentCommand::Remove)
        .unwrap();
    assert!(fixture
        .bus
        .read(|queries| queries.document(document_id))
        .unwrap()
        .is_none());

    fixture.texts.set(document_id, &meeting_text("[book a bigger room]"));
    let second = fixture
        .service
        .reconcile(&saved(document_id, now_epoch_ms() + 60_000))
        .unwrap();
    assert_eq!(
        second,
        ReconcileReport {
            created: 1,
            orphaned: 1,
            touched: 1,
            failed: 0,
        }
    );
    let document = fixture
        .bus
        .read(|queries| queries.document(document_id))
        .unwrap()
        .unwrap();
    assert_eq!(document.file_path, MEETING_PATH);
}

#[test]
fn second_pass_on_unchanged_text_appends_nothing() {
    let fixture = fixture();
    let document_id = Uuid::new_v4();
    fixture
        .texts
        .set(document_id, "[renew passport]\n[ ]\n[x]\nsee footnote [42]\n[pick up dry cleaning]");
    let save = saved(document_id, now_epoch_ms());

    let first = fixture.service.reconcile(&save).unwrap();
    assert_eq!(first.created, 3);
    let position = head(&fixture);

    let second = fixture.service.reconcile(&save).unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.orphaned, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(head(&fixture), position);
}

#[test]
fn edits_on_one_line_leave_other_lines_alone() {
    let fixture = fixture();
    let document_id = Uuid::new_v4();
    fixture
        .texts
        .set(document_id, "[alpha task]\n[beta task]\n[gamma task]\n");
    fixture
        .service
        .reconcile(&saved(document_id, now_epoch_ms()))
        .unwrap();
    let before = fixture
        .bus
        .read(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();

    fixture
        .texts
        .set(document_id, "[alpha task]\n[beta task, revised]\n[gamma task]\n");
    fixture
        .service
        .reconcile(&saved(document_id, now_epoch_ms() + 1_000))
        .unwrap();
    let after = fixture
        .bus
        .read(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();

    for line in [1, 3] {
        let old = before.iter().find(|task| task.source_line_number == Some(line)).unwrap();
        let new = after.iter().find(|task| task.source_line_number == Some(line)).unwrap();
        assert_eq!(old.task_id, new.task_id);
        assert_eq!(old.text, new.text);
    }
    let old_line_two = before.iter().find(|task| task.source_line_number == Some(2)).unwrap();
    assert!(after.iter().all(|task| task.task_id != old_line_two.task_id));
}

#[test]
fn user_edits_survive_reconciliation_and_orphans_are_purged_explicitly() {
    let fixture = fixture();
    let document_id = Uuid::new_v4();
    fixture.texts.set(document_id, "[plan offsite]\n[order badges]\n");
    fixture
        .service
        .reconcile(&saved(document_id, now_epoch_ms()))
        .unwrap();
    let live = fixture
        .bus
        .read(|queries| queries.live_tasks_for_document(document_id))
        .unwrap();
    let offsite = live[0].task_id;
    fixture
        .bus
        .dispatch_task(offsite, TaskCommand::Rename { text: "plan the team offsite".to_string() })
        .unwrap();
    fixture
        .bus
        .dispatch_task(live[1].task_id, TaskCommand::SetTags { tags: vec!["events".to_string()] })
        .unwrap();

    fixture.texts.set(document_id, "[plan offsite]\n");
    let report = fixture
        .service
        .reconcile(&saved(document_id, now_epoch_ms() + 1_000))
        .unwrap();
    assert_eq!(report.orphaned, 1);

    let renamed = fixture.bus.read(|queries| queries.task(offsite)).unwrap().unwrap();
    assert_eq!(renamed.text, "plan the team offsite");
    let orphan = fixture
        .bus
        .read(|queries| queries.orphaned_tasks_for_document(document_id))
        .unwrap();
    assert_eq!(orphan.len(), 1);
    assert!(orphan[0].manual_tags.contains("events"));

    let purged = purge_orphaned_tasks(&fixture.bus, document_id).unwrap();
    assert_eq!(purged.deleted, 1);
    let orphan = fixture
        .bus
        .read(|queries| queries.orphaned_tasks_for_document(document_id))
        .unwrap();
    assert!(orphan.is_empty());
}
