use inkledger_core::db::open_db_in_memory;
use inkledger_core::store::{ExpectedVersion, NewEvent, SqliteEventStore, StoreError};

fn event(n: u32) -> NewEvent {
    NewEvent {
        event_type: "task_renamed".to_string(),
        payload: format!(r#"{{"type":"renamed","text":"revision {n}"}}"#),
    }
}

#[test]
fn stale_expected_version_conflicts_and_leaves_stream_unchanged() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);

    store
        .append("task-1", "task", ExpectedVersion::NoStream, &[event(1), event(2)])
        .unwrap();
    store
        .append("task-1", "task", ExpectedVersion::Exact(2), &[event(3)])
        .unwrap();
    let before = store.load("task-1", None).unwrap();
    assert_eq!(before.len(), 3);

    let err = store
        .append("task-1", "task", ExpectedVersion::Exact(2), &[event(4)])
        .unwrap_err();
    match err {
        StoreError::ConcurrencyConflict {
            stream_id,
            expected,
            actual,
        } => {
            assert_eq!(stream_id, "task-1");
            assert_eq!(expected, ExpectedVersion::Exact(2));
            assert_eq!(actual, Some(3));
        }
        other => panic!("unexpected error: {other}"),
    }

    let after = store.load("task-1", None).unwrap();
    assert_eq!(after, before);
    assert_eq!(store.current_version("task-1").unwrap(), Some(3));
    assert_eq!(store.head_position().unwrap(), 3);
}

#[test]
fn sequence_numbers_are_contiguous_and_read_global_pages_in_order() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEventStore::new(&conn);

    for round in 0..3 {
        for stream in ["task-a", "task-b"] {
            let expected = if round == 0 {
                ExpectedVersion::NoStream
            } else {
                ExpectedVersion::Exact(round)
            };
            store.append(stream, "task", expected, &[event(round as u32)]).unwrap();
        }
    }

    let stream_a = store.load("task-a", None).unwrap();
    let sequence: Vec<u64> = stream_a.iter().map(|stored| stored.sequence_number).collect();
    assert_eq!(sequence, vec![1, 2, 3]);

    let first_page = store.read_global(0, 4).unwrap();
    let second_page = store.read_global(first_page.last().unwrap().global_position, 4).unwrap();
    assert_eq!(first_page.len(), 4);
    assert_eq!(second_page.len(), 2);
    let positions: Vec<u64> = first_page
        .iter()
        .chain(second_page.iter())
        .map(|stored| stored.global_position)
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
}
