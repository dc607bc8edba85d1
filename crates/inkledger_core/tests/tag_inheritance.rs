use inkledger_core::db::{open_db_in_memory, share};
use inkledger_core::model::tags::TagSet;
use inkledger_core::projection::{OrchestratorOptions, ProjectionOrchestrator};
use inkledger_core::runtime::CancellationToken;
use inkledger_core::tags::{
    CategoryNode, InMemoryHierarchy, PropagationJob, PropagationOptions, PropagationRunner,
    TagInheritanceResolver, TagPropagator,
};
use inkledger_core::{
    CategoryCommand, CategoryId, CommandBus, CommandBusOptions, DocumentCommand, TaskCommand,
    TaskId, TaskSource,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn bus() -> Arc<CommandBus> {
    let conn = share(open_db_in_memory().unwrap());
    let orchestrator = Arc::new(
        ProjectionOrchestrator::new(Arc::clone(&conn), OrchestratorOptions::default()).unwrap(),
    );
    Arc::new(CommandBus::new(conn, orchestrator, CommandBusOptions::default()))
}

fn category(
    bus: &CommandBus,
    name: &str,
    parent_id: Option<CategoryId>,
    tags: &[&str],
) -> CategoryId {
    let category_id = Uuid::new_v4();
    bus.dispatch_category(
        category_id,
        CategoryCommand::Create {
            category_id,
            name: name.to_string(),
            parent_id,
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            inherit_to_children: true,
        },
    )
    .unwrap();
    category_id
}

fn task(bus: &CommandBus, category_id: CategoryId) -> TaskId {
    let task_id = Uuid::new_v4();
    bus.dispatch_task(
        task_id,
        TaskCommand::Create {
            task_id,
            text: "prepare slides".to_string(),
            category_id: Some(category_id),
            source: None,
            inherited_tags: None,
        },
    )
    .unwrap();
    task_id
}

fn inherited(bus: &CommandBus, task_id: TaskId) -> Vec<String> {
    bus.read(|queries| queries.task(task_id))
        .unwrap()
        .unwrap()
        .inherited_tags
        .into_vec()
}

fn fast_options() -> PropagationOptions {
    PropagationOptions {
        batch_size: 2,
        batch_delay: Duration::from_millis(1),
    }
}

#[test]
fn new_task_under_nested_category_inherits_root_first() {
    let bus = bus();
    let a = category(&bus, "A", None, &["work"]);
    let b = category(&bus, "B", Some(a), &["urgent"]);

    let task_id = task(&bus, b);
    assert_eq!(inherited(&bus, task_id), vec!["work", "urgent"]);
    assert_eq!(
        bus.read(|queries| queries.category_path(b)).unwrap().as_deref(),
        Some("A/B")
    );
}

#[test]
fn ancestor_changes_reach_existing_tasks_without_touching_manual_tags() {
    let bus = bus();
    let a = category(&bus, "A", None, &["work"]);
    let b = category(&bus, "B", Some(a), &["urgent"]);
    let tasks: Vec<TaskId> = (0..5).map(|_| task(&bus, b)).collect();
    bus.dispatch_task(tasks[0], TaskCommand::SetTags { tags: vec!["mine".to_string()] })
        .unwrap();

    bus.dispatch_category(
        a,
        CategoryCommand::SetTags {
            tags: vec!["work".to_string(), "q3".to_string()],
        },
    )
    .unwrap();
    let runner = PropagationRunner::new(Arc::clone(&bus), fast_options());
    let report = runner
        .run(PropagationJob::Category(a), &CancellationToken::new())
        .unwrap();
    assert_eq!(report.examined, 5);
    assert_eq!(report.refreshed, 5);
    for task_id in &tasks {
        assert_eq!(inherited(&bus, *task_id), vec!["work", "q3", "urgent"]);
    }
    let first = bus.read(|queries| queries.task(tasks[0])).unwrap().unwrap();
    assert_eq!(first.manual_tags.into_vec(), vec!["mine"]);

    let again = runner
        .run(PropagationJob::Category(a), &CancellationToken::new())
        .unwrap();
    assert_eq!(again.refreshed, 0, "unchanged sets are not rewritten");

    bus.dispatch_category(a, CategoryCommand::SetInheritance { inherit_to_children: false })
        .unwrap();
    runner
        .run(PropagationJob::Category(a), &CancellationToken::new())
        .unwrap();
    assert_eq!(inherited(&bus, tasks[1]), vec!["urgent"]);
}

#[test]
fn task_moved_during_propagation_keeps_its_new_category_tags() {
    let bus = bus();
    let a = category(&bus, "A", None, &["work"]);
    let b = category(&bus, "B", None, &["home"]);
    let first = task(&bus, a);
    let second = task(&bus, a);
    bus.dispatch_category(
        a,
        CategoryCommand::SetTags {
            tags: vec!["work".to_string(), "urgent".to_string()],
        },
    )
    .unwrap();

    let runner = PropagationRunner::new(
        Arc::clone(&bus),
        PropagationOptions {
            batch_size: 1,
            batch_delay: Duration::from_millis(400),
        },
    );
    let propagation = std::thread::spawn(move || {
        runner
            .run(PropagationJob::Category(a), &CancellationToken::new())
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(150));
    for task_id in [first, second] {
        bus.dispatch_task(
            task_id,
            TaskCommand::Move {
                category_id: Some(b),
                inherited_tags: None,
            },
        )
        .unwrap();
        assert_eq!(inherited(&bus, task_id), vec!["home"]);
    }
    let report = propagation.join().unwrap();
    assert_eq!(report.examined, 2);

    for task_id in [first, second] {
        let view = bus.read(|queries| queries.task(task_id)).unwrap().unwrap();
        assert_eq!(view.category_id, Some(b));
        assert_eq!(view.inherited_tags.into_vec(), vec!["home"]);
    }
}

#[test]
fn cancelled_propagation_stops_between_batches() {
    let bus = bus();
    let a = category(&bus, "A", None, &[]);
    for _ in 0..4 {
        task(&bus, a);
    }
    bus.dispatch_category(a, CategoryCommand::SetTags { tags: vec!["home".to_string()] })
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = PropagationRunner::new(Arc::clone(&bus), fast_options())
        .run(PropagationJob::Category(a), &cancel)
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.refreshed, 0);
}

#[test]
fn background_propagator_refreshes_document_tasks() {
    let bus = bus();
    let a = category(&bus, "A", None, &["work"]);
    let propagator = Arc::new(
        TagPropagator::spawn(Arc::clone(&bus), fast_options(), CancellationToken::new()).unwrap(),
    );
    assert!(bus.attach_propagation(propagator.clone()));

    let document_id = Uuid::new_v4();
    bus.dispatch_document(
        document_id,
        DocumentCommand::Register {
            document_id,
            file_path: "A/plan.txt".to_string(),
            category_id: Some(a),
        },
    )
    .unwrap();
    let task_id = Uuid::new_v4();
    bus.dispatch_task(
        task_id,
        TaskCommand::Create {
            task_id,
            text: "draft agenda".to_string(),
            category_id: Some(a),
            source: Some(TaskSource {
                document_id,
                stable_id: "a1b2c3d4e5f60718".to_string(),
                line_number: 1,
            }),
            inherited_tags: None,
        },
    )
    .unwrap();

    bus.dispatch_document(
        document_id,
        DocumentCommand::SetTags {
            tags: vec!["planning".to_string()],
        },
    )
    .unwrap();
    assert!(propagator.wait_idle(Duration::from_secs(10)));
    assert_eq!(inherited(&bus, task_id), vec!["work", "planning"]);
    propagator.shutdown();
}

fn chain(tags: &[Vec<String>], inherit: &[bool]) -> (InMemoryHierarchy, Vec<CategoryId>) {
    let mut hierarchy = InMemoryHierarchy::new();
    let ids: Vec<CategoryId> = (0..tags.len()).map(|i| Uuid::from_u128(i as u128 + 1)).collect();
    for (index, id) in ids.iter().enumerate() {
        hierarchy.insert_category(CategoryNode {
            id: *id,
            parent_id: index.checked_sub(1).map(|parent| ids[parent]),
            tags: TagSet::from_tags(&tags[index]),
            inherit_to_children: inherit[index],
        });
    }
    (hierarchy, ids)
}

proptest! {
    #[test]
    fn adding_an_inherited_ancestor_tag_never_shrinks_the_set(
        tags in prop::collection::vec(prop::collection::vec("[a-e]{1,3}", 0..3), 2..6),
        inherit in prop::collection::vec(any::<bool>(), 6),
        ancestor in 0usize..5,
        extra in "[a-z]{1,6}",
    ) {
        let ancestor = ancestor % (tags.len() - 1);
        let resolver = TagInheritanceResolver::default();
        let mut inherit = inherit[..tags.len()].to_vec();
        inherit[ancestor] = true;

        let (before_hierarchy, ids) = chain(&tags, &inherit);
        let leaf = *ids.last().unwrap();
        let before = resolver.resolve_category(&before_hierarchy, leaf).unwrap();

        let mut grown = tags.clone();
        grown[ancestor].push(extra.clone());
        let (after_hierarchy, _) = chain(&grown, &inherit);
        let after = resolver.resolve_category(&after_hierarchy, leaf).unwrap();

        prop_assert!(after.is_superset_of(&before));
        prop_assert!(after.contains(&extra));
    }

    #[test]
    fn disabling_ancestor_inheritance_only_drops_that_ancestors_tags(
        tags in prop::collection::vec(prop::collection::vec("[a-e]{1,3}", 0..3), 2..6),
        inherit in prop::collection::vec(any::<bool>(), 6),
        ancestor in 0usize..5,
    ) {
        let ancestor = ancestor % (tags.len() - 1);
        let resolver = TagInheritanceResolver::default();
        let mut inherit = inherit[..tags.len()].to_vec();
        inherit[ancestor] = true;

        let (before_hierarchy, ids) = chain(&tags, &inherit);
        let leaf = *ids.last().unwrap();
        let before = resolver.resolve_category(&before_hierarchy, leaf).unwrap();

        inherit[ancestor] = false;
        let (after_hierarchy, _) = chain(&tags, &inherit);
        let after = resolver.resolve_category(&after_hierarchy, leaf).unwrap();

        prop_assert!(before.is_superset_of(&after));
        let ancestor_tags = TagSet::from_tags(&tags[ancestor]);
        for dropped in before.iter().filter(|tag| !after.contains(tag)) {
            prop_assert!(ancestor_tags.contains(dropped), "{} came from another level", dropped);
        }
    }
}
