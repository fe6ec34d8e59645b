use std::sync::mpsc;
use std::time::Duration;
use tierstore_core::{
    AttributeDescription, AttributeKind, AttributeValue, EntityDescription, FetchError,
    FetchRequest, ModelSchema, Predicate, SaveOutcome, SavePolicy, SchemaBundle, SortDescriptor,
    StoreConfig, StoreKind, StoreManager, WorkerContext,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_bundle() -> SchemaBundle {
    SchemaBundle::new().with_model(
        ModelSchema::new("Test").with_entity(
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::new("title", AttributeKind::Text))
                .with_attribute(
                    AttributeDescription::new("priority", AttributeKind::Integer)
                        .with_default(serde_json::json!(0)),
                ),
        ),
    )
}

fn open_in_memory(policy: SavePolicy) -> StoreManager {
    let config = StoreConfig::new("Test")
        .with_store_kind(StoreKind::InMemory)
        .with_save_policy(policy);
    StoreManager::open(config, &test_bundle()).unwrap()
}

fn titles(records: &[tierstore_core::ManagedRecord]) -> Vec<String> {
    let mut titles: Vec<String> = records
        .iter()
        .filter_map(|record| record.text("title").map(str::to_string))
        .collect();
    titles.sort();
    titles
}

#[test]
fn ready_callback_fires_once_on_the_foreground_queue() {
    let (sender, receiver) = mpsc::channel();
    let config = StoreConfig::new("Test").with_store_kind(StoreKind::InMemory);
    let _manager = StoreManager::new(config, &test_bundle(), move |result| {
        let thread_name = std::thread::current().name().map(str::to_string);
        sender.send((result.map(|manager| manager.is_ready()), thread_name)).unwrap();
    })
    .unwrap();

    let (ready, thread_name) = receiver.recv_timeout(WAIT).unwrap();
    assert!(ready.unwrap());
    assert_eq!(thread_name.as_deref(), Some("tierstore-foreground"));
    // The callback consumed the only sender.
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn ready_callback_can_wait_on_foreground_worker_and_manager_saves() {
    let (sender, receiver) = mpsc::channel();
    let config = StoreConfig::new("Test")
        .with_store_kind(StoreKind::InMemory)
        .with_save_policy(SavePolicy::EachTier);
    let _manager = StoreManager::new(config, &test_bundle(), move |result| {
        let manager = result.unwrap();
        let worker = WorkerContext::new(manager.foreground_context()).unwrap();
        worker
            .insert_with("Note", |record| record.set("title", "from ready"))
            .unwrap();
        let staged = worker.save().wait();
        let persisted = manager.save().wait();
        let titles = manager.fetch_all("Note", None).map(|notes| titles(&notes));
        sender.send((staged, persisted, titles)).unwrap();
    })
    .unwrap();

    let (staged, persisted, titles) = receiver.recv_timeout(WAIT).unwrap();
    assert!(matches!(staged.unwrap(), SaveOutcome::Staged(summary) if summary.inserted == 1));
    assert!(matches!(persisted.unwrap(), SaveOutcome::Persisted(summary) if summary.inserted == 1));
    assert_eq!(titles.unwrap(), ["from ready"]);
}

#[test]
fn insert_initializer_can_read_another_context() {
    let manager = open_in_memory(SavePolicy::EachTier);
    let seeder = manager.new_worker().unwrap();
    for title in ["one", "two"] {
        seeder
            .insert_with("Note", move |record| record.set("title", title))
            .unwrap();
    }
    seeder.save().wait().unwrap();

    let worker = manager.new_worker().unwrap();
    let reader = manager.foreground_context().clone();
    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        let inserted = worker.insert_with("Note", move |record| {
            let existing = reader.fetch_all("Note", None).map_or(0, |notes| notes.len());
            record.set("title", "derived");
            record.set("priority", existing as i64);
        });
        sender.send(inserted.map(|record| record.integer("priority"))).unwrap();
    });

    let priority = receiver.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(priority, Some(2));
}

#[test]
fn in_memory_worker_insert_is_fetchable_after_saves() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);

    let worker = manager.new_worker().unwrap();
    worker
        .insert_with("Note", |record| record.set("title", "A"))
        .unwrap();
    worker.save().wait().unwrap();
    manager.save().wait().unwrap();

    let notes = manager.fetch_all("Note", None).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("title"), Some("A"));
    assert_eq!(notes[0].integer("priority"), Some(0));
}

#[test]
fn worker_insert_is_invisible_until_saved() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);
    let worker = manager.new_worker().unwrap();
    worker
        .insert_with("Note", |record| record.set("title", "draft"))
        .unwrap();

    assert!(manager.fetch_all("Note", None).unwrap().is_empty());
    assert_eq!(worker.fetch_all("Note", None).unwrap().len(), 1);

    let outcome = worker.save().wait().unwrap();
    assert!(matches!(outcome, SaveOutcome::Staged(summary) if summary.inserted == 1));
    assert_eq!(titles(&manager.fetch_all("Note", None).unwrap()), ["draft"]);
}

#[test]
fn save_is_idempotent() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);

    let worker = manager.new_worker().unwrap();
    worker
        .insert_with("Note", |record| record.set("title", "background"))
        .unwrap();
    worker.save().wait().unwrap();
    manager
        .foreground_context()
        .insert_with("Note", |record| record.set("title", "foreground"))
        .unwrap();

    let first = manager.save().wait().unwrap();
    assert!(matches!(first, SaveOutcome::Persisted(summary) if summary.inserted == 2));
    assert!(!manager.foreground_context().has_changes());
    assert!(!manager.background_context().has_changes());

    let second = manager.save().wait().unwrap();
    assert_eq!(second, SaveOutcome::Skipped);
    assert_eq!(manager.fetch_all("Note", None).unwrap().len(), 2);
}

#[test]
fn save_skips_when_only_one_tier_has_changes() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);

    let worker = manager.new_worker().unwrap();
    worker.insert("Note").unwrap();
    worker.save().wait().unwrap();
    assert!(manager.background_context().has_changes());
    assert!(!manager.foreground_context().has_changes());

    assert_eq!(manager.save().wait().unwrap(), SaveOutcome::Skipped);
    assert!(manager.background_context().has_changes());

    let other = open_in_memory(SavePolicy::RequireBothTiers);
    other.foreground_context().insert("Note").unwrap();
    assert_eq!(other.save().wait().unwrap(), SaveOutcome::Skipped);
    assert!(other.foreground_context().has_changes());
}

#[test]
fn each_tier_policy_flushes_background_only_changes() {
    let manager = open_in_memory(SavePolicy::EachTier);

    let worker = manager.new_worker().unwrap();
    worker.insert("Note").unwrap();
    worker.save().wait().unwrap();

    let outcome = manager.save().wait().unwrap();
    assert!(matches!(outcome, SaveOutcome::Persisted(summary) if summary.inserted == 1));
    assert!(!manager.background_context().has_changes());
    assert_eq!(manager.save().wait().unwrap(), SaveOutcome::Skipped);
}

#[test]
fn worker_save_callback_runs_on_the_worker_queue() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);
    let worker = manager.new_worker().unwrap();
    worker.insert("Note").unwrap();
    let expected_thread = format!("tierstore-{}", worker.label());

    let (sender, receiver) = mpsc::channel();
    worker.save_then(move |result| {
        let thread_name = std::thread::current().name().map(str::to_string);
        sender.send((result.map(|outcome| outcome.summary().inserted), thread_name)).unwrap();
    });

    let (inserted, thread_name) = receiver.recv_timeout(WAIT).unwrap();
    assert_eq!(inserted.unwrap(), 1);
    assert_eq!(thread_name, Some(expected_thread));
}

#[test]
fn fetch_with_predicate_returns_the_matching_subset() {
    let manager = open_in_memory(SavePolicy::EachTier);
    let worker = manager.new_worker().unwrap();
    for (title, priority) in [("alpha", 1_i64), ("beta", 5), ("alpine", 3), ("gamma", 5)] {
        worker
            .insert_with("Note", move |record| {
                record.set("title", title);
                record.set("priority", priority);
            })
            .unwrap();
    }
    worker.save().wait().unwrap();
    manager.save().wait().unwrap();

    let all = manager.fetch_all("Note", None).unwrap();
    assert_eq!(all.len(), 4);

    let cases = [
        (Predicate::eq("priority", 5_i64), vec!["beta", "gamma"]),
        (Predicate::gt("priority", 2_i64), vec!["alpine", "beta", "gamma"]),
        (Predicate::begins_with("title", "alp"), vec!["alpha", "alpine"]),
        (
            Predicate::is_in(
                "title",
                vec![AttributeValue::from("beta"), AttributeValue::from("delta")],
            ),
            vec!["beta"],
        ),
        (Predicate::matches("title", "[ab].*a"), vec!["alpha", "beta"]),
        (
            Predicate::begins_with("title", "alp").and(Predicate::lt("priority", 2_i64)),
            vec!["alpha"],
        ),
        (Predicate::eq("priority", 5_i64).negate(), vec!["alpha", "alpine"]),
    ];
    for (predicate, expected) in cases {
        let expected_from_all: Vec<String> = {
            let compiled = predicate.compile().unwrap();
            titles(
                &all.iter()
                    .filter(|record| compiled.evaluate(record))
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        let fetched = titles(&manager.fetch_all("Note", Some(predicate)).unwrap());
        assert_eq!(fetched, expected);
        assert_eq!(fetched, expected_from_all);
    }
}

#[test]
fn fetch_request_sorts_and_pages() {
    let manager = open_in_memory(SavePolicy::EachTier);
    let worker = manager.new_worker().unwrap();
    for (title, priority) in [("a", 3_i64), ("b", 1), ("c", 2)] {
        worker
            .insert_with("Note", move |record| {
                record.set("title", title);
                record.set("priority", priority);
            })
            .unwrap();
    }
    worker.save().wait().unwrap();

    let request = FetchRequest::new("Note")
        .sorted_by(SortDescriptor::descending("priority"))
        .with_offset(1)
        .with_limit(1);
    let page = manager.fetch(request.clone()).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].text("title"), Some("c"));
    assert_eq!(manager.count(request).unwrap(), 1);
}

#[test]
fn fetch_errors_are_returned() {
    let manager = open_in_memory(SavePolicy::RequireBothTiers);

    let err = manager.fetch_all("Missing", None).unwrap_err();
    assert!(matches!(err, FetchError::UnknownEntity(name) if name == "Missing"));

    let err = manager
        .fetch_all("Note", Some(Predicate::matches("title", "(")))
        .unwrap_err();
    assert!(matches!(err, FetchError::InvalidPredicate(_)));
}

#[test]
fn worker_delete_propagates_to_fetch_results() {
    let manager = open_in_memory(SavePolicy::EachTier);

    let writer = manager.new_worker().unwrap();
    let record = writer
        .insert_with("Note", |record| record.set("title", "doomed"))
        .unwrap();
    writer.save().wait().unwrap();
    manager.save().wait().unwrap();
    assert_eq!(manager.fetch_all("Note", None).unwrap().len(), 1);

    let deleter = manager.new_worker().unwrap();
    let visible = deleter.existing(record.id).unwrap().unwrap();
    deleter.delete(&visible).unwrap();
    assert_eq!(manager.fetch_all("Note", None).unwrap().len(), 1);

    let outcome = deleter.save().wait().unwrap();
    assert!(matches!(outcome, SaveOutcome::Staged(summary) if summary.deleted == 1));
    assert!(manager.fetch_all("Note", None).unwrap().is_empty());

    let persisted = manager.save().wait().unwrap();
    assert!(matches!(persisted, SaveOutcome::Persisted(summary) if summary.deleted == 1));
    assert!(manager.fetch_all("Note", None).unwrap().is_empty());
}

#[test]
fn concurrent_workers_all_land_in_background() {
    let manager = open_in_memory(SavePolicy::EachTier);

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let manager = manager.clone();
            std::thread::spawn(move || {
                let worker = manager.new_worker().unwrap();
                worker
                    .insert_with("Note", move |record| record.set("priority", index as i64))
                    .unwrap();
                worker.save().wait().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(matches!(handle.join().unwrap(), SaveOutcome::Staged(_)));
    }

    assert_eq!(manager.background_context().pending_summary().inserted, 8);
    let outcome = manager.save().wait().unwrap();
    assert_eq!(outcome.summary().inserted, 8);
    assert_eq!(manager.fetch_all("Note", None).unwrap().len(), 8);
}
