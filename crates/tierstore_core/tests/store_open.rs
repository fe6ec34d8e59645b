use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::Path;
use tierstore_core::db::migrations::layout_version;
use tierstore_core::db::DbError;
use tierstore_core::{
    FetchError, SavePolicy, SchemaBundle, SchemaResolutionError, StoreConfig, StoreError,
    StoreKind, StoreManager, StoreOpenError, StoreOptions,
};

fn note_schema(version: u32, extra_attributes: Vec<Value>) -> Value {
    let mut attributes = vec![json!({ "name": "title", "type": "text" })];
    attributes.extend(extra_attributes);
    json!({
        "name": "Test",
        "version": version,
        "entities": [{ "name": "Note", "attributes": attributes }]
    })
}

fn write_schema(dir: &Path, schema: &Value) -> SchemaBundle {
    let path = dir.join("Test.schema.json");
    std::fs::write(&path, serde_json::to_string_pretty(schema).unwrap()).unwrap();
    SchemaBundle::from_dir(dir)
}

fn file_config(kind: StoreKind, store_dir: &Path) -> StoreConfig {
    StoreConfig::new("Test")
        .with_store_kind(kind)
        .with_store_dir(store_dir)
        .with_save_policy(SavePolicy::EachTier)
}

fn seed_titles(manager: &StoreManager, titles: &[&'static str]) {
    let worker = manager.new_worker().unwrap();
    for &title in titles {
        worker
            .insert_with("Note", move |record| record.set("title", title))
            .unwrap();
    }
    worker.save().wait().unwrap();
    manager.save().wait().unwrap();
}

#[test]
fn missing_schema_resource_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = SchemaBundle::from_dir(dir.path());

    let err = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap_err();
    match err {
        StoreError::Schema(SchemaResolutionError::ResourceMissing { model_name, path }) => {
            assert_eq!(model_name, "Test");
            assert_eq!(path, Some(dir.path().join("Test.schema.json")));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn malformed_schema_resource_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Test.schema.json"), "{ not json").unwrap();
    let bundle = SchemaBundle::from_dir(dir.path());

    let err = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Schema(SchemaResolutionError::Malformed { .. })
    ));
}

#[test]
fn sqlite_store_is_created_with_layout_and_delete_journal() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schema(dir.path(), &note_schema(1, Vec::new()));

    let manager = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap();
    let location = manager.store_location().unwrap();
    assert_eq!(location, dir.path().join("Test.sqlite"));

    let conn = Connection::open(&location).unwrap();
    let user_version: u32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(user_version, layout_version());
    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_ascii_lowercase(), "delete");
}

#[test]
fn sqlite_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schema(dir.path(), &note_schema(1, Vec::new()));

    let manager = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap();
    seed_titles(&manager, &["A", "B"]);
    drop(manager);

    let reopened = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap();
    let mut titles: Vec<String> = reopened
        .fetch_all("Note", None)
        .unwrap()
        .iter()
        .filter_map(|record| record.text("title").map(str::to_string))
        .collect();
    titles.sort();
    assert_eq!(titles, ["A", "B"]);
}

#[test]
fn store_from_a_newer_build_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schema(dir.path(), &note_schema(1, Vec::new()));
    let manager = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap();
    seed_titles(&manager, &["A"]);
    let location = manager.store_location().unwrap();
    drop(manager);

    let newer = layout_version() + 1;
    Connection::open(&location)
        .unwrap()
        .pragma_update(None, "user_version", newer)
        .unwrap();

    let err = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &bundle).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Open(StoreOpenError::Db(DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        })) if db_version == newer && latest_supported == layout_version()
    ));
}

#[test]
fn binary_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_schema(dir.path(), &note_schema(1, Vec::new()));

    let manager = StoreManager::open(file_config(StoreKind::Binary, dir.path()), &bundle).unwrap();
    assert_eq!(
        manager.store_location(),
        Some(dir.path().join("Test.binary"))
    );
    seed_titles(&manager, &["only"]);
    drop(manager);

    let reopened = StoreManager::open(file_config(StoreKind::Binary, dir.path()), &bundle).unwrap();
    let notes = reopened.fetch_all("Note", None).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("title"), Some("only"));
}

#[test]
fn changed_model_migrates_stored_records() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = write_schema(dir.path(), &note_schema(1, Vec::new()));
    let manager = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &v1).unwrap();
    seed_titles(&manager, &["kept"]);
    drop(manager);

    let v2 = write_schema(
        dir.path(),
        &note_schema(
            2,
            vec![json!({ "name": "pinned", "type": "boolean", "optional": false, "default": false })],
        ),
    );
    let migrated = StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &v2).unwrap();
    let notes = migrated.fetch_all("Note", None).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("title"), Some("kept"));
    assert_eq!(notes[0].get("pinned").as_bool(), Some(false));
}

#[test]
fn changed_model_without_auto_migration_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = write_schema(dir.path(), &note_schema(1, Vec::new()));
    drop(StoreManager::open(file_config(StoreKind::Binary, dir.path()), &v1).unwrap());

    let v2 = write_schema(
        dir.path(),
        &note_schema(2, vec![json!({ "name": "rank", "type": "integer" })]),
    );
    let options = StoreOptions {
        auto_migrate: false,
        ..StoreOptions::default()
    };
    let err = StoreManager::open(
        file_config(StoreKind::Binary, dir.path()).with_options(options),
        &v2,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Open(StoreOpenError::IncompatibleModel {
            stored_version: 1,
            current_version: 2
        })
    ));
}

#[test]
fn uninferable_required_attribute_fails_and_manager_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = write_schema(dir.path(), &note_schema(1, Vec::new()));
    drop(StoreManager::open(file_config(StoreKind::Sqlite, dir.path()), &v1).unwrap());

    let v2 = write_schema(
        dir.path(),
        &note_schema(
            2,
            vec![json!({ "name": "owner", "type": "text", "optional": false })],
        ),
    );
    let (sender, receiver) = std::sync::mpsc::channel();
    let manager = StoreManager::new(
        file_config(StoreKind::Sqlite, dir.path()),
        &v2,
        move |result| sender.send(result.map(|_| ())).unwrap(),
    )
    .unwrap();

    let err = receiver
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        StoreOpenError::MappingInference { ref entity, ref attribute }
            if entity == "Note" && attribute == "owner"
    ));
    assert!(!manager.is_ready());
    assert!(matches!(
        manager.fetch_all("Note", None),
        Err(FetchError::Store(_))
    ));
}
