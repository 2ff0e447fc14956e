use storage::codec;
use storage::repository::{KeyValueStore, Storage};
use storage::sqlite::SqliteRepository;

#[tokio::test]
async fn sqlite_kv_roundtrip_and_overwrite() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_kv_roundtrip?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    assert_eq!(repo.get_item("workflow").await.unwrap(), None);

    repo.set_item("workflow", "first").await.unwrap();
    repo.set_item("workflow", "second").await.unwrap();
    assert_eq!(
        repo.get_item("workflow").await.unwrap().as_deref(),
        Some("second")
    );

    repo.remove_item("workflow").await.unwrap();
    assert_eq!(repo.get_item("workflow").await.unwrap(), None);
}

#[tokio::test]
async fn sqlite_migrations_are_idempotent() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_kv_migrate?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("first migrate");
    repo.migrate().await.expect("second migrate");

    repo.set_item("k", "v").await.unwrap();
    assert_eq!(repo.get_item("k").await.unwrap().as_deref(), Some("v"));
}

#[tokio::test]
async fn storage_sqlite_persists_encoded_records() {
    let storage = Storage::sqlite("sqlite:file:memdb_kv_storage?mode=memory&cache=shared")
        .await
        .expect("storage");

    let record = r#"{"sessionId":"abc","formData":{"email":"x@example.com"}}"#;
    storage
        .workflow
        .set_item("assessment_workflow_state", &codec::encode(record))
        .await
        .unwrap();

    let raw = storage
        .workflow
        .get_item("assessment_workflow_state")
        .await
        .unwrap()
        .expect("stored");
    assert!(!raw.contains("sessionId"));
    assert_eq!(codec::decode(&raw).unwrap(), record);
}
