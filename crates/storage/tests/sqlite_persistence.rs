use serde_json::json;
use shared::{paths::StorePath, protocol::StoreWrite};
use storage::{KvStore, SqliteStore};

fn path(raw: &str) -> StorePath {
    StorePath::parse(raw).expect("path")
}

fn database_url(dir: &tempfile::TempDir) -> String {
    let db_path = dir.path().join("nested").join("store.db");
    format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"))
}

#[tokio::test]
async fn writes_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir);

    {
        let store = SqliteStore::open(&url).await.expect("open");
        store
            .set(
                &path("devices"),
                StoreWrite::Set(json!({
                    "rover_01": { "name": "Rover Alpha", "status": "available" },
                    "rover_02": { "name": "Rover Beta", "status": "available" }
                })),
            )
            .await
            .expect("seed");
        store
            .set(&path("devices/rover_01/controller"), StoreWrite::text("alice"))
            .await
            .expect("claim");
        store.pool().close().await;
    }

    let reopened = SqliteStore::open(&url).await.expect("reopen");
    assert_eq!(
        reopened.get(&path("devices/rover_01")).await.expect("read"),
        Some(json!({ "name": "Rover Alpha", "status": "available", "controller": "alice" }))
    );
    assert_eq!(
        reopened
            .get(&path("devices/rover_02/name"))
            .await
            .expect("read"),
        Some(json!("Rover Beta"))
    );
}

#[tokio::test]
async fn overwriting_a_subtree_drops_stale_leaves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir);

    {
        let store = SqliteStore::open(&url).await.expect("open");
        store
            .set(
                &path("devices/rover_01/rover"),
                StoreWrite::Set(json!({ "command": "F", "motorSpeed": 200 })),
            )
            .await
            .expect("write");
        store
            .set(
                &path("devices/rover_01/rover"),
                StoreWrite::Set(json!({ "command": "S" })),
            )
            .await
            .expect("overwrite");
        store
            .set(&path("devices/rover_01/controller"), StoreWrite::text("bob"))
            .await
            .expect("claim");
        store
            .set(&path("devices/rover_01/controller"), StoreWrite::Delete)
            .await
            .expect("release");
        store.pool().close().await;
    }

    let reopened = SqliteStore::open(&url).await.expect("reopen");
    assert_eq!(
        reopened.get(&path("devices/rover_01")).await.expect("read"),
        Some(json!({ "rover": { "command": "S" } }))
    );
}

#[tokio::test]
async fn leaf_replaced_by_object_is_not_resurrected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir);

    {
        let store = SqliteStore::open(&url).await.expect("open");
        store
            .set(&path("devices/rover_01"), StoreWrite::text("legacy"))
            .await
            .expect("leaf");
        store
            .set(&path("devices/rover_01/name"), StoreWrite::text("Rover Alpha"))
            .await
            .expect("nested");
        store.pool().close().await;
    }

    let reopened = SqliteStore::open(&url).await.expect("reopen");
    assert_eq!(
        reopened.get(&path("devices/rover_01")).await.expect("read"),
        Some(json!({ "name": "Rover Alpha" }))
    );
}

#[tokio::test]
async fn sqlite_store_pushes_changes_to_subscribers() {
    let store = SqliteStore::open("sqlite::memory:").await.expect("open");
    store.health_check().await.expect("health");

    let mut subscription = store
        .subscribe(&path("devices/rover_01/controller"))
        .await
        .expect("subscribe");
    assert_eq!(subscription.next().await, Some(None));

    store
        .set(&path("devices/rover_01/controller"), StoreWrite::text("alice"))
        .await
        .expect("claim");
    assert_eq!(subscription.next().await, Some(Some(json!("alice"))));
    assert_eq!(store.subscriber_count(), 1);
}
