use super::*;

use serde_json::json;
use storage::MemoryStore;

fn setup() -> ApiContext {
    ApiContext {
        store: Arc::new(MemoryStore::new()),
    }
}

#[tokio::test]
async fn reads_return_the_stored_value_or_nothing() {
    let ctx = setup();
    write_value(&ctx, "devices/rover_01/name", StoreWrite::text("Rover Alpha"))
        .await
        .expect("write");

    let read = read_value(&ctx, "devices/rover_01").await.expect("read");
    assert_eq!(read.path.as_str(), "devices/rover_01");
    assert_eq!(read.value, Some(json!({ "name": "Rover Alpha" })));

    let missing = read_value(&ctx, "devices/rover_02").await.expect("read");
    assert_eq!(missing.value, None);
}

#[tokio::test]
async fn deletes_clear_the_value() {
    let ctx = setup();
    write_value(&ctx, "devices/rover_01/controller", StoreWrite::text("alice"))
        .await
        .expect("write");
    write_value(&ctx, "devices/rover_01/controller", StoreWrite::Delete)
        .await
        .expect("delete");

    let read = read_value(&ctx, "devices/rover_01/controller")
        .await
        .expect("read");
    assert_eq!(read.value, None);
}

#[tokio::test]
async fn invalid_paths_are_validation_errors() {
    let ctx = setup();
    for raw in ["", "devices//rover", "devices/rover.01", "devices/$x"] {
        let err = read_value(&ctx, raw).await.expect_err("invalid path");
        assert_eq!(err.code, ErrorCode::Validation, "{raw:?}");
        assert_eq!(status_for(&err), StatusCode::BAD_REQUEST);
    }
}

#[test]
fn store_failures_map_to_status_codes() {
    let unavailable = store_failure(StoreError::Unavailable("db locked".into()));
    assert_eq!(unavailable.code, ErrorCode::Unavailable);
    assert_eq!(status_for(&unavailable), StatusCode::SERVICE_UNAVAILABLE);

    let rejected = store_failure(StoreError::Rejected("nope".into()));
    assert_eq!(status_for(&rejected), StatusCode::BAD_REQUEST);

    let malformed = store_failure(StoreError::Malformed {
        path: "devices".into(),
        reason: "bad json".into(),
    });
    assert_eq!(status_for(&malformed), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn subscriptions_start_with_the_current_value() {
    let ctx = setup();
    write_value(&ctx, "devices/rover_01/rover/command", StoreWrite::text("F"))
        .await
        .expect("write");

    let path = parse_path("devices/rover_01/rover/command").expect("path");
    let mut subscription = subscribe(&ctx, &path).await.expect("subscribe");
    assert_eq!(subscription.next().await, Some(Some(json!("F"))));
}
