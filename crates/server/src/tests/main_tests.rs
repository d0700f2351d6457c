use super::*;
use axum::{body, body::Body, http::Request};
use client_core::{RemoteStore, SessionConfig, SessionController};
use serde_json::json;
use shared::{domain::MoveCommand, error::ErrorCode};
use storage::{KvStore, MemoryStore};
use tower::ServiceExt;

fn test_app_with_limit(max_body_bytes: usize) -> (Router, MemoryStore) {
    let store = MemoryStore::new();
    let state = AppState {
        api: ApiContext {
            store: Arc::new(store.clone()),
        },
        max_body_bytes,
    };
    (build_router(Arc::new(state)), store)
}

fn test_app() -> (Router, MemoryStore) {
    test_app_with_limit(64 * 1024)
}

fn path(raw: &str) -> StorePath {
    StorePath::parse(raw).expect("path")
}

fn put(uri: &str, write: &StoreWrite) -> Request<Body> {
    Request::put(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(write).expect("encode")))
        .expect("request")
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _store) = test_app();
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn put_then_get_round_trips_through_the_store() {
    let (app, store) = test_app();

    let response = app
        .clone()
        .oneshot(put(
            "/v1/store/devices/rover_01/controller",
            &StoreWrite::text("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        store.read(&path("devices/rover_01/controller")),
        Some(json!("alice"))
    );

    let request = Request::get("/v1/store/devices/rover_01")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let read: ReadResponse = json_body(response).await;
    assert_eq!(read.path.as_str(), "devices/rover_01");
    assert_eq!(read.value, Some(json!({ "controller": "alice" })));
}

#[tokio::test]
async fn server_timestamps_are_resolved_by_the_store() {
    let (app, store) = test_app();

    let response = app
        .oneshot(put(
            "/v1/store/devices/rover_01/lastActivity",
            &StoreWrite::ServerTimestamp,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(store
        .read(&path("devices/rover_01/lastActivity"))
        .is_some_and(|stamp| stamp.is_i64()));
}

#[tokio::test]
async fn delete_clears_the_path() {
    let (app, store) = test_app();
    store
        .set(&path("devices/rover_01/controller"), StoreWrite::text("bob"))
        .await
        .expect("seed");

    let request = Request::delete("/v1/store/devices/rover_01/controller")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(store.read(&path("devices/rover_01/controller")), None);
}

#[tokio::test]
async fn invalid_paths_are_rejected_with_validation_errors() {
    let (app, _store) = test_app();
    let request = Request::get("/v1/store/devices/rover.01")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let error: ApiError = json_body(response).await;
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn oversized_bodies_are_refused() {
    let (app, store) = test_app_with_limit(16);
    let write = StoreWrite::text("x".repeat(64));
    let encoded = serde_json::to_string(&write).expect("encode");

    let request = Request::put("/v1/store/devices/rover_01/name")
        .header("content-type", "application/json")
        .header("content-length", encoded.len().to_string())
        .body(Body::from(encoded))
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(store.read(&path("devices/rover_01/name")), None);
}

#[tokio::test]
async fn remote_store_reads_writes_and_subscribes() {
    let (app, store) = test_app();
    let addr = serve(app).await;
    let remote = RemoteStore::new(&format!("http://{addr}")).expect("remote");
    remote.health_check().await.expect("healthy");

    let speed = path("devices/rover_01/rover/motorSpeed");
    let mut subscription = remote.subscribe(&speed).await.expect("subscribe");
    let first = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.next())
        .await
        .expect("initial value");
    assert_eq!(first, Some(None));

    remote
        .set(&speed, StoreWrite::number(120))
        .await
        .expect("write");
    assert_eq!(store.read(&speed), Some(json!(120)));
    assert_eq!(remote.get(&speed).await.expect("read"), Some(json!(120)));

    let update = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.next())
        .await
        .expect("update");
    assert_eq!(update, Some(Some(json!(120))));

    remote.set(&speed, StoreWrite::Delete).await.expect("delete");
    assert_eq!(remote.get(&speed).await.expect("read"), None);
}

#[tokio::test]
async fn remote_store_reports_an_unreachable_server_as_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let remote = RemoteStore::new(&format!("http://{addr}")).expect("remote");

    let error = remote
        .get(&path("devices/rover_01"))
        .await
        .expect_err("unreachable");
    assert!(error.is_connectivity(), "{error}");
    assert!(remote.health_check().await.is_err());
}

#[tokio::test]
async fn operator_session_runs_against_the_hosted_store() {
    let (app, store) = test_app();
    let addr = serve(app).await;
    let remote = RemoteStore::new(&format!("http://{addr}")).expect("remote");
    let session = SessionController::new(Arc::new(remote), SessionConfig::default());

    session.connect("rover_01", "alice").await.expect("connect");
    assert_eq!(
        store.read(&path("devices/rover_01/controller")),
        Some(json!("alice"))
    );

    session
        .hold_input(MoveCommand::Forward)
        .await
        .expect("hold");
    assert_eq!(
        store.read(&path("devices/rover_01/rover/command")),
        Some(json!("F"))
    );
    session
        .release_input(MoveCommand::Forward)
        .await
        .expect("release");
    assert_eq!(
        store.read(&path("devices/rover_01/rover/command")),
        Some(json!("S"))
    );

    session.disconnect().await.expect("disconnect");
    assert_eq!(store.read(&path("devices/rover_01/controller")), None);
}
