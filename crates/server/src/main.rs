use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use shared::{
    error::ApiError,
    paths::StorePath,
    protocol::{ReadResponse, StoreEvent, StoreWrite, SubscribeQuery},
};
use storage::SqliteStore;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info};

mod api;
mod app_state;
mod config;

use api::{parse_path, read_value, status_for, store_route, subscribe_route, write_value, ApiContext};
use app_state::AppState;
use config::{load_settings, prepare_database_url};

type ApiFailure = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = SqliteStore::open(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext {
            store: Arc::new(store),
        },
        max_body_bytes: settings.max_body_bytes,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "store server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = RequestBodyLimitLayer::new(state.max_body_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            store_route(),
            get(http_read).put(http_write).delete(http_delete),
        )
        .route(subscribe_route(), get(ws_handler))
        .layer(body_limit)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn failure(error: ApiError) -> ApiFailure {
    (status_for(&error), Json(error))
}

async fn http_read(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<ReadResponse>, ApiFailure> {
    let read = read_value(&state.api, &path).await.map_err(failure)?;
    Ok(Json(read))
}

async fn http_write(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(write): Json<StoreWrite>,
) -> Result<StatusCode, ApiFailure> {
    write_value(&state.api, &path, write)
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    write_value(&state.api, &path, StoreWrite::Delete)
        .await
        .map_err(failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<SubscribeQuery>,
) -> Response {
    let path = match parse_path(&q.path) {
        Ok(path) => path,
        Err(error) => return failure(error).into_response(),
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, path))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket, path: StorePath) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    let mut subscription = match api::subscribe(&state.api, &path).await {
        Ok(subscription) => subscription,
        Err(error) => {
            if let Ok(text) = serde_json::to_string(&StoreEvent::Error(error)) {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    debug!(%path, "subscribe: client attached");

    let watched = path.clone();
    let send_task = tokio::spawn(async move {
        while let Some(value) = subscription.next().await {
            let event = StoreEvent::ValueChanged {
                path: watched.clone(),
                value,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    debug!(%path, "subscribe: client detached");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
