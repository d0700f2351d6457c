use std::sync::Arc;

use axum::http::StatusCode;
use shared::{
    error::{ApiError, ErrorCode},
    paths::StorePath,
    protocol::{ReadResponse, StoreWrite},
};
use storage::{KvStore, StoreError, Subscription};
use tracing::warn;

#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn KvStore>,
}

pub fn store_route() -> &'static str {
    "/v1/store/*path"
}

pub fn subscribe_route() -> &'static str {
    "/v1/subscribe"
}

pub async fn read_value(ctx: &ApiContext, raw_path: &str) -> Result<ReadResponse, ApiError> {
    let path = parse_path(raw_path)?;
    let value = ctx.store.get(&path).await.map_err(store_failure)?;
    Ok(ReadResponse { path, value })
}

pub async fn write_value(
    ctx: &ApiContext,
    raw_path: &str,
    write: StoreWrite,
) -> Result<(), ApiError> {
    let path = parse_path(raw_path)?;
    ctx.store.set(&path, write).await.map_err(store_failure)
}

pub async fn subscribe(ctx: &ApiContext, path: &StorePath) -> Result<Subscription, ApiError> {
    ctx.store.subscribe(path).await.map_err(store_failure)
}

pub fn parse_path(raw_path: &str) -> Result<StorePath, ApiError> {
    StorePath::parse(raw_path).map_err(|e| ApiError::new(ErrorCode::Validation, e.to_string()))
}

pub fn status_for(error: &ApiError) -> StatusCode {
    match error.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_failure(err: StoreError) -> ApiError {
    let code = match &err {
        StoreError::InvalidPath(_) | StoreError::Rejected(_) => ErrorCode::Validation,
        err if err.is_connectivity() => ErrorCode::Unavailable,
        _ => ErrorCode::Internal,
    };
    if code != ErrorCode::Validation {
        warn!(error = %err, "api: store request failed");
    }
    ApiError::new(code, err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
