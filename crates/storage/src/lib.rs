//! Path-addressed key/value store with subscribe-on-path push notifications.
//!
//! [`KvStore`] is the only seam the session core talks to. Two local
//! implementations live here: [`MemoryStore`] for a single process and
//! [`SqliteStore`] for the hosted store server.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{paths::PathError, paths::StorePath, protocol::StoreWrite};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod sqlite;
mod tree;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Value observed at a path; `None` when nothing is stored there.
pub type Snapshot = Option<Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("malformed value at {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Database(_) | StoreError::Io(_)
        )
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError>;
    async fn set(&self, path: &StorePath, write: StoreWrite) -> Result<(), StoreError>;
    /// Delivers the current value first, then one update per change.
    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cloneable cancel token for a [`Subscription`]. Cancelling is synchronous
/// and idempotent.
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancel: Arc<Mutex<Option<CancelFn>>>,
}

impl SubscriptionHandle {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(Some(Box::new(on_cancel)))),
        }
    }

    pub fn cancel(&self) {
        let on_cancel = self.cancel.lock().take();
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Stream of changes at one path. Dropping it unsubscribes.
pub struct Subscription {
    path: StorePath,
    updates: mpsc::UnboundedReceiver<Snapshot>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(
        path: StorePath,
        updates: mpsc::UnboundedReceiver<Snapshot>,
        handle: SubscriptionHandle,
    ) -> Self {
        Self {
            path,
            updates,
            handle,
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// `None` once the subscription is cancelled or the store went away.
    /// Updates buffered before a cancel are discarded.
    pub async fn next(&mut self) -> Option<Snapshot> {
        if self.handle.is_cancelled() {
            return None;
        }
        let update = self.updates.recv().await?;
        if self.handle.is_cancelled() {
            return None;
        }
        Some(update)
    }

    pub fn cancel(self) {
        self.handle.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
