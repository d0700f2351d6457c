use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{paths::StorePath, protocol::StoreWrite};
use tokio::sync::mpsc;

use crate::{tree, KvStore, Snapshot, StoreError, Subscription, SubscriptionHandle};

/// In-process store. Clones share the same tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    root: Value,
    watchers: HashMap<u64, Watcher>,
    next_watcher_id: u64,
    last_timestamp: i64,
}

struct Watcher {
    path: StorePath,
    last: Snapshot,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    pub fn read(&self, path: &StorePath) -> Snapshot {
        tree::read(&self.inner.lock().root, path)
    }

    /// Resolves a write to the concrete value it stores. Server timestamps
    /// never go backwards within one store.
    pub(crate) fn resolve(&self, write: StoreWrite) -> Snapshot {
        match write {
            StoreWrite::Set(value) => tree::prune(value),
            StoreWrite::Delete => None,
            StoreWrite::ServerTimestamp => {
                let mut inner = self.inner.lock();
                let now = Utc::now().timestamp_millis().max(inner.last_timestamp);
                inner.last_timestamp = now;
                Some(Value::from(now))
            }
        }
    }

    pub(crate) fn apply(&self, path: &StorePath, value: Snapshot) {
        let mut inner = self.inner.lock();
        tree::write(&mut inner.root, path, value);
        notify(&mut inner, path);
    }

    pub(crate) fn watch(&self, path: &StorePath) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_watcher_id;
            inner.next_watcher_id += 1;
            let current = tree::read(&inner.root, path);
            let _ = tx.send(current.clone());
            inner.watchers.insert(
                id,
                Watcher {
                    path: path.clone(),
                    last: current,
                    tx,
                },
            );
            id
        };

        let registry = Arc::downgrade(&self.inner);
        let handle = SubscriptionHandle::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner.lock().watchers.remove(&id);
            }
        });
        Subscription::new(path.clone(), rx, handle)
    }
}

fn notify(inner: &mut MemoryInner, written: &StorePath) {
    let MemoryInner { root, watchers, .. } = inner;
    watchers.retain(|_, watcher| {
        if !watcher.path.overlaps(written) {
            return true;
        }
        let current = tree::read(root, &watcher.path);
        if current == watcher.last {
            return true;
        }
        watcher.last = current.clone();
        watcher.tx.send(current).is_ok()
    });
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        Ok(self.read(path))
    }

    async fn set(&self, path: &StorePath, write: StoreWrite) -> Result<(), StoreError> {
        let value = self.resolve(write);
        self.apply(path, value);
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        Ok(self.watch(path))
    }
}
