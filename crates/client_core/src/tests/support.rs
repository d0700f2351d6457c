//! In-memory store double that records writes and injects failures.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{domain::DeviceId, paths::StorePath, protocol::StoreWrite};
use storage::{KvStore, MemoryStore, Snapshot, StoreError, Subscription, SubscriptionHandle};
use tokio::{
    sync::{broadcast, mpsc, watch, RwLock, RwLockWriteGuard},
    task::JoinHandle,
};

use crate::session::SessionEvent;

pub(crate) fn rover() -> DeviceId {
    DeviceId::parse("rover_01").expect("device id")
}

pub(crate) fn path(raw: &str) -> StorePath {
    StorePath::parse(raw).expect("store path")
}

#[derive(Default)]
pub(crate) struct TestStore {
    memory: MemoryStore,
    writes: Mutex<Vec<(StorePath, StoreWrite)>>,
    attempts: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_paths: Mutex<HashSet<String>>,
    read_gate: RwLock<()>,
    /// Subscriptions are relayed through tasks that can be cut.
    severable: bool,
    links: Mutex<Vec<JoinHandle<()>>>,
}

impl TestStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn severable() -> Arc<Self> {
        Arc::new(Self {
            severable: true,
            ..Self::default()
        })
    }

    /// Ends every relayed subscription as a dropped connection would,
    /// without cancelling it.
    pub(crate) fn sever_subscriptions(&self) {
        for link in self.links.lock().drain(..) {
            link.abort();
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.memory.subscriber_count()
    }

    pub(crate) fn read(&self, raw: &str) -> Snapshot {
        self.memory.read(&path(raw))
    }

    pub(crate) fn read_text(&self, raw: &str) -> Option<String> {
        self.read(raw).and_then(|value| value.as_str().map(str::to_string))
    }

    /// Writes straight into the backing tree, as another client would.
    pub(crate) async fn put(&self, raw: &str, write: StoreWrite) {
        self.memory.set(&path(raw), write).await.expect("seed write");
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_everything(&self, fail: bool) {
        self.fail_reads(fail);
        self.fail_writes(fail);
    }

    pub(crate) fn fail_path(&self, raw: &str) {
        self.failing_paths.lock().insert(raw.to_string());
    }

    /// Reads wait until the returned guard is dropped.
    pub(crate) async fn block_reads(&self) -> RwLockWriteGuard<'_, ()> {
        self.read_gate.write().await
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> Vec<(StorePath, StoreWrite)> {
        self.writes.lock().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Text values successfully written to `raw`, oldest first.
    pub(crate) fn texts_written(&self, raw: &str) -> Vec<String> {
        self.values_written(raw)
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect()
    }

    pub(crate) fn values_written(&self, raw: &str) -> Vec<Value> {
        let target = path(raw);
        self.writes
            .lock()
            .iter()
            .filter(|(path, _)| *path == target)
            .filter_map(|(_, write)| match write {
                StoreWrite::Set(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn stamps_written(&self, raw: &str) -> usize {
        let target = path(raw);
        self.writes
            .lock()
            .iter()
            .filter(|(path, write)| *path == target && *write == StoreWrite::ServerTimestamp)
            .count()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.texts_written("devices/rover_01/rover/command")
    }
}

#[async_trait]
impl KvStore for TestStore {
    async fn get(&self, path: &StorePath) -> Result<Snapshot, StoreError> {
        let _gate = self.read_gate.read().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads are failing".into()));
        }
        self.memory.get(path).await
    }

    async fn set(&self, path: &StorePath, write: StoreWrite) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst)
            || self.failing_paths.lock().contains(path.as_str())
        {
            return Err(StoreError::Unavailable(format!("write to {path} failed")));
        }
        self.memory.set(path, write.clone()).await?;
        self.writes.lock().push((path.clone(), write));
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("subscribe failed".into()));
        }
        let mut inner = self.memory.subscribe(path).await?;
        if !self.severable {
            return Ok(inner);
        }

        let inner_handle = inner.handle();
        let (tx, rx) = mpsc::unbounded_channel();
        let link = tokio::spawn(async move {
            while let Some(value) = inner.next().await {
                if tx.send(value).is_err() {
                    break;
                }
            }
        });
        self.links.lock().push(link);
        let handle = SubscriptionHandle::new(move || inner_handle.cancel());
        Ok(Subscription::new(path.clone(), rx, handle))
    }
}

/// Waits for a watched value to satisfy `ready`.
pub(crate) async fn wait_for_value<T, F>(rx: &mut watch::Receiver<T>, ready: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(ready))
        .await
        .expect("value in time")
        .expect("sender alive")
        .clone()
}

/// Receives events until one matches `wanted`.
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut wanted: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

/// Lets spawned tasks run until `ready` holds.
pub(crate) async fn settle<F>(mut ready: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(ready(), "condition not reached");
}
