//! Advisory device lease stored in `devices/{id}/controller`.
//!
//! The store offers no compare-and-set, so acquisition is check-then-write and
//! exclusion is maintained by watching for takeovers rather than preventing
//! them.

use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use shared::{
    domain::{Command, DeviceId, OperatorId},
    paths::{DevicePaths, StorePath},
    protocol::StoreWrite,
};
use storage::{KvStore, StoreError, SubscriptionHandle};
use tracing::{debug, info, warn};

use crate::{error::SessionError, task::ScheduledTask};

/// Whether the owning session still believes it holds the lease.
#[derive(Debug, Clone)]
pub struct LeaseFlag(Arc<AtomicBool>);

impl LeaseFlag {
    pub fn held() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns true if this call flipped the flag.
    pub fn revoke(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub device_id: DeviceId,
    pub operator_id: OperatorId,
    /// The operator already held the lease before this call.
    pub renewed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Someone else holds the lease now; the record was left alone.
    Superseded { holder: String },
}

/// Non-empty controller value, if any.
pub(crate) fn parse_holder(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(holder) if holder.is_empty() => None,
        Value::String(holder) => Some(holder),
        other => Some(other.to_string()),
    }
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn KvStore>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn current_holder(&self, device_id: &DeviceId) -> Result<Option<String>, StoreError> {
        let paths = DevicePaths::new(device_id);
        Ok(parse_holder(self.store.get(&paths.controller()).await?))
    }

    pub async fn acquire(
        &self,
        device_id: &DeviceId,
        operator_id: &OperatorId,
    ) -> Result<LeaseGrant, SessionError> {
        let paths = DevicePaths::new(device_id);
        let holder = self.current_holder(device_id).await?;

        let renewed = match holder {
            Some(holder) if holder != operator_id.as_str() => {
                info!(
                    device_id = %device_id,
                    operator_id = %operator_id,
                    holder = %holder,
                    "lease: device already claimed"
                );
                return Err(SessionError::LeaseConflict {
                    device_id: device_id.clone(),
                    holder,
                });
            }
            Some(_) => true,
            None => false,
        };

        self.store
            .set(&paths.controller(), StoreWrite::text(operator_id.as_str()))
            .await?;
        // The claim stands without the stamp; the heartbeat writes it again.
        if let Err(error) = self
            .store
            .set(&paths.last_activity(), StoreWrite::ServerTimestamp)
            .await
        {
            warn!(device_id = %device_id, %error, "lease: activity stamp failed after claim");
        }

        info!(
            device_id = %device_id,
            operator_id = %operator_id,
            renewed,
            "lease: acquired"
        );
        Ok(LeaseGrant {
            device_id: device_id.clone(),
            operator_id: operator_id.clone(),
            renewed,
        })
    }

    /// Writes the stop command, clears the controller and stamps activity,
    /// unless the lease visibly belongs to someone else. Every write is
    /// attempted; the first failure is returned.
    pub async fn release(
        &self,
        device_id: &DeviceId,
        operator_id: &OperatorId,
    ) -> Result<ReleaseOutcome, StoreError> {
        match self.current_holder(device_id).await {
            Ok(Some(holder)) if holder != operator_id.as_str() => {
                info!(
                    device_id = %device_id,
                    operator_id = %operator_id,
                    holder = %holder,
                    "lease: superseded, leaving device record untouched"
                );
                return Ok(ReleaseOutcome::Superseded { holder });
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    device_id = %device_id,
                    %error,
                    "lease: holder check failed, releasing unconditionally"
                );
            }
        }

        self.force_release(device_id).await?;
        info!(device_id = %device_id, operator_id = %operator_id, "lease: released");
        Ok(ReleaseOutcome::Released)
    }

    /// Unconditional release used to reclaim a stale lease.
    pub async fn force_release(&self, device_id: &DeviceId) -> Result<(), StoreError> {
        let paths = DevicePaths::new(device_id);
        let writes = [
            (paths.command(), StoreWrite::text(Command::Stop.symbol())),
            (paths.controller(), StoreWrite::Delete),
            (paths.last_activity(), StoreWrite::ServerTimestamp),
        ];

        let mut first_error = None;
        for (path, write) in writes {
            if let Err(error) = self.store.set(&path, write).await {
                warn!(path = %path, %error, "lease: release write failed");
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Calls `on_taken_over` once per distinct foreign holder observed while
    /// `lease` is held, revoking `lease` first. `on_lost` runs if the
    /// subscription ends without being closed.
    pub async fn watch_takeover<F, L>(
        &self,
        device_id: &DeviceId,
        operator_id: &OperatorId,
        lease: LeaseFlag,
        on_taken_over: F,
        on_lost: L,
    ) -> Result<TakeoverWatch, StoreError>
    where
        F: Fn(String) + Send + Sync + 'static,
        L: FnOnce(StorePath) + Send + 'static,
    {
        let paths = DevicePaths::new(device_id);
        let mut subscription = self.store.subscribe(&paths.controller()).await?;
        let handle = subscription.handle();
        let watched = handle.clone();
        let operator = operator_id.clone();
        let device = device_id.clone();

        let task = ScheduledTask::spawn("takeover-watch", async move {
            let mut reported: Option<String> = None;
            while let Some(snapshot) = subscription.next().await {
                match parse_holder(snapshot) {
                    Some(holder) if holder != operator.as_str() => {
                        if reported.as_deref() == Some(holder.as_str()) || !lease.is_held() {
                            continue;
                        }
                        lease.revoke();
                        warn!(
                            device_id = %device,
                            operator_id = %operator,
                            holder = %holder,
                            "lease: taken over"
                        );
                        reported = Some(holder.clone());
                        on_taken_over(holder);
                    }
                    _ => reported = None,
                }
            }
            if watched.is_cancelled() {
                debug!(device_id = %device, "lease: takeover watch ended");
                return;
            }
            warn!(device_id = %device, "lease: takeover watch lost its subscription");
            on_lost(subscription.path().clone());
        });

        Ok(TakeoverWatch {
            subscription: handle,
            task: Some(task),
        })
    }

    /// Stamps `lastActivity` every `period` until `lease` is revoked.
    pub fn start_heartbeat(
        &self,
        device_id: &DeviceId,
        lease: LeaseFlag,
        period: Duration,
    ) -> ScheduledTask {
        let store = Arc::clone(&self.store);
        let last_activity = DevicePaths::new(device_id).last_activity();
        ScheduledTask::every("heartbeat", period, move || {
            let store = Arc::clone(&store);
            let last_activity = last_activity.clone();
            let lease = lease.clone();
            async move {
                if !lease.is_held() {
                    return ControlFlow::Break(());
                }
                if let Err(error) = store.set(&last_activity, StoreWrite::ServerTimestamp).await {
                    warn!(path = %last_activity, %error, "lease: heartbeat write failed");
                }
                ControlFlow::Continue(())
            }
        })
    }
}

pub struct TakeoverWatch {
    subscription: SubscriptionHandle,
    task: Option<ScheduledTask>,
}

impl TakeoverWatch {
    pub fn is_active(&self) -> bool {
        !self.subscription.is_cancelled()
    }

    pub fn close(&mut self) {
        self.subscription.cancel();
        self.task.take();
    }
}

impl Drop for TakeoverWatch {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/lease_tests.rs"]
mod tests;
