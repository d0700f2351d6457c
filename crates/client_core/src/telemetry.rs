//! Read-only local mirror of device-reported state.

use futures::{stream, StreamExt};
use serde_json::Value;
use shared::{
    domain::{DeviceId, DEFAULT_MOTOR_SPEED, MAX_MOTOR_SPEED},
    paths::{DevicePaths, StorePath},
};
use storage::{KvStore, Snapshot, StoreError, Subscription, SubscriptionHandle};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{lease::parse_holder, task::ScheduledTask};

pub const UNKNOWN_STATUS_TEXT: &str = "Unknown";
pub const WAITING_STATUS_TEXT: &str = "Waiting...";
pub const NO_CONTROLLER_TEXT: &str = "None";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub rover_status: Option<String>,
    pub arduino_status: Option<String>,
    /// Last valid reported speed; invalid reports leave it untouched.
    pub motor_speed: Option<u8>,
    pub controller: Option<String>,
}

impl TelemetrySnapshot {
    pub fn rover_status_text(&self) -> &str {
        self.rover_status.as_deref().unwrap_or(UNKNOWN_STATUS_TEXT)
    }

    pub fn arduino_status_text(&self) -> &str {
        self.arduino_status.as_deref().unwrap_or(WAITING_STATUS_TEXT)
    }

    pub fn controller_text(&self) -> &str {
        self.controller.as_deref().unwrap_or(NO_CONTROLLER_TEXT)
    }

    pub fn motor_speed_or_default(&self) -> u8 {
        self.motor_speed.unwrap_or(DEFAULT_MOTOR_SPEED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    RoverStatus,
    ArduinoStatus,
    MotorSpeed,
    Controller,
}

enum MirrorUpdate {
    Value(Field, Snapshot),
    /// The subscription stopped; `cancelled` tells a close from a loss.
    Ended { path: StorePath, cancelled: bool },
}

fn display_text(value: Snapshot) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

/// Accepts only integral numbers in `[0, 255]`.
pub(crate) fn parse_speed(value: &Snapshot) -> Option<u8> {
    let value = value.as_ref()?;
    if let Some(speed) = value.as_u64() {
        return u8::try_from(speed).ok();
    }
    let speed = value.as_f64()?;
    if speed.fract() == 0.0 && (0.0..=f64::from(MAX_MOTOR_SPEED)).contains(&speed) {
        Some(speed as u8)
    } else {
        None
    }
}

fn apply(snapshot: &mut TelemetrySnapshot, field: Field, value: Snapshot) -> bool {
    let before = snapshot.clone();
    match field {
        Field::RoverStatus => snapshot.rover_status = display_text(value),
        Field::ArduinoStatus => snapshot.arduino_status = display_text(value),
        Field::MotorSpeed => {
            if let Some(speed) = parse_speed(&value) {
                snapshot.motor_speed = Some(speed);
            }
        }
        Field::Controller => snapshot.controller = parse_holder(value),
    }
    *snapshot != before
}

/// Owns one subscription per mirrored field. Closing cancels all of them
/// synchronously.
pub struct TelemetryMirror {
    device_id: DeviceId,
    snapshot: watch::Receiver<TelemetrySnapshot>,
    subscriptions: Vec<SubscriptionHandle>,
    task: Option<ScheduledTask>,
}

impl TelemetryMirror {
    /// `on_lost` runs once, for the first subscription that ends without the
    /// mirror being closed.
    pub async fn start<L>(
        store: &dyn KvStore,
        device_id: &DeviceId,
        on_lost: L,
    ) -> Result<Self, StoreError>
    where
        L: FnOnce(StorePath) + Send + 'static,
    {
        let paths = DevicePaths::new(device_id);
        let targets = [
            (Field::RoverStatus, paths.rover_status()),
            (Field::ArduinoStatus, paths.arduino_status()),
            (Field::MotorSpeed, paths.motor_speed()),
            (Field::Controller, paths.controller()),
        ];

        // Any failure drops the subscriptions made so far.
        let mut subscriptions: Vec<(Field, Subscription)> = Vec::with_capacity(targets.len());
        for (field, path) in targets {
            subscriptions.push((field, store.subscribe(&path).await?));
        }

        let handles = subscriptions
            .iter()
            .map(|(_, subscription)| subscription.handle())
            .collect();
        let (tx, rx) = watch::channel(TelemetrySnapshot::default());

        let updates = stream::select_all(subscriptions.into_iter().map(|(field, subscription)| {
            stream::unfold(Some(subscription), move |state| async move {
                let mut subscription = state?;
                match subscription.next().await {
                    Some(value) => Some((MirrorUpdate::Value(field, value), Some(subscription))),
                    None => {
                        let ended = MirrorUpdate::Ended {
                            path: subscription.path().clone(),
                            cancelled: subscription.handle().is_cancelled(),
                        };
                        Some((ended, None))
                    }
                }
            })
            .boxed()
        }));

        let device = device_id.clone();
        let task = ScheduledTask::spawn("telemetry-mirror", async move {
            let mut updates = updates;
            let mut on_lost = Some(on_lost);
            while let Some(update) = updates.next().await {
                match update {
                    MirrorUpdate::Value(field, value) => {
                        tx.send_if_modified(|snapshot| apply(snapshot, field, value));
                    }
                    MirrorUpdate::Ended { cancelled: true, .. } => {}
                    MirrorUpdate::Ended { path, cancelled: false } => {
                        warn!(device_id = %device, path = %path, "telemetry: subscription lost");
                        if let Some(on_lost) = on_lost.take() {
                            on_lost(path);
                        }
                    }
                }
            }
            debug!(device_id = %device, "telemetry: mirror stopped");
        });

        Ok(Self {
            device_id: device_id.clone(),
            snapshot: rx,
            subscriptions: handles,
            task: Some(task),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|handle| !handle.is_cancelled())
            .count()
    }

    pub fn close(&mut self) {
        for handle in &self.subscriptions {
            handle.cancel();
        }
        self.task.take();
    }
}

impl Drop for TelemetryMirror {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/telemetry_tests.rs"]
mod tests;
