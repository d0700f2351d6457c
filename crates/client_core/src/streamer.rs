//! Turns press/release edges into a continuous last-value-wins command stream.
//!
//! The device treats a command as current only while it keeps being
//! rewritten, so every held input is resent on a fixed period. At most one
//! resend task exists per streamer: it starts when the held set goes from
//! empty to non-empty and stops when it goes back to empty.

use std::{
    ops::ControlFlow,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use shared::{
    domain::{Command, DeviceId, MoveCommand, SpeedDirection, DEFAULT_MOTOR_SPEED, SPEED_STEP},
    paths::DevicePaths,
    protocol::StoreWrite,
};
use storage::{KvStore, StoreError};
use tracing::{debug, warn};

use crate::{error::SessionError, lease::LeaseFlag, task::ScheduledTask};

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Receives store failures the caller never sees, such as resend ticks.
pub type FaultSink = Arc<dyn Fn(&StoreError) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub resend_interval: Duration,
    pub speed_step: u8,
    pub initial_speed: u8,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            speed_step: SPEED_STEP,
            initial_speed: DEFAULT_MOTOR_SPEED,
        }
    }
}

#[derive(Clone)]
pub struct CommandStreamer {
    shared: Arc<StreamerShared>,
}

struct StreamerShared {
    store: Arc<dyn KvStore>,
    paths: DevicePaths,
    lease: LeaseFlag,
    config: StreamerConfig,
    state: Mutex<StreamerState>,
    // Serializes command writes so a resend can never overtake a stop.
    write_lane: tokio::sync::Mutex<()>,
    on_fault: FaultSink,
}

struct StreamerState {
    /// Held inputs in order of first press.
    held: Vec<MoveCommand>,
    resend: Option<ScheduledTask>,
    /// Bumped every time the held set empties; move writes issued under an
    /// older epoch are dropped.
    hold_epoch: u64,
    speed: u8,
    last_sent: Option<Command>,
}

impl CommandStreamer {
    pub fn new(
        store: Arc<dyn KvStore>,
        device_id: &DeviceId,
        lease: LeaseFlag,
        config: StreamerConfig,
        on_fault: FaultSink,
    ) -> Self {
        let speed = config.initial_speed;
        Self {
            shared: Arc::new(StreamerShared {
                store,
                paths: DevicePaths::new(device_id),
                lease,
                config,
                state: Mutex::new(StreamerState {
                    held: Vec::new(),
                    resend: None,
                    hold_epoch: 0,
                    speed,
                    last_sent: None,
                }),
                write_lane: tokio::sync::Mutex::new(()),
                on_fault,
            }),
        }
    }

    fn ensure_lease(&self) -> Result<(), SessionError> {
        if self.shared.lease.is_held() {
            Ok(())
        } else {
            Err(SessionError::validation("connect to a device first"))
        }
    }

    pub async fn start_input(&self, command: MoveCommand) -> Result<(), SessionError> {
        self.ensure_lease()?;
        let epoch = {
            let mut state = self.shared.state.lock();
            if !state.held.contains(&command) {
                state.held.push(command);
            }
            if state.resend.is_none() {
                state.resend = Some(self.spawn_resend(state.hold_epoch));
                debug!(command = %command, "streamer: resend task started");
            }
            state.hold_epoch
        };
        self.write_command(Command::Move(command), Some(epoch))
            .await?;
        Ok(())
    }

    /// Returns true when this release emptied the held set and the stop
    /// command was written.
    pub async fn end_input(&self, command: MoveCommand) -> Result<bool, SessionError> {
        {
            let mut state = self.shared.state.lock();
            let Some(position) = state.held.iter().position(|held| *held == command) else {
                return Ok(false);
            };
            state.held.remove(position);
            if !state.held.is_empty() {
                return Ok(false);
            }
            state.resend.take();
            state.hold_epoch += 1;
            debug!(command = %command, "streamer: resend task stopped");
        }
        Ok(self.write_command(Command::Stop, None).await?)
    }

    pub async fn adjust_speed(&self, direction: SpeedDirection) -> Result<u8, SessionError> {
        self.ensure_lease()?;
        let speed = {
            let mut state = self.shared.state.lock();
            state.speed = direction.apply(state.speed, self.shared.config.speed_step);
            state.speed
        };
        self.write_speed(speed).await?;
        Ok(speed)
    }

    pub async fn set_speed(&self, speed: u8) -> Result<u8, SessionError> {
        self.ensure_lease()?;
        self.shared.state.lock().speed = speed;
        self.write_speed(speed).await?;
        Ok(speed)
    }

    /// One-shot diagnostic write of the test symbol.
    pub async fn send_test(&self) -> Result<(), SessionError> {
        self.ensure_lease()?;
        self.write_command(Command::Test, None).await?;
        Ok(())
    }

    /// Tracks speed reported by the device so the next step starts from it.
    pub fn adopt_reported_speed(&self, speed: u8) {
        self.shared.state.lock().speed = speed;
    }

    /// Drops every held input and the resend task without writing anything.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.held.clear();
        state.resend.take();
        state.hold_epoch += 1;
    }

    /// Waits for a command write already in flight to finish.
    pub async fn drain(&self) {
        let _lane = self.shared.write_lane.lock().await;
    }

    pub fn held_inputs(&self) -> Vec<MoveCommand> {
        self.shared.state.lock().held.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().resend.is_some()
    }

    pub fn current_speed(&self) -> u8 {
        self.shared.state.lock().speed
    }

    pub fn last_sent(&self) -> Option<Command> {
        self.shared.state.lock().last_sent
    }

    fn spawn_resend(&self, epoch: u64) -> ScheduledTask {
        let shared = Arc::downgrade(&self.shared);
        ScheduledTask::every(
            "command-resend",
            self.shared.config.resend_interval,
            move || {
                let shared = Weak::clone(&shared);
                async move {
                    match shared.upgrade() {
                        Some(shared) => CommandStreamer { shared }.resend_tick(epoch).await,
                        None => ControlFlow::Break(()),
                    }
                }
            },
        )
    }

    async fn resend_tick(&self, epoch: u64) -> ControlFlow<()> {
        let newest = {
            let state = self.shared.state.lock();
            if state.hold_epoch != epoch {
                return ControlFlow::Break(());
            }
            state.held.last().copied()
        };
        let Some(command) = newest else {
            return ControlFlow::Break(());
        };
        if !self.shared.lease.is_held() {
            return ControlFlow::Break(());
        }

        if let Err(error) = self.write_command(Command::Move(command), Some(epoch)).await {
            warn!(command = %command, %error, "streamer: resend failed");
            (self.shared.on_fault)(&error);
        }
        ControlFlow::Continue(())
    }

    /// Writes `command` plus its timestamps. A move write carries the epoch it
    /// was issued under and is skipped if the held set emptied since. Returns
    /// false when the write was skipped.
    async fn write_command(&self, command: Command, epoch: Option<u64>) -> Result<bool, StoreError> {
        let _lane = self.shared.write_lane.lock().await;
        if !self.shared.lease.is_held() {
            return Ok(false);
        }
        if let Some(epoch) = epoch {
            let state = self.shared.state.lock();
            if state.hold_epoch != epoch || state.held.is_empty() {
                return Ok(false);
            }
        }

        let store = &self.shared.store;
        let paths = &self.shared.paths;
        let written = store
            .set(&paths.command(), StoreWrite::text(command.symbol()))
            .await;
        for stamp in [paths.command_timestamp(), paths.last_activity()] {
            if let Err(error) = store.set(&stamp, StoreWrite::ServerTimestamp).await {
                warn!(path = %stamp, %error, "streamer: timestamp write failed");
                (self.shared.on_fault)(&error);
            }
        }
        written?;

        self.shared.state.lock().last_sent = Some(command);
        debug!(command = %command, "streamer: command written");
        Ok(true)
    }

    async fn write_speed(&self, speed: u8) -> Result<(), StoreError> {
        let store = &self.shared.store;
        let paths = &self.shared.paths;
        let written = store
            .set(&paths.motor_speed(), StoreWrite::number(speed))
            .await;
        if let Err(error) = store
            .set(&paths.last_activity(), StoreWrite::ServerTimestamp)
            .await
        {
            warn!(%error, "streamer: activity stamp failed");
            (self.shared.on_fault)(&error);
        }
        written?;
        debug!(speed, "streamer: speed written");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/streamer_tests.rs"]
mod tests;
