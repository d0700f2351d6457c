//! Session state machine tying the lease, mirror and streamer together.
//!
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
//! with `Connected { revoked: true }` entered only when a takeover is
//! observed. The controller is the only component that changes session state
//! or emits [`SessionEvent`]s; the parts below it report failures upward.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{
    domain::{
        DeviceId, DeviceSummary, MoveCommand, OperatorId, SpeedDirection, DEFAULT_MOTOR_SPEED,
        SPEED_STEP, TEST_MOTOR_SPEED,
    },
    paths::StorePath,
};
use storage::{KvStore, StoreError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    directory::DeviceDirectory,
    error::SessionError,
    lease::{LeaseFlag, LeaseGrant, LeaseManager, ReleaseOutcome, TakeoverWatch},
    streamer::{CommandStreamer, FaultSink, StreamerConfig, DEFAULT_RESEND_INTERVAL},
    task::ScheduledTask,
    telemetry::{TelemetryMirror, TelemetrySnapshot},
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected { revoked: bool },
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TakenOver { holder: String },
    /// A store subscription ended on its own; takeovers can no longer be seen.
    ConnectionLost,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Connected {
        device_id: DeviceId,
        operator_id: OperatorId,
        renewed: bool,
    },
    TakenOver {
        device_id: DeviceId,
        holder: String,
    },
    Disconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
    },
    /// A store call failed; the session stays up.
    StoreDegraded { message: String },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub resend_interval: Duration,
    pub heartbeat_interval: Duration,
    pub speed_step: u8,
    pub default_speed: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            speed_step: SPEED_STEP,
            default_speed: DEFAULT_MOTOR_SPEED,
        }
    }
}

/// Identifies one connect attempt. Callbacks carrying an older key are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionKey {
    device_id: DeviceId,
    operator_id: OperatorId,
    generation: u64,
}

/// Local view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub device_id: DeviceId,
    pub operator_id: OperatorId,
    pub lease_held: bool,
    pub active_inputs: Vec<MoveCommand>,
    pub streaming: bool,
    pub current_speed: u8,
    pub active_subscriptions: usize,
}

struct ActiveSession {
    key: SessionKey,
    lease: LeaseFlag,
    streamer: CommandStreamer,
    mirror: TelemetryMirror,
    takeover: TakeoverWatch,
    heartbeat: Option<ScheduledTask>,
    speed_relay: Option<ScheduledTask>,
}

impl ActiveSession {
    fn active_subscriptions(&self) -> usize {
        self.mirror.active_subscriptions() + usize::from(self.takeover.is_active())
    }

    /// Stops every local activity synchronously. Store writes already in the
    /// streamer's lane may still complete.
    fn close(&mut self) {
        self.lease.revoke();
        self.streamer.shutdown();
        self.mirror.close();
        self.takeover.close();
        self.heartbeat.take();
        self.speed_relay.take();
    }
}

struct ControllerInner {
    state: SessionState,
    generation: u64,
    /// Key of the connect attempt in flight.
    pending: Option<SessionKey>,
    /// Takeover observed before the pending connect finished wiring.
    pending_takeover: Option<String>,
    /// Subscription lost before the pending connect finished wiring.
    pending_lost: Option<StorePath>,
    active: Option<ActiveSession>,
}

pub struct SessionController {
    store: Arc<dyn KvStore>,
    leases: LeaseManager,
    directory: DeviceDirectory,
    config: SessionConfig,
    inner: Mutex<ControllerInner>,
    events: broadcast::Sender<SessionEvent>,
    this: Weak<SessionController>,
}

impl SessionController {
    pub fn new(store: Arc<dyn KvStore>, config: SessionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new_cyclic(|this| Self {
            leases: LeaseManager::new(Arc::clone(&store)),
            directory: DeviceDirectory::new(Arc::clone(&store)),
            store,
            config,
            inner: Mutex::new(ControllerInner {
                state: SessionState::Disconnected,
                generation: 0,
                pending: None,
                pending_takeover: None,
                pending_lost: None,
                active: None,
            }),
            events,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// `None` while no session is connected.
    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        let inner = self.inner.lock();
        let session = inner.active.as_ref()?;
        Some(SessionSnapshot {
            device_id: session.key.device_id.clone(),
            operator_id: session.key.operator_id.clone(),
            lease_held: session.lease.is_held(),
            active_inputs: session.streamer.held_inputs(),
            streaming: session.streamer.is_streaming(),
            current_speed: session.streamer.current_speed(),
            active_subscriptions: session.active_subscriptions(),
        })
    }

    pub fn telemetry(&self) -> Option<watch::Receiver<TelemetrySnapshot>> {
        let inner = self.inner.lock();
        inner.active.as_ref().map(|session| session.mirror.watch())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceSummary>, SessionError> {
        let devices = self.directory.list_devices().await;
        self.report(devices.map_err(SessionError::from))
    }

    pub async fn connect(
        &self,
        device_id: &str,
        operator_label: &str,
    ) -> Result<LeaseGrant, SessionError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(SessionError::validation("select a device first"));
        }
        let device_id = DeviceId::parse(device_id)
            .map_err(|error| SessionError::validation(format!("invalid device id: {error}")))?;
        let operator_id = OperatorId::parse(operator_label)
            .map_err(|_| SessionError::validation("enter an operator name first"))?;

        let key = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Disconnected {
                return Err(SessionError::validation(
                    "a session is already active; disconnect first",
                ));
            }
            inner.generation += 1;
            let key = SessionKey {
                device_id,
                operator_id,
                generation: inner.generation,
            };
            inner.pending = Some(key.clone());
            inner.pending_takeover = None;
            inner.pending_lost = None;
            self.set_state(&mut inner, SessionState::Connecting);
            key
        };
        info!(
            device_id = %key.device_id,
            operator_id = %key.operator_id,
            "session: connecting"
        );

        let established = self.establish(&key).await;
        self.finish_connect(key, established).await
    }

    async fn establish(&self, key: &SessionKey) -> Result<(LeaseGrant, ActiveSession), SessionError> {
        let grant = self.leases.acquire(&key.device_id, &key.operator_id).await?;
        match self.wire(key).await {
            Ok(session) => Ok((grant, session)),
            Err(error) => {
                warn!(device_id = %key.device_id, %error, "session: wiring failed after acquire");
                self.release_quietly(key).await;
                Err(error.into())
            }
        }
    }

    async fn wire(&self, key: &SessionKey) -> Result<ActiveSession, StoreError> {
        let lease = LeaseFlag::held();
        let mirror = TelemetryMirror::start(
            self.store.as_ref(),
            &key.device_id,
            self.loss_sink(key.clone()),
        )
        .await?;

        let this = self.this.clone();
        let takeover_key = key.clone();
        let takeover = self
            .leases
            .watch_takeover(
                &key.device_id,
                &key.operator_id,
                lease.clone(),
                move |holder| {
                    let Some(controller) = this.upgrade() else {
                        return;
                    };
                    let key = takeover_key.clone();
                    tokio::spawn(async move {
                        controller.handle_takeover(key, holder).await;
                    });
                },
                self.loss_sink(key.clone()),
            )
            .await?;

        let streamer = CommandStreamer::new(
            Arc::clone(&self.store),
            &key.device_id,
            lease.clone(),
            StreamerConfig {
                resend_interval: self.config.resend_interval,
                speed_step: self.config.speed_step,
                initial_speed: self.config.default_speed,
            },
            self.fault_sink(key.clone()),
        );
        let heartbeat =
            self.leases
                .start_heartbeat(&key.device_id, lease.clone(), self.config.heartbeat_interval);
        let speed_relay = relay_reported_speed(mirror.watch(), streamer.clone());

        Ok(ActiveSession {
            key: key.clone(),
            lease,
            streamer,
            mirror,
            takeover,
            heartbeat: Some(heartbeat),
            speed_relay: Some(speed_relay),
        })
    }

    async fn finish_connect(
        &self,
        key: SessionKey,
        established: Result<(LeaseGrant, ActiveSession), SessionError>,
    ) -> Result<LeaseGrant, SessionError> {
        let (grant, session) = match established {
            Ok(established) => established,
            Err(error) => {
                {
                    let mut inner = self.inner.lock();
                    if inner.pending.as_ref() == Some(&key) {
                        inner.pending = None;
                        inner.pending_takeover = None;
                        inner.pending_lost = None;
                        self.set_state(&mut inner, SessionState::Disconnected);
                    }
                }
                if let SessionError::StoreUnavailable(store_error) = &error {
                    self.emit(SessionEvent::StoreDegraded {
                        message: store_error.to_string(),
                    });
                }
                info!(device_id = %key.device_id, %error, "session: connect failed");
                return Err(error);
            }
        };

        let installed = {
            let mut inner = self.inner.lock();
            if inner.pending.as_ref() == Some(&key) {
                inner.pending = None;
                let early_takeover = inner.pending_takeover.take();
                let early_loss = inner.pending_lost.take();
                inner.active = Some(session);
                self.set_state(
                    &mut inner,
                    SessionState::Connected {
                        revoked: early_takeover.is_some(),
                    },
                );
                Ok((early_takeover, early_loss))
            } else {
                Err(session)
            }
        };

        match installed {
            Ok((early_takeover, early_loss)) => {
                self.connected(grant, key, early_takeover, early_loss)
            }
            Err(mut session) => {
                // A disconnect arrived while the lease was being acquired.
                session.close();
                self.release_quietly(&key).await;
                info!(device_id = %key.device_id, "session: connect cancelled");
                Err(SessionError::Cancelled)
            }
        }
    }

    fn connected(
        &self,
        grant: LeaseGrant,
        key: SessionKey,
        early_takeover: Option<String>,
        early_loss: Option<StorePath>,
    ) -> Result<LeaseGrant, SessionError> {
        info!(
            device_id = %key.device_id,
            operator_id = %key.operator_id,
            renewed = grant.renewed,
            "session: connected"
        );
        self.emit(SessionEvent::Connected {
            device_id: key.device_id.clone(),
            operator_id: key.operator_id.clone(),
            renewed: grant.renewed,
        });
        let Some(controller) = self.this.upgrade() else {
            return Ok(grant);
        };
        if let Some(holder) = early_takeover {
            tokio::spawn(async move {
                controller.handle_takeover(key, holder).await;
            });
        } else if let Some(path) = early_loss {
            tokio::spawn(async move {
                controller.handle_subscription_lost(key, path).await;
            });
        }
        Ok(grant)
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.end_session(None, DisconnectReason::Requested).await;
        Ok(())
    }

    /// Process teardown; takes the same path as an explicit disconnect.
    pub async fn shutdown(&self) {
        self.end_session(None, DisconnectReason::Teardown).await;
    }

    async fn handle_takeover(&self, key: SessionKey, holder: String) {
        {
            let mut inner = self.inner.lock();
            if inner.pending.as_ref() == Some(&key) {
                inner.pending_takeover = Some(holder);
                return;
            }
            let current = inner
                .active
                .as_ref()
                .is_some_and(|session| session.key == key);
            if !current {
                debug!(device_id = %key.device_id, "session: ignoring stale takeover");
                return;
            }
            self.set_state(&mut inner, SessionState::Connected { revoked: true });
        }

        warn!(
            device_id = %key.device_id,
            operator_id = %key.operator_id,
            holder = %holder,
            "session: control taken over"
        );
        self.emit(SessionEvent::TakenOver {
            device_id: key.device_id.clone(),
            holder: holder.clone(),
        });
        self.end_session(Some(&key), DisconnectReason::TakenOver { holder })
            .await;
    }

    /// Without its subscriptions the session can neither see takeovers nor
    /// mirror the device, so it is ended.
    async fn handle_subscription_lost(&self, key: SessionKey, path: StorePath) {
        {
            let mut inner = self.inner.lock();
            if inner.pending.as_ref() == Some(&key) {
                inner.pending_lost.get_or_insert(path);
                return;
            }
            let current = inner
                .active
                .as_ref()
                .is_some_and(|session| session.key == key);
            if !current {
                debug!(device_id = %key.device_id, "session: ignoring stale subscription loss");
                return;
            }
        }

        warn!(
            device_id = %key.device_id,
            path = %path,
            "session: store subscription lost, ending session"
        );
        self.emit(SessionEvent::StoreDegraded {
            message: format!("lost the store subscription to {path}"),
        });
        self.end_session(Some(&key), DisconnectReason::ConnectionLost)
            .await;
    }

    /// Tears the session down locally, then attempts the release. Store
    /// failures are logged and never stop the teardown.
    async fn end_session(&self, expected: Option<&SessionKey>, reason: DisconnectReason) {
        let mut session = {
            let mut inner = self.inner.lock();
            if let Some(expected) = expected {
                let matches = inner
                    .active
                    .as_ref()
                    .is_some_and(|session| &session.key == expected);
                if !matches {
                    return;
                }
            }
            match inner.state {
                SessionState::Disconnected | SessionState::Disconnecting => return,
                SessionState::Connecting => {
                    // The connect attempt notices and releases on its own.
                    inner.pending = None;
                    inner.pending_takeover = None;
                    inner.pending_lost = None;
                    self.set_state(&mut inner, SessionState::Disconnected);
                    return;
                }
                SessionState::Connected { .. } => {}
            }
            let Some(session) = inner.active.take() else {
                self.set_state(&mut inner, SessionState::Disconnected);
                return;
            };
            self.set_state(&mut inner, SessionState::Disconnecting);
            session
        };

        session.close();
        session.streamer.drain().await;
        self.release_quietly(&session.key).await;
        let device_id = session.key.device_id.clone();
        drop(session);

        {
            let mut inner = self.inner.lock();
            self.set_state(&mut inner, SessionState::Disconnected);
        }
        info!(device_id = %device_id, reason = ?reason, "session: disconnected");
        self.emit(SessionEvent::Disconnected { device_id, reason });
    }

    async fn release_quietly(&self, key: &SessionKey) {
        match self.leases.release(&key.device_id, &key.operator_id).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(ReleaseOutcome::Superseded { holder }) => {
                debug!(device_id = %key.device_id, holder = %holder, "session: lease already superseded");
            }
            Err(error) => {
                warn!(device_id = %key.device_id, %error, "session: release failed");
            }
        }
    }

    fn active_streamer(&self) -> Option<CommandStreamer> {
        let inner = self.inner.lock();
        inner
            .active
            .as_ref()
            .filter(|session| session.lease.is_held())
            .map(|session| session.streamer.clone())
    }

    fn require_streamer(&self) -> Result<CommandStreamer, SessionError> {
        self.active_streamer()
            .ok_or_else(|| SessionError::validation("connect to a device first"))
    }

    pub async fn hold_input(&self, command: MoveCommand) -> Result<(), SessionError> {
        let streamer = self.require_streamer()?;
        let result = streamer.start_input(command).await;
        self.report(result)
    }

    /// Releasing with no session, or an input that is not held, is a no-op.
    pub async fn release_input(&self, command: MoveCommand) -> Result<(), SessionError> {
        let Some(streamer) = self.active_streamer() else {
            return Ok(());
        };
        let result = streamer.end_input(command).await.map(|_| ());
        self.report(result)
    }

    pub async fn adjust_speed(&self, direction: SpeedDirection) -> Result<u8, SessionError> {
        let streamer = self.require_streamer()?;
        let result = streamer.adjust_speed(direction).await;
        self.report(result)
    }

    pub async fn send_test_command(&self) -> Result<(), SessionError> {
        let streamer = self.require_streamer()?;
        let result = streamer.send_test().await;
        self.report(result)
    }

    pub async fn send_test_speed(&self) -> Result<u8, SessionError> {
        let streamer = self.require_streamer()?;
        let result = streamer.set_speed(TEST_MOTOR_SPEED).await;
        self.report(result)
    }

    fn report<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(SessionError::StoreUnavailable(error)) = &result {
            self.emit(SessionEvent::StoreDegraded {
                message: error.to_string(),
            });
        }
        result
    }

    fn fault_sink(&self, key: SessionKey) -> FaultSink {
        let this = self.this.clone();
        Arc::new(move |error: &StoreError| {
            let Some(controller) = this.upgrade() else {
                return;
            };
            let current = controller
                .inner
                .lock()
                .active
                .as_ref()
                .is_some_and(|session| session.key == key);
            if current {
                controller.emit(SessionEvent::StoreDegraded {
                    message: error.to_string(),
                });
            }
        })
    }

    fn loss_sink(&self, key: SessionKey) -> impl FnOnce(StorePath) + Send + 'static {
        let this = self.this.clone();
        move |path| {
            let Some(controller) = this.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                controller.handle_subscription_lost(key, path).await;
            });
        }
    }

    fn set_state(&self, inner: &mut ControllerInner, state: SessionState) {
        if inner.state == state {
            return;
        }
        inner.state = state.clone();
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Feeds device-reported speed back into the streamer.
fn relay_reported_speed(
    mut telemetry: watch::Receiver<TelemetrySnapshot>,
    streamer: CommandStreamer,
) -> ScheduledTask {
    ScheduledTask::spawn("speed-relay", async move {
        while telemetry.changed().await.is_ok() {
            let reported = telemetry.borrow_and_update().motor_speed;
            if let Some(speed) = reported {
                streamer.adopt_reported_speed(speed);
            }
        }
    })
}

/// Operator-facing surface of a session.
#[async_trait]
pub trait OperatorHandle: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceSummary>, SessionError>;
    async fn connect(&self, device_id: &str, operator_label: &str)
        -> Result<LeaseGrant, SessionError>;
    async fn hold_input(&self, command: MoveCommand) -> Result<(), SessionError>;
    async fn release_input(&self, command: MoveCommand) -> Result<(), SessionError>;
    async fn adjust_speed(&self, direction: SpeedDirection) -> Result<u8, SessionError>;
    async fn send_test_command(&self) -> Result<(), SessionError>;
    async fn send_test_speed(&self) -> Result<u8, SessionError>;
    async fn disconnect(&self) -> Result<(), SessionError>;
    async fn shutdown(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent>;
    fn telemetry(&self) -> Option<watch::Receiver<TelemetrySnapshot>>;
}

#[async_trait]
impl OperatorHandle for Arc<SessionController> {
    async fn list_devices(&self) -> Result<Vec<DeviceSummary>, SessionError> {
        SessionController::list_devices(self).await
    }

    async fn connect(
        &self,
        device_id: &str,
        operator_label: &str,
    ) -> Result<LeaseGrant, SessionError> {
        SessionController::connect(self, device_id, operator_label).await
    }

    async fn hold_input(&self, command: MoveCommand) -> Result<(), SessionError> {
        SessionController::hold_input(self, command).await
    }

    async fn release_input(&self, command: MoveCommand) -> Result<(), SessionError> {
        SessionController::release_input(self, command).await
    }

    async fn adjust_speed(&self, direction: SpeedDirection) -> Result<u8, SessionError> {
        SessionController::adjust_speed(self, direction).await
    }

    async fn send_test_command(&self) -> Result<(), SessionError> {
        SessionController::send_test_command(self).await
    }

    async fn send_test_speed(&self) -> Result<u8, SessionError> {
        SessionController::send_test_speed(self).await
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        SessionController::disconnect(self).await
    }

    async fn shutdown(&self) {
        SessionController::shutdown(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        SessionController::subscribe_events(self)
    }

    fn telemetry(&self) -> Option<watch::Receiver<TelemetrySnapshot>> {
        SessionController::telemetry(self)
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
