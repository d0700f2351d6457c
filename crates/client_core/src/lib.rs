//! Device control sessions over a push-notification key/value store.
//!
//! A [`SessionController`] owns at most one session at a time. Connecting
//! acquires the device lease, starts the telemetry mirror, the takeover watch,
//! the heartbeat and the command streamer; every exit path tears all of them
//! down and attempts a release.

pub mod directory;
pub mod error;
pub mod lease;
pub mod remote_store;
pub mod session;
pub mod streamer;
pub mod task;
pub mod telemetry;

pub use directory::DeviceDirectory;
pub use error::SessionError;
pub use lease::{LeaseFlag, LeaseGrant, LeaseManager, ReleaseOutcome, TakeoverWatch};
pub use remote_store::RemoteStore;
pub use session::{
    DisconnectReason, OperatorHandle, SessionConfig, SessionController, SessionEvent,
    SessionSnapshot, SessionState,
};
pub use streamer::{CommandStreamer, StreamerConfig};
pub use task::ScheduledTask;
pub use telemetry::{TelemetryMirror, TelemetrySnapshot};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
