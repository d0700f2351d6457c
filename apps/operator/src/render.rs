use client_core::{DisconnectReason, SessionEvent, SessionSnapshot, SessionState, TelemetrySnapshot};

pub fn describe_state(state: &SessionState) -> &'static str {
    match state {
        SessionState::Disconnected => "disconnected",
        SessionState::Connecting => "connecting",
        SessionState::Connected { revoked: false } => "connected",
        SessionState::Connected { revoked: true } => "connected (control lost)",
        SessionState::Disconnecting => "disconnecting",
    }
}

pub fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::StateChanged(state) => format!("state: {}", describe_state(state)),
        SessionEvent::Connected {
            device_id,
            operator_id,
            renewed,
        } => {
            let verb = if *renewed { "renewed" } else { "took" };
            format!("{operator_id} {verb} control of {device_id}")
        }
        SessionEvent::TakenOver { device_id, holder } => {
            format!("control of {device_id} was taken by {holder}")
        }
        SessionEvent::Disconnected { device_id, reason } => match reason {
            DisconnectReason::Requested => format!("disconnected from {device_id}"),
            DisconnectReason::TakenOver { holder } => {
                format!("disconnected from {device_id}: now controlled by {holder}")
            }
            DisconnectReason::ConnectionLost => {
                format!("disconnected from {device_id}: lost contact with the store")
            }
            DisconnectReason::Teardown => format!("released {device_id} on exit"),
        },
        SessionEvent::StoreDegraded { message } => format!("store problem: {message}"),
    }
}

pub fn describe_telemetry(snapshot: &TelemetrySnapshot) -> String {
    format!(
        "rover: {} | arduino: {} | speed: {} | controller: {}",
        snapshot.rover_status_text(),
        snapshot.arduino_status_text(),
        snapshot.motor_speed_or_default(),
        snapshot.controller_text(),
    )
}

pub fn describe_session(snapshot: &SessionSnapshot) -> String {
    let inputs: Vec<&str> = snapshot
        .active_inputs
        .iter()
        .map(|command| command.symbol())
        .collect();
    format!(
        "{} on {} | lease: {} | holding: [{}] | speed: {} | subscriptions: {}",
        snapshot.operator_id,
        snapshot.device_id,
        if snapshot.lease_held { "held" } else { "lost" },
        inputs.join(" "),
        snapshot.current_speed,
        snapshot.active_subscriptions,
    )
}
