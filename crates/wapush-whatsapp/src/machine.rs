//! Session state machine
//!
//! `transition` is pure: it maps `(machine, event)` to the next machine and
//! a list of [`Effect`]s. The session manager executes the effects (timers,
//! broadcasts, persistence, handle teardown) in order.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::transport::CloseReason;

pub const LOGGED_OUT_MESSAGE: &str = "session terminated, re-scan required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    AwaitingScan,
    Open,
    /// Handle teardown in progress after a close event
    Closing,
    Reconnecting,
    LoggedOut,
}

/// Pairing/connection status pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub session_id: String,
    pub qr_code: Option<String>,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    fn qr(session_id: &str, code: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            qr_code: Some(code.to_string()),
            connected: false,
            error: None,
        }
    }

    fn connected(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            qr_code: None,
            connected: true,
            error: None,
        }
    }

    fn error(session_id: &str, error: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            qr_code: None,
            connected: false,
            error: Some(error.into()),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PairingStarted,
    PairingFailed(String),
    QrCode(String),
    Opened { phone_number: Option<String> },
    Closed(CloseReason),
    QrTimeout,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartQrWatchdog,
    CancelQrWatchdog,
    Broadcast(StatusUpdate),
    PersistStatus {
        status: &'static str,
        phone_number: Option<String>,
        connected: bool,
    },
    /// End and close the live handle, removing it from the registry
    ReleaseHandle,
    DeleteAuthState,
    ScheduleReconnect(Duration),
    /// Forget the session entirely, failure counter included
    Abandon,
    /// Settle into a state once the preceding teardown effects ran
    Enter(SessionState),
    LogQrTimeout,
}

/// Per-session machine data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionMachine {
    pub state: SessionState,
    /// Consecutive transient connection failures
    pub failures: u32,
}

pub fn transition(
    session_id: &str,
    machine: SessionMachine,
    event: &SessionEvent,
    policy: &BackoffPolicy,
) -> (SessionMachine, Vec<Effect>) {
    let failures = machine.failures;
    match event {
        SessionEvent::PairingStarted => (
            SessionMachine {
                state: SessionState::Connecting,
                failures,
            },
            vec![Effect::StartQrWatchdog],
        ),

        SessionEvent::PairingFailed(reason) => (
            SessionMachine {
                state: SessionState::Idle,
                failures,
            },
            vec![
                Effect::CancelQrWatchdog,
                Effect::Broadcast(StatusUpdate::error(session_id, reason.clone())),
            ],
        ),

        SessionEvent::QrCode(code) => (
            SessionMachine {
                state: SessionState::AwaitingScan,
                failures,
            },
            vec![
                Effect::CancelQrWatchdog,
                Effect::Broadcast(StatusUpdate::qr(session_id, code)),
            ],
        ),

        SessionEvent::Opened { phone_number } => (
            SessionMachine {
                state: SessionState::Open,
                failures: 0,
            },
            vec![
                Effect::CancelQrWatchdog,
                Effect::PersistStatus {
                    status: "connected",
                    phone_number: phone_number.clone(),
                    connected: true,
                },
                Effect::Broadcast(StatusUpdate::connected(session_id)),
            ],
        ),

        SessionEvent::Closed(reason) => closed(session_id, failures, reason, policy),

        SessionEvent::QrTimeout => {
            let effects = if machine.state == SessionState::Connecting {
                vec![Effect::LogQrTimeout]
            } else {
                Vec::new()
            };
            (machine, effects)
        }
    }
}

fn closed(
    session_id: &str,
    failures: u32,
    reason: &CloseReason,
    policy: &BackoffPolicy,
) -> (SessionMachine, Vec<Effect>) {
    let closing = |failures| SessionMachine {
        state: SessionState::Closing,
        failures,
    };

    match reason {
        CloseReason::LoggedOut => (
            closing(0),
            vec![
                Effect::CancelQrWatchdog,
                Effect::ReleaseHandle,
                Effect::DeleteAuthState,
                Effect::PersistStatus {
                    status: "logged_out",
                    phone_number: None,
                    connected: false,
                },
                Effect::Enter(SessionState::LoggedOut),
                Effect::Broadcast(StatusUpdate::error(session_id, LOGGED_OUT_MESSAGE)),
            ],
        ),

        CloseReason::ConnectionFailure(detail) => {
            let failures = failures + 1;
            match policy.delay_for(failures) {
                Some(delay) => (
                    closing(failures),
                    vec![
                        Effect::CancelQrWatchdog,
                        Effect::ReleaseHandle,
                        Effect::PersistStatus {
                            status: "reconnecting",
                            phone_number: None,
                            connected: false,
                        },
                        Effect::Enter(SessionState::Reconnecting),
                        Effect::ScheduleReconnect(delay),
                    ],
                ),
                None => (
                    closing(0),
                    vec![
                        Effect::CancelQrWatchdog,
                        Effect::ReleaseHandle,
                        Effect::Abandon,
                        Effect::PersistStatus {
                            status: "disconnected",
                            phone_number: None,
                            connected: false,
                        },
                        Effect::Broadcast(StatusUpdate::error(
                            session_id,
                            format!(
                                "connection failed {} times in a row ({}), giving up",
                                failures, detail
                            ),
                        )),
                    ],
                ),
            }
        }

        // Anything that is not a logout restarts, including unknown reasons
        CloseReason::Other(_) => (
            closing(failures),
            vec![
                Effect::CancelQrWatchdog,
                Effect::ReleaseHandle,
                Effect::Enter(SessionState::Reconnecting),
                Effect::ScheduleReconnect(policy.restart_delay),
            ],
        ),
    }
}
