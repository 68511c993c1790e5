//! Session lifecycle states and connect phases.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Step of the connect sequence. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Phase {
    Validating,
    Provisioning,
    StartingForwarder,
    Redirecting,
    SecuringDns,
    Connected,
    Disconnecting,
}

impl Phase {
    /// Progress reported when the phase begins.
    pub fn progress_percent(&self) -> u8 {
        match self {
            Phase::Validating => 10,
            Phase::Provisioning => 25,
            Phase::StartingForwarder => 45,
            Phase::Redirecting => 65,
            Phase::SecuringDns => 85,
            Phase::Connected => 100,
            Phase::Disconnecting => 0,
        }
    }

    /// Human readable description for failure messages.
    pub fn describe(&self) -> &'static str {
        match self {
            Phase::Validating => "validating the proxy",
            Phase::Provisioning => "creating the network adapter",
            Phase::StartingForwarder => "starting the traffic forwarder",
            Phase::Redirecting => "redirecting traffic",
            Phase::SecuringDns => "securing DNS",
            Phase::Connected => "connected",
            Phase::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Validating => "Validating",
            Phase::Provisioning => "Provisioning",
            Phase::StartingForwarder => "StartingForwarder",
            Phase::Redirecting => "Redirecting",
            Phase::SecuringDns => "SecuringDNS",
            Phase::Connected => "Connected",
            Phase::Disconnecting => "Disconnecting",
        };
        f.write_str(s)
    }
}

/// Supervisor state as seen from the outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Validating,
    Provisioning,
    StartingForwarder,
    Redirecting,
    SecuringDns,
    Connected,
    Disconnecting,
    Error(String),
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }
}

impl From<Phase> for SessionState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Validating => SessionState::Validating,
            Phase::Provisioning => SessionState::Provisioning,
            Phase::StartingForwarder => SessionState::StartingForwarder,
            Phase::Redirecting => SessionState::Redirecting,
            Phase::SecuringDns => SessionState::SecuringDns,
            Phase::Connected => SessionState::Connected,
            Phase::Disconnecting => SessionState::Disconnecting,
        }
    }
}

/// Asynchronous failure raised by a background component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The forwarder process exited on its own.
    ForwarderExited {
        session_id: Uuid,
        code: Option<i32>,
        timestamp: u64,
    },
    /// The health monitor found the forwarder gone.
    ForwarderDead { session_id: Uuid },
}

impl Fault {
    pub fn session_id(&self) -> Uuid {
        match self {
            Fault::ForwarderExited { session_id, .. } | Fault::ForwarderDead { session_id } => *session_id,
        }
    }
}
