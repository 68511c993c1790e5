//! Error types for the tunnel connection core.

use std::time::Duration;

use thiserror::Error;

use crate::supervisor::Phase;
use crate::types::ValidationReport;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed proxy endpoint or configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Proxy unreachable or authentication failed.
    #[error("Proxy validation failed: {0}")]
    Validation(String),

    /// An OS command reported insufficient rights.
    #[error("Administrator rights required for `{command}`: {message}")]
    Privilege { command: String, message: String },

    /// Every interface creation strategy failed.
    #[error("Interface provisioning failed: {0}")]
    Provisioning(String),

    /// A redirection step failed after its retries.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A DNS securing step failed after its retries.
    #[error("DNS error: {0}")]
    Dns(String),

    /// An operation exceeded its budget.
    #[error("{operation} timed out after {}s", after.as_secs_f32())]
    Timeout { operation: String, after: Duration },

    /// The forwarding subprocess could not be started.
    #[error("Forwarder error: {0}")]
    Forwarder(String),

    /// The forwarding subprocess exited while connected.
    #[error("Forwarder exited unexpectedly (code: {code:?})")]
    ForwarderCrash { code: Option<i32> },

    /// A command returned a non-zero exit status.
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// SOCKS5 / HTTP wire errors while probing.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disconnect without an active session.
    #[error("Not connected")]
    NotConnected,

    /// Operation requires an idle supervisor.
    #[error("A session is already active")]
    AlreadyConnected,
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new routing error.
    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Self::Routing(msg.into())
    }

    /// Create a new DNS error.
    pub fn dns<S: Into<String>>(msg: S) -> Self {
        Self::Dns(msg.into())
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Check if this is a retriable error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Io(_) | Self::Timeout { .. } | Self::Protocol(_)
        )
    }

    /// Check if this error was caused by missing administrator rights.
    pub fn is_privilege(&self) -> bool {
        matches!(self, Self::Privilege { .. })
    }

    /// Short, user-facing remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "Check the proxy host, port, type and credentials",
            Self::Validation(_) | Self::Protocol(_) => {
                "Check that the proxy is online, the credentials are correct and this machine has connectivity"
            }
            Self::Privilege { .. } => "Restart the application as administrator",
            Self::Provisioning(_) => {
                "Install the tunnel adapter driver or restart the application as administrator"
            }
            Self::Routing(_) | Self::Dns(_) | Self::Command { .. } | Self::Io(_) => {
                "Retry the connection; if it keeps failing, restart the application as administrator"
            }
            Self::Timeout { .. } => "The system was too slow to respond; retry the connection",
            Self::Forwarder(_) | Self::ForwarderCrash { .. } => {
                "Check that the forwarding binary is installed and not blocked by antivirus"
            }
            Self::NotConnected | Self::AlreadyConnected => "No action needed",
        }
    }
}

/// Failure of a `connect` call: the error, the phase it was raised in and
/// whatever validation report was produced before it.
#[derive(Error, Debug)]
#[error("Connect failed during {phase}: {error}")]
pub struct ConnectFailure {
    pub phase: Phase,
    #[source]
    pub error: Error,
    pub validation: Option<ValidationReport>,
}

impl ConnectFailure {
    pub fn new(phase: Phase, error: Error, validation: Option<ValidationReport>) -> Self {
        Self {
            phase,
            error,
            validation,
        }
    }

    /// Message suitable for end users: phase reached plus a remediation hint.
    pub fn user_message(&self) -> String {
        format!(
            "Could not connect ({}): {}",
            self.phase.describe(),
            self.error.remediation()
        )
    }
}
