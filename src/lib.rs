//! Full-tunnel proxy client core.
//!
//! Routes all host traffic through a SOCKS5 or HTTP proxy: the proxy is
//! validated, a virtual adapter is provisioned, a forwarding subprocess
//! bridges the adapter to the proxy, the default route is moved onto the
//! adapter and DNS is locked to trusted resolvers. Every change is recorded
//! on the active session and undone in reverse order.

pub mod adapter;
pub mod command;
pub mod config;
pub mod dns;
pub mod error;
pub mod events;
pub mod forwarder;
pub mod health;
pub mod protocol;
pub mod routing;
pub mod supervisor;
pub mod types;
pub mod validator;

// Re-export main types
pub use config::TunnelConfig;
pub use error::{ConnectFailure, Error, Result};
pub use events::{EventSink, TunnelEvent};
pub use supervisor::{ConnectOutcome, Fault, Phase, SessionState, SessionStatus, TunnelSupervisor};
pub use types::{ProxyEndpoint, ProxyKind, UdpMode, ValidationReport};

// Default configuration constants
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_INTERFACE_NAME: &str = "ProxyTun";
/// Every firewall rule this crate creates starts with this prefix.
pub const FIREWALL_RULE_PREFIX: &str = "ProxyTun-DNS-";
pub const USER_AGENT: &str = concat!("proxytun/", env!("CARGO_PKG_VERSION"));
