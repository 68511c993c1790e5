//! Everything one connection changed on the machine.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::state::{Phase, SessionState};
use crate::forwarder::ForwarderHandle;
use crate::types::{AddedRoute, InterfaceRecord, ProxyEndpoint, RouteBackup, UdpMode, ValidationReport};

/// A tunnel session and its record of OS mutations.
///
/// Components append to the lists as they mutate the system and remove
/// entries as they undo them, so the session always describes what is
/// left to clean up.
pub struct TunnelSession {
    pub id: Uuid,
    pub endpoint: ProxyEndpoint,
    pub validation: ValidationReport,
    pub iface: Option<InterfaceRecord>,
    pub route_backup: Option<RouteBackup>,
    pub added_routes: Vec<AddedRoute>,
    pub added_firewall_rules: Vec<String>,
    /// Non-tunnel interfaces whose DNS servers were overridden.
    pub dns_overrides: Vec<String>,
    pub state: SessionState,
    /// Furthest phase entered; decides which teardown steps apply.
    pub reached: Phase,
    pub started_at: Option<u64>,
    pub last_health_check: Option<u64>,
    /// Cleared when the simplified redirect was used.
    pub hardened: bool,
    pub forwarder: Option<Arc<dyn ForwarderHandle>>,
}

impl TunnelSession {
    pub fn new(endpoint: ProxyEndpoint, validation: ValidationReport) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            validation,
            iface: None,
            route_backup: None,
            added_routes: Vec::new(),
            added_firewall_rules: Vec::new(),
            dns_overrides: Vec::new(),
            state: SessionState::Idle,
            reached: Phase::Validating,
            started_at: None,
            last_health_check: None,
            hardened: true,
            forwarder: None,
        }
    }

    pub fn udp_mode(&self) -> UdpMode {
        self.validation.udp_mode()
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.iface.as_ref().map(|i| i.resolved_name.as_str())
    }

    /// No recorded mutation is left to undo.
    pub fn is_clean(&self) -> bool {
        self.added_routes.is_empty()
            && self.added_firewall_rules.is_empty()
            && self.dns_overrides.is_empty()
            && self.forwarder.is_none()
            && !self.route_backup.as_ref().is_some_and(|b| b.default_route_removed)
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("iface", &self.iface)
            .field("added_routes", &self.added_routes.len())
            .field("added_firewall_rules", &self.added_firewall_rules.len())
            .field("dns_overrides", &self.dns_overrides)
            .field("state", &self.state)
            .field("hardened", &self.hardened)
            .field("forwarder_pid", &self.forwarder.as_ref().and_then(|f| f.pid()))
            .finish_non_exhaustive()
    }
}
