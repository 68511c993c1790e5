//! State-change events emitted to collaborators (UI, dashboard, session tracking).
//!
//! Delivery is best-effort and never blocks the core.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::dns::LeakTestReport;
use crate::types::ProxyEndpoint;

/// Events produced by the tunnel core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// Connect progress.
    #[serde(rename_all = "camelCase")]
    Progress {
        phase: String,
        message: String,
        progress_percent: u8,
    },
    /// Connect completed, or the session ended.
    #[serde(rename_all = "camelCase")]
    Connection {
        connected: bool,
        session_id: Option<String>,
        #[serde(serialize_with = "serialize_endpoint")]
        config: Option<ProxyEndpoint>,
    },
    /// Health transition or egress IP change.
    #[serde(rename_all = "camelCase")]
    Health {
        is_healthy: bool,
        external_ip: Option<IpAddr>,
        timestamp: u64,
    },
    /// Leak test finished.
    #[serde(rename_all = "camelCase")]
    LeakTest {
        has_leaks: bool,
        report: LeakTestReport,
    },
    /// The forwarding subprocess exited while connected.
    #[serde(rename_all = "camelCase")]
    ForwarderCrashed { code: Option<i32>, timestamp: u64 },
}

/// Credentials never leave the core through events.
fn serialize_endpoint<S: serde::Serializer>(
    endpoint: &Option<ProxyEndpoint>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match endpoint {
        Some(ep) => s.serialize_some(&ep.to_string()),
        None => s.serialize_none(),
    }
}

/// Receiver of tunnel events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TunnelEvent);
}

/// Fan-out sink backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TunnelEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Sink that only writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: TunnelEvent) {
        match &event {
            TunnelEvent::Progress {
                phase,
                message,
                progress_percent,
            } => info!(phase = %phase, progress = progress_percent, "{}", message),
            TunnelEvent::Connection { connected, .. } => info!(connected, "Connection state changed"),
            TunnelEvent::Health {
                is_healthy,
                external_ip,
                ..
            } => {
                if *is_healthy {
                    info!(ip = ?external_ip, "Tunnel healthy");
                } else {
                    warn!("Tunnel unhealthy");
                }
            }
            TunnelEvent::LeakTest { has_leaks, report } => {
                if *has_leaks {
                    warn!(passed = report.tests_passed, total = report.total_tests, "DNS leak detected");
                } else {
                    info!(passed = report.tests_passed, total = report.total_tests, "DNS leak test passed");
                }
            }
            TunnelEvent::ForwarderCrashed { code, .. } => warn!(code = ?code, "Forwarder crashed"),
        }
        debug!(event = ?event, "event emitted");
    }
}

/// Forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: TunnelEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Records events for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: parking_lot::Mutex<Vec<TunnelEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<TunnelEvent> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn emit(&self, event: TunnelEvent) {
        self.events.lock().push(event);
    }
}
