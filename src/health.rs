//! Health monitoring of a connected session.
//!
//! A background task checks on a fixed interval that the forwarder is alive
//! and which egress IP the outside world sees. Transitions and IP changes
//! are emitted as events; a dead forwarder is raised as a fault.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::events::{EventSink, TunnelEvent};
use crate::forwarder::ForwarderHandle;
use crate::protocol::http::Fetcher;
use crate::supervisor::Fault;
use crate::types::unix_millis;

/// Latest health observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// `None` until the first check completed.
    pub is_healthy: Option<bool>,
    pub external_ip: Option<IpAddr>,
    pub forwarder_alive: bool,
    pub last_check: Option<u64>,
}

/// Discovers the egress IP address.
#[async_trait]
pub trait EgressProbe: Send + Sync {
    async fn external_ip(&self) -> Option<IpAddr>;
}

/// Asks a list of IP echo services in order.
pub struct HttpEgressProbe {
    fetcher: Arc<dyn Fetcher>,
    services: Vec<String>,
    budget: Duration,
}

impl HttpEgressProbe {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: &HealthConfig) -> Self {
        Self {
            fetcher,
            services: config.ip_services.clone(),
            budget: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

/// An echo service answer: a bare IPv4/IPv6 address.
pub fn parse_ip_answer(body: &str) -> Option<IpAddr> {
    body.lines().next()?.trim().parse().ok()
}

#[async_trait]
impl EgressProbe for HttpEgressProbe {
    async fn external_ip(&self) -> Option<IpAddr> {
        for service in &self.services {
            match self.fetcher.fetch_text(service, self.budget).await {
                Ok(body) => match parse_ip_answer(&body) {
                    Some(ip) => return Some(ip),
                    None => debug!(service = %service, "IP service returned no address"),
                },
                Err(e) => debug!(service = %service, error = %e, "IP service failed"),
            }
        }
        None
    }
}

/// State carried from one tick to the next.
struct Checker {
    session_id: Uuid,
    forwarder: Arc<dyn ForwarderHandle>,
    probe: Arc<dyn EgressProbe>,
    events: Arc<dyn EventSink>,
    faults: mpsc::UnboundedSender<Fault>,
    snapshot: Arc<Mutex<HealthSnapshot>>,
    dead_reported: bool,
}

impl Checker {
    async fn check(&mut self) {
        // Liveness and IP discovery are independent reads.
        let forwarder = self.forwarder.clone();
        let (alive, ip) = tokio::join!(async move { forwarder.is_running() }, self.probe.external_ip());
        let healthy = alive && ip.is_some();

        if !alive && !self.dead_reported {
            warn!(pid = ?self.forwarder.pid(), "Forwarder is no longer running");
            self.dead_reported = true;
            let _ = self.faults.send(Fault::ForwarderDead {
                session_id: self.session_id,
            });
        }

        let now = unix_millis();
        let previous = {
            let mut snap = self.snapshot.lock();
            let previous = snap.clone();
            snap.is_healthy = Some(healthy);
            snap.forwarder_alive = alive;
            snap.last_check = Some(now);
            if ip.is_some() {
                snap.external_ip = ip;
            }
            previous
        };

        if previous.is_healthy != Some(healthy) {
            if healthy {
                info!(ip = ?ip, "Tunnel healthy");
            } else {
                warn!(forwarder_alive = alive, "Tunnel unhealthy");
            }
            self.events.emit(TunnelEvent::Health {
                is_healthy: healthy,
                external_ip: ip,
                timestamp: now,
            });
        } else if healthy && ip != previous.external_ip {
            info!(old = ?previous.external_ip, new = ?ip, "Egress IP changed");
            self.events.emit(TunnelEvent::Health {
                is_healthy: true,
                external_ip: ip,
                timestamp: now,
            });
        }
    }
}

/// Periodic health checker for one session at a time.
pub struct HealthMonitor {
    period: Duration,
    probe: Arc<dyn EgressProbe>,
    events: Arc<dyn EventSink>,
    snapshot: Arc<Mutex<HealthSnapshot>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(period: Duration, probe: Arc<dyn EgressProbe>, events: Arc<dyn EventSink>) -> Self {
        Self {
            period,
            probe,
            events,
            snapshot: Arc::new(Mutex::new(HealthSnapshot::default())),
            task: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start checking `forwarder`. A monitor that is already running is
    /// replaced.
    pub async fn start(
        &self,
        session_id: Uuid,
        forwarder: Arc<dyn ForwarderHandle>,
        faults: mpsc::UnboundedSender<Fault>,
    ) {
        self.stop().await;
        *self.snapshot.lock() = HealthSnapshot::default();

        let token = CancellationToken::new();
        let cancel = token.clone();
        let period = self.period;
        let mut checker = Checker {
            session_id,
            forwarder,
            probe: self.probe.clone(),
            events: self.events.clone(),
            faults,
            snapshot: self.snapshot.clone(),
            dead_reported: false,
        };
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = checker.check() => {}
                }
            }
            debug!("Health monitor stopped");
        });
        *self.task.lock() = Some((token, handle));
        info!(interval_secs = period.as_secs(), "Health monitor started");
    }

    /// Stop the background task and wait until it has exited.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Health monitor task failed");
            }
        }
    }
}
