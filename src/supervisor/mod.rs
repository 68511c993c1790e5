//! Tunnel supervisor.
//!
//! Drives the connect sequence (validate, provision, start the forwarder,
//! redirect, secure DNS), owns the single active [`TunnelSession`] and
//! tears it down in reverse order on disconnect, on failure and when the
//! forwarder dies.

mod session;
mod state;


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{CreationStrategy, InterfaceProvisioner};
use crate::command::{CommandRunner, SystemRunner};
use crate::config::TunnelConfig;
use crate::dns::{DnsLeakGuard, LeakTestReport};
use crate::error::{ConnectFailure, Error, Result};
use crate::events::{EventSink, LogSink, TunnelEvent};
use crate::forwarder::{ForwarderLauncher, ForwarderSpec, ProcessLauncher};
use crate::health::{EgressProbe, HealthMonitor, HealthSnapshot, HttpEgressProbe};
use crate::protocol::http::{DirectFetcher, Fetcher};
use crate::routing::RoutingController;
use crate::types::{unix_millis, InterfaceRecord, ProxyEndpoint, UdpMode, ValidationReport};
use crate::validator::{validate_with_retry, EndpointValidator, ProxyValidator, ValidateOptions, ValidationFailure};

pub use session::TunnelSession;
pub use state::{Fault, Phase, SessionState};

/// Result of a successful connect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOutcome {
    pub session_id: Uuid,
    pub interface: InterfaceRecord,
    pub udp_mode: UdpMode,
    /// False when the simplified redirect was used and no firewall rules
    /// were installed.
    pub hardened: bool,
    pub validation: ValidationReport,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    /// Redacted proxy URL.
    pub proxy: Option<String>,
    pub interface: Option<InterfaceRecord>,
    pub udp_mode: Option<UdpMode>,
    pub hardened: Option<bool>,
    pub started_at: Option<u64>,
    pub health: HealthSnapshot,
}

/// Applies the validation phase budget to each attempt.
struct PhaseBudget<'a> {
    inner: &'a dyn EndpointValidator,
    budget: Duration,
}

#[async_trait]
impl<'a> EndpointValidator for PhaseBudget<'a> {
    async fn validate(
        &self,
        endpoint: &ProxyEndpoint,
        opts: ValidateOptions,
    ) -> std::result::Result<ValidationReport, ValidationFailure> {
        match timeout(self.budget, self.inner.validate(endpoint, opts)).await {
            Ok(result) => result,
            Err(_) => {
                let error = Error::timeout("proxy validation", self.budget);
                let report = ValidationReport {
                    errors: vec![error.to_string()],
                    ..Default::default()
                };
                Err(ValidationFailure { error, report })
            }
        }
    }
}

/// Run `fut` under `budget`; running out is a [`Error::Timeout`].
async fn within<T, F>(budget: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, budget)),
    }
}

/// Assembles a [`TunnelSupervisor`]; every collaborator has a production
/// default.
pub struct SupervisorBuilder {
    config: TunnelConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    validator: Option<Arc<dyn EndpointValidator>>,
    launcher: Option<Arc<dyn ForwarderLauncher>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    probe: Option<Arc<dyn EgressProbe>>,
    events: Option<Arc<dyn EventSink>>,
    strategies: Option<Vec<Box<dyn CreationStrategy>>>,
}

impl SupervisorBuilder {
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn EndpointValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ForwarderLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn egress_probe(mut self, probe: Arc<dyn EgressProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn strategies(mut self, strategies: Vec<Box<dyn CreationStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn build(self) -> TunnelSupervisor {
        let config = self.config;
        let command_timeout = config.timeouts.command();

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(SystemRunner::new()) as Arc<dyn CommandRunner>);
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(DirectFetcher) as Arc<dyn Fetcher>);
        let events = self.events.unwrap_or_else(|| Arc::new(LogSink) as Arc<dyn EventSink>);
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(HttpEgressProbe::new(fetcher.clone(), &config.health)) as Arc<dyn EgressProbe>
        });
        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(ProxyValidator::new(config.validation.clone())) as Arc<dyn EndpointValidator>
        });
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher) as Arc<dyn ForwarderLauncher>);

        let mut provisioner = InterfaceProvisioner::new(runner.clone(), config.interface.clone(), command_timeout);
        if let Some(strategies) = self.strategies {
            provisioner = provisioner.with_strategies(strategies);
        }
        let routing = RoutingController::new(runner.clone(), command_timeout, config.dns.essential_servers());
        let dns = DnsLeakGuard::new(runner, fetcher, config.dns.clone(), command_timeout);
        let health = HealthMonitor::new(Duration::from_secs(config.health.interval_secs), probe, events.clone());
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        TunnelSupervisor {
            config,
            validator,
            launcher,
            provisioner,
            routing,
            dns,
            health,
            events,
            state: SessionState::Idle,
            session: None,
            faults_tx,
            faults_rx,
        }
    }
}

/// Owns the single active tunnel session.
pub struct TunnelSupervisor {
    config: TunnelConfig,
    validator: Arc<dyn EndpointValidator>,
    launcher: Arc<dyn ForwarderLauncher>,
    provisioner: InterfaceProvisioner,
    routing: RoutingController,
    dns: DnsLeakGuard,
    health: HealthMonitor,
    events: Arc<dyn EventSink>,
    state: SessionState,
    session: Option<TunnelSession>,
    faults_tx: mpsc::UnboundedSender<Fault>,
    faults_rx: mpsc::UnboundedReceiver<Fault>,
}

impl TunnelSupervisor {
    pub fn builder(config: TunnelConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            runner: None,
            validator: None,
            launcher: None,
            fetcher: None,
            probe: None,
            events: None,
            strategies: None,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn session(&self) -> Option<&TunnelSession> {
        self.session.as_ref()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session_state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn enter(&mut self, phase: Phase, message: impl Into<String>) {
        let message = message.into();
        info!(phase = %phase, "{}", message);
        self.set_state(phase.into());
        self.events.emit(TunnelEvent::Progress {
            phase: phase.to_string(),
            message,
            progress_percent: phase.progress_percent(),
        });
    }

    fn advance(&mut self, session: &mut TunnelSession, phase: Phase, message: impl Into<String>) {
        self.enter(phase, message);
        session.reached = phase;
        session.state = phase.into();
    }

    /// Bring the tunnel up.
    ///
    /// An active session is torn down first. On failure every change made
    /// so far is rolled back and the supervisor is idle again.
    pub async fn connect(&mut self, endpoint: ProxyEndpoint) -> std::result::Result<ConnectOutcome, ConnectFailure> {
        if self.session.is_some() {
            info!("Tearing down the active session before connecting again");
            if let Err(e) = self.disconnect().await {
                warn!(error = %e, "Previous session did not disconnect cleanly");
            }
        }
        // Faults of earlier sessions are meaningless now.
        while self.faults_rx.try_recv().is_ok() {}

        let timeouts = self.config.timeouts.clone();

        self.enter(Phase::Validating, format!("Validating proxy {endpoint}"));
        if let Err(e) = endpoint.validate() {
            return Err(self.abort(None, Phase::Validating, e, None).await);
        }
        let report = match self.validate(&endpoint).await {
            Ok(report) => report,
            Err(failure) => {
                return Err(self
                    .abort(None, Phase::Validating, failure.error, Some(failure.report))
                    .await)
            }
        };
        for warning in &report.warnings {
            warn!("Proxy validation: {}", warning);
        }

        let mut session = TunnelSession::new(endpoint, report);
        info!(session = %session.id, udp_mode = %session.udp_mode(), "Proxy validated");

        self.advance(&mut session, Phase::Provisioning, "Creating network adapter");
        let requested = self.config.interface.name.clone();
        match within(timeouts.provisioning(), "adapter provisioning", self.provisioner.provision(&requested)).await {
            Ok(record) => session.iface = Some(record),
            Err(e) => return Err(self.abort(Some(session), Phase::Provisioning, e, None).await),
        }

        self.advance(&mut session, Phase::StartingForwarder, "Starting traffic forwarder");
        if let Err(e) = self.start_forwarder(&mut session).await {
            return Err(self.abort(Some(session), Phase::StartingForwarder, e, None).await);
        }

        self.advance(&mut session, Phase::Redirecting, "Redirecting traffic through the tunnel");
        if let Err(e) = self.redirect(&mut session).await {
            return Err(self.abort(Some(session), Phase::Redirecting, e, None).await);
        }

        self.advance(&mut session, Phase::SecuringDns, "Securing DNS");
        if let Err(e) = within(timeouts.dns(), "DNS configuration", self.dns.secure(&mut session)).await {
            return Err(self.abort(Some(session), Phase::SecuringDns, e, None).await);
        }

        self.advance(&mut session, Phase::Connected, "Connected");
        session.started_at = Some(unix_millis());
        if let Some(forwarder) = session.forwarder.clone() {
            self.health.start(session.id, forwarder, self.faults_tx.clone()).await;
        }

        let Some(interface) = session.iface.clone() else {
            return Err(self
                .abort(Some(session), Phase::Connected, Error::Provisioning("Adapter record lost".into()), None)
                .await);
        };
        let outcome = ConnectOutcome {
            session_id: session.id,
            interface,
            udp_mode: session.udp_mode(),
            hardened: session.hardened,
            validation: session.validation.clone(),
        };
        self.events.emit(TunnelEvent::Connection {
            connected: true,
            session_id: Some(session.id.to_string()),
            config: Some(session.endpoint.clone()),
        });
        info!(
            session = %session.id,
            iface = %outcome.interface.resolved_name,
            hardened = outcome.hardened,
            "Tunnel connected via {}",
            session.endpoint
        );
        self.session = Some(session);
        Ok(outcome)
    }

    async fn validate(&self, endpoint: &ProxyEndpoint) -> std::result::Result<ValidationReport, ValidationFailure> {
        let bounded = PhaseBudget {
            inner: self.validator.as_ref(),
            budget: self.config.timeouts.validation(),
        };
        let opts = ValidateOptions {
            skip_http_probe: self.config.validation.skip_http_probe,
        };
        let report = validate_with_retry(&bounded, endpoint, opts, self.config.validation.retry_attempts).await?;
        if !report.permits_mutation() {
            return Err(ValidationFailure {
                error: Error::validation("Proxy is not reachable or rejected the credentials"),
                report,
            });
        }
        Ok(report)
    }

    /// Launch the forwarder, then finish a deferred adapter it created.
    async fn start_forwarder(&self, session: &mut TunnelSession) -> Result<()> {
        let timeouts = &self.config.timeouts;
        let device = session
            .interface_name()
            .ok_or_else(|| Error::Forwarder("No adapter to attach to".into()))?
            .to_string();
        let spec = ForwarderSpec::new(
            session.id,
            &self.config.forwarder,
            device,
            session.endpoint.to_url(),
            self.config.interface.mtu,
            session.udp_mode(),
        );
        let handle = within(
            timeouts.forwarder(),
            "forwarder start",
            self.launcher.launch(&spec, self.faults_tx.clone()),
        )
        .await?;
        info!(pid = ?handle.pid(), udp_mode = %spec.udp_mode, "Forwarder running");
        session.forwarder = Some(handle);

        if let Some(record) = session.iface.as_mut().filter(|r| r.pending) {
            within(
                timeouts.provisioning(),
                "adapter discovery",
                self.provisioner.complete_deferred(record),
            )
            .await?;
        }
        Ok(())
    }

    /// Full redirect; on timeout undo what was done and try the simplified
    /// variant once.
    async fn redirect(&self, session: &mut TunnelSession) -> Result<()> {
        let budget = self.config.timeouts.routing();
        match timeout(budget, self.routing.redirect(session)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Redirection timed out after {:?}, falling back to simplified routing", budget);
                if timeout(self.config.timeouts.teardown_step(), self.routing.emergency_restore(session))
                    .await
                    .is_err()
                {
                    error!("Emergency restore timed out");
                }
                within(budget, "simplified redirection", self.routing.redirect_simplified(session)).await?;
                warn!("Connected without DNS firewall hardening");
                Ok(())
            }
        }
    }

    /// Roll back a failed connect and report where it stopped.
    async fn abort(
        &mut self,
        session: Option<TunnelSession>,
        phase: Phase,
        error: Error,
        validation: Option<ValidationReport>,
    ) -> ConnectFailure {
        error!(phase = %phase, error = %error, "Connect failed");
        self.set_state(SessionState::Error(error.to_string()));

        let validation = match session {
            Some(mut session) => {
                warn!(session = %session.id, "Rolling back partial session");
                let failures = self.teardown(&mut session).await;
                if !failures.is_empty() {
                    error!(failures = ?failures, "Rollback incomplete");
                }
                Some(session.validation)
            }
            None => validation,
        };

        self.set_state(SessionState::Idle);
        self.events.emit(TunnelEvent::Connection {
            connected: false,
            session_id: None,
            config: None,
        });
        ConnectFailure::new(phase, error, validation)
    }

    /// Undo a session in reverse order. Every step runs; failures are
    /// collected and trigger an emergency route restore at the end.
    async fn teardown(&self, session: &mut TunnelSession) -> Vec<String> {
        let step = self.config.timeouts.teardown_step();
        let mut failures = Vec::new();

        self.health.stop().await;

        if let Some(forwarder) = session.forwarder.take() {
            match within(step, "forwarder stop", forwarder.stop()).await {
                Ok(()) => debug!("Forwarder stopped"),
                Err(e) => failures.push(format!("forwarder: {e}")),
            }
        }

        if session.reached >= Phase::SecuringDns {
            if let Err(e) = within(step, "DNS release", self.dns.release(session)).await {
                failures.push(format!("dns: {e}"));
            }
        }

        if session.reached >= Phase::Redirecting {
            if let Err(e) = within(step, "route restore", self.routing.restore(session)).await {
                failures.push(format!("routing: {e}"));
            }
        }

        if !failures.is_empty() {
            error!(failures = ?failures, "Teardown incomplete, running emergency restore");
            if timeout(step, self.routing.emergency_restore(session)).await.is_err() {
                failures.push("emergency restore timed out".to_string());
            }
        }

        if let Some(record) = session.iface.take() {
            let destroy = async {
                self.provisioner.destroy(&record).await;
                Ok(())
            };
            if let Err(e) = within(step, "adapter removal", destroy).await {
                failures.push(format!("adapter: {e}"));
            }
        }

        session.state = SessionState::Idle;
        failures
    }

    /// Tear the active session down.
    ///
    /// Cleanup is best-effort: failures are logged, not returned. Errors
    /// with [`Error::NotConnected`] when there is nothing to disconnect.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            debug!("Disconnect requested without an active session");
            return Err(Error::NotConnected);
        };

        info!(session = %session.id, "Disconnecting");
        self.set_state(SessionState::Disconnecting);
        session.state = SessionState::Disconnecting;

        let failures = self.teardown(&mut session).await;

        self.set_state(SessionState::Idle);
        self.events.emit(TunnelEvent::Connection {
            connected: false,
            session_id: Some(session.id.to_string()),
            config: None,
        });
        if failures.is_empty() {
            info!(session = %session.id, "Disconnected");
        } else {
            warn!(session = %session.id, failures = ?failures, "Disconnected with cleanup failures");
        }
        Ok(())
    }

    pub fn status(&mut self) -> SessionStatus {
        let health = self.health.snapshot();
        if let Some(session) = self.session.as_mut() {
            session.last_health_check = health.last_check;
        }
        let session = self.session.as_ref();
        SessionStatus {
            state: self.state.clone(),
            session_id: session.map(|s| s.id),
            proxy: session.map(|s| s.endpoint.to_string()),
            interface: session.and_then(|s| s.iface.clone()),
            udp_mode: session.map(|s| s.udp_mode()),
            hardened: session.map(|s| s.hardened),
            started_at: session.and_then(|s| s.started_at),
            health,
        }
    }

    /// Run the DNS leak test and publish the report.
    pub async fn run_leak_test(&self) -> LeakTestReport {
        let alias = self.session.as_ref().and_then(|s| s.interface_name());
        let report = self.dns.run_leak_test(alias).await;
        self.events.emit(TunnelEvent::LeakTest {
            has_leaks: report.has_leaks,
            report: report.clone(),
        });
        report
    }

    /// Wait for the next fault raised by a background component.
    pub async fn next_fault(&mut self) -> Fault {
        match self.faults_rx.recv().await {
            Some(fault) => fault,
            // The supervisor holds a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }

    /// React to a fault. Faults of sessions that are no longer active are
    /// ignored. Returns whether the session was torn down.
    pub async fn handle_fault(&mut self, fault: Fault) -> bool {
        let active = self.session.as_ref().map(|s| s.id);
        if active != Some(fault.session_id()) {
            debug!(fault = ?fault, "Ignoring fault of an inactive session");
            return false;
        }

        match fault {
            Fault::ForwarderExited { code, timestamp, .. } => {
                error!("{}", Error::ForwarderCrash { code });
                self.events.emit(TunnelEvent::ForwarderCrashed { code, timestamp });
            }
            Fault::ForwarderDead { .. } => {
                error!("Health monitor found the forwarder dead");
                self.events.emit(TunnelEvent::ForwarderCrashed {
                    code: None,
                    timestamp: unix_millis(),
                });
            }
        }

        if let Err(e) = self.disconnect().await {
            warn!(error = %e, "Disconnect after forwarder failure failed");
        }
        true
    }

    /// Remove firewall rules and tunnel routes a crashed earlier run left
    /// behind. Only allowed while idle.
    pub async fn recover(&self) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyConnected);
        }
        match self.dns.purge_stale_rules().await {
            Ok(0) => debug!("No stale firewall rules"),
            Ok(removed) => info!(removed, "Removed stale firewall rules"),
            Err(e) => warn!(error = %e, "Could not purge stale firewall rules"),
        }
        self.routing
            .purge_tunnel_routes(self.config.interface.gateway_address)
            .await;
        Ok(())
    }
}
