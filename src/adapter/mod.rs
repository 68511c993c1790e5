//! Virtual interface provisioning.
//!
//! An ordered chain of creation strategies is tried until one yields an
//! adapter, then a discovery pass resolves the name and index the OS
//! actually assigned. Every later phase uses the resolved name.

pub mod discovery;
pub mod strategy;
pub mod windows;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::command::{run_with_retry, CommandRunner, CommandSpec};
use crate::config::InterfaceConfig;
use crate::error::{Error, Result};
use crate::types::{CreationMethod, InterfaceRecord};

pub use discovery::{AdapterClassifier, CandidateRank, Discovery, HeuristicClassifier};
pub use strategy::{CreationStrategy, ProvisionContext, StrategyOutcome};
pub use windows::AdapterInfo;

const CONFIGURE_ATTEMPTS: u32 = 3;
const CONFIGURE_BACKOFF: Duration = Duration::from_millis(500);

/// Creates, configures and removes the tunnel adapter.
pub struct InterfaceProvisioner {
    runner: Arc<dyn CommandRunner>,
    config: InterfaceConfig,
    command_timeout: Duration,
    classifier: Arc<dyn AdapterClassifier>,
    strategies: Vec<Box<dyn CreationStrategy>>,
    /// Adapter list taken before the current attempt.
    baseline: Mutex<Vec<AdapterInfo>>,
}

impl InterfaceProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, config: InterfaceConfig, command_timeout: Duration) -> Self {
        Self {
            runner,
            config,
            command_timeout,
            classifier: Arc::new(HeuristicClassifier),
            strategies: strategy::default_chain(),
            baseline: Mutex::new(Vec::new()),
        }
    }

    /// Replace the physical-adapter heuristic.
    pub fn with_classifier(mut self, classifier: Arc<dyn AdapterClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the creation chain.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn CreationStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    fn discovery(&self) -> Discovery<'_> {
        Discovery {
            runner: self.runner.as_ref(),
            classifier: self.classifier.as_ref(),
            poll: Duration::from_millis(self.config.discovery_poll_ms),
            cap: Duration::from_millis(self.config.discovery_cap_ms),
            command_timeout: self.command_timeout,
        }
    }

    fn new_record(&self, requested: &str, method: CreationMethod) -> InterfaceRecord {
        InterfaceRecord {
            requested_name: requested.to_string(),
            resolved_name: requested.to_string(),
            index: None,
            creation_method: method,
            gateway_address: self.config.gateway_address,
            local_address: self.config.local_address,
            subnet_mask: self.config.subnet_mask,
            device_id: None,
            pending: true,
        }
    }

    /// Create or find the adapter.
    ///
    /// Deferred methods return a record with `pending` set; call
    /// [`complete_deferred`](Self::complete_deferred) once the forwarder runs.
    pub async fn provision(&self, requested: &str) -> Result<InterfaceRecord> {
        let discovery = self.discovery();
        let baseline = discovery.snapshot().await;
        *self.baseline.lock() = baseline.clone();

        let ctx = ProvisionContext {
            requested_name: requested,
            config: &self.config,
            runner: self.runner.as_ref(),
            classifier: self.classifier.as_ref(),
            command_timeout: self.command_timeout,
        };

        let mut failures: Vec<String> = Vec::new();
        let mut privilege: Option<Error> = None;

        for strategy in &self.strategies {
            let method = strategy.method();
            let budget = strategy.timeout(&self.config);
            debug!(method = %method, budget_secs = budget.as_secs(), "Trying adapter creation");

            let outcome = match timeout(budget, strategy.attempt(&ctx)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(method = %method, error = %e, "Adapter creation failed");
                    failures.push(format!("{method}: {e}"));
                    if e.is_privilege() && privilege.is_none() {
                        privilege = Some(e);
                    }
                    continue;
                }
                Err(_) => {
                    warn!(method = %method, "Adapter creation timed out after {:?}", budget);
                    failures.push(format!("{method}: timed out"));
                    continue;
                }
            };

            let mut record = self.new_record(requested, outcome.method);
            if method.is_deferred() {
                info!(method = %method, name = %requested, "Adapter creation deferred to forwarder");
                return Ok(record);
            }

            let adapter = match outcome.adapter {
                Some(adapter) => adapter,
                None => match discovery.resolve(requested, &baseline).await {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        warn!(method = %method, error = %e, "Created adapter was not discovered");
                        failures.push(format!("{method}: {e}"));
                        continue;
                    }
                },
            };

            if let Err(e) = self.configure(&mut record, adapter).await {
                self.destroy(&record).await;
                return Err(e);
            }
            return Ok(record);
        }

        Err(privilege.unwrap_or_else(|| {
            Error::Provisioning(format!(
                "All {} creation methods failed ({})",
                self.strategies.len(),
                failures.join("; ")
            ))
        }))
    }

    /// Finish a deferred record after the forwarder created the adapter.
    pub async fn complete_deferred(&self, record: &mut InterfaceRecord) -> Result<()> {
        if !record.pending {
            return Ok(());
        }
        let baseline = self.baseline.lock().clone();
        let adapter = match self.discovery().resolve(&record.requested_name, &baseline).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "Discovery failed, querying the expected name");
                let spec = windows::adapter_by_name(&record.requested_name)
                    .with_timeout(self.command_timeout);
                let out = self.runner.run_checked(&spec).await.map_err(|_| e)?;
                windows::parse_adapters(&out.stdout)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        Error::Provisioning(format!(
                            "Forwarder did not create adapter '{}'",
                            record.requested_name
                        ))
                    })?
            }
        };
        self.configure(record, adapter).await
    }

    /// Adopt the discovered adapter, assign addresses and bring it up.
    async fn configure(&self, record: &mut InterfaceRecord, adapter: AdapterInfo) -> Result<()> {
        if !adapter.name.eq_ignore_ascii_case(&record.requested_name) {
            info!(
                requested = %record.requested_name,
                resolved = %adapter.name,
                "OS assigned a different adapter name"
            );
        }
        record.resolved_name = adapter.name.clone();
        record.index = Some(adapter.index);
        record.device_id = adapter.device_id.clone();

        let name = record.resolved_name.clone();
        let assign = windows::set_static_address(&name, record.local_address, record.subnet_mask)
            .with_timeout(self.command_timeout);
        run_with_retry(self.runner.as_ref(), &assign, CONFIGURE_ATTEMPTS, CONFIGURE_BACKOFF)
            .await
            .map_err(|e| provisioning_error(e, format!("Could not assign address to '{name}'")))?;

        let enable = windows::set_admin_state(&name, true).with_timeout(self.command_timeout);
        run_with_retry(self.runner.as_ref(), &enable, CONFIGURE_ATTEMPTS, CONFIGURE_BACKOFF)
            .await
            .map_err(|e| provisioning_error(e, format!("Could not enable '{name}'")))?;

        let mtu = windows::set_mtu(&name, self.config.mtu).with_timeout(self.command_timeout);
        if let Err(e) = self.runner.run_checked(&mtu).await {
            warn!(iface = %name, error = %e, "Failed to set MTU, continuing anyway");
        }

        record.pending = false;
        info!(
            iface = %name,
            index = adapter.index,
            method = %record.creation_method,
            "Configured {} with IP {}/{}",
            name,
            record.local_address,
            record.prefix_len()
        );
        Ok(())
    }

    /// Disable and remove the adapter. Best-effort; failures are logged.
    pub async fn destroy(&self, record: &InterfaceRecord) {
        let name = record.resolved_name.as_str();
        match record.creation_method {
            CreationMethod::ReuseExisting => {
                // Not ours to remove.
                self.cleanup_step(name, windows::set_dhcp_address(name)).await;
            }
            CreationMethod::TunnelDriver | CreationMethod::VirtualFallback => {
                debug!(iface = %name, "Adapter is removed by the forwarder");
            }
            CreationMethod::NativeApi => {
                self.cleanup_step(name, windows::set_admin_state(name, false)).await;
                self.cleanup_step(name, windows::tapctl_delete(&self.config.tapctl_path, name)).await;
            }
            CreationMethod::Script | CreationMethod::Loopback => {
                if record.pending {
                    return;
                }
                self.cleanup_step(name, windows::set_admin_state(name, false)).await;
                match record.device_id.as_deref() {
                    Some(id) if !id.is_empty() => self.cleanup_step(name, windows::remove_device(id)).await,
                    _ => warn!(iface = %name, "No device id recorded, adapter left disabled"),
                }
            }
        }
        info!(iface = %name, "Adapter released");
    }

    async fn cleanup_step(&self, name: &str, spec: CommandSpec) {
        let spec = spec.with_timeout(self.command_timeout);
        if let Err(e) = self.runner.run_checked(&spec).await {
            warn!(iface = %name, error = %e, "Adapter cleanup step failed");
        }
    }
}

fn provisioning_error(e: Error, context: String) -> Error {
    if e.is_privilege() {
        e
    } else {
        Error::Provisioning(format!("{context}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::{loopback_listing, FakeRunner, BEFORE_LOOPBACK, LOOPBACK_ADAPTER};

    fn provisioner(runner: Arc<FakeRunner>) -> InterfaceProvisioner {
        let config = InterfaceConfig {
            wintun_path: "/nonexistent/wintun.dll".into(),
            ..Default::default()
        };
        InterfaceProvisioner::new(runner, config, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_adapter_is_discovered_and_configured() {
        let runner = Arc::new(FakeRunner::windows_host());
        let record = provisioner(runner.clone()).provision("ProxyTun").await.unwrap();

        assert_eq!(record.creation_method, CreationMethod::NativeApi);
        assert_eq!(record.resolved_name, "ProxyTun");
        assert_eq!(record.index, Some(31));
        assert!(!record.pending);

        let assign = runner.position("set address name=ProxyTun source=static").unwrap();
        let enable = runner.position("admin=enabled").unwrap();
        assert!(assign < enable);
        assert_eq!(runner.count("mtu=1500"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loopback_adapter_with_os_assigned_name() {
        let runner = Arc::new(FakeRunner::windows_host());
        let after = loopback_listing();
        runner
            .fail("tapctl", "tapctl.exe is not recognized as an internal or external command")
            .on("Get-NetAdapter -IncludeHidden", &after)
            .on_once("Get-NetAdapter -IncludeHidden", BEFORE_LOOPBACK)
            .on("Get-NetAdapter -InterfaceIndex 19", LOOPBACK_ADAPTER);

        let provisioner = provisioner(runner.clone());
        let record = provisioner.provision("ProxyTun").await.unwrap();

        assert_eq!(record.creation_method, CreationMethod::Loopback);
        assert_eq!(record.requested_name, "ProxyTun");
        assert_eq!(record.resolved_name, "Ethernet 7");
        assert_eq!(record.index, Some(19));
        assert_eq!(runner.count("netloop.inf"), 1);
        assert_eq!(runner.count("name=Ethernet 7 source=static"), 1);
        assert_eq!(runner.count("name=ProxyTun source=static"), 0);

        provisioner.destroy(&record).await;
        let disable = runner.position("name=Ethernet 7 admin=disabled").unwrap();
        let remove = runner.position(r"pnputil /remove-device ROOT\NET\0000").unwrap();
        assert!(disable < remove);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_loopback_adapter_wins_over_existing_virtual_adapter() {
        let runner = Arc::new(FakeRunner::windows_host());
        let after = loopback_listing();
        // Baseline and the first two polls still show the old listing.
        runner
            .fail("tapctl", "tapctl.exe is not recognized as an internal or external command")
            .on("Get-NetAdapter -IncludeHidden", &after)
            .on_once("Get-NetAdapter -IncludeHidden", BEFORE_LOOPBACK)
            .on_once("Get-NetAdapter -IncludeHidden", BEFORE_LOOPBACK)
            .on_once("Get-NetAdapter -IncludeHidden", BEFORE_LOOPBACK)
            .on("Get-NetAdapter -InterfaceIndex 44", BEFORE_LOOPBACK)
            .on("Get-NetAdapter -InterfaceIndex 19", LOOPBACK_ADAPTER);

        let record = provisioner(runner.clone()).provision("ProxyTun").await.unwrap();

        assert_eq!(record.creation_method, CreationMethod::Loopback);
        assert_eq!(record.resolved_name, "Ethernet 7");
        assert_eq!(runner.count("Get-NetAdapter -IncludeHidden"), 4);
        assert_eq!(runner.count("vEthernet (WSL)"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_virtual_adapter_is_never_adopted() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner
            .fail("tapctl", "tapctl.exe is not recognized as an internal or external command")
            .on("Get-NetAdapter -IncludeHidden", BEFORE_LOOPBACK)
            .on("Get-NetAdapter -InterfaceIndex 44", BEFORE_LOOPBACK);

        let provisioner = provisioner(runner.clone());
        let record = provisioner.provision("ProxyTun").await.unwrap();

        // The loopback never showed up, so the chain moved on.
        assert_eq!(runner.count("netloop.inf"), 1);
        assert_eq!(record.creation_method, CreationMethod::VirtualFallback);
        assert!(record.pending);
        assert_eq!(record.resolved_name, "ProxyTun");

        provisioner.destroy(&record).await;
        assert_eq!(runner.count("vEthernet (WSL)"), 0);
        assert_eq!(runner.count("ROOT\\VMS_MP"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_strategy_is_skipped() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner.hang("tapctl");
        let provisioner = provisioner(runner.clone());

        let started = tokio::time::Instant::now();
        let record = provisioner.provision("ProxyTun").await.unwrap();
        // tapctl burns its 15s budget; the loopback installer then succeeds.
        assert_eq!(record.creation_method, CreationMethod::Loopback);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_adapter_completes_after_forwarder_start() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner
            .fail("tapctl", "failed")
            .fail("netloop.inf", "devcon failed");
        let provisioner = provisioner(runner.clone());

        let mut record = provisioner.provision("ProxyTun").await.unwrap();
        assert_eq!(record.creation_method, CreationMethod::VirtualFallback);
        assert!(record.pending);
        assert_eq!(record.index, None);
        assert_eq!(runner.count("source=static"), 0);

        provisioner.complete_deferred(&mut record).await.unwrap();
        assert!(!record.pending);
        assert_eq!(record.index, Some(31));
        assert_eq!(runner.count("name=ProxyTun source=static"), 1);

        runner.clear_log();
        provisioner.destroy(&record).await;
        assert!(runner.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_assignment_retries_then_rolls_back() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner.fail_once("source=static", "The interface is not ready");
        let record = provisioner(runner.clone()).provision("ProxyTun").await.unwrap();
        assert_eq!(runner.count("source=static"), 2);
        assert!(!record.pending);

        let runner = Arc::new(FakeRunner::windows_host());
        runner.fail("source=static", "The filename, directory name, or volume label syntax is incorrect.");
        let err = provisioner(runner.clone()).provision("ProxyTun").await.unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert_eq!(runner.count("source=static"), CONFIGURE_ATTEMPTS as usize);
        assert_eq!(runner.count("tapctl.exe delete ProxyTun"), 1);
    }

    #[tokio::test]
    async fn test_privilege_error_surfaces_when_nothing_works() {
        let runner = Arc::new(FakeRunner::new());
        runner.fail("", "Access is denied.");
        let provisioner = provisioner(runner).with_strategies(vec![
            Box::new(strategy::NativeApi),
            Box::new(strategy::Loopback),
        ]);
        let err = provisioner.provision("ProxyTun").await.unwrap_err();
        assert!(err.is_privilege());
    }
}
