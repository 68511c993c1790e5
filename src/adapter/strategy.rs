//! Ordered adapter creation strategies.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::discovery::AdapterClassifier;
use super::windows::{self, AdapterInfo};
use crate::command::CommandRunner;
use crate::config::InterfaceConfig;
use crate::error::{Error, Result};
use crate::types::CreationMethod;

/// Everything a strategy may use.
pub struct ProvisionContext<'a> {
    pub requested_name: &'a str,
    pub config: &'a InterfaceConfig,
    pub runner: &'a dyn CommandRunner,
    pub classifier: &'a dyn AdapterClassifier,
    pub command_timeout: Duration,
}

/// A successful attempt.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub method: CreationMethod,
    /// Adapter the strategy already identified, if any.
    pub adapter: Option<AdapterInfo>,
}

impl StrategyOutcome {
    fn created(method: CreationMethod) -> Self {
        Self {
            method,
            adapter: None,
        }
    }
}

#[async_trait]
pub trait CreationStrategy: Send + Sync {
    fn method(&self) -> CreationMethod;

    fn timeout(&self, config: &InterfaceConfig) -> Duration {
        Duration::from_secs(config.strategy_timeout_secs)
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome>;
}

/// The default chain, in preference order.
pub fn default_chain() -> Vec<Box<dyn CreationStrategy>> {
    vec![
        Box::new(ReuseExisting),
        Box::new(NativeApi),
        Box::new(Script),
        Box::new(Loopback),
        Box::new(TunnelDriver),
        Box::new(VirtualFallback),
    ]
}

/// Use an adapter that already carries the requested name.
pub struct ReuseExisting;

#[async_trait]
impl CreationStrategy for ReuseExisting {
    fn method(&self) -> CreationMethod {
        CreationMethod::ReuseExisting
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        let spec = windows::adapter_by_name(ctx.requested_name).with_timeout(ctx.command_timeout);
        let out = ctx.runner.run_checked(&spec).await?;
        let adapter = windows::parse_adapters(&out.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Provisioning(format!("No adapter named '{}'", ctx.requested_name))
            })?;
        if ctx.classifier.is_physical(&adapter) {
            return Err(Error::Provisioning(format!(
                "'{}' is a physical adapter ({})",
                adapter.name,
                adapter.description()
            )));
        }
        debug!(name = %adapter.name, index = adapter.index, "Reusing existing adapter");
        Ok(StrategyOutcome {
            method: self.method(),
            adapter: Some(adapter),
        })
    }
}

/// Create a tunnel adapter through the adapter management tool.
pub struct NativeApi;

#[async_trait]
impl CreationStrategy for NativeApi {
    fn method(&self) -> CreationMethod {
        CreationMethod::NativeApi
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        let spec = windows::tapctl_create(&ctx.config.tapctl_path, ctx.requested_name)
            .with_timeout(ctx.command_timeout);
        ctx.runner.run_checked(&spec).await?;
        Ok(StrategyOutcome::created(self.method()))
    }
}

/// Run a user-supplied PowerShell creation script.
pub struct Script;

#[async_trait]
impl CreationStrategy for Script {
    fn method(&self) -> CreationMethod {
        CreationMethod::Script
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        let script = ctx
            .config
            .creation_script
            .as_deref()
            .ok_or_else(|| Error::Provisioning("No creation script configured".to_string()))?;
        if !tokio::fs::try_exists(script).await.unwrap_or(false) {
            return Err(Error::Provisioning(format!(
                "Creation script not found: {}",
                script.display()
            )));
        }
        let spec = windows::run_script(script, ctx.requested_name).with_timeout(ctx.command_timeout);
        ctx.runner.run_checked(&spec).await?;
        Ok(StrategyOutcome::created(self.method()))
    }
}

/// Install a Microsoft loopback adapter. The OS names it "Ethernet N".
pub struct Loopback;

#[async_trait]
impl CreationStrategy for Loopback {
    fn method(&self) -> CreationMethod {
        CreationMethod::Loopback
    }

    fn timeout(&self, config: &InterfaceConfig) -> Duration {
        Duration::from_secs(config.loopback_timeout_secs)
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        let budget = self.timeout(ctx.config);
        let spec = windows::install_loopback(&ctx.config.devcon_path).with_timeout(budget);
        ctx.runner.run_checked(&spec).await?;
        Ok(StrategyOutcome::created(self.method()))
    }
}

/// The forwarder creates a driver adapter itself when it starts.
pub struct TunnelDriver;

#[async_trait]
impl CreationStrategy for TunnelDriver {
    fn method(&self) -> CreationMethod {
        CreationMethod::TunnelDriver
    }

    async fn attempt(&self, ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        let driver = &ctx.config.wintun_path;
        if !tokio::fs::try_exists(driver).await.unwrap_or(false) {
            return Err(Error::Provisioning(format!(
                "Tunnel driver not found: {}",
                driver.display()
            )));
        }
        Ok(StrategyOutcome::created(self.method()))
    }
}

/// Last resort: record the expected name and let the forwarder create it.
pub struct VirtualFallback;

#[async_trait]
impl CreationStrategy for VirtualFallback {
    fn method(&self) -> CreationMethod {
        CreationMethod::VirtualFallback
    }

    async fn attempt(&self, _ctx: &ProvisionContext<'_>) -> Result<StrategyOutcome> {
        Ok(StrategyOutcome::created(self.method()))
    }
}
