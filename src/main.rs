//! Full-tunnel proxy client CLI

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use proxytun::events::{BroadcastSink, FanoutSink, LogSink};
use proxytun::{TunnelConfig, TunnelSupervisor, DEFAULT_CONFIG_FILE};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "proxytun")]
#[command(about = "Route all traffic through a SOCKS5/HTTP proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Only validate the proxy and print the report
    #[arg(long)]
    check: bool,

    /// Run a DNS leak test right after connecting
    #[arg(long)]
    leak_test: bool,

    /// Print tunnel events as JSON lines
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG, then RUST_LOG_LEVEL, then --verbose
    let fallback = if cli.verbose { "debug" } else { "info" };
    let default_level = std::env::var("RUST_LOG_LEVEL").unwrap_or_else(|_| fallback.to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.clone()))
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    info!("Loading configuration from: {}", cli.config);
    let config = TunnelConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from: {}", cli.config))?;
    config.validate().context("Invalid configuration")?;

    if cli.check {
        return check(config).await;
    }
    run(config, cli.leak_test, cli.json_events).await
}

/// Validate the proxy without touching the system.
async fn check(config: TunnelConfig) -> Result<()> {
    use proxytun::validator::{validate_with_retry, ProxyValidator, ValidateOptions};

    let validator = ProxyValidator::new(config.validation.clone());
    let opts = ValidateOptions {
        skip_http_probe: config.validation.skip_http_probe,
    };
    let report = match validate_with_retry(&validator, &config.proxy, opts, config.validation.retry_attempts).await {
        Ok(report) => report,
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure.report)?);
            return Err(failure.error).context("Proxy validation failed");
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Connect and keep the tunnel up until Ctrl+C or a fatal fault.
async fn run(config: TunnelConfig, leak_test: bool, json_events: bool) -> Result<()> {
    let broadcast = Arc::new(BroadcastSink::new(64));
    let sink = FanoutSink::new()
        .with(Arc::new(LogSink))
        .with(broadcast.clone());
    if json_events {
        let mut rx = broadcast.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        });
    }

    let leak_interval = config.dns.leak_test_interval_secs.map(Duration::from_secs);
    let proxy = config.proxy.clone();
    let mut supervisor = TunnelSupervisor::builder(config).events(Arc::new(sink)).build();

    if let Err(e) = supervisor.recover().await {
        warn!("Leftover cleanup skipped: {}", e);
    }

    let outcome = match supervisor.connect(proxy).await {
        Ok(outcome) => outcome,
        Err(failure) => {
            error!("{}", failure.user_message());
            return Err(failure).context("Connect failed");
        }
    };
    info!(
        "Connected (session {}, adapter {}, UDP {})",
        outcome.session_id, outcome.interface.resolved_name, outcome.udp_mode
    );

    if leak_test {
        let report = supervisor.run_leak_test().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let mut leak_timer = leak_interval.map(|period| {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
            fault = supervisor.next_fault() => {
                if supervisor.handle_fault(fault).await {
                    error!("Tunnel lost: the forwarder stopped");
                    anyhow::bail!("Forwarder stopped unexpectedly");
                }
            }
            _ = async {
                match leak_timer.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                report_leaks(&supervisor).await;
            }
        }
    }

    supervisor.disconnect().await.context("Disconnect failed")?;
    info!("Tunnel session ended");
    Ok(())
}

async fn report_leaks(supervisor: &TunnelSupervisor) {
    let report = supervisor.run_leak_test().await;
    if report.has_leaks {
        warn!("DNS leak test found untrusted resolvers: {:?}", report.resolved_servers);
    } else {
        info!(
            "DNS leak test: {}/{} passed ({})",
            report.tests_passed, report.total_tests, report.rating
        );
    }
}
