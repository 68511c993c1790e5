//! Configuration management for the tunnel client

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{mask_to_prefix, ProxyEndpoint, ProxyKind};
use crate::{DEFAULT_INTERFACE_NAME, FIREWALL_RULE_PREFIX};

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Upstream proxy
    pub proxy: ProxyEndpoint,

    /// Virtual adapter options
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Forwarding subprocess options
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// DNS leak protection options
    #[serde(default)]
    pub dns: DnsConfig,

    /// Per-phase budgets
    #[serde(default)]
    pub timeouts: PhaseTimeouts,

    /// Health monitor options
    #[serde(default)]
    pub health: HealthConfig,

    /// Proxy probe options
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Virtual adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Requested adapter name; the OS may assign another one
    #[serde(default = "default_interface_name")]
    pub name: String,

    /// Static address assigned to the adapter
    #[serde(default = "default_local_address")]
    pub local_address: Ipv4Addr,

    /// Next hop used for tunnel routes
    #[serde(default = "default_gateway_address")]
    pub gateway_address: Ipv4Addr,

    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: Ipv4Addr,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Adapter management tool used by the native strategy
    #[serde(default = "default_tapctl_path")]
    pub tapctl_path: PathBuf,

    /// Device installer used by the loopback strategy
    #[serde(default = "default_devcon_path")]
    pub devcon_path: PathBuf,

    /// Tunnel driver library the forwarder loads
    #[serde(default = "default_wintun_path")]
    pub wintun_path: PathBuf,

    /// Optional PowerShell script for the script strategy
    #[serde(default)]
    pub creation_script: Option<PathBuf>,

    /// Budget for a single creation strategy (seconds)
    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout_secs: u64,

    /// Budget for the loopback strategy, which installs a driver (seconds)
    #[serde(default = "default_loopback_timeout")]
    pub loopback_timeout_secs: u64,

    /// Discovery polling interval (milliseconds)
    #[serde(default = "default_discovery_poll_ms")]
    pub discovery_poll_ms: u64,

    /// Discovery hard cap (milliseconds)
    #[serde(default = "default_discovery_cap_ms")]
    pub discovery_cap_ms: u64,
}

/// Forwarding subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Path to the packet forwarding binary
    #[serde(default = "default_forwarder_program")]
    pub program: PathBuf,

    /// Argument template; `{device}`, `{proxy}`, `{mtu}`, `{udp_mode}` and
    /// `{log_level}` are substituted at launch
    #[serde(default = "default_forwarder_args")]
    pub args: Vec<String>,

    /// Extra arguments appended when the proxy cannot relay UDP
    #[serde(default)]
    pub tcp_only_args: Vec<String>,

    #[serde(default = "default_forwarder_log_level")]
    pub log_level: String,

    /// Time the process must survive before startup counts as successful (ms)
    #[serde(default = "default_forwarder_settle_ms")]
    pub settle_ms: u64,
}

/// DNS leak protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_primary")]
    pub primary: Ipv4Addr,

    #[serde(default = "default_dns_secondary")]
    pub secondary: Ipv4Addr,

    #[serde(default = "default_dns_backup")]
    pub backup: Ipv4Addr,

    #[serde(default = "default_dns_ipv6")]
    pub ipv6: Vec<Ipv6Addr>,

    /// Public resolvers pulled into the tunnel with host routes
    #[serde(default = "default_resolver_routes")]
    pub resolver_routes: Vec<Ipv4Addr>,

    /// Block UDP/TCP 53 outside the tunnel
    #[serde(default = "default_true")]
    pub block_plain_dns: bool,

    /// Block DNS-over-TLS (853) outside the tunnel
    #[serde(default = "default_true")]
    pub block_dot: bool,

    /// Block DNS-over-HTTPS providers outside the tunnel
    #[serde(default = "default_true")]
    pub block_doh: bool,

    /// Deterministic prefix for firewall rule names
    #[serde(default = "default_rule_prefix")]
    pub firewall_rule_prefix: String,

    /// Domains resolved by the leak test
    #[serde(default = "default_leak_test_domains")]
    pub leak_test_domains: Vec<String>,

    /// Trace endpoint used to corroborate egress identity
    #[serde(default = "default_trace_url")]
    pub trace_url: String,

    /// Run the leak test periodically while connected (seconds)
    #[serde(default)]
    pub leak_test_interval_secs: Option<u64>,
}

/// Per-phase timeouts (seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    #[serde(default = "default_validation_timeout")]
    pub validation: u64,
    #[serde(default = "default_provisioning_timeout")]
    pub provisioning: u64,
    #[serde(default = "default_forwarder_timeout")]
    pub forwarder: u64,
    #[serde(default = "default_routing_timeout")]
    pub routing: u64,
    #[serde(default = "default_dns_timeout")]
    pub dns: u64,
    /// Each teardown step
    #[serde(default = "default_teardown_timeout")]
    pub teardown_step: u64,
    /// A single OS command
    #[serde(default = "default_command_timeout")]
    pub command: u64,
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// IP echo services, tried in order
    #[serde(default = "default_ip_services")]
    pub ip_services: Vec<String>,

    /// Per-request timeout (seconds)
    #[serde(default = "default_ip_fetch_timeout")]
    pub request_timeout_secs: u64,
}

/// Proxy probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Raw TCP connect budget (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Host reached through the SOCKS5 CONNECT probe
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Echo endpoint fetched through the proxy
    #[serde(default = "default_echo_url")]
    pub echo_url: String,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default)]
    pub skip_http_probe: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_interface_name() -> String {
    DEFAULT_INTERFACE_NAME.to_string()
}
fn default_local_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 255, 0, 2)
}
fn default_gateway_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 255, 0, 1)
}
fn default_subnet_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}
fn default_mtu() -> u16 {
    1500
}
fn default_tapctl_path() -> PathBuf {
    PathBuf::from("tapctl.exe")
}
fn default_devcon_path() -> PathBuf {
    PathBuf::from("devcon.exe")
}
fn default_wintun_path() -> PathBuf {
    PathBuf::from("wintun.dll")
}
fn default_strategy_timeout() -> u64 {
    15
}
fn default_loopback_timeout() -> u64 {
    30
}
fn default_discovery_poll_ms() -> u64 {
    200
}
fn default_discovery_cap_ms() -> u64 {
    3000
}
fn default_forwarder_program() -> PathBuf {
    PathBuf::from("tun2socks.exe")
}
fn default_forwarder_args() -> Vec<String> {
    [
        "-device",
        "tun://{device}",
        "-proxy",
        "{proxy}",
        "-mtu",
        "{mtu}",
        "-loglevel",
        "{log_level}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_forwarder_log_level() -> String {
    "info".to_string()
}
fn default_forwarder_settle_ms() -> u64 {
    1500
}
fn default_dns_primary() -> Ipv4Addr {
    Ipv4Addr::new(1, 1, 1, 1)
}
fn default_dns_secondary() -> Ipv4Addr {
    Ipv4Addr::new(8, 8, 8, 8)
}
fn default_dns_backup() -> Ipv4Addr {
    Ipv4Addr::new(9, 9, 9, 9)
}
fn default_dns_ipv6() -> Vec<Ipv6Addr> {
    vec![
        Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111),
        Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888),
    ]
}
fn default_resolver_routes() -> Vec<Ipv4Addr> {
    vec![
        Ipv4Addr::new(1, 1, 1, 1),
        Ipv4Addr::new(1, 0, 0, 1),
        Ipv4Addr::new(8, 8, 8, 8),
        Ipv4Addr::new(8, 8, 4, 4),
        Ipv4Addr::new(9, 9, 9, 9),
        Ipv4Addr::new(149, 112, 112, 112),
        Ipv4Addr::new(208, 67, 222, 222),
        Ipv4Addr::new(208, 67, 220, 220),
        Ipv4Addr::new(94, 140, 14, 14),
        Ipv4Addr::new(94, 140, 15, 15),
    ]
}
fn default_rule_prefix() -> String {
    FIREWALL_RULE_PREFIX.to_string()
}
fn default_leak_test_domains() -> Vec<String> {
    vec![
        "example.com".to_string(),
        "wikipedia.org".to_string(),
        "cloudflare.com".to_string(),
    ]
}
fn default_trace_url() -> String {
    "http://1.1.1.1/cdn-cgi/trace".to_string()
}
fn default_validation_timeout() -> u64 {
    10
}
fn default_provisioning_timeout() -> u64 {
    30
}
fn default_forwarder_timeout() -> u64 {
    30
}
fn default_routing_timeout() -> u64 {
    45
}
fn default_dns_timeout() -> u64 {
    60
}
fn default_teardown_timeout() -> u64 {
    20
}
fn default_command_timeout() -> u64 {
    15
}
fn default_health_interval() -> u64 {
    30
}
fn default_ip_services() -> Vec<String> {
    vec![
        "http://api.ipify.org/".to_string(),
        "http://icanhazip.com/".to_string(),
        "http://ifconfig.me/ip".to_string(),
    ]
}
fn default_ip_fetch_timeout() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_probe_host() -> String {
    "www.google.com".to_string()
}
fn default_probe_port() -> u16 {
    80
}
fn default_echo_url() -> String {
    "http://api.ipify.org/".to_string()
}
fn default_retry_attempts() -> u32 {
    2
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            local_address: default_local_address(),
            gateway_address: default_gateway_address(),
            subnet_mask: default_subnet_mask(),
            mtu: default_mtu(),
            tapctl_path: default_tapctl_path(),
            devcon_path: default_devcon_path(),
            wintun_path: default_wintun_path(),
            creation_script: None,
            strategy_timeout_secs: default_strategy_timeout(),
            loopback_timeout_secs: default_loopback_timeout(),
            discovery_poll_ms: default_discovery_poll_ms(),
            discovery_cap_ms: default_discovery_cap_ms(),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            program: default_forwarder_program(),
            args: default_forwarder_args(),
            tcp_only_args: Vec::new(),
            log_level: default_forwarder_log_level(),
            settle_ms: default_forwarder_settle_ms(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            primary: default_dns_primary(),
            secondary: default_dns_secondary(),
            backup: default_dns_backup(),
            ipv6: default_dns_ipv6(),
            resolver_routes: default_resolver_routes(),
            block_plain_dns: true,
            block_dot: true,
            block_doh: true,
            firewall_rule_prefix: default_rule_prefix(),
            leak_test_domains: default_leak_test_domains(),
            trace_url: default_trace_url(),
            leak_test_interval_secs: None,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            validation: default_validation_timeout(),
            provisioning: default_provisioning_timeout(),
            forwarder: default_forwarder_timeout(),
            routing: default_routing_timeout(),
            dns: default_dns_timeout(),
            teardown_step: default_teardown_timeout(),
            command: default_command_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            ip_services: default_ip_services(),
            request_timeout_secs: default_ip_fetch_timeout(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            probe_host: default_probe_host(),
            probe_port: default_probe_port(),
            echo_url: default_echo_url(),
            retry_attempts: default_retry_attempts(),
            skip_http_probe: false,
        }
    }
}

impl DnsConfig {
    /// The trusted resolver set: primary, secondary, backup and IPv6.
    pub fn trusted_servers(&self) -> Vec<IpAddr> {
        let mut servers: Vec<IpAddr> = vec![
            self.primary.into(),
            self.secondary.into(),
            self.backup.into(),
        ];
        servers.extend(self.ipv6.iter().map(|v6| IpAddr::V6(*v6)));
        servers.dedup();
        servers
    }

    /// The two resolvers kept by the simplified redirection.
    pub fn essential_servers(&self) -> [Ipv4Addr; 2] {
        [self.primary, self.secondary]
    }
}

impl PhaseTimeouts {
    pub fn validation(&self) -> Duration {
        Duration::from_secs(self.validation)
    }
    pub fn provisioning(&self) -> Duration {
        Duration::from_secs(self.provisioning)
    }
    pub fn forwarder(&self) -> Duration {
        Duration::from_secs(self.forwarder)
    }
    pub fn routing(&self) -> Duration {
        Duration::from_secs(self.routing)
    }
    pub fn dns(&self) -> Duration {
        Duration::from_secs(self.dns)
    }
    pub fn teardown_step(&self) -> Duration {
        Duration::from_secs(self.teardown_step)
    }
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command)
    }
}

impl TunnelConfig {
    /// Create a configuration with defaults for everything but the proxy
    pub fn new(proxy: ProxyEndpoint) -> Self {
        Self {
            proxy,
            interface: InterfaceConfig::default(),
            forwarder: ForwarderConfig::default(),
            dns: DnsConfig::default(),
            timeouts: PhaseTimeouts::default(),
            health: HealthConfig::default(),
            validation: ValidationConfig::default(),
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: TunnelConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;

        if self.interface.name.trim().is_empty() {
            anyhow::bail!("Interface name cannot be empty");
        }

        let prefix = mask_to_prefix(self.interface.subnet_mask);
        let mask_bits = u32::from(self.interface.subnet_mask);
        if prefix == 0 || mask_bits.leading_ones() != u32::from(prefix) {
            anyhow::bail!("Invalid subnet mask: {}", self.interface.subnet_mask);
        }

        let net = |ip: Ipv4Addr| u32::from(ip) & mask_bits;
        if net(self.interface.local_address) != net(self.interface.gateway_address) {
            anyhow::bail!(
                "Local address {} and gateway {} are not in the same subnet",
                self.interface.local_address,
                self.interface.gateway_address
            );
        }
        if self.interface.local_address == self.interface.gateway_address {
            anyhow::bail!("Local address and gateway must differ");
        }

        if !(576..=9000).contains(&self.interface.mtu) {
            anyhow::bail!("MTU must be between 576 and 9000");
        }

        if self.forwarder.args.is_empty() {
            anyhow::bail!("Forwarder argument template cannot be empty");
        }
        if !self.forwarder.args.iter().any(|a| a.contains("{device}")) {
            anyhow::bail!("Forwarder arguments must reference {{device}}");
        }

        if self.dns.firewall_rule_prefix.trim().is_empty() {
            anyhow::bail!("Firewall rule prefix cannot be empty");
        }

        if self.health.interval_secs == 0 {
            anyhow::bail!("Health interval cannot be zero");
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("validation", t.validation),
            ("provisioning", t.provisioning),
            ("forwarder", t.forwarder),
            ("routing", t.routing),
            ("dns", t.dns),
            ("teardown_step", t.teardown_step),
            ("command", t.command),
        ] {
            if value == 0 {
                anyhow::bail!("Timeout `{}` cannot be zero", name);
            }
        }

        if self.validation.retry_attempts == 0 {
            anyhow::bail!("Validation retry attempts cannot be zero");
        }

        Ok(())
    }

    /// Shortcut used by callers that only know the proxy.
    pub fn proxy_kind(&self) -> ProxyKind {
        self.proxy.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample() -> TunnelConfig {
        TunnelConfig::new(ProxyEndpoint::new("203.0.113.9", 1080, ProxyKind::Socks5))
    }

    #[test]
    fn test_config_defaults() {
        let config = sample();
        assert_eq!(config.interface.name, DEFAULT_INTERFACE_NAME);
        assert_eq!(config.timeouts.routing(), Duration::from_secs(45));
        assert_eq!(config.health.interval_secs, 30);
        assert_eq!(config.validation.retry_attempts, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = sample();
        config.interface.gateway_address = Ipv4Addr::new(192, 168, 1, 1);
        assert!(config.validate().is_err());

        let mut config = sample();
        config.interface.subnet_mask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(config.validate().is_err());

        let mut config = sample();
        config.proxy.port = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.timeouts.dns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_json() -> Result<()> {
        let json = r#"{ "proxy": { "host": "198.51.100.4", "port": 3128, "type": "http",
                        "username": "bob", "password": "secret" } }"#;
        let config: TunnelConfig = serde_json::from_str(json)?;
        assert_eq!(config.proxy.kind, ProxyKind::Http);
        assert_eq!(config.proxy.credentials(), Some(("bob", "secret")));
        assert_eq!(config.dns.primary, Ipv4Addr::new(1, 1, 1, 1));
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_trusted_servers() {
        let config = sample();
        let trusted = config.dns.trusted_servers();
        assert_eq!(trusted.len(), 5);
        assert!(trusted.contains(&IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))));
    }

    #[test]
    fn test_config_file_operations() -> Result<()> {
        let config = sample();

        let temp_file = NamedTempFile::new()?;
        config.to_file(temp_file.path())?;

        let loaded_config = TunnelConfig::from_file(temp_file.path())?;
        assert_eq!(config.proxy, loaded_config.proxy);
        assert_eq!(config.interface.mtu, loaded_config.interface.mtu);

        Ok(())
    }
}
