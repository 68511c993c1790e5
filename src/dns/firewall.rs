//! Outbound firewall rules that stop DNS from bypassing the tunnel.
//!
//! Every rule name starts with a fixed prefix so rules left behind by a
//! crashed session can be found and removed on the next start.

use std::fmt;
use std::net::Ipv4Addr;

use crate::command::{ps_quote, CommandSpec};
use crate::config::DnsConfig;

/// Addresses of well-known DNS-over-HTTPS endpoints
/// (cloudflare-dns.com, dns.google, dns.quad9.net, doh.opendns.com,
/// dns.adguard.com, dns.nextdns.io).
pub const DOH_PROVIDERS: &[Ipv4Addr] = &[
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
    Ipv4Addr::new(104, 16, 248, 249),
    Ipv4Addr::new(104, 16, 249, 249),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(9, 9, 9, 9),
    Ipv4Addr::new(149, 112, 112, 112),
    Ipv4Addr::new(146, 112, 41, 2),
    Ipv4Addr::new(94, 140, 14, 14),
    Ipv4Addr::new(94, 140, 15, 15),
    Ipv4Addr::new(45, 90, 28, 0),
    Ipv4Addr::new(45, 90, 30, 0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// One outbound block rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRule {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    /// Restrict the rule to these destinations; `None` blocks every address.
    pub remote: Option<Vec<Ipv4Addr>>,
}

/// The rules selected by the DNS configuration.
pub fn block_rules(config: &DnsConfig) -> Vec<BlockRule> {
    let prefix = &config.firewall_rule_prefix;
    let mut rules = Vec::new();
    if config.block_plain_dns {
        rules.push(BlockRule {
            name: format!("{prefix}Block-UDP53"),
            protocol: Protocol::Udp,
            port: 53,
            remote: None,
        });
        rules.push(BlockRule {
            name: format!("{prefix}Block-TCP53"),
            protocol: Protocol::Tcp,
            port: 53,
            remote: None,
        });
    }
    if config.block_dot {
        rules.push(BlockRule {
            name: format!("{prefix}Block-DoT853"),
            protocol: Protocol::Tcp,
            port: 853,
            remote: None,
        });
    }
    if config.block_doh {
        rules.push(BlockRule {
            name: format!("{prefix}Block-DoH443"),
            protocol: Protocol::Tcp,
            port: 443,
            remote: Some(DOH_PROVIDERS.to_vec()),
        });
    }
    rules
}

/// Create `rule` on the given (non-tunnel) interfaces.
pub fn add_rule(rule: &BlockRule, interfaces: &[String]) -> CommandSpec {
    let aliases = interfaces.iter().map(|a| ps_quote(a)).collect::<Vec<_>>().join(",");
    let remote = match &rule.remote {
        Some(list) => format!(
            " -RemoteAddress {}",
            list.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(",")
        ),
        None => String::new(),
    };
    let script = format!(
        "New-NetFirewallRule -DisplayName {} -Direction Outbound -Action Block -Protocol {} -RemotePort {}{remote} -InterfaceAlias {aliases} -Profile Any -ErrorAction Stop | Out-Null",
        ps_quote(&rule.name),
        rule.protocol,
        rule.port,
    );
    CommandSpec::powershell(script)
}

pub fn remove_rule(name: &str) -> CommandSpec {
    CommandSpec::powershell(format!(
        "Remove-NetFirewallRule -DisplayName {} -ErrorAction Stop",
        ps_quote(name)
    ))
}

/// Remove every rule carrying `prefix`. Prints the number removed.
pub fn purge_rules(prefix: &str) -> CommandSpec {
    let pattern = ps_quote(&format!("{prefix}*"));
    CommandSpec::powershell(format!(
        "$r = @(Get-NetFirewallRule -DisplayName {pattern} -ErrorAction SilentlyContinue); \
$r | Remove-NetFirewallRule -ErrorAction SilentlyContinue; $r.Count"
    ))
}

/// A rule that is already gone.
pub fn is_missing_rule(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no msft_netfirewallrule objects found") || lower.contains("not found")
}
