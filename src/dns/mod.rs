//! DNS leak protection.
//!
//! [`DnsLeakGuard::secure`] points the tunnel adapter and the other active
//! interfaces at trusted resolvers, pulls well-known resolvers into the
//! tunnel with host routes and blocks direct DNS, DoT and DoH egress at the
//! firewall. Everything it applies is recorded on the session and
//! [`DnsLeakGuard::release`] removes exactly that.

pub mod firewall;
pub mod leak_test;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{run_with_retry, CommandRunner, CommandSpec};
use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::protocol::http::Fetcher;
use crate::routing::{install_route, remove_route};
use crate::supervisor::TunnelSession;
use crate::types::{AddedRoute, AddressFamily, DnsSnapshot, DnsSource, RouteBackup, RouteKind};

pub use leak_test::{LeakRating, LeakSubTest, LeakTestReport};

/// `Alias|Family|servers|source`. A `NameServer` registry value means the
/// servers were set by hand; otherwise they came from DHCP.
const DNS_SNAPSHOT_SCRIPT: &str = concat!(
    "Get-DnsClientServerAddress -ErrorAction SilentlyContinue | ForEach-Object { ",
    "$svc = if ($_.AddressFamily -eq 23) { 'Tcpip6' } else { 'Tcpip' }; ",
    "$guid = (Get-NetAdapter -InterfaceIndex $_.InterfaceIndex -IncludeHidden -ErrorAction SilentlyContinue).InterfaceGuid; ",
    "$ns = if ($guid) { (Get-ItemProperty -Path ",
    r#""HKLM:\SYSTEM\CurrentControlSet\Services\$svc\Parameters\Interfaces\$guid""#,
    " -Name NameServer -ErrorAction SilentlyContinue).NameServer }; ",
    "$src = if ($ns) { 'static' } else { 'dhcp' }; ",
    r#""$($_.InterfaceAlias)|$($_.AddressFamily)|$($_.ServerAddresses -join ',')|$src" }"#,
);

const SET_ATTEMPTS: u32 = 3;
const SET_BACKOFF: Duration = Duration::from_millis(300);

pub fn snapshot_query() -> CommandSpec {
    CommandSpec::powershell(DNS_SNAPSHOT_SCRIPT)
}

/// IPv4 DNS servers of one adapter, comma separated.
pub fn adapter_dns_query(alias: &str) -> CommandSpec {
    CommandSpec::powershell(format!(
        "(Get-DnsClientServerAddress -InterfaceAlias {} -AddressFamily IPv4 -ErrorAction Stop).ServerAddresses -join ','",
        crate::command::ps_quote(alias)
    ))
}

pub fn flush_cache() -> CommandSpec {
    CommandSpec::new("ipconfig", ["/flushdns"])
}

/// `netsh` commands that make `servers` the ordered DNS list of `alias`.
pub fn set_servers(alias: &str, family: AddressFamily, servers: &[IpAddr]) -> Vec<CommandSpec> {
    servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            let mut args = vec![
                "interface".to_string(),
                family.netsh_name().to_string(),
            ];
            if i == 0 {
                args.extend([
                    "set".to_string(),
                    "dnsservers".to_string(),
                    format!("name={alias}"),
                    "static".to_string(),
                    server.to_string(),
                    "primary".to_string(),
                ]);
            } else {
                args.extend([
                    "add".to_string(),
                    "dnsservers".to_string(),
                    format!("name={alias}"),
                    server.to_string(),
                    format!("index={}", i + 1),
                ]);
            }
            args.push("validate=no".to_string());
            CommandSpec::netsh(args)
        })
        .collect()
}

pub fn reset_servers(alias: &str, family: AddressFamily) -> CommandSpec {
    CommandSpec::netsh([
        "interface".to_string(),
        family.netsh_name().to_string(),
        "set".to_string(),
        "dnsservers".to_string(),
        format!("name={alias}"),
        "source=dhcp".to_string(),
    ])
}

/// Parse `Alias|Family|server,server|source` lines. The family is either
/// the numeric address family (2, 23) or its name. Without a source column
/// a non-empty server list is taken as static.
pub fn parse_snapshot(text: &str) -> Vec<DnsSnapshot> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(4, '|');
            let interface = parts.next()?.trim();
            if interface.is_empty() {
                return None;
            }
            let family = match parts.next()?.trim() {
                "2" | "IPv4" => AddressFamily::V4,
                "23" | "IPv6" => AddressFamily::V6,
                _ => return None,
            };
            let servers = parse_server_list(parts.next().unwrap_or(""));
            let source = match parts.next().map(|s| s.trim().to_ascii_lowercase()).as_deref() {
                Some("static") => DnsSource::Static,
                Some("dhcp") => DnsSource::Dhcp,
                _ if servers.is_empty() => DnsSource::Dhcp,
                _ => DnsSource::Static,
            };
            Some(DnsSnapshot {
                interface: interface.to_string(),
                family,
                servers,
                source,
            })
        })
        .collect()
}

pub fn parse_server_list(text: &str) -> Vec<IpAddr> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

/// Interfaces other than the tunnel whose DNS must be overridden.
fn other_interfaces(snapshots: &[DnsSnapshot], tunnel_alias: &str) -> Vec<String> {
    let mut aliases: Vec<String> = Vec::new();
    for snap in snapshots.iter().filter(|s| s.family == AddressFamily::V4) {
        let alias = snap.interface.as_str();
        if alias.eq_ignore_ascii_case(tunnel_alias) || alias.to_lowercase().starts_with("loopback") {
            continue;
        }
        if !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)) {
            aliases.push(alias.to_string());
        }
    }
    aliases
}

fn dns_error(e: Error, context: &str) -> Error {
    match e {
        Error::Privilege { .. } | Error::Timeout { .. } => e,
        other => Error::dns(format!("{context}: {other}")),
    }
}

/// Owns every DNS client and firewall mutation of a session.
pub struct DnsLeakGuard {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
    config: DnsConfig,
    command_timeout: Duration,
}

impl DnsLeakGuard {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn Fetcher>,
        config: DnsConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            fetcher,
            config,
            command_timeout,
        }
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    fn spec(&self, spec: CommandSpec) -> CommandSpec {
        spec.with_timeout(self.command_timeout)
    }

    fn trusted_v4(&self) -> Vec<IpAddr> {
        vec![
            self.config.primary.into(),
            self.config.secondary.into(),
            self.config.backup.into(),
        ]
    }

    /// DNS servers of every interface. Empty when the query fails.
    pub async fn snapshot(&self) -> Vec<DnsSnapshot> {
        match self.runner.run_checked(&self.spec(snapshot_query())).await {
            Ok(out) => parse_snapshot(&out.stdout),
            Err(e) => {
                warn!(error = %e, "Could not snapshot DNS settings; release will reset to automatic");
                Vec::new()
            }
        }
    }

    /// Force resolution through the trusted resolvers.
    ///
    /// Hardening (resolver host routes and firewall rules) is skipped for
    /// sessions that fell back to simplified redirection.
    pub async fn secure(&self, session: &mut TunnelSession) -> Result<()> {
        let iface = session
            .iface
            .as_ref()
            .ok_or_else(|| Error::dns("No tunnel interface provisioned"))?;
        let alias = iface.resolved_name.clone();
        let tunnel_gateway = iface.gateway_address;
        let tunnel_index = iface.index;

        let snapshots = match session.route_backup.as_ref() {
            Some(backup) if !backup.dns.is_empty() => backup.dns.clone(),
            _ => self.snapshot().await,
        };
        let backup = session.route_backup.get_or_insert_with(RouteBackup::default);
        if backup.dns.is_empty() {
            backup.dns = snapshots.clone();
        }
        let others = other_interfaces(&snapshots, &alias);
        debug!(tunnel = %alias, others = ?others, "DNS snapshot taken");

        self.apply(&alias, AddressFamily::V4, &self.trusted_v4())
            .await
            .map_err(|e| dns_error(e, &format!("Failed to set DNS on {alias}")))?;
        info!(iface = %alias, primary = %self.config.primary, "Tunnel adapter DNS set");

        if !self.config.ipv6.is_empty() {
            let v6: Vec<IpAddr> = self.config.ipv6.iter().map(|ip| IpAddr::V6(*ip)).collect();
            for spec in set_servers(&alias, AddressFamily::V6, &v6) {
                if let Err(e) = self.runner.run_checked(&self.spec(spec)).await {
                    debug!(iface = %alias, error = %e, "IPv6 DNS not applied");
                    break;
                }
            }
        }

        for other in others.iter() {
            session.dns_overrides.push(other.clone());
            match self.apply(other, AddressFamily::V4, &self.trusted_v4()).await {
                Ok(()) => debug!(iface = %other, "System DNS pointed at trusted resolvers"),
                Err(e) => warn!(iface = %other, error = %e, "Failed to override DNS"),
            }
        }

        if session.hardened {
            self.route_resolvers(session, tunnel_gateway, tunnel_index).await;
            self.install_firewall_rules(session, &others).await?;
        } else {
            info!("Simplified mode: firewall hardening and resolver routes skipped");
        }

        self.flush().await;
        self.verify(&alias).await;
        Ok(())
    }

    /// Undo [`secure`](Self::secure): firewall rules, resolver routes, then
    /// the DNS of the other interfaces. Every step runs even if an earlier
    /// one failed.
    pub async fn release(&self, session: &mut TunnelSession) -> Result<()> {
        let mut failures = Vec::new();

        let rules = std::mem::take(&mut session.added_firewall_rules);
        for name in rules.into_iter().rev() {
            match self.runner.run_checked(&self.spec(firewall::remove_rule(&name))).await {
                Ok(_) => debug!(rule = %name, "Removed firewall rule"),
                Err(Error::Command { message, .. }) if firewall::is_missing_rule(&message) => {
                    debug!(rule = %name, "Firewall rule already gone");
                }
                Err(e) => {
                    warn!(rule = %name, error = %e, "Failed to remove firewall rule");
                    failures.push(format!("remove rule {name}: {e}"));
                    session.added_firewall_rules.insert(0, name);
                }
            }
        }

        let routes = std::mem::take(&mut session.added_routes);
        let mut kept = Vec::with_capacity(routes.len());
        for route in routes.into_iter().rev() {
            if route.kind != RouteKind::DnsResolver {
                kept.push(route);
                continue;
            }
            if let Err(e) = remove_route(self.runner.as_ref(), &route, self.command_timeout).await {
                warn!(route = %route, error = %e, "Failed to delete resolver route");
                failures.push(format!("delete {route}: {e}"));
                kept.push(route);
            }
        }
        kept.reverse();
        session.added_routes = kept;

        let overrides = std::mem::take(&mut session.dns_overrides);
        for alias in overrides.into_iter().rev() {
            let original: Vec<IpAddr> = session
                .route_backup
                .as_ref()
                .and_then(|b| b.dns_for(&alias, AddressFamily::V4))
                .and_then(DnsSnapshot::static_servers)
                .map(<[IpAddr]>::to_vec)
                .unwrap_or_default();
            let result = if original.is_empty() {
                self.runner
                    .run_checked(&self.spec(reset_servers(&alias, AddressFamily::V4)))
                    .await
                    .map(|_| ())
            } else {
                self.apply(&alias, AddressFamily::V4, &original).await
            };
            match result {
                Ok(()) if original.is_empty() => debug!(iface = %alias, "DNS back to automatic"),
                Ok(()) => debug!(iface = %alias, servers = ?original, "Static DNS restored"),
                Err(e) => {
                    warn!(iface = %alias, error = %e, "Failed to restore DNS");
                    failures.push(format!("restore DNS on {alias}: {e}"));
                }
            }
        }

        if let Some(iface) = session.iface.as_ref().filter(|i| !i.pending) {
            if !self.config.ipv6.is_empty() {
                let spec = self.spec(reset_servers(&iface.resolved_name, AddressFamily::V6));
                if let Err(e) = self.runner.run_checked(&spec).await {
                    debug!(iface = %iface.resolved_name, error = %e, "IPv6 DNS reset failed");
                }
            }
        }

        self.flush().await;

        if failures.is_empty() {
            info!("DNS settings released");
            Ok(())
        } else {
            Err(Error::dns(failures.join("; ")))
        }
    }

    /// Remove firewall rules left by a session that never released them.
    pub async fn purge_stale_rules(&self) -> Result<usize> {
        let spec = self.spec(firewall::purge_rules(&self.config.firewall_rule_prefix));
        let out = self.runner.run_checked(&spec).await?;
        let removed = out.stdout.trim().parse().unwrap_or(0);
        if removed > 0 {
            warn!(removed, prefix = %self.config.firewall_rule_prefix, "Removed stale firewall rules");
        }
        Ok(removed)
    }

    pub async fn run_leak_test(&self, tunnel_alias: Option<&str>) -> LeakTestReport {
        let trusted = self.config.trusted_servers();
        leak_test::LeakTest {
            runner: self.runner.as_ref(),
            fetcher: self.fetcher.as_ref(),
            domains: &self.config.leak_test_domains,
            trusted: &trusted,
            trace_url: &self.config.trace_url,
            tunnel_alias,
            command_timeout: self.command_timeout,
        }
        .run()
        .await
    }

    async fn apply(&self, alias: &str, family: AddressFamily, servers: &[IpAddr]) -> Result<()> {
        for spec in set_servers(alias, family, servers) {
            run_with_retry(self.runner.as_ref(), &self.spec(spec), SET_ATTEMPTS, SET_BACKOFF).await?;
        }
        Ok(())
    }

    async fn route_resolvers(&self, session: &mut TunnelSession, gateway: Ipv4Addr, index: Option<u32>) {
        let mut added = 0;
        for resolver in self.config.resolver_routes.iter().copied() {
            if session
                .added_routes
                .iter()
                .any(|r| r.destination == resolver && r.prefix_len == 32)
            {
                continue;
            }
            let route = AddedRoute {
                destination: resolver,
                prefix_len: 32,
                gateway,
                interface_index: index,
                kind: RouteKind::DnsResolver,
            };
            match install_route(self.runner.as_ref(), &route, self.command_timeout).await {
                Ok(()) => {
                    session.added_routes.push(route);
                    added += 1;
                }
                Err(e) => warn!(resolver = %resolver, error = %e, "Failed to route resolver through tunnel"),
            }
        }
        debug!(added, "Resolver host routes installed");
    }

    async fn install_firewall_rules(&self, session: &mut TunnelSession, interfaces: &[String]) -> Result<()> {
        if interfaces.is_empty() {
            warn!("No non-tunnel interfaces known; DNS firewall rules skipped");
            return Ok(());
        }
        for rule in firewall::block_rules(&self.config) {
            let spec = self.spec(firewall::add_rule(&rule, interfaces));
            run_with_retry(self.runner.as_ref(), &spec, SET_ATTEMPTS, SET_BACKOFF)
                .await
                .map_err(|e| dns_error(e, &format!("Failed to add firewall rule {}", rule.name)))?;
            debug!(rule = %rule.name, "Added firewall rule");
            session.added_firewall_rules.push(rule.name);
        }
        info!(rules = session.added_firewall_rules.len(), "DNS egress outside the tunnel blocked");
        Ok(())
    }

    async fn flush(&self) {
        if let Err(e) = self.runner.run_checked(&self.spec(flush_cache())).await {
            debug!(error = %e, "DNS cache flush failed");
        }
    }

    /// Read back the adapter DNS and resolve through the primary resolver.
    /// Mismatches are only logged.
    async fn verify(&self, alias: &str) {
        match self.runner.run_checked(&self.spec(adapter_dns_query(alias))).await {
            Ok(out) => {
                let servers = parse_server_list(&out.stdout);
                if servers.first() != Some(&IpAddr::V4(self.config.primary)) {
                    warn!(iface = %alias, servers = ?servers, "Adapter does not report the expected DNS servers");
                }
            }
            Err(e) => warn!(iface = %alias, error = %e, "Could not read adapter DNS servers"),
        }

        let Some(domain) = self.config.leak_test_domains.first() else {
            return;
        };
        let spec = self.spec(CommandSpec::new(
            "nslookup",
            [domain.clone(), self.config.primary.to_string()],
        ));
        if let Err(e) = self.runner.run_checked(&spec).await {
            warn!(domain = %domain, error = %e, "Resolution through the primary resolver failed");
        }
    }
}
