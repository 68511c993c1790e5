//! Full-tunnel routing.
//!
//! Redirection replaces the system default route with two half-range routes
//! through the tunnel gateway. A host route to the proxy server via the
//! original gateway is installed first and removed last, so tunnel traffic
//! to the proxy never loops back into the tunnel.

pub mod table;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::command::{run_with_retry, CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::supervisor::TunnelSession;
use crate::types::{AddedRoute, DefaultRoute, RouteBackup, RouteKind};

use table::RouteCheck;

/// `0.0.0.0/1` and `128.0.0.0/1`.
pub const HALF_ROUTES: [Ipv4Addr; 2] = [Ipv4Addr::new(0, 0, 0, 0), Ipv4Addr::new(128, 0, 0, 0)];

const ROUTE_ATTEMPTS: u32 = 2;
const ROUTE_BACKOFF: Duration = Duration::from_millis(300);

/// Tunnel-side facts every routing step needs.
#[derive(Debug, Clone)]
struct TunnelTarget {
    name: String,
    gateway: Ipv4Addr,
    index: Option<u32>,
}

impl TunnelTarget {
    fn of(session: &TunnelSession) -> Result<Self> {
        let iface = session
            .iface
            .as_ref()
            .ok_or_else(|| Error::routing("No tunnel interface provisioned"))?;
        Ok(Self {
            name: iface.resolved_name.clone(),
            gateway: iface.gateway_address,
            index: iface.index,
        })
    }
}

/// Owns every routing-table mutation of a session.
pub struct RoutingController {
    runner: Arc<dyn CommandRunner>,
    command_timeout: Duration,
    essential_dns: [Ipv4Addr; 2],
}

impl RoutingController {
    pub fn new(runner: Arc<dyn CommandRunner>, command_timeout: Duration, essential_dns: [Ipv4Addr; 2]) -> Self {
        Self {
            runner,
            command_timeout,
            essential_dns,
        }
    }

    fn spec(&self, spec: CommandSpec) -> CommandSpec {
        spec.with_timeout(self.command_timeout)
    }

    /// Current default route, ignoring the tunnel's own.
    ///
    /// Falls back to parsing `route print` when the PowerShell query fails.
    pub async fn snapshot_default_route(&self, tunnel_gateway: Ipv4Addr) -> Option<DefaultRoute> {
        match self.runner.run_checked(&self.spec(table::default_route_query())).await {
            Ok(out) => {
                if let Some(route) = table::pick_default(table::parse_default_routes(&out.stdout), tunnel_gateway) {
                    return Some(route);
                }
                debug!("Get-NetRoute returned no usable default route");
            }
            Err(e) => debug!(error = %e, "Get-NetRoute failed, trying route print"),
        }

        match self.runner.run_checked(&self.spec(table::route_print_default())).await {
            Ok(out) => table::default_from_entries(&table::parse_route_print(&out.stdout), tunnel_gateway),
            Err(e) => {
                warn!(error = %e, "Could not determine the default gateway");
                None
            }
        }
    }

    /// Back up the default route and send all traffic through the tunnel.
    pub async fn redirect(&self, session: &mut TunnelSession) -> Result<()> {
        let tun = TunnelTarget::of(session)?;

        let default_route = self.snapshot_default_route(tun.gateway).await;
        match &default_route {
            Some(route) => info!(
                gateway = %route.gateway,
                iface = ?route.interface_alias,
                "Saved original default route"
            ),
            None => warn!("No default route found; it will not be replaced or restored"),
        }
        let backup = session.route_backup.get_or_insert_with(RouteBackup::default);
        backup.default_route = default_route.clone();

        self.install_protective_route(session, default_route.as_ref()).await;
        let protective: Vec<RouteCheck> = session
            .added_routes
            .iter()
            .filter(|r| r.kind == RouteKind::ProxyHost)
            .map(|r| RouteCheck::present(r.destination, r.mask(), r.gateway))
            .collect();
        if !protective.is_empty() {
            self.verify(&protective).await;
        }

        if let Err(e) = self.swap_default_route(session, &tun, default_route.as_ref()).await {
            error!(error = %e, "Redirection failed, running emergency restore");
            self.emergency_restore(session).await;
            return Err(e);
        }

        let half = HALF_ROUTES.map(|d| RouteCheck::present(d, Ipv4Addr::new(128, 0, 0, 0), tun.gateway));
        self.verify(&half).await;
        info!(iface = %tun.name, gateway = %tun.gateway, "All traffic redirected through tunnel");
        Ok(())
    }

    /// Fallback redirection: protective route, half-range routes and host
    /// routes for the two essential resolvers. The default route stays.
    pub async fn redirect_simplified(&self, session: &mut TunnelSession) -> Result<()> {
        let tun = TunnelTarget::of(session)?;

        let known = session.route_backup.as_ref().and_then(|b| b.default_route.clone());
        let default_route = match known {
            Some(route) => Some(route),
            None => self.snapshot_default_route(tun.gateway).await,
        };
        let backup = session.route_backup.get_or_insert_with(RouteBackup::default);
        backup.default_route = default_route.clone();

        if !session.added_routes.iter().any(|r| r.kind == RouteKind::ProxyHost) {
            self.install_protective_route(session, default_route.as_ref()).await;
        }

        if let Err(e) = self.add_half_routes(session, &tun).await {
            error!(error = %e, "Simplified redirection failed, running emergency restore");
            self.emergency_restore(session).await;
            return Err(e);
        }

        for resolver in self.essential_dns {
            let route = AddedRoute {
                destination: resolver,
                prefix_len: 32,
                gateway: tun.gateway,
                interface_index: tun.index,
                kind: RouteKind::DnsResolver,
            };
            if let Err(e) = self.add_route(session, route).await {
                warn!(resolver = %resolver, error = %e, "Failed to route resolver through tunnel");
            }
        }

        session.hardened = false;
        info!(iface = %tun.name, "Traffic redirected with simplified routing (no firewall hardening)");
        Ok(())
    }

    /// Undo redirection: resolver routes still on record, half routes, then
    /// the original default route, then the protective route, then the
    /// adapter DNS.
    ///
    /// Every step runs even if an earlier one failed.
    pub async fn restore(&self, session: &mut TunnelSession) -> Result<()> {
        let mut failures = Vec::new();

        self.drain_routes(session, RouteKind::DnsResolver, &mut failures).await;
        self.drain_routes(session, RouteKind::TunnelDefault, &mut failures).await;

        let default_restored = self.restore_default_route(session, &mut failures).await;

        if default_restored {
            self.drain_routes(session, RouteKind::ProxyHost, &mut failures).await;
        } else {
            warn!("Original default route not restored; keeping protective route");
        }

        if session.route_backup.is_none() {
            warn!("No route backup captured; resetting tunnel DNS to automatic");
        }
        self.reset_adapter_dns(session).await;

        if failures.is_empty() {
            info!("Routing restored");
            Ok(())
        } else {
            Err(Error::routing(failures.join("; ")))
        }
    }

    /// Last-resort recovery: put the original default route back, drop the
    /// tunnel routes and reset the tunnel adapter DNS. Never fails.
    pub async fn emergency_restore(&self, session: &mut TunnelSession) {
        warn!("Emergency route restore");
        let mut failures = Vec::new();
        let default_restored = self.restore_default_route(session, &mut failures).await;

        let recorded: Vec<Ipv4Addr> = session
            .added_routes
            .iter()
            .filter(|r| r.kind == RouteKind::TunnelDefault)
            .map(|r| r.destination)
            .collect();
        self.drain_routes(session, RouteKind::TunnelDefault, &mut failures).await;

        // An add cut short by a timeout may have landed without being recorded.
        if let Ok(tun) = TunnelTarget::of(session) {
            for destination in HALF_ROUTES.into_iter().filter(|d| !recorded.contains(d)) {
                let spec = CommandSpec::route([
                    "delete".to_string(),
                    destination.to_string(),
                    "mask".to_string(),
                    "128.0.0.0".to_string(),
                    tun.gateway.to_string(),
                ]);
                if let Err(e) = self.delete(&spec).await {
                    debug!(destination = %destination, error = %e, "Unrecorded tunnel route not removed");
                }
            }
        }
        self.drain_routes(session, RouteKind::DnsResolver, &mut failures).await;

        if default_restored {
            self.drain_routes(session, RouteKind::ProxyHost, &mut failures).await;
        }
        self.reset_adapter_dns(session).await;

        for failure in failures {
            error!("Emergency restore step failed: {}", failure);
        }
    }

    /// Remove half-range routes left behind by a crashed session.
    pub async fn purge_tunnel_routes(&self, tunnel_gateway: Ipv4Addr) {
        for destination in HALF_ROUTES {
            let spec = CommandSpec::route([
                "delete".to_string(),
                destination.to_string(),
                "mask".to_string(),
                "128.0.0.0".to_string(),
                tunnel_gateway.to_string(),
            ]);
            match self.delete(&spec).await {
                Ok(()) => debug!(destination = %destination, "Purged leftover tunnel route"),
                Err(e) => debug!(destination = %destination, error = %e, "No leftover tunnel route"),
            }
        }
    }

    async fn install_protective_route(&self, session: &mut TunnelSession, default_route: Option<&DefaultRoute>) {
        let proxy_ip = match session.validation.proxy_ip() {
            Some(IpAddr::V4(ip)) => ip,
            Some(IpAddr::V6(ip)) => {
                warn!(proxy = %ip, "IPv6 proxy address; protective route skipped");
                return;
            }
            None => {
                warn!("Proxy address unknown; protective route skipped");
                return;
            }
        };
        let Some(default_route) = default_route else {
            warn!(proxy = %proxy_ip, "No original gateway; protective route skipped");
            return;
        };

        let route = AddedRoute {
            destination: proxy_ip,
            prefix_len: 32,
            gateway: default_route.gateway,
            interface_index: default_route.interface_index,
            kind: RouteKind::ProxyHost,
        };
        match self.add_route(session, route).await {
            Ok(()) => info!(proxy = %proxy_ip, gateway = %default_route.gateway, "Added protective host route"),
            Err(e) => warn!(proxy = %proxy_ip, error = %e, "Failed to add protective host route, continuing"),
        }
    }

    async fn swap_default_route(
        &self,
        session: &mut TunnelSession,
        tun: &TunnelTarget,
        default_route: Option<&DefaultRoute>,
    ) -> Result<()> {
        if let Some(route) = default_route {
            let spec = self.spec(CommandSpec::route([
                "delete".to_string(),
                "0.0.0.0".to_string(),
                "mask".to_string(),
                "0.0.0.0".to_string(),
                route.gateway.to_string(),
            ]));
            run_with_retry(self.runner.as_ref(), &spec, ROUTE_ATTEMPTS, ROUTE_BACKOFF)
                .await
                .map_err(|e| routing_error(e, "Failed to remove default route"))?;
            if let Some(backup) = session.route_backup.as_mut() {
                backup.default_route_removed = true;
            }
            debug!(gateway = %route.gateway, "Removed original default route");
            self.verify(&[RouteCheck::absent(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, route.gateway)])
                .await;
        }

        self.add_half_routes(session, tun).await
    }

    async fn add_half_routes(&self, session: &mut TunnelSession, tun: &TunnelTarget) -> Result<()> {
        for destination in HALF_ROUTES {
            if session
                .added_routes
                .iter()
                .any(|r| r.kind == RouteKind::TunnelDefault && r.destination == destination)
            {
                continue;
            }
            let route = AddedRoute {
                destination,
                prefix_len: 1,
                gateway: tun.gateway,
                interface_index: tun.index,
                kind: RouteKind::TunnelDefault,
            };
            self.add_route(session, route)
                .await
                .map_err(|e| routing_error(e, &format!("Failed to add route {destination}/1")))?;
        }
        Ok(())
    }

    /// Add a route and record it on success.
    async fn add_route(&self, session: &mut TunnelSession, route: AddedRoute) -> Result<()> {
        install_route(self.runner.as_ref(), &route, self.command_timeout).await?;
        debug!(route = %route, kind = ?route.kind, "Added route");
        session.added_routes.push(route);
        Ok(())
    }

    /// Delete every recorded route of `kind`, newest first. Routes that fail
    /// to delete stay recorded.
    async fn drain_routes(&self, session: &mut TunnelSession, kind: RouteKind, failures: &mut Vec<String>) {
        let mut kept = Vec::with_capacity(session.added_routes.len());
        let routes = std::mem::take(&mut session.added_routes);
        for route in routes.into_iter().rev() {
            if route.kind != kind {
                kept.push(route);
                continue;
            }
            match remove_route(self.runner.as_ref(), &route, self.command_timeout).await {
                Ok(()) => debug!(route = %route, "Deleted route"),
                Err(e) => {
                    warn!(route = %route, error = %e, "Failed to delete route");
                    failures.push(format!("delete {route}: {e}"));
                    kept.push(route);
                }
            }
        }
        kept.reverse();
        session.added_routes = kept;
    }

    async fn delete(&self, spec: &CommandSpec) -> Result<()> {
        delete_checked(self.runner.as_ref(), &self.spec(spec.clone())).await
    }

    /// Re-add the original default route if it was removed. Returns whether
    /// the default route is in place afterwards.
    async fn restore_default_route(&self, session: &mut TunnelSession, failures: &mut Vec<String>) -> bool {
        let Some(backup) = session.route_backup.as_mut() else {
            return true;
        };
        if !backup.default_route_removed {
            return true;
        }
        let Some(route) = backup.default_route.clone() else {
            return true;
        };

        let mut args = vec![
            "add".to_string(),
            "0.0.0.0".to_string(),
            "mask".to_string(),
            "0.0.0.0".to_string(),
            route.gateway.to_string(),
        ];
        if let Some(metric) = route.metric {
            args.push("metric".to_string());
            args.push(metric.max(1).to_string());
        }
        if let Some(index) = route.interface_index {
            args.push("if".to_string());
            args.push(index.to_string());
        }
        let spec = self.spec(CommandSpec::route(args));
        match run_with_retry(self.runner.as_ref(), &spec, ROUTE_ATTEMPTS, ROUTE_BACKOFF).await {
            Ok(_) => {
                backup.default_route_removed = false;
                info!(gateway = %route.gateway, "Restored original default route");
                true
            }
            Err(Error::Command { message, .. }) if message.to_lowercase().contains("already exists") => {
                backup.default_route_removed = false;
                true
            }
            Err(e) => {
                error!(gateway = %route.gateway, error = %e, "Failed to restore default route");
                failures.push(format!("restore default route via {}: {e}", route.gateway));
                false
            }
        }
    }

    async fn reset_adapter_dns(&self, session: &TunnelSession) {
        let Some(iface) = session.iface.as_ref().filter(|i| !i.pending) else {
            return;
        };
        let spec = self.spec(CommandSpec::netsh([
            "interface".to_string(),
            "ipv4".to_string(),
            "set".to_string(),
            "dnsservers".to_string(),
            format!("name={}", iface.resolved_name),
            "source=dhcp".to_string(),
        ]));
        if let Err(e) = self.runner.run_checked(&spec).await {
            debug!(iface = %iface.resolved_name, error = %e, "Adapter DNS reset failed");
        }
    }

    /// Read the table back; mismatches are only logged.
    async fn verify(&self, checks: &[RouteCheck]) {
        match self.runner.run_checked(&self.spec(table::route_print())).await {
            Ok(out) => {
                let entries = table::parse_route_print(&out.stdout);
                for check in checks.iter().filter(|c| !c.holds(&entries)) {
                    if check.present {
                        warn!(destination = %check.destination, mask = %check.mask, "Route not visible in routing table after adding it");
                    } else {
                        warn!(destination = %check.destination, mask = %check.mask, "Route still in routing table after deleting it");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not read routing table for verification"),
        }
    }
}

/// `route add` for one route; an identical existing route counts as added.
pub(crate) async fn install_route(runner: &dyn CommandRunner, route: &AddedRoute, command_timeout: Duration) -> Result<()> {
    let mut args = vec![
        "add".to_string(),
        route.destination.to_string(),
        "mask".to_string(),
        route.mask().to_string(),
        route.gateway.to_string(),
        "metric".to_string(),
        "1".to_string(),
    ];
    if let Some(index) = route.interface_index {
        args.push("if".to_string());
        args.push(index.to_string());
    }
    let spec = CommandSpec::route(args).with_timeout(command_timeout);
    match run_with_retry(runner, &spec, ROUTE_ATTEMPTS, ROUTE_BACKOFF).await {
        Ok(_) => Ok(()),
        Err(Error::Command { message, .. }) if message.to_lowercase().contains("already exists") => {
            debug!(route = %route, "Route already present");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// `route delete` for one route; a route that is already gone counts as deleted.
pub(crate) async fn remove_route(runner: &dyn CommandRunner, route: &AddedRoute, command_timeout: Duration) -> Result<()> {
    let spec = CommandSpec::route([
        "delete".to_string(),
        route.destination.to_string(),
        "mask".to_string(),
        route.mask().to_string(),
        route.gateway.to_string(),
    ])
    .with_timeout(command_timeout);
    delete_checked(runner, &spec).await
}

async fn delete_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<()> {
    match runner.run_checked(spec).await {
        Ok(_) => Ok(()),
        Err(Error::Command { message, .. }) if message.to_lowercase().contains("not found") => Ok(()),
        Err(e) => Err(e),
    }
}

fn routing_error(e: Error, context: &str) -> Error {
    match e {
        Error::Privilege { .. } | Error::Timeout { .. } => e,
        other => Error::routing(format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::fake::{FakeRunner, TUNNEL_INDEX, WIFI_GATEWAY};
    use crate::supervisor::tests::session_fixture;

    fn controller(runner: Arc<FakeRunner>) -> RoutingController {
        RoutingController::new(
            runner,
            Duration::from_secs(5),
            [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_route_brackets_default_swap() {
        let runner = Arc::new(FakeRunner::windows_host());
        let routing = controller(runner.clone());
        let mut session = session_fixture();

        routing.redirect(&mut session).await.unwrap();
        let protect_add = runner.position("route add 203.0.113.9 mask 255.255.255.255 192.168.1.1").unwrap();
        let default_delete = runner.position("route delete 0.0.0.0 mask 0.0.0.0 192.168.1.1").unwrap();
        let half_add = runner
            .position(&format!("route add 0.0.0.0 mask 128.0.0.0 10.255.0.1 metric 1 if {TUNNEL_INDEX}"))
            .unwrap();
        assert!(protect_add < default_delete);
        assert!(default_delete < half_add);
        assert_eq!(session.added_routes.len(), 3);
        assert!(session.route_backup.as_ref().unwrap().default_route_removed);

        routing.restore(&mut session).await.unwrap();
        let default_add = runner.position("route add 0.0.0.0 mask 0.0.0.0 192.168.1.1").unwrap();
        let protect_delete = runner.position("route delete 203.0.113.9 mask 255.255.255.255").unwrap();
        let half_delete = runner.position("route delete 128.0.0.0 mask 128.0.0.0").unwrap();
        assert!(half_delete < default_add);
        assert!(default_add < protect_delete);
        assert!(session.added_routes.is_empty());
        assert!(!session.route_backup.as_ref().unwrap().default_route_removed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_route_failure_triggers_emergency_restore() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner.fail("route add 128.0.0.0", "The route addition failed: The parameter is incorrect.");
        let routing = controller(runner.clone());
        let mut session = session_fixture();

        let err = routing.redirect(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Routing(_)));

        let log = runner.log();
        let failed = runner.last_position("route add 128.0.0.0").unwrap();
        let readd = runner.position("route add 0.0.0.0 mask 0.0.0.0").unwrap();
        assert!(readd > failed);
        assert!(log[readd..].iter().any(|l| l.starts_with("route delete 0.0.0.0 mask 128.0.0.0")));
        assert!(log[readd..].iter().any(|l| l.contains("dnsservers name=ProxyTun source=dhcp")));
        // Default route is back, so the protective route could go too.
        assert!(session.added_routes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_route_failure_is_not_fatal() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner.fail("route add 203.0.113.9", "The route addition failed: Element not found.");
        let mut session = session_fixture();
        controller(runner.clone()).redirect(&mut session).await.unwrap();
        assert!(session.added_routes.iter().all(|r| r.kind == RouteKind::TunnelDefault));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_route_found_via_route_print() {
        let runner = Arc::new(FakeRunner::windows_host());
        runner.fail("Get-NetRoute", "Get-NetRoute : The term 'Get-NetRoute' is not recognized");
        let route = controller(runner).snapshot_default_route(Ipv4Addr::new(10, 255, 0, 1)).await.unwrap();
        assert_eq!(route.gateway.to_string(), WIFI_GATEWAY);
        assert_eq!(route.interface_index, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simplified_redirect_keeps_default_route() {
        let runner = Arc::new(FakeRunner::windows_host());
        let mut session = session_fixture();
        session.hardened = true;
        controller(runner.clone()).redirect_simplified(&mut session).await.unwrap();

        assert_eq!(runner.count("route delete 0.0.0.0 mask 0.0.0.0"), 0);
        assert_eq!(runner.count("mask 128.0.0.0 10.255.0.1"), 2);
        assert_eq!(runner.count("route add 1.1.1.1 mask 255.255.255.255 10.255.0.1"), 1);
        assert_eq!(runner.count("route add 8.8.8.8 mask 255.255.255.255 10.255.0.1"), 1);
        assert!(!session.hardened);
        assert_eq!(session.added_routes.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_backup_still_removes_recorded_routes() {
        let runner = Arc::new(FakeRunner::windows_host());
        let mut session = session_fixture();
        session.added_routes.push(AddedRoute {
            destination: Ipv4Addr::new(0, 0, 0, 0),
            prefix_len: 1,
            gateway: Ipv4Addr::new(10, 255, 0, 1),
            interface_index: Some(TUNNEL_INDEX),
            kind: RouteKind::TunnelDefault,
        });
        runner.fail("route delete 0.0.0.0 mask 128.0.0.0", "The route deletion failed: Element not found.");

        controller(runner.clone()).restore(&mut session).await.unwrap();
        assert!(session.added_routes.is_empty());
        assert_eq!(runner.count("route add"), 0);
        assert_eq!(runner.count("dnsservers name=ProxyTun source=dhcp"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_read_back_after_each_mutation() {
        let runner = Arc::new(FakeRunner::windows_host());
        let mut session = session_fixture();
        controller(runner.clone()).redirect(&mut session).await.unwrap();

        let log = runner.log();
        let reads: Vec<usize> = log
            .iter()
            .enumerate()
            .filter(|(_, l)| l.ends_with("print -4"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(reads.len(), 3);

        let protect_add = runner.position("route add 203.0.113.9 mask 255.255.255.255").unwrap();
        let default_delete = runner.position("route delete 0.0.0.0 mask 0.0.0.0").unwrap();
        let half_add = runner.last_position("mask 128.0.0.0 10.255.0.1").unwrap();
        assert!(protect_add < reads[0] && reads[0] < default_delete);
        assert!(default_delete < reads[1] && reads[1] < half_add);
        assert!(half_add < reads[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_restore_keeps_undeleted_tunnel_routes() {
        let runner = Arc::new(FakeRunner::windows_host());
        let routing = controller(runner.clone());
        let mut session = session_fixture();
        routing.redirect(&mut session).await.unwrap();

        runner.fail("route delete 0.0.0.0 mask 128.0.0.0", "The route deletion failed: The parameter is incorrect.");
        routing.emergency_restore(&mut session).await;

        let left: Vec<Ipv4Addr> = session
            .added_routes
            .iter()
            .filter(|r| r.kind == RouteKind::TunnelDefault)
            .map(|r| r.destination)
            .collect();
        assert_eq!(left, vec![Ipv4Addr::new(0, 0, 0, 0)]);
        assert_eq!(runner.count("route delete 128.0.0.0 mask 128.0.0.0"), 1);

        // The later teardown retries what is still on record.
        runner.on("route delete 0.0.0.0 mask 128.0.0.0", "OK!");
        runner.clear_log();
        routing.restore(&mut session).await.unwrap();
        assert_eq!(runner.count("route delete 0.0.0.0 mask 128.0.0.0"), 1);
        assert!(session.added_routes.is_empty());
    }
}
