//! Routing table queries and their parsers.

use std::net::Ipv4Addr;

use crate::command::CommandSpec;
use crate::types::DefaultRoute;

/// `NextHop|ifIndex|InterfaceAlias|RouteMetric`, lowest metric first.
const DEFAULT_ROUTE_SCRIPT: &str = "Get-NetRoute -DestinationPrefix '0.0.0.0/0' -AddressFamily IPv4 \
-ErrorAction SilentlyContinue | Sort-Object RouteMetric | ForEach-Object \
{ \"$($_.NextHop)|$($_.ifIndex)|$($_.InterfaceAlias)|$($_.RouteMetric)\" }";

pub fn default_route_query() -> CommandSpec {
    CommandSpec::powershell(DEFAULT_ROUTE_SCRIPT)
}

pub fn route_print_default() -> CommandSpec {
    CommandSpec::route(["print", "-4", "0.0.0.0"])
}

pub fn route_print() -> CommandSpec {
    CommandSpec::route(["print", "-4"])
}

/// One row of the `route print` active routes table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    /// `None` for on-link routes.
    pub gateway: Option<Ipv4Addr>,
    pub interface: Ipv4Addr,
    pub metric: u32,
}

/// Expected state of one route after a table mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCheck {
    pub destination: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub present: bool,
}

impl RouteCheck {
    pub fn present(destination: Ipv4Addr, mask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            mask,
            gateway,
            present: true,
        }
    }

    pub fn absent(destination: Ipv4Addr, mask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            destination,
            mask,
            gateway,
            present: false,
        }
    }

    pub fn holds(&self, entries: &[RouteEntry]) -> bool {
        let found = entries.iter().any(|e| {
            e.destination == self.destination && e.mask == self.mask && e.gateway == Some(self.gateway)
        });
        found == self.present
    }
}

/// Parse the active routes of `route print -4`. Rows that do not have the
/// five-column shape (headers, persistent routes) are skipped.
pub fn parse_route_print(text: &str) -> Vec<RouteEntry> {
    text.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() != 5 {
                return None;
            }
            let gateway = if cols[2].eq_ignore_ascii_case("On-link") {
                None
            } else {
                Some(cols[2].parse().ok()?)
            };
            Some(RouteEntry {
                destination: cols[0].parse().ok()?,
                mask: cols[1].parse().ok()?,
                gateway,
                interface: cols[3].parse().ok()?,
                metric: cols[4].parse().ok()?,
            })
        })
        .collect()
}

/// Parse the output of [`default_route_query`].
pub fn parse_default_routes(text: &str) -> Vec<DefaultRoute> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('|');
            let gateway: Ipv4Addr = parts.next()?.trim().parse().ok()?;
            let interface_index = parts.next().and_then(|s| s.trim().parse().ok());
            let interface_alias = parts
                .next()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let metric = parts.next().and_then(|s| s.trim().parse().ok());
            Some(DefaultRoute {
                gateway,
                interface_index,
                interface_alias,
                metric,
            })
        })
        .collect()
}

/// The usable default route: a real next hop that is not the tunnel.
pub fn pick_default(routes: Vec<DefaultRoute>, tunnel_gateway: Ipv4Addr) -> Option<DefaultRoute> {
    routes
        .into_iter()
        .find(|r| !r.gateway.is_unspecified() && r.gateway != tunnel_gateway)
}

/// Default route from `route print` rows, lowest metric first.
pub fn default_from_entries(entries: &[RouteEntry], tunnel_gateway: Ipv4Addr) -> Option<DefaultRoute> {
    entries
        .iter()
        .filter(|e| e.destination.is_unspecified() && e.mask.is_unspecified())
        .filter_map(|e| e.gateway.map(|g| (g, e.metric)))
        .filter(|(g, _)| !g.is_unspecified() && *g != tunnel_gateway)
        .min_by_key(|(_, metric)| *metric)
        .map(|(gateway, metric)| DefaultRoute {
            gateway,
            interface_index: None,
            interface_alias: None,
            metric: Some(metric),
        })
}
