//! Core data model shared by the tunnel components.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Proxy protocol spoken by the upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl ProxyKind {
    /// URL scheme understood by the forwarding subprocess.
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Socks5 => write!(f, "SOCKS5"),
            ProxyKind::Http => write!(f, "HTTP"),
        }
    }
}

/// Upstream proxy endpoint. Immutable once validated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ProxyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Credentials, when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    /// Reject malformed endpoints before any network probe.
    pub fn validate(&self) -> Result<()> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(Error::config("Proxy host cannot be empty"));
        }
        if host.contains(char::is_whitespace) || host.contains('/') {
            return Err(Error::config(format!("Invalid proxy host: {host}")));
        }
        if self.port == 0 {
            return Err(Error::config("Proxy port must be between 1 and 65535"));
        }

        let has_user = self.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_pass = self.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_user != has_pass {
            return Err(Error::config(
                "Proxy username and password must be given together",
            ));
        }
        if let Some((user, pass)) = self.credentials() {
            // RFC 1929 length-prefixes both fields with a single byte.
            if self.kind == ProxyKind::Socks5 && (user.len() > 255 || pass.len() > 255) {
                return Err(Error::config(
                    "SOCKS5 username and password are limited to 255 bytes",
                ));
            }
        }
        Ok(())
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Proxy URL handed to the forwarding subprocess (credentials included).
    pub fn to_url(&self) -> String {
        match self.credentials() {
            Some((user, pass)) => format!(
                "{}://{}:{}@{}",
                self.kind.scheme(),
                percent_encode(user),
                percent_encode(pass),
                self.authority()
            ),
            None => format!("{}://{}", self.kind.scheme(), self.authority()),
        }
    }
}

/// Never prints the password.
impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("kind", &self.kind)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => {
                write!(f, "{}://{}@{}", self.kind.scheme(), user, self.authority())
            }
            _ => write!(f, "{}://{}", self.kind.scheme(), self.authority()),
        }
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Result of probing a proxy once. Never mutated after it is returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub tcp_reachable: bool,
    pub authenticated: bool,
    pub http_round_trip_ok: bool,
    pub udp_associate_supported: bool,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    /// Address the proxy host resolved to; used for the protective route.
    pub resolved_address: Option<SocketAddr>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether OS state may be mutated on the strength of this report.
    pub fn permits_mutation(&self) -> bool {
        self.tcp_reachable && self.authenticated
    }

    /// Sessions without UDP ASSOCIATE run the forwarder in TCP-only mode.
    pub fn udp_mode(&self) -> UdpMode {
        if self.udp_associate_supported {
            UdpMode::Relay
        } else {
            UdpMode::TcpOnly
        }
    }

    pub fn proxy_ip(&self) -> Option<IpAddr> {
        self.resolved_address.map(|a| a.ip())
    }
}

/// How the forwarding subprocess treats UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UdpMode {
    Relay,
    TcpOnly,
}

impl fmt::Display for UdpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpMode::Relay => write!(f, "relay"),
            UdpMode::TcpOnly => write!(f, "tcp-only"),
        }
    }
}

/// Which interface creation strategy produced the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreationMethod {
    ReuseExisting,
    NativeApi,
    Script,
    Loopback,
    TunnelDriver,
    VirtualFallback,
}

impl CreationMethod {
    /// Methods whose adapter only appears once the forwarder runs.
    pub fn is_deferred(&self) -> bool {
        matches!(self, CreationMethod::TunnelDriver | CreationMethod::VirtualFallback)
    }
}

impl fmt::Display for CreationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CreationMethod::ReuseExisting => "reuse-existing",
            CreationMethod::NativeApi => "native-api",
            CreationMethod::Script => "script",
            CreationMethod::Loopback => "loopback",
            CreationMethod::TunnelDriver => "tunnel-driver",
            CreationMethod::VirtualFallback => "virtual-fallback",
        };
        f.write_str(s)
    }
}

/// The provisioned virtual adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceRecord {
    pub requested_name: String,
    /// Name the OS actually assigned; every later phase uses this.
    pub resolved_name: String,
    pub index: Option<u32>,
    pub creation_method: CreationMethod,
    pub gateway_address: Ipv4Addr,
    pub local_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// Plug-and-play instance id, used to remove loopback adapters.
    pub device_id: Option<String>,
    /// Discovery and address assignment still outstanding.
    pub pending: bool,
}

impl InterfaceRecord {
    pub fn prefix_len(&self) -> u8 {
        mask_to_prefix(self.subnet_mask)
    }
}

/// Address family of a DNS server list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn netsh_name(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4",
            AddressFamily::V6 => "ipv6",
        }
    }
}

/// Where an interface gets its DNS servers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsSource {
    Static,
    Dhcp,
}

/// DNS servers of one interface for one address family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSnapshot {
    pub interface: String,
    pub family: AddressFamily,
    /// Ordered, as currently in effect.
    pub servers: Vec<IpAddr>,
    pub source: DnsSource,
}

impl DnsSnapshot {
    /// Servers to put back as a static list, or `None` when the interface
    /// goes back to automatic.
    pub fn static_servers(&self) -> Option<&[IpAddr]> {
        match self.source {
            DnsSource::Static if !self.servers.is_empty() => Some(&self.servers),
            _ => None,
        }
    }
}

/// The system default route before redirection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub interface_index: Option<u32>,
    pub interface_alias: Option<String>,
    pub metric: Option<u32>,
}

/// Snapshot taken before any mutation; used only for restoration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteBackup {
    pub default_route: Option<DefaultRoute>,
    pub dns: Vec<DnsSnapshot>,
    /// The original default route was deleted and must be re-added.
    pub default_route_removed: bool,
}

impl RouteBackup {
    pub fn dns_for(&self, interface: &str, family: AddressFamily) -> Option<&DnsSnapshot> {
        self.dns
            .iter()
            .find(|s| s.family == family && s.interface.eq_ignore_ascii_case(interface))
    }
}

/// Why a route was installed; drives teardown grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteKind {
    /// Host route to the proxy server via the original gateway.
    ProxyHost,
    /// Host route to a public resolver via the tunnel.
    DnsResolver,
    /// Half of the address space via the tunnel.
    TunnelDefault,
}

/// One route installed by this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedRoute {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub interface_index: Option<u32>,
    pub kind: RouteKind,
}

impl AddedRoute {
    pub fn mask(&self) -> Ipv4Addr {
        prefix_to_mask(self.prefix_len)
    }
}

impl fmt::Display for AddedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} via {}", self.destination, self.prefix_len, self.gateway)
    }
}

/// Convert a netmask to a prefix length.
pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    mask.octets().iter().map(|b| b.count_ones() as u8).sum()
}

/// Convert a prefix length to a netmask.
pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    let bits: u32 = if prefix_len == 0 {
        0
    } else {
        !((1u64 << (32 - u32::from(prefix_len.min(32)))) - 1) as u32
    };
    Ipv4Addr::from(bits)
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
