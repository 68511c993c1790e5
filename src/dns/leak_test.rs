//! DNS leak test.
//!
//! Resolves a few domains through the system resolver and checks which
//! server answered, reads the DNS servers of the tunnel adapter and fetches
//! a trace endpoint through the tunnel. Sub-tests are independent: one
//! failing never stops the others.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::protocol::http::Fetcher;
use crate::types::unix_millis;

/// Overall classification of a leak test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeakRating {
    Excellent,
    Good,
    Fail,
}

impl LeakRating {
    pub fn from_pass_rate(rate: f64) -> Self {
        if rate >= 95.0 {
            LeakRating::Excellent
        } else if rate >= 80.0 {
            LeakRating::Good
        } else {
            LeakRating::Fail
        }
    }
}

impl fmt::Display for LeakRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakRating::Excellent => f.write_str("EXCELLENT"),
            LeakRating::Good => f.write_str("GOOD"),
            LeakRating::Fail => f.write_str("FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakSubTest {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeakTestReport {
    pub tests: Vec<LeakSubTest>,
    pub tests_passed: usize,
    pub total_tests: usize,
    pub pass_rate: f64,
    pub rating: LeakRating,
    pub has_leaks: bool,
    /// Every resolver observed answering a query.
    pub resolved_servers: Vec<IpAddr>,
    pub egress_ip: Option<IpAddr>,
    pub location: Option<String>,
    pub timestamp: u64,
}

impl LeakTestReport {
    fn from_tests(tests: Vec<LeakSubTest>, resolved: Vec<IpAddr>, trusted: &[IpAddr], trace: Option<Trace>) -> Self {
        let total_tests = tests.len();
        let tests_passed = tests.iter().filter(|t| t.passed).count();
        let pass_rate = if total_tests == 0 {
            0.0
        } else {
            tests_passed as f64 * 100.0 / total_tests as f64
        };
        let has_leaks = resolved.iter().any(|server| !trusted.contains(server));
        let (egress_ip, location) = match trace {
            Some(t) => (t.ip, t.location),
            None => (None, None),
        };
        Self {
            tests,
            tests_passed,
            total_tests,
            pass_rate,
            rating: LeakRating::from_pass_rate(pass_rate),
            has_leaks,
            resolved_servers: resolved,
            egress_ip,
            location,
            timestamp: unix_millis(),
        }
    }
}

/// Fields of a `cdn-cgi/trace` style response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub ip: Option<IpAddr>,
    pub location: Option<String>,
}

pub fn parse_trace(body: &str) -> Trace {
    let mut trace = Trace::default();
    for line in body.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "ip" => trace.ip = value.trim().parse().ok(),
                "loc" => trace.location = Some(value.trim().to_string()).filter(|s| !s.is_empty()),
                _ => {}
            }
        }
    }
    trace
}

/// The server that answered an `nslookup`: the first `Address` line after
/// the `Server` line. A trailing `#53` is ignored.
pub fn parse_nslookup_server(output: &str) -> Option<IpAddr> {
    let mut lines = output.lines().skip_while(|l| !l.trim_start().starts_with("Server:"));
    lines.next()?;
    lines
        .map(str::trim)
        .find_map(|l| l.strip_prefix("Address:"))
        .and_then(|addr| {
            let addr = addr.trim();
            let addr = addr.split('#').next().unwrap_or(addr);
            addr.parse().ok()
        })
}

/// Whether `nslookup` printed an answer section.
fn has_answer(output: &str) -> bool {
    let mut lines = output.lines().skip_while(|l| !l.trim_start().starts_with("Name:"));
    lines.next().is_some()
}

pub fn nslookup(domain: &str) -> CommandSpec {
    CommandSpec::new("nslookup", [domain])
}

/// Inputs of one leak test run.
pub struct LeakTest<'a> {
    pub runner: &'a dyn CommandRunner,
    pub fetcher: &'a dyn Fetcher,
    pub domains: &'a [String],
    pub trusted: &'a [IpAddr],
    pub trace_url: &'a str,
    /// Tunnel adapter alias; the adapter sub-test is skipped without one.
    pub tunnel_alias: Option<&'a str>,
    pub command_timeout: Duration,
}

impl LeakTest<'_> {
    pub async fn run(&self) -> LeakTestReport {
        let (lookups, adapter, trace) = tokio::join!(self.resolve_domains(), self.check_adapter(), self.trace());

        let (mut tests, resolved) = lookups;
        tests.extend(adapter);
        let (trace_test, trace) = trace;
        tests.push(trace_test);

        let report = LeakTestReport::from_tests(tests, resolved, self.trusted, trace);
        if report.has_leaks {
            warn!(
                servers = ?report.resolved_servers,
                rating = %report.rating,
                "DNS leak detected: a resolver outside the trusted set answered"
            );
        } else {
            info!(
                passed = report.tests_passed,
                total = report.total_tests,
                rating = %report.rating,
                "DNS leak test finished"
            );
        }
        report
    }

    async fn resolve_domains(&self) -> (Vec<LeakSubTest>, Vec<IpAddr>) {
        let mut tests = Vec::with_capacity(self.domains.len());
        let mut resolved = Vec::new();
        for domain in self.domains {
            let spec = nslookup(domain).with_timeout(self.command_timeout);
            let name = format!("resolve {domain}");
            let out = match self.runner.run(&spec).await {
                Ok(out) => out,
                Err(e) => {
                    tests.push(LeakSubTest {
                        name,
                        passed: false,
                        detail: e.to_string(),
                    });
                    continue;
                }
            };
            let text = format!("{}\n{}", out.stdout, out.stderr);
            match parse_nslookup_server(&text) {
                Some(server) => {
                    let trusted = self.trusted.contains(&server);
                    if !resolved.contains(&server) {
                        resolved.push(server);
                    }
                    let answered = has_answer(&out.stdout);
                    debug!(domain = %domain, server = %server, trusted, answered, "nslookup");
                    tests.push(LeakSubTest {
                        name,
                        passed: trusted && answered,
                        detail: match (trusted, answered) {
                            (true, true) => format!("answered by trusted resolver {server}"),
                            (true, false) => format!("trusted resolver {server} returned no answer"),
                            (false, _) => format!("answered by untrusted resolver {server}"),
                        },
                    });
                }
                None => tests.push(LeakSubTest {
                    name,
                    passed: false,
                    detail: "could not determine the answering server".to_string(),
                }),
            }
        }
        (tests, resolved)
    }

    async fn check_adapter(&self) -> Option<LeakSubTest> {
        let alias = self.tunnel_alias?;
        let spec = super::adapter_dns_query(alias).with_timeout(self.command_timeout);
        let test = match self.runner.run_checked(&spec).await {
            Ok(out) => {
                let servers = super::parse_server_list(&out.stdout);
                let all_trusted = !servers.is_empty() && servers.iter().all(|s| self.trusted.contains(s));
                LeakSubTest {
                    name: format!("adapter {alias} DNS"),
                    passed: all_trusted,
                    detail: format!("{servers:?}"),
                }
            }
            Err(e) => LeakSubTest {
                name: format!("adapter {alias} DNS"),
                passed: false,
                detail: e.to_string(),
            },
        };
        Some(test)
    }

    async fn trace(&self) -> (LeakSubTest, Option<Trace>) {
        match self.fetcher.fetch_text(self.trace_url, self.command_timeout).await {
            Ok(body) => {
                let trace = parse_trace(&body);
                let passed = trace.ip.is_some();
                let detail = match (&trace.ip, &trace.location) {
                    (Some(ip), Some(loc)) => format!("egress {ip} ({loc})"),
                    (Some(ip), None) => format!("egress {ip}"),
                    _ => "trace response had no ip field".to_string(),
                };
                (
                    LeakSubTest {
                        name: "trace".to_string(),
                        passed,
                        detail,
                    },
                    Some(trace),
                )
            }
            Err(e) => (
                LeakSubTest {
                    name: "trace".to_string(),
                    passed: false,
                    detail: e.to_string(),
                },
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_thresholds() {
        assert_eq!(LeakRating::from_pass_rate(100.0), LeakRating::Excellent);
        assert_eq!(LeakRating::from_pass_rate(95.0), LeakRating::Excellent);
        assert_eq!(LeakRating::from_pass_rate(80.0), LeakRating::Good);
        assert_eq!(LeakRating::from_pass_rate(79.9), LeakRating::Fail);
    }

    #[test]
    fn test_parse_nslookup_server() {
        let out = "Server:  UnKnown\nAddress:  192.168.1.1#53\n\nName:    example.com\nAddress:  93.184.216.34\n";
        assert_eq!(parse_nslookup_server(out), Some("192.168.1.1".parse().unwrap()));
        assert!(has_answer(out));

        let refused = "*** Request to UnKnown timed-out\n";
        assert_eq!(parse_nslookup_server(refused), None);
    }

    #[test]
    fn test_parse_trace() {
        let body = "fl=29f\nh=1.1.1.1\nip=198.51.100.23\nts=1700000000.1\nloc=NL\nwarp=off\n";
        let trace = parse_trace(body);
        assert_eq!(trace.ip, Some("198.51.100.23".parse().unwrap()));
        assert_eq!(trace.location.as_deref(), Some("NL"));
    }

    #[test]
    fn test_report_serializes_rating_uppercase() {
        let report = LeakTestReport::from_tests(
            vec![LeakSubTest {
                name: "trace".into(),
                passed: false,
                detail: String::new(),
            }],
            Vec::new(),
            &[],
            None,
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"rating\":\"FAIL\""));
        assert!(json.contains("\"hasLeaks\":false"));
    }
}
