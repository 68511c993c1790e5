//! Scripted command runner for tests.
//!
//! Replies are chosen by substring match on the command line; the most
//! recently added matching rule wins. Every command is appended to a log so
//! tests can assert on the exact order of OS mutations.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::Result;

#[derive(Clone)]
enum Reply {
    Output(CommandOutput),
    /// Never completes.
    Hang,
}

struct Rule {
    pattern: String,
    reply: Reply,
    once: bool,
    used: bool,
}

#[derive(Default)]
pub(crate) struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
}

pub(crate) const WIFI_GATEWAY: &str = "192.168.1.1";
pub(crate) const TUNNEL_INDEX: u32 = 31;

pub(crate) const ADAPTERS_JSON: &str = r#"[
 {"Name":"Wi-Fi","InterfaceDescription":"Intel(R) Wi-Fi 6 AX201 160MHz","ifIndex":12,"Virtual":false,"Status":"Up","PnPDeviceID":"PCI\\VEN_8086&DEV_A0F0\\3&11583659&0&A3"},
 {"Name":"Ethernet","InterfaceDescription":"Realtek PCIe GbE Family Controller","ifIndex":7,"Virtual":false,"Status":"Disconnected","PnPDeviceID":"PCI\\VEN_10EC&DEV_8168\\4&2C0B5F5&0&00E4"},
 {"Name":"vEthernet (WSL)","InterfaceDescription":"Hyper-V Virtual Ethernet Adapter","ifIndex":44,"Virtual":true,"Status":"Up","PnPDeviceID":"ROOT\\VMS_MP\\0001"},
 {"Name":"ProxyTun","InterfaceDescription":"Wintun Userspace Tunnel","ifIndex":31,"Virtual":true,"Status":"Up","PnPDeviceID":"SWD\\WINTUN\\{6A2C1F94-1B3D-4E52-9C7E-0D1A1B7F0C11}"}
]"#;

pub(crate) const TUNNEL_ADAPTER_JSON: &str = r#"{"Name":"ProxyTun","InterfaceDescription":"Wintun Userspace Tunnel","ifIndex":31,"Virtual":true,"Status":"Up","PnPDeviceID":"SWD\\WINTUN\\{6A2C1F94-1B3D-4E52-9C7E-0D1A1B7F0C11}"}"#;

/// Adapter list of a machine with a WSL switch and no tunnel adapter yet.
pub(crate) const BEFORE_LOOPBACK: &str = r#"[
 {"Name":"Wi-Fi","InterfaceDescription":"Intel(R) Wi-Fi 6 AX201 160MHz","ifIndex":12,"Virtual":false,"Status":"Up","PnPDeviceID":"PCI\\VEN_8086&DEV_A0F0"},
 {"Name":"Ethernet","InterfaceDescription":"Realtek PCIe GbE Family Controller","ifIndex":7,"Virtual":false,"Status":"Disconnected","PnPDeviceID":"PCI\\VEN_10EC&DEV_8168"},
 {"Name":"vEthernet (WSL)","InterfaceDescription":"Hyper-V Virtual Ethernet Adapter","ifIndex":44,"Virtual":true,"Status":"Up","PnPDeviceID":"ROOT\\VMS_MP\\0001"}
]"#;

/// A freshly installed loopback adapter, named by the OS.
pub(crate) const LOOPBACK_ADAPTER: &str = r#"{"Name":"Ethernet 7","InterfaceDescription":"Microsoft KM-TEST Loopback Adapter","ifIndex":19,"Virtual":false,"Status":"Up","PnPDeviceID":"ROOT\\NET\\0000"}"#;

/// [`BEFORE_LOOPBACK`] plus [`LOOPBACK_ADAPTER`].
pub(crate) fn loopback_listing() -> String {
    format!(
        "{},\n {}\n]",
        BEFORE_LOOPBACK.trim_end().trim_end_matches(']').trim_end(),
        LOOPBACK_ADAPTER
    )
}

const ROUTE_PRINT: &str = "\
===========================================================================
IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.34     25
          0.0.0.0        128.0.0.0       10.255.0.1      10.255.0.2      1
        128.0.0.0        128.0.0.0       10.255.0.1      10.255.0.2      1
===========================================================================
";

const DNS_SNAPSHOT: &str = "\
Wi-Fi|2|192.168.1.1|dhcp
Wi-Fi|23||dhcp
Loopback Pseudo-Interface 1|2||dhcp
";

const NSLOOKUP_TRUSTED: &str = "\
Server:  one.one.one.one
Address:  1.1.1.1

Non-authoritative answer:
Name:    example.com
Address:  93.184.216.34
";

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A machine with one live Wi-Fi uplink and a tunnel driver that
    /// materialises `ProxyTun` (index 31) on request.
    pub(crate) fn windows_host() -> Self {
        let runner = Self::new();
        runner
            .on("Get-NetAdapter -IncludeHidden", ADAPTERS_JSON)
            .on("Get-NetAdapter -InterfaceIndex 31", TUNNEL_ADAPTER_JSON)
            .fail("Get-NetAdapter -Name", "No MSFT_NetAdapter objects found with property 'Name'")
            .on("tapctl", "{6A2C1F94-1B3D-4E52-9C7E-0D1A1B7F0C11}")
            .on(
                "Get-NetRoute",
                &format!("{WIFI_GATEWAY}|12|Wi-Fi|25\n"),
            )
            .on("route print", ROUTE_PRINT)
            .on("Get-DnsClientServerAddress", DNS_SNAPSHOT)
            .on("Get-DnsClientServerAddress -InterfaceAlias", "1.1.1.1,8.8.8.8,9.9.9.9")
            .on("nslookup", NSLOOKUP_TRUSTED);
        runner
    }

    fn push(&self, pattern: &str, reply: Reply, once: bool) -> &Self {
        self.rules.lock().push(Rule {
            pattern: pattern.to_string(),
            reply,
            once,
            used: false,
        });
        self
    }

    pub(crate) fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(pattern, Reply::Output(CommandOutput::ok(stdout)), false)
    }

    pub(crate) fn on_once(&self, pattern: &str, stdout: &str) -> &Self {
        self.push(pattern, Reply::Output(CommandOutput::ok(stdout)), true)
    }

    pub(crate) fn fail(&self, pattern: &str, stderr: &str) -> &Self {
        self.push(pattern, Reply::Output(CommandOutput::failed(1, stderr)), false)
    }

    pub(crate) fn fail_once(&self, pattern: &str, stderr: &str) -> &Self {
        self.push(pattern, Reply::Output(CommandOutput::failed(1, stderr)), true)
    }

    pub(crate) fn hang(&self, pattern: &str) -> &Self {
        self.push(pattern, Reply::Hang, false)
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Index of the first logged command containing `pattern`.
    pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
        self.log.lock().iter().position(|l| l.contains(pattern))
    }

    /// Index of the last logged command containing `pattern`.
    pub(crate) fn last_position(&self, pattern: &str) -> Option<usize> {
        self.log.lock().iter().rposition(|l| l.contains(pattern))
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.log.lock().iter().filter(|l| l.contains(pattern)).count()
    }

    fn reply_for(&self, line: &str) -> Reply {
        let mut rules = self.rules.lock();
        for rule in rules.iter_mut().rev() {
            if rule.used || !line.contains(&rule.pattern) {
                continue;
            }
            if rule.once {
                rule.used = true;
            }
            return rule.reply.clone();
        }
        Reply::Output(CommandOutput::ok(""))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        self.log.lock().push(line.clone());
        match self.reply_for(&line) {
            Reply::Output(output) => Ok(output),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_rule_wins_and_once_is_consumed() {
        let runner = FakeRunner::new();
        runner.on("route", "always").on_once("route add", "first");

        let add = CommandSpec::route(["add", "1.2.3.4"]);
        assert_eq!(runner.run(&add).await.unwrap().stdout, "first");
        assert_eq!(runner.run(&add).await.unwrap().stdout, "always");
        assert_eq!(runner.count("route add"), 2);
        assert_eq!(runner.position("route add 1.2.3.4"), Some(0));
    }
}
