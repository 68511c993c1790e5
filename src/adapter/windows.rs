//! Windows adapter commands and `Get-NetAdapter` parsing.
//!
//! Commands are plain `netsh`/PowerShell invocations built here and executed
//! through a [`CommandRunner`](crate::command::CommandRunner).

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

use crate::command::{ps_quote, CommandSpec};
use crate::error::{Error, Result};

const ADAPTER_FIELDS: &str = "Name,InterfaceDescription,ifIndex,Virtual,Status,PnPDeviceID";

/// One row of `Get-NetAdapter`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdapterInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "InterfaceDescription", default)]
    pub description: Option<String>,
    #[serde(rename = "ifIndex")]
    pub index: u32,
    #[serde(rename = "Virtual", default)]
    pub is_virtual: Option<bool>,
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    #[serde(rename = "PnPDeviceID", default)]
    pub device_id: Option<String>,
}

impl AdapterInfo {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual.unwrap_or(false)
    }

    pub fn device_id(&self) -> &str {
        self.device_id.as_deref().unwrap_or("")
    }
}

/// `ConvertTo-Json` emits a bare object for one row and an array otherwise.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(AdapterInfo),
    Many(Vec<AdapterInfo>),
}

/// Parse `Get-NetAdapter | ConvertTo-Json` output.
pub fn parse_adapters(json: &str) -> Result<Vec<AdapterInfo>> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany = serde_json::from_str(json)
        .map_err(|e| Error::protocol(format!("Unexpected Get-NetAdapter output: {e}")))?;
    Ok(match parsed {
        OneOrMany::One(a) => vec![a],
        OneOrMany::Many(v) => v,
    })
}

fn select_json(source: &str) -> CommandSpec {
    CommandSpec::powershell(format!(
        "{source} | Select-Object {ADAPTER_FIELDS} | ConvertTo-Json -Compress"
    ))
}

pub fn list_adapters() -> CommandSpec {
    select_json("Get-NetAdapter -IncludeHidden -ErrorAction SilentlyContinue")
}

pub fn adapter_by_name(name: &str) -> CommandSpec {
    select_json(&format!("Get-NetAdapter -Name {} -ErrorAction Stop", ps_quote(name)))
}

pub fn adapter_by_index(index: u32) -> CommandSpec {
    select_json(&format!("Get-NetAdapter -InterfaceIndex {index} -ErrorAction Stop"))
}

pub fn set_static_address(name: &str, address: Ipv4Addr, mask: Ipv4Addr) -> CommandSpec {
    CommandSpec::netsh([
        "interface".to_string(),
        "ipv4".to_string(),
        "set".to_string(),
        "address".to_string(),
        format!("name={name}"),
        "source=static".to_string(),
        format!("address={address}"),
        format!("mask={mask}"),
    ])
}

pub fn set_dhcp_address(name: &str) -> CommandSpec {
    CommandSpec::netsh([
        "interface".to_string(),
        "ipv4".to_string(),
        "set".to_string(),
        "address".to_string(),
        format!("name={name}"),
        "source=dhcp".to_string(),
    ])
}

pub fn set_admin_state(name: &str, enabled: bool) -> CommandSpec {
    CommandSpec::netsh([
        "interface".to_string(),
        "set".to_string(),
        "interface".to_string(),
        format!("name={name}"),
        format!("admin={}", if enabled { "enabled" } else { "disabled" }),
    ])
}

pub fn set_mtu(name: &str, mtu: u16) -> CommandSpec {
    CommandSpec::netsh([
        "interface".to_string(),
        "ipv4".to_string(),
        "set".to_string(),
        "subinterface".to_string(),
        name.to_string(),
        format!("mtu={mtu}"),
        "store=active".to_string(),
    ])
}

pub fn tapctl_create(tapctl: &Path, name: &str) -> CommandSpec {
    CommandSpec::new(
        &tapctl.to_string_lossy(),
        ["create", "--name", name, "--hwid", "wintun"],
    )
}

pub fn tapctl_delete(tapctl: &Path, name: &str) -> CommandSpec {
    CommandSpec::new(&tapctl.to_string_lossy(), ["delete", name])
}

pub fn run_script(script: &Path, name: &str) -> CommandSpec {
    CommandSpec::new(
        "powershell",
        [
            "-NoProfile".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-File".to_string(),
            script.to_string_lossy().into_owned(),
            "-AdapterName".to_string(),
            name.to_string(),
        ],
    )
}

pub fn install_loopback(devcon: &Path) -> CommandSpec {
    let windir = std::env::var("WINDIR").unwrap_or_else(|_| r"C:\Windows".to_string());
    CommandSpec::new(
        &devcon.to_string_lossy(),
        [
            "install".to_string(),
            format!(r"{windir}\inf\netloop.inf"),
            "*MSLOOP".to_string(),
        ],
    )
}

pub fn remove_device(device_id: &str) -> CommandSpec {
    CommandSpec::new("pnputil", ["/remove-device", device_id])
}
