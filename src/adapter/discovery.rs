//! Adapter discovery.
//!
//! The OS does not always honour the requested adapter name, so after a
//! creation strategy returns the adapter list is polled and the best
//! non-physical candidate is chosen. Selection is a pure function of the
//! listing so the same machine state always yields the same adapter.

use std::cmp::Reverse;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

use super::windows::{self, AdapterInfo};
use crate::command::CommandRunner;
use crate::error::{Error, Result};

/// Decides whether an adapter is a real uplink that must never be taken
/// for the tunnel adapter.
pub trait AdapterClassifier: Send + Sync {
    fn is_physical(&self, adapter: &AdapterInfo) -> bool;
}

/// Bus prefixes of plug-and-play ids that belong to hardware.
const PHYSICAL_BUSES: &[&str] = &["PCI\\", "USB\\", "BTH", "SD\\", "ACPI\\"];

const PHYSICAL_HINTS: &[&str] = &[
    "wi-fi",
    "wifi",
    "wireless",
    "802.11",
    "wlan",
    "bluetooth",
    "ethernet controller",
    "family controller",
    "gbe",
    "gigabit",
    "intel(r) ethernet",
    "killer",
    "broadcom",
    "qualcomm",
    "mediatek",
];

const VIRTUAL_HINTS: &[&str] = &[
    "loopback",
    "km-test",
    "wintun",
    "tap-windows",
    "tap-win32",
    "virtual",
    "hyper-v",
    "tunnel",
];

/// Description and device-id heuristics. Names are ignored: Windows names
/// loopback adapters "Ethernet N".
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl AdapterClassifier for HeuristicClassifier {
    fn is_physical(&self, adapter: &AdapterInfo) -> bool {
        let id = adapter.device_id().to_ascii_uppercase();
        if PHYSICAL_BUSES.iter().any(|bus| id.starts_with(bus)) {
            return true;
        }
        let desc = adapter.description().to_lowercase();
        if adapter.is_virtual() || VIRTUAL_HINTS.iter().any(|h| desc.contains(h)) {
            return false;
        }
        PHYSICAL_HINTS.iter().any(|h| desc.contains(h))
    }
}

/// Candidate preference, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CandidateRank {
    ExactName,
    ProductName,
    Loopback,
    TunnelDriver,
    GenericVirtual,
}

/// Rank an adapter, or `None` when it is not a candidate at all.
pub fn rank(adapter: &AdapterInfo, requested: &str) -> Option<CandidateRank> {
    let name = adapter.name.to_lowercase();
    let desc = adapter.description().to_lowercase();
    let product = crate::DEFAULT_INTERFACE_NAME.to_lowercase();
    let requested = requested.to_lowercase();

    if name == requested {
        Some(CandidateRank::ExactName)
    } else if name.contains(&product) || desc.contains(&product) || name.starts_with(&requested) {
        Some(CandidateRank::ProductName)
    } else if desc.contains("loopback") || desc.contains("km-test") {
        Some(CandidateRank::Loopback)
    } else if desc.contains("wintun") || desc.contains("tap-windows") || desc.contains("tap-win32") {
        Some(CandidateRank::TunnelDriver)
    } else if adapter.is_virtual() {
        Some(CandidateRank::GenericVirtual)
    } else {
        None
    }
}

/// Order the non-physical candidates of `adapters`, best first.
///
/// Only adapters absent from `baseline` qualify, except an exact name
/// match. Within a rank the higher interface index wins, then the name.
pub fn select_candidates<'a>(
    adapters: &'a [AdapterInfo],
    baseline: &[AdapterInfo],
    requested: &str,
    classifier: &dyn AdapterClassifier,
) -> Vec<&'a AdapterInfo> {
    let mut ranked: Vec<(CandidateRank, &AdapterInfo)> = adapters
        .iter()
        .filter(|a| !classifier.is_physical(a))
        .filter_map(|a| rank(a, requested).map(|r| (r, a)))
        .filter(|(r, a)| *r == CandidateRank::ExactName || !in_baseline(a, baseline))
        .collect();

    ranked.sort_by(|(ra, a), (rb, b)| (ra, Reverse(a.index), &a.name).cmp(&(rb, Reverse(b.index), &b.name)));
    ranked.into_iter().map(|(_, a)| a).collect()
}

fn in_baseline(adapter: &AdapterInfo, baseline: &[AdapterInfo]) -> bool {
    baseline
        .iter()
        .any(|b| b.index == adapter.index && b.name == adapter.name)
}

/// Bounded polling discovery.
pub struct Discovery<'a> {
    pub runner: &'a dyn CommandRunner,
    pub classifier: &'a dyn AdapterClassifier,
    pub poll: Duration,
    pub cap: Duration,
    pub command_timeout: Duration,
}

impl Discovery<'_> {
    /// Current adapter list; empty when the query fails.
    pub async fn snapshot(&self) -> Vec<AdapterInfo> {
        let spec = windows::list_adapters().with_timeout(self.command_timeout);
        match self.runner.run_checked(&spec).await {
            Ok(out) => windows::parse_adapters(&out.stdout).unwrap_or_else(|e| {
                debug!(error = %e, "Ignoring unparsable adapter list");
                Vec::new()
            }),
            Err(e) => {
                debug!(error = %e, "Adapter enumeration failed");
                Vec::new()
            }
        }
    }

    /// Re-query an adapter by index; a candidate is only accepted if the OS
    /// can still answer for it.
    pub async fn confirm(&self, index: u32) -> Option<AdapterInfo> {
        let spec = windows::adapter_by_index(index).with_timeout(self.command_timeout);
        let out = self.runner.run_checked(&spec).await.ok()?;
        windows::parse_adapters(&out.stdout)
            .ok()?
            .into_iter()
            .find(|a| a.index == index)
    }

    /// Poll until a confirmed candidate appears or the cap is reached.
    pub async fn resolve(&self, requested: &str, baseline: &[AdapterInfo]) -> Result<AdapterInfo> {
        let deadline = Instant::now() + self.cap;
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let adapters = self.snapshot().await;
            for candidate in select_candidates(&adapters, baseline, requested, self.classifier) {
                trace!(name = %candidate.name, index = candidate.index, "checking candidate");
                if let Some(confirmed) = self.confirm(candidate.index).await {
                    debug!(
                        requested = %requested,
                        resolved = %confirmed.name,
                        index = confirmed.index,
                        rounds,
                        "Adapter discovered"
                    );
                    return Ok(confirmed);
                }
            }
            if Instant::now() + self.poll > deadline {
                break;
            }
            sleep(self.poll).await;
        }
        Err(Error::Provisioning(format!(
            "No usable adapter for '{requested}' appeared within {}ms",
            self.cap.as_millis()
        )))
    }
}
