//! VM provisioning core.
//!
//! Resource pools, readiness polling, the provisioning session and device
//! attachment transactions, plus the data types shared between them.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod attachment;
pub mod orchestrator;
pub mod pool;
pub mod readiness;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Guest operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestOsFamily {
    Rhel,
    Centos,
    Ubuntu,
    Sles,
    /// Windows Server / client guests. `rs5` is accepted for Redstone 5 images.
    #[serde(alias = "rs5")]
    Windows,
}

impl GuestOsFamily {
    pub fn is_windows_like(self) -> bool {
        matches!(self, GuestOsFamily::Windows)
    }
}

/// Operating system of the hypervisor host (the SUT).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    #[default]
    Linux,
    Windows,
    Esxi,
}

impl HostOs {
    pub fn is_windows(self) -> bool {
        matches!(self, HostOs::Windows)
    }
}

/// How the guest NIC is attached.
///
/// In TOML: `network = "default"` or `network = { bridge = "br0" }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAttachment {
    #[default]
    Default,
    Bridge(String),
    Macvtap(String),
}

/// Pinned host cores, parsed from a cpuset list such as `0-3,8,10-11`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuAffinity {
    spec: String,
    cores: Vec<u32>,
}

impl CpuAffinity {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidAffinity {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty core list"));
        }

        let mut cores = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.trim().parse().map_err(|_| invalid("bad range start"))?;
                    let hi: u32 = hi.trim().parse().map_err(|_| invalid("bad range end"))?;
                    if hi < lo {
                        return Err(invalid("range end before start"));
                    }
                    cores.extend(lo..=hi);
                }
                None => cores.push(part.parse().map_err(|_| invalid("bad core id"))?),
            }
        }
        cores.sort_unstable();
        cores.dedup();

        Ok(Self {
            spec: trimmed.to_string(),
            cores,
        })
    }

    pub fn cores(&self) -> &[u32] {
        &self.cores
    }

    /// Number of distinct cores, which becomes the guest vCPU count.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

impl TryFrom<String> for CpuAffinity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CpuAffinity::parse(&value)
    }
}

impl From<CpuAffinity> for String {
    fn from(value: CpuAffinity) -> Self {
        value.spec
    }
}

impl fmt::Display for CpuAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

/// What the caller asks for. Never mutated once handed to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub os_family: GuestOsFamily,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub disk_gb: u32,
    #[serde(default)]
    pub network: NetworkAttachment,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub cpu_affinity: Option<CpuAffinity>,
    #[serde(default)]
    pub nested: bool,
}

impl VmSpec {
    /// Minimal spec with the sizing used by most of the test plans.
    pub fn new(name: impl Into<String>, os_family: GuestOsFamily) -> Self {
        Self {
            name: name.into(),
            os_family,
            cpu_count: 2,
            memory_mb: 4096,
            disk_gb: 20,
            network: NetworkAttachment::Default,
            mac_address: None,
            cpu_affinity: None,
            nested: false,
        }
    }
}

/// Lifecycle state of a VM as tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Record registered, hypervisor create not finished yet.
    Provisioning,
    /// Create returned; waiting for the guest OS.
    Booting,
    /// Guest has an IP and answers reachability probes.
    Ready,
    /// Boot detection ran out of time (or was cancelled). The VM may still
    /// come up; the caller decides what that means for its test.
    Unconfirmed,
    /// A forced power-off/start is in flight.
    PowerCycling,
}

impl VmState {
    /// Whether the guest went through boot detection at least once, which is
    /// the precondition for device operations.
    pub fn is_booted(self) -> bool {
        matches!(self, VmState::Ready | VmState::Unconfirmed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Provisioning => "provisioning",
            VmState::Booting => "booting",
            VmState::Ready => "ready",
            VmState::Unconfirmed => "unconfirmed",
            VmState::PowerCycling => "power-cycling",
        };
        f.write_str(s)
    }
}

/// Live bookkeeping entry for one VM on the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRecord {
    pub name: String,
    pub os_family: GuestOsFamily,
    pub state: VmState,
    pub ip: Option<IpAddr>,
    pub pool_id: Option<String>,
    pub volume_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn new(spec: &VmSpec, pool_id: Option<String>, volume_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name.clone(),
            os_family: spec.os_family,
            state: VmState::Provisioning,
            ip: None,
            pool_id,
            volume_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_state(&mut self, state: VmState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use attachment::{AttachmentState, AttachmentTransaction, DeviceLocator, PowerCycle};
pub use orchestrator::{CreateOptions, Creation, OrchestratorSession, PoolCleanup};
pub use pool::{PoolManager, PoolSelection, ResourcePool};
pub use readiness::{BootOutcome, BootSignals, PollOutcome, PollSchedule, ReachabilityProbe};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_parses_ranges_and_singles() {
        let a = CpuAffinity::parse("0-3,8,10-11").unwrap();
        assert_eq!(a.cores(), &[0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(a.len(), 7);
        assert_eq!(a.to_string(), "0-3,8,10-11");
    }

    #[test]
    fn affinity_dedups_overlaps() {
        let a = CpuAffinity::parse("2-4,3").unwrap();
        assert_eq!(a.cores(), &[2, 3, 4]);
    }

    #[test]
    fn affinity_rejects_garbage() {
        assert!(CpuAffinity::parse("").is_err());
        assert!(CpuAffinity::parse("4-2").is_err());
        assert!(CpuAffinity::parse("a,b").is_err());
    }

    #[test]
    fn spec_deserializes_from_toml() {
        let spec: VmSpec = toml::from_str(
            r#"
name = "RHEL_0"
os_family = "rhel"
cpu_count = 4
memory_mb = 8192
disk_gb = 40
network = { bridge = "br0" }
cpu_affinity = "0-3"
"#,
        )
        .unwrap();
        assert_eq!(spec.name, "RHEL_0");
        assert_eq!(spec.network, NetworkAttachment::Bridge("br0".into()));
        assert_eq!(spec.cpu_affinity.unwrap().len(), 4);
        assert!(!spec.nested);
    }

    #[test]
    fn rs5_alias_is_windows() {
        let spec: VmSpec = toml::from_str(
            r#"
name = "RS5_1"
os_family = "rs5"
cpu_count = 2
memory_mb = 4096
disk_gb = 60
"#,
        )
        .unwrap();
        assert!(spec.os_family.is_windows_like());
    }
}
