//! Configuration for the provisioning core and the plan runner.
//!
//! All sections deserialize with `#[serde(default)]`, so a plan only needs to
//! mention what it changes. Durations are whole seconds.
//!
//! ```toml
//! host_os = "linux"
//!
//! [orchestrator.timings]
//! boot_max_wait_secs = 900
//!
//! [ssh]
//! host = "sut.lab"
//!
//! [hypervisor]
//! create = "virt-install --name {name} ..."
//!
//! [[pools]]
//! candidates = ["Storage_0", "Storage_1"]
//! backing_path = "/mnt/nvme0"
//!
//! [[vms]]
//! name = "RHEL_0"
//! os_family = "rhel"
//! cpu_count = 4
//! memory_mb = 8192
//! disk_gb = 40
//! parallel = true
//! pool_id = "Storage_0"
//! devices = ["0000:6b:02.0"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::remote::RetryPolicy;
use crate::vm::{CpuAffinity, CreateOptions, HostOs, VmSpec};

// ---------------------------------------------------------------------------
// Orchestrator settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub command_timeout_secs: u64,
    pub creation_poll_interval_secs: u64,
    pub creation_max_wait_secs: u64,
    pub boot_poll_interval_secs: u64,
    pub boot_max_wait_secs: u64,
    pub reachability_window_secs: u64,
    pub reachability_retry_secs: u64,
    pub ping_count: u32,
    pub define_settle_secs: u64,
    pub await_settle_secs: u64,
    pub guest_reboot_settle_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            creation_poll_interval_secs: 2,
            creation_max_wait_secs: 1200,
            boot_poll_interval_secs: 10,
            boot_max_wait_secs: 500,
            reachability_window_secs: 30,
            reachability_retry_secs: 1,
            ping_count: 4,
            define_settle_secs: 5,
            await_settle_secs: 500,
            guest_reboot_settle_secs: 30,
        }
    }
}

impl Timings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn define_settle(&self) -> Duration {
        Duration::from_secs(self.define_settle_secs)
    }

    pub fn await_settle(&self) -> Duration {
        Duration::from_secs(self.await_settle_secs)
    }

    pub fn guest_reboot_settle(&self) -> Duration {
        Duration::from_secs(self.guest_reboot_settle_secs)
    }

    pub fn reachability_window(&self) -> Duration {
        Duration::from_secs(self.reachability_window_secs)
    }

    pub fn reachability_retry(&self) -> Duration {
        Duration::from_secs(self.reachability_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_secs: policy.backoff.as_secs(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(value: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: value.max_attempts,
            backoff: Duration::from_secs(value.backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub timings: Timings,
    pub retry: RetryConfig,
    /// Volumes a pool may hold before it counts as exhausted. Unlimited when
    /// unset.
    pub pool_volume_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// When set, host keys are recorded here and dropped on reconnect.
    pub known_hosts_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: "root".to_string(),
            port: 22,
            identity_file: None,
            known_hosts_file: None,
            connect_timeout_secs: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Hypervisor command templates
// ---------------------------------------------------------------------------

/// Command text for every hypervisor primitive, with `{placeholder}`
/// substitution. See `demos/libvirt.toml` for a complete set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorTemplates {
    /// `{name} {os_family} {cpus} {memory_mb} {disk_gb} {network} {mac}
    /// {cpuset} {pool} {volume} {nested}`
    pub create: String,
    /// Substring identifying the creation process in `ps -ef` output.
    pub creation_process_marker: String,
    /// `{name}`; output is scanned for the first non-loopback IPv4 address.
    pub get_ip: String,
    pub power_off: String,
    pub power_on: String,
    pub reboot: String,
    pub destroy: String,
    /// `{name} {descriptor_file}`
    pub attach_device: String,
    pub detach_device: String,
    /// `{name} {device}`; exit 0 with non-empty output means present.
    pub device_present: String,
    /// `{domain} {bus} {slot} {function}`
    pub pci_descriptor: String,
    /// `{uuid}`
    pub mdev_descriptor: String,
    /// Directory on the SUT where descriptors are written.
    pub descriptor_dir: String,
    /// `{pool} {path}`
    pub define_pool: String,
    pub undefine_pool: String,
    /// `{pool}`; exit 0 means the pool exists.
    pub pool_exists: String,
}

impl HypervisorTemplates {
    /// Names of templates that are required but empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let required = [
            ("create", &self.create),
            ("get_ip", &self.get_ip),
            ("power_off", &self.power_off),
            ("power_on", &self.power_on),
            ("reboot", &self.reboot),
            ("destroy", &self.destroy),
            ("attach_device", &self.attach_device),
            ("detach_device", &self.detach_device),
            ("device_present", &self.device_present),
            ("pci_descriptor", &self.pci_descriptor),
            ("mdev_descriptor", &self.mdev_descriptor),
            ("define_pool", &self.define_pool),
            ("undefine_pool", &self.undefine_pool),
            ("pool_exists", &self.pool_exists),
        ];
        required
            .into_iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(k, _)| k)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPlan {
    pub candidates: Vec<String>,
    pub backing_path: String,
}

/// One VM of a batch: its spec plus how to create it and what to attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmPlan {
    #[serde(flatten)]
    pub spec: VmSpec,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub pool_volume_id: Option<String>,
    #[serde(default)]
    pub core_affinity: Option<CpuAffinity>,
    #[serde(default)]
    pub extra_disk_gb: Option<u32>,
    /// PCI addresses or mediated-device UUIDs to attach after boot.
    #[serde(default)]
    pub devices: Vec<String>,
}

impl VmPlan {
    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            parallel: self.parallel,
            pool_id: self.pool_id.clone(),
            pool_volume_id: self.pool_volume_id.clone(),
            core_affinity: self.core_affinity.clone(),
            extra_disk_gb: self.extra_disk_gb,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub host_os: HostOs,
    pub orchestrator: OrchestratorConfig,
    pub ssh: SshConfig,
    pub hypervisor: HypervisorTemplates,
    pub pools: Vec<PoolPlan>,
    pub vms: Vec<VmPlan>,
    /// Destroy the batch and sweep pools once everything finished.
    pub teardown: bool,
}

impl Plan {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        let plan = Self::from_toml(&text).with_context(|| format!("parsing plan {}", path.display()))?;
        plan.validate()
            .with_context(|| format!("validating plan {}", path.display()))?;
        Ok(plan)
    }

    /// Structural checks that do not need the SUT.
    pub fn validate(&self) -> Result<()> {
        if self.ssh.host.trim().is_empty() {
            bail!("[ssh] host is required");
        }

        let missing = self.hypervisor.missing();
        if !missing.is_empty() {
            bail!("[hypervisor] is missing templates: {}", missing.join(", "));
        }

        let mut names = std::collections::HashSet::new();
        for vm in &self.vms {
            if !names.insert(vm.spec.name.as_str()) {
                bail!("VM name {} appears more than once", vm.spec.name);
            }
            for device in &vm.devices {
                crate::vm::DeviceLocator::parse(device)
                    .with_context(|| format!("VM {}", vm.spec.name))?;
            }
        }

        for pool in &self.pools {
            if pool.candidates.is_empty() {
                bail!("pool at {} lists no candidate ids", pool.backing_path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_templates() -> String {
        [
            "create", "get_ip", "power_off", "power_on", "reboot", "destroy",
            "attach_device", "detach_device", "device_present", "pci_descriptor",
            "mdev_descriptor", "define_pool", "undefine_pool", "pool_exists",
        ]
        .iter()
        .map(|k| format!("{k} = \"x\"\n"))
        .collect()
    }

    #[test]
    fn defaults_match_observed_constants() {
        let t = Timings::default();
        assert_eq!(t.creation_poll_interval_secs, 2);
        assert_eq!(t.creation_max_wait_secs, 1200);
        assert_eq!(t.boot_poll_interval_secs, 10);
        assert_eq!(t.reachability_window_secs, 30);
        assert_eq!(RetryConfig::default().max_attempts, 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let plan = Plan::from_toml(
            r#"
[orchestrator.timings]
boot_max_wait_secs = 900
"#,
        )
        .unwrap();
        assert_eq!(plan.orchestrator.timings.boot_max_wait_secs, 900);
        assert_eq!(plan.orchestrator.timings.boot_poll_interval_secs, 10);
        assert_eq!(plan.ssh.user, "root");
        assert_eq!(plan.host_os, HostOs::Linux);
    }

    #[test]
    fn vm_plan_flattens_spec() {
        let plan = Plan::from_toml(
            r#"
[[vms]]
name = "RHEL_0"
os_family = "rhel"
cpu_count = 4
memory_mb = 8192
disk_gb = 40
parallel = true
pool_id = "Storage_0"
devices = ["0000:6b:02.0"]
"#,
        )
        .unwrap();
        let vm = &plan.vms[0];
        assert_eq!(vm.spec.name, "RHEL_0");
        assert!(vm.parallel);
        let opts = vm.create_options();
        assert_eq!(opts.pool_id.as_deref(), Some("Storage_0"));
        assert!(opts.pool_volume_id.is_none());
    }

    #[test]
    fn validate_reports_missing_templates() {
        let plan = Plan::from_toml("[ssh]\nhost = \"sut\"\n").unwrap();
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("create"), "got: {err}");
    }

    #[test]
    fn validate_rejects_duplicate_vm_names() {
        let text = format!(
            r#"
[ssh]
host = "sut"

[hypervisor]
{}

[[vms]]
name = "a"
os_family = "rhel"
cpu_count = 1
memory_mb = 1024
disk_gb = 10

[[vms]]
name = "a"
os_family = "rhel"
cpu_count = 1
memory_mb = 1024
disk_gb = 10
"#,
            minimal_templates()
        );
        let plan = Plan::from_toml(&text).unwrap();
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("more than once"), "got: {err}");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        let text = format!("[ssh]\nhost = \"sut\"\n\n[hypervisor]\n{}", minimal_templates());
        std::fs::write(&path, text).unwrap();
        let plan = Plan::load(&path).unwrap();
        assert_eq!(plan.ssh.host, "sut");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Plan::from_toml("this is not [[ valid toml").is_err());
    }

    #[test]
    fn printed_plan_parses_back_unchanged() {
        let plan = Plan::from_toml(include_str!("../demos/libvirt.toml")).unwrap();
        let printed = plan.to_toml().unwrap();
        assert!(!printed.is_empty());
        assert_eq!(Plan::from_toml(&printed).unwrap(), plan);
    }
}
