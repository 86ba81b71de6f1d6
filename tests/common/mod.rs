//! In-memory doubles of the SUT shell and the hypervisor control interface.
//!
//! The fake hypervisor models just enough of a real host for the session:
//! defined VMs, the device set stored in each definition, the device set the
//! running guest sees (refreshed on power-on), pools, and how long a
//! define takes. Every define is recorded as a virtual-time interval so tests
//! can check which ones overlapped.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use virt_provision::config::OrchestratorConfig;
use virt_provision::error::{Advisory, AdvisoryError, Error, Result};
use virt_provision::hypervisor::{
    CreateRequest, CreationHandle, DeviceDescriptor, HypervisorControl,
};
use virt_provision::remote::{CommandExecutor, CommandOutput, RemoteShell, RetryPolicy, ShellError};
use virt_provision::vm::{DeviceLocator, HostOs, OrchestratorSession};

// ---------------------------------------------------------------------------
// Shell
// ---------------------------------------------------------------------------

/// SUT shell: empty process table, every guest answers pings unless
/// `silent` is set.
#[derive(Default)]
pub struct FakeShell {
    pub silent: bool,
    pub commands: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    fn host(&self) -> &str {
        "fake-sut"
    }

    async fn reconnect(&self) -> std::result::Result<(), ShellError> {
        Ok(())
    }

    async fn run(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> std::result::Result<CommandOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        if let Some(target) = command.strip_prefix("ping -c 4 ") {
            if self.silent {
                return Ok(CommandOutput {
                    stdout: "4 packets transmitted, 0 received, 100% packet loss".into(),
                    stderr: String::new(),
                    exit_code: 1,
                });
            }
            return Ok(CommandOutput {
                stdout: format!("64 bytes from {target}: icmp_seq=1 ttl=64 time=0.210 ms\n"),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        Ok(CommandOutput::default())
    }
}

// ---------------------------------------------------------------------------
// Hypervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FakeVm {
    pub request: Option<CreateRequest>,
    pub defined_devices: HashSet<DeviceLocator>,
    pub visible_devices: HashSet<DeviceLocator>,
    pub ip_lookups: u32,
    pub reboots: u32,
    pub power_cycles: u32,
}

/// One `create` call as seen on the virtual clock.
#[derive(Debug, Clone)]
pub struct DefineSpan {
    pub vm: String,
    pub start: Instant,
    pub end: Instant,
}

impl DefineSpan {
    pub fn overlaps(&self, other: &DefineSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Default)]
pub struct FakeState {
    pub vms: HashMap<String, FakeVm>,
    pub pools: HashSet<String>,
    pub pool_defines: Vec<String>,
    pub pool_undefines: Vec<String>,
    pub defines: Vec<DefineSpan>,
}

pub struct FakeHypervisor {
    pub state: Mutex<FakeState>,
    /// Virtual time one `create` takes.
    pub define_delay: Duration,
    /// IP lookups that fail before an address appears. `None` never boots.
    pub ip_after_lookups: Option<u32>,
    /// Names whose `create` fails.
    pub failing: HashSet<String>,
    /// Devices never show up in the guest.
    pub hide_devices: bool,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            define_delay: Duration::from_secs(3),
            ip_after_lookups: Some(1),
            failing: HashSet::new(),
            hide_devices: false,
        }
    }
}

impl FakeHypervisor {
    pub fn with_existing_pool(self, pool_id: &str) -> Self {
        self.state.lock().unwrap().pools.insert(pool_id.to_string());
        self
    }

    pub fn vm(&self, name: &str) -> FakeVm {
        self.state.lock().unwrap().vms.get(name).cloned().unwrap_or_default()
    }

    pub fn defines(&self) -> Vec<DefineSpan> {
        self.state.lock().unwrap().defines.clone()
    }

    fn with_vm<T>(&self, name: &str, f: impl FnOnce(&mut FakeVm) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let vm = state.vms.get_mut(name).ok_or_else(|| Error::Hypervisor {
            operation: "lookup",
            target: name.to_string(),
            reason: "no such domain".into(),
        })?;
        Ok(f(vm))
    }
}

fn guest_ip(name: &str) -> IpAddr {
    let last = name.bytes().fold(10u8, |acc, b| acc.wrapping_add(b)) | 1;
    IpAddr::V4(Ipv4Addr::new(192, 168, 122, last))
}

#[async_trait]
impl HypervisorControl for FakeHypervisor {
    async fn create(&self, request: &CreateRequest) -> Result<CreationHandle> {
        let name = request.spec.name.clone();
        if self.state.lock().unwrap().vms.contains_key(&name) {
            return Err(Error::Hypervisor {
                operation: "create",
                target: name,
                reason: "domain already exists".into(),
            });
        }

        let start = Instant::now();
        tokio::time::sleep(self.define_delay).await;
        let end = Instant::now();

        let mut state = self.state.lock().unwrap();
        state.defines.push(DefineSpan {
            vm: name.clone(),
            start,
            end,
        });
        if self.failing.contains(&name) {
            return Err(Error::Hypervisor {
                operation: "create",
                target: name,
                reason: "install failed".into(),
            });
        }
        state.vms.insert(
            name.clone(),
            FakeVm {
                request: Some(request.clone()),
                ..FakeVm::default()
            },
        );
        Ok(CreationHandle {
            vm_name: name,
            process_marker: Some("virt-install".into()),
        })
    }

    async fn get_ip(&self, vm_name: &str) -> Advisory<IpAddr> {
        let lookups = self
            .with_vm(vm_name, |vm| {
                vm.ip_lookups += 1;
                vm.ip_lookups
            })
            .map_err(AdvisoryError::from)?;
        match self.ip_after_lookups {
            Some(n) if lookups > n => Ok(guest_ip(vm_name)),
            _ => Err(AdvisoryError::not_yet_available(vm_name)),
        }
    }

    async fn power_off(&self, vm_name: &str) -> Result<()> {
        self.with_vm(vm_name, |vm| vm.visible_devices.clear())
    }

    async fn power_on(&self, vm_name: &str) -> Result<()> {
        let hide = self.hide_devices;
        self.with_vm(vm_name, |vm| {
            vm.power_cycles += 1;
            if !hide {
                vm.visible_devices = vm.defined_devices.clone();
            }
        })
    }

    async fn reboot(&self, vm_name: &str) -> Result<()> {
        self.with_vm(vm_name, |vm| vm.reboots += 1)
    }

    async fn destroy(&self, vm_name: &str) -> Result<()> {
        self.state.lock().unwrap().vms.remove(vm_name);
        Ok(())
    }

    async fn attach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.with_vm(&descriptor.vm_name, |vm| {
            vm.defined_devices.insert(descriptor.locator);
        })
    }

    async fn detach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let removed = self.with_vm(&descriptor.vm_name, |vm| {
            vm.defined_devices.remove(&descriptor.locator)
        })?;
        if removed {
            Ok(())
        } else {
            Err(Error::Hypervisor {
                operation: "detach_device",
                target: descriptor.vm_name.clone(),
                reason: "device not found in definition".into(),
            })
        }
    }

    async fn device_present(&self, vm_name: &str, locator: &DeviceLocator) -> Result<bool> {
        self.with_vm(vm_name, |vm| vm.visible_devices.contains(locator))
    }

    async fn define_pool(&self, pool_id: &str, _backing_path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pools.insert(pool_id.to_string());
        state.pool_defines.push(pool_id.to_string());
        Ok(())
    }

    async fn undefine_pool(&self, pool_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pools.remove(pool_id);
        state.pool_undefines.push(pool_id.to_string());
        Ok(())
    }

    async fn pool_exists(&self, pool_id: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().pools.contains(pool_id))
    }
}

// ---------------------------------------------------------------------------
// Session helpers
// ---------------------------------------------------------------------------

pub fn executor(shell: Arc<FakeShell>) -> CommandExecutor {
    CommandExecutor::new(shell, RetryPolicy::default(), Duration::from_secs(30))
}

pub fn session_with(
    hypervisor: Arc<FakeHypervisor>,
    shell: Arc<FakeShell>,
    host_os: HostOs,
) -> Arc<OrchestratorSession> {
    OrchestratorSession::new(hypervisor, executor(shell), OrchestratorConfig::default(), host_os)
}

pub fn session(hypervisor: Arc<FakeHypervisor>) -> Arc<OrchestratorSession> {
    session_with(hypervisor, Arc::new(FakeShell::default()), HostOs::Linux)
}

pub fn ids(candidates: &[&str]) -> Vec<String> {
    candidates.iter().map(|s| s.to_string()).collect()
}
