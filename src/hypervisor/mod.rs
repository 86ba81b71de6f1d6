//! Boundary to the hypervisor control interface.
//!
//! The provisioning core never builds hypervisor command syntax itself. It
//! talks to a [`HypervisorControl`] implementation, which may shell out
//! ([`CommandHypervisor`]), call an API, or be an in-memory double in tests.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::{Advisory, Result};
use crate::vm::{DeviceLocator, VmSpec};

pub mod command;

pub use command::CommandHypervisor;

/// Everything the hypervisor needs to define one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub spec: VmSpec,
    /// vCPU count after applying core affinity.
    pub cpu_count: u32,
    /// Disk size after adding any nested-guest headroom.
    pub disk_gb: u32,
    pub pool_id: Option<String>,
    pub volume_id: Option<String>,
}

/// Returned by [`HypervisorControl::create`].
///
/// Creation may continue asynchronously after the call returns; the only
/// completion signal is the creation process disappearing from the process
/// table. `process_marker` is the string that identifies that process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationHandle {
    pub vm_name: String,
    pub process_marker: Option<String>,
}

/// Transient description of a device to add to or remove from a VM
/// definition. Built per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vm_name: String,
    pub locator: DeviceLocator,
    /// Desired presence after the operation.
    pub present: bool,
}

/// Operations consumed from the hypervisor control interface.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Define and start a VM. Duplicate names must be rejected here.
    async fn create(&self, request: &CreateRequest) -> Result<CreationHandle>;

    /// Look up the guest IP; fails while the guest has not published one.
    async fn get_ip(&self, vm_name: &str) -> Advisory<IpAddr>;

    /// Forced power-off (not an in-guest shutdown).
    async fn power_off(&self, vm_name: &str) -> Result<()>;

    async fn power_on(&self, vm_name: &str) -> Result<()>;

    async fn reboot(&self, vm_name: &str) -> Result<()>;

    /// Stop and undefine the VM.
    async fn destroy(&self, vm_name: &str) -> Result<()>;

    /// Persist the device into the stored definition. Takes effect on the
    /// next cold start.
    async fn attach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()>;

    async fn detach_device_descriptor(&self, descriptor: &DeviceDescriptor) -> Result<()>;

    /// Guest-side query: is the device visible to the running guest?
    async fn device_present(&self, vm_name: &str, locator: &DeviceLocator) -> Result<bool>;

    async fn define_pool(&self, pool_id: &str, backing_path: &str) -> Result<()>;

    async fn undefine_pool(&self, pool_id: &str) -> Result<()>;

    async fn pool_exists(&self, pool_id: &str) -> Result<bool>;
}
