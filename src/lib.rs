//! virt-provision: VM provisioning and device attachment for hardware
//! validation hosts.
//!
//! The library creates many VMs concurrently on one hypervisor host, waits
//! for each guest to come up by polling (there is no event channel), keeps
//! track of the storage pools they share and moves passthrough devices in
//! and out of running guests. Every remote command goes through a
//! [`remote::CommandExecutor`] that reconnects and retries on transport
//! failures.
//!
//! Hypervisor command syntax is not part of the library: it talks to a
//! [`hypervisor::HypervisorControl`] implementation, normally the
//! template-driven [`hypervisor::CommandHypervisor`].

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod logging;
pub mod remote;
pub mod state_machine;
pub mod vm;

pub use error::{Advisory, AdvisoryError, Error, Result};
