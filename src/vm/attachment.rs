//! Device attachment transactions.
//!
//! ```text
//! Detached ── pre-detach (advisory), attach --config ──► PendingPowerCycle
//! PendingPowerCycle ── power off, power on, boot wait ──► Attached
//! Attached ── detach, power off, power on, boot wait ──► Detached
//! ```
//!
//! The definition change is only persisted, so a forced power cycle follows
//! every apply. Presence is then checked from inside the guest; a miss is
//! reported and never retried.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::readiness::BootOutcome;
use crate::error::{AdvisoryError, Error, Result};
use crate::hypervisor::{DeviceDescriptor, HypervisorControl};

fn pci_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([0-9a-fA-F]{4}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])\b")
            .expect("valid regex")
    })
}

/// Address of a passthrough device on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceLocator {
    /// `domain:bus:slot.function`
    Pci {
        domain: u16,
        bus: u8,
        slot: u8,
        function: u8,
    },
    /// Mediated device slice.
    Mediated(Uuid),
}

impl DeviceLocator {
    /// Accepts a bare PCI address, an `lspci -D` line that starts with one,
    /// or an mdev UUID.
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(caps) = pci_regex().captures(input) {
            let hex = |i: usize| u16::from_str_radix(&caps[i], 16);
            let (Ok(domain), Ok(bus), Ok(slot), Ok(function)) = (hex(1), hex(2), hex(3), hex(4))
            else {
                return Err(Error::InvalidLocator {
                    input: input.to_string(),
                    reason: "unparsable PCI address".to_string(),
                });
            };
            return Ok(DeviceLocator::Pci {
                domain,
                bus: bus as u8,
                slot: slot as u8,
                function: function as u8,
            });
        }

        Uuid::parse_str(input.trim())
            .map(DeviceLocator::Mediated)
            .map_err(|e| Error::InvalidLocator {
                input: input.to_string(),
                reason: format!("neither a PCI address nor an mdev UUID ({e})"),
            })
    }

    pub fn is_mediated(&self) -> bool {
        matches!(self, DeviceLocator::Mediated(_))
    }
}

impl FromStr for DeviceLocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceLocator {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DeviceLocator> for String {
    fn from(value: DeviceLocator) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLocator::Pci {
                domain,
                bus,
                slot,
                function,
            } => write!(f, "{domain:04x}:{bus:02x}:{slot:02x}.{function:x}"),
            DeviceLocator::Mediated(uuid) => write!(f, "{uuid}"),
        }
    }
}

/// Where a transaction currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Detached,
    PendingPowerCycle,
    Attached,
    /// Apply or verification failed. The stored definition may or may not
    /// hold the device; the caller has to decide what to do.
    Failed,
}

/// Forced power cycle followed by boot detection.
///
/// Implemented by the session, which also refreshes the VM record.
#[async_trait]
pub trait PowerCycle: Send + Sync {
    async fn power_cycle(&self, vm_name: &str) -> Result<BootOutcome>;
}

/// One attach or detach of one device on one VM.
pub struct AttachmentTransaction<'a> {
    hypervisor: &'a dyn HypervisorControl,
    vm_name: &'a str,
    locator: DeviceLocator,
    state: AttachmentState,
    started: Instant,
}

impl<'a> AttachmentTransaction<'a> {
    /// `initial` is `Detached` for an attach and `Attached` for a detach.
    pub fn new(
        hypervisor: &'a dyn HypervisorControl,
        vm_name: &'a str,
        locator: DeviceLocator,
        initial: AttachmentState,
    ) -> Self {
        Self {
            hypervisor,
            vm_name,
            locator,
            state: initial,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    fn advance(&mut self, next: AttachmentState) {
        debug!(vm = self.vm_name, device = %self.locator, from = ?self.state, to = ?next, "attachment state");
        self.state = next;
    }

    fn descriptor(&self, present: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            vm_name: self.vm_name.to_string(),
            locator: self.locator,
            present,
        }
    }

    fn failed(&mut self, detail: String) -> Error {
        self.advance(AttachmentState::Failed);
        Error::DeviceAttachmentFailed {
            vm: self.vm_name.to_string(),
            device: self.locator.to_string(),
            detail,
            elapsed: self.started.elapsed(),
        }
    }

    pub async fn attach(mut self, cycler: &dyn PowerCycle) -> Result<AttachmentState> {
        info!(vm = self.vm_name, device = %self.locator, "attaching device");

        // Leftover definitions from earlier runs would make the attach fail.
        let leftover = self.descriptor(false);
        if let Err(e) = self.hypervisor.detach_device_descriptor(&leftover).await {
            let advisory = AdvisoryError::from(e);
            debug!(vm = self.vm_name, device = %self.locator, reason = %advisory, "pre-detach ignored");
        }

        let descriptor = self.descriptor(true);
        if let Err(e) = self.hypervisor.attach_device_descriptor(&descriptor).await {
            self.advance(AttachmentState::Failed);
            return Err(e);
        }
        self.advance(AttachmentState::PendingPowerCycle);

        let boot = match cycler.power_cycle(self.vm_name).await {
            Ok(boot) => boot,
            Err(e) => {
                self.advance(AttachmentState::Failed);
                return Err(e);
            }
        };

        if !self.hypervisor.device_present(self.vm_name, &self.locator).await? {
            let err = self.failed(format!("guest does not report the device ({boot})"));
            warn!(error = %err, "device attachment not verified");
            return Err(err);
        }

        self.advance(AttachmentState::Attached);
        info!(
            vm = self.vm_name,
            device = %self.locator,
            elapsed_secs = self.started.elapsed().as_secs(),
            "device attached"
        );
        Ok(self.state)
    }

    pub async fn detach(mut self, cycler: &dyn PowerCycle) -> Result<AttachmentState> {
        info!(vm = self.vm_name, device = %self.locator, "detaching device");

        let descriptor = self.descriptor(false);
        if let Err(e) = self.hypervisor.detach_device_descriptor(&descriptor).await {
            self.advance(AttachmentState::Failed);
            return Err(e);
        }
        self.advance(AttachmentState::PendingPowerCycle);

        let boot = match cycler.power_cycle(self.vm_name).await {
            Ok(boot) => boot,
            Err(e) => {
                self.advance(AttachmentState::Failed);
                return Err(e);
            }
        };

        if self.hypervisor.device_present(self.vm_name, &self.locator).await? {
            let err = self.failed(format!("guest still reports the device ({boot})"));
            warn!(error = %err, "device detach not verified");
            return Err(err);
        }

        self.advance(AttachmentState::Detached);
        info!(vm = self.vm_name, device = %self.locator, "device detached");
        Ok(self.state)
    }
}
