//! Error taxonomy for the provisioning core.
//!
//! Hard failures are [`Error`] values and always reach the caller. Steps that
//! are allowed to fail (speculative cleanup, process-table checks, IP lookups
//! while a guest is still booting) return [`Advisory`] instead, so that
//! "ignored on purpose" is visible in the signature rather than buried in a
//! swallowed error.

use std::time::Duration;

use thiserror::Error;

use crate::remote::CommandOutput;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a best-effort step.
pub type Advisory<T> = std::result::Result<T, AdvisoryError>;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote command ran and returned a non-zero exit code.
    #[error(
        "command `{command}` on {host} failed with exit code {exit_code} after {:.1}s: {stderr}",
        elapsed.as_secs_f64()
    )]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    },

    /// The remote command did not finish within its bound.
    #[error("command `{command}` on {host} timed out after {:.1}s", elapsed.as_secs_f64())]
    CommandTimeout {
        host: String,
        command: String,
        elapsed: Duration,
    },

    /// Transport kept failing after the whole retry budget was spent.
    #[error("connection to {host} lost after {attempts} attempts running `{command}`: {reason}")]
    ConnectionLost {
        host: String,
        command: String,
        attempts: u32,
        reason: String,
        elapsed: Duration,
    },

    #[error("pool {pool_id} is still referenced by {}", vms.join(", "))]
    PoolBusy { pool_id: String, vms: Vec<String> },

    #[error("no usable pool among candidates [{}]", candidates.join(", "))]
    PoolExhausted { candidates: Vec<String> },

    #[error("unknown pool {0}")]
    UnknownPool(String),

    #[error("volume {volume_id} in pool {pool_id} is already held by {vm}")]
    VolumeInUse {
        pool_id: String,
        volume_id: String,
        vm: String,
    },

    /// The device was not visible in the guest after the power cycle.
    #[error(
        "device {device} not present in {vm} after power cycle ({:.1}s): {detail}",
        elapsed.as_secs_f64()
    )]
    DeviceAttachmentFailed {
        vm: String,
        device: String,
        detail: String,
        elapsed: Duration,
    },

    #[error("a VM named {0} is already active on this host")]
    DuplicateVm(String),

    #[error("unknown VM {0}")]
    UnknownVm(String),

    #[error("VM {vm} is {state}, expected a booted guest")]
    VmNotReady { vm: String, state: String },

    #[error("invalid device locator {input:?}: {reason}")]
    InvalidLocator { input: String, reason: String },

    #[error("invalid CPU core list {input:?}: {reason}")]
    InvalidAffinity { input: String, reason: String },

    /// The hypervisor control interface rejected an operation without a
    /// command-level failure (e.g. an in-memory or API backend).
    #[error("hypervisor {operation} failed for {target}: {reason}")]
    Hypervisor {
        operation: &'static str,
        target: String,
        reason: String,
    },

    #[error("creation worker for {vm} panicked: {reason}")]
    WorkerPanicked { vm: String, reason: String },
}

impl Error {
    /// Captured stdout of the failing command, if any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { stdout, .. } => Some(stdout),
            _ => None,
        }
    }

    /// Captured stderr of the failing command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Time spent before the failure was declared, if it was measured.
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Error::CommandFailed { elapsed, .. }
            | Error::CommandTimeout { elapsed, .. }
            | Error::ConnectionLost { elapsed, .. }
            | Error::DeviceAttachmentFailed { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }
}

/// Failure of a best-effort step.
///
/// Carries whatever output was produced so a caller can still inspect it.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct AdvisoryError {
    pub reason: String,
    pub partial: Option<CommandOutput>,
}

impl AdvisoryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            partial: None,
        }
    }

    pub fn with_output(reason: impl Into<String>, output: CommandOutput) -> Self {
        Self {
            reason: reason.into(),
            partial: Some(output),
        }
    }

    /// Used by IP lookups while the guest has not published an address yet.
    pub fn not_yet_available(vm: &str) -> Self {
        Self::new(format!("IP of {vm} not yet available"))
    }

    /// Whatever output the failed step produced (empty when none).
    pub fn into_partial(self) -> CommandOutput {
        self.partial.unwrap_or_default()
    }
}

impl From<Error> for AdvisoryError {
    fn from(err: Error) -> Self {
        let partial = match &err {
            Error::CommandFailed {
                stdout,
                stderr,
                exit_code,
                ..
            } => Some(CommandOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: *exit_code,
            }),
            _ => None,
        };
        Self {
            reason: err.to_string(),
            partial,
        }
    }
}
