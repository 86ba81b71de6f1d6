//! Provisioning session: VM creation, boot confirmation, pools and devices.
//!
//! ```text
//! create_vm ─► register record ─► take pool volume
//!                 │
//!                 ├─ parallel ──► worker task ─┐
//!                 └─ sequential ───────────────┤
//!                                              ▼
//!        [define gate if parallel and no explicit volume] create + settle
//!                                              │
//!                          creation-exit wait (advisory)
//!                                              │
//!        boot detection ─► one reboot (on timeout, or always for Windows guests)
//!                                              │
//!                               record: Ready | Unconfirmed
//! ```
//!
//! One session owns the name registry, the pool table and the define gate,
//! so nothing leaks between unrelated runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::attachment::{AttachmentState, AttachmentTransaction, DeviceLocator, PowerCycle};
use super::pool::{PoolManager, PoolSelection};
use super::readiness::{
    self, BootOutcome, BootSignals, PollSchedule, ReachabilityProbe, sleep_or_cancel,
};
use super::{CpuAffinity, GuestOsFamily, HostOs, VmRecord, VmSpec, VmState};
use crate::config::OrchestratorConfig;
use crate::error::{Advisory, Error, Result};
use crate::hypervisor::{CreateRequest, CreationHandle, HypervisorControl};
use crate::remote::CommandExecutor;

/// Per-call creation options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Run creation and boot detection on a worker; join with
    /// [`OrchestratorSession::await_all`].
    pub parallel: bool,
    /// Pool to take a volume from. Must come from
    /// [`OrchestratorSession::allocate_pool`].
    pub pool_id: Option<String>,
    /// Pre-selected volume. Parallel creations without one are serialized
    /// through the define gate.
    pub pool_volume_id: Option<String>,
    /// Overrides the spec's affinity; the vCPU count follows the core count.
    pub core_affinity: Option<CpuAffinity>,
    /// Added to the spec's disk, for guests that host nested VMs.
    pub extra_disk_gb: Option<u32>,
}

/// What [`OrchestratorSession::create_vm`] hands back.
#[derive(Debug)]
pub enum Creation {
    /// Running on a worker; the record appears in `await_all`.
    Spawned(String),
    Completed(VmRecord),
}

/// Result of [`OrchestratorSession::cleanup_pools`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolCleanup {
    pub released: Vec<String>,
    pub busy: Vec<String>,
}

// ---------------------------------------------------------------------------
// Define gate
// ---------------------------------------------------------------------------

/// Held while an anonymous-pool define runs. Dropping it lets the next one in.
struct DefinePermit {
    _release: oneshot::Sender<()>,
}

/// Single-owner task that hands out one [`DefinePermit`] at a time.
struct DefineGate {
    requests: mpsc::Sender<oneshot::Sender<DefinePermit>>,
}

impl DefineGate {
    fn spawn() -> Self {
        let (requests, mut incoming) = mpsc::channel::<oneshot::Sender<DefinePermit>>(64);
        tokio::spawn(async move {
            while let Some(grant) = incoming.recv().await {
                let (release, released) = oneshot::channel();
                if grant.send(DefinePermit { _release: release }).is_ok() {
                    // Resolves with an error once the permit is dropped.
                    let _ = released.await;
                }
            }
        });
        Self { requests }
    }

    async fn acquire(&self, vm_name: &str) -> Result<DefinePermit> {
        let closed = || Error::Hypervisor {
            operation: "define",
            target: vm_name.to_string(),
            reason: "define gate closed".to_string(),
        };
        let (grant, granted) = oneshot::channel();
        self.requests.send(grant).await.map_err(|_| closed())?;
        granted.await.map_err(|_| closed())
    }
}

// ---------------------------------------------------------------------------
// Boot signals
// ---------------------------------------------------------------------------

struct GuestSignals<'a> {
    hypervisor: &'a dyn HypervisorControl,
    probe: &'a ReachabilityProbe,
    vm_name: &'a str,
}

#[async_trait]
impl BootSignals for GuestSignals<'_> {
    async fn lookup_ip(&self) -> Advisory<IpAddr> {
        self.hypervisor.get_ip(self.vm_name).await
    }

    async fn probe(&self, ip: IpAddr, cancel: &CancellationToken) -> bool {
        self.probe.confirm(ip, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

type Worker = (String, JoinHandle<Result<VmRecord>>);

pub struct OrchestratorSession {
    hypervisor: Arc<dyn HypervisorControl>,
    config: OrchestratorConfig,
    host_os: HostOs,
    probe: ReachabilityProbe,
    executor: CommandExecutor,
    records: Mutex<HashMap<String, VmRecord>>,
    pools: tokio::sync::Mutex<PoolManager>,
    gate: DefineGate,
    workers: Mutex<Vec<Worker>>,
    cancel: CancellationToken,
}

impl OrchestratorSession {
    /// Must be called from within a Tokio runtime (the define gate is a task).
    pub fn new(
        hypervisor: Arc<dyn HypervisorControl>,
        executor: CommandExecutor,
        config: OrchestratorConfig,
        host_os: HostOs,
    ) -> Arc<Self> {
        let probe = ReachabilityProbe::new(executor.clone(), &config.timings);
        let pools = PoolManager::new(config.pool_volume_capacity);
        Arc::new(Self {
            hypervisor,
            host_os,
            probe,
            executor,
            records: Mutex::new(HashMap::new()),
            pools: tokio::sync::Mutex::new(pools),
            gate: DefineGate::spawn(),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            config,
        })
    }

    // -- records ------------------------------------------------------------

    /// Snapshot of every live record, sorted by name.
    pub fn records(&self) -> Vec<VmRecord> {
        let mut all: Vec<VmRecord> = self
            .records
            .lock()
            .expect("records mutex poisoned")
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn record(&self, vm_name: &str) -> Option<VmRecord> {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .get(vm_name)
            .cloned()
    }

    fn register(&self, spec: &VmSpec) -> Result<()> {
        let mut records = self.records.lock().expect("records mutex poisoned");
        if records.contains_key(&spec.name) {
            return Err(Error::DuplicateVm(spec.name.clone()));
        }
        records.insert(spec.name.clone(), VmRecord::new(spec, None, None));
        Ok(())
    }

    fn update<F>(&self, vm_name: &str, f: F) -> Result<VmRecord>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut records = self.records.lock().expect("records mutex poisoned");
        let record = records
            .get_mut(vm_name)
            .ok_or_else(|| Error::UnknownVm(vm_name.to_string()))?;
        f(record);
        Ok(record.clone())
    }

    /// Drop the record and give its volume back.
    async fn forget(&self, vm_name: &str) {
        let removed = self
            .records
            .lock()
            .expect("records mutex poisoned")
            .remove(vm_name);
        if let Some(pool_id) = removed.and_then(|r| r.pool_id) {
            self.pools.lock().await.release_vm(&pool_id, vm_name);
        }
    }

    fn require_booted(&self, vm_name: &str) -> Result<()> {
        let record = self
            .record(vm_name)
            .ok_or_else(|| Error::UnknownVm(vm_name.to_string()))?;
        if !record.state.is_booted() {
            return Err(Error::VmNotReady {
                vm: vm_name.to_string(),
                state: record.state.to_string(),
            });
        }
        Ok(())
    }

    // -- creation -----------------------------------------------------------

    /// Create one VM.
    ///
    /// Sequential calls return the final record. Parallel calls return as
    /// soon as the worker is spawned. Boot timeouts never fail the call; the
    /// record ends up `Unconfirmed` instead.
    pub async fn create_vm(self: &Arc<Self>, spec: VmSpec, options: CreateOptions) -> Result<Creation> {
        self.register(&spec)?;

        if let Some(pool_id) = &options.pool_id {
            let allocated = self.pools.lock().await.allocate_volume(
                pool_id,
                &spec.name,
                options.pool_volume_id.as_deref(),
            );
            let volume_id = match allocated {
                Ok(volume_id) => volume_id,
                Err(e) => {
                    self.forget(&spec.name).await;
                    return Err(e);
                }
            };
            self.update(&spec.name, |r| {
                r.pool_id = Some(pool_id.clone());
                r.volume_id = Some(volume_id);
            })?;
        }

        let request = self.build_request(&spec, &options)?;
        let gated = options.parallel && options.pool_volume_id.is_none();

        if options.parallel {
            let session = Arc::clone(self);
            let handle = tokio::spawn(async move { session.provision(request, gated).await });
            self.workers
                .lock()
                .expect("workers mutex poisoned")
                .push((spec.name.clone(), handle));
            info!(vm = %spec.name, gated, "creation worker spawned");
            return Ok(Creation::Spawned(spec.name));
        }

        self.provision(request, false).await.map(Creation::Completed)
    }

    fn build_request(&self, spec: &VmSpec, options: &CreateOptions) -> Result<CreateRequest> {
        let record = self
            .record(&spec.name)
            .ok_or_else(|| Error::UnknownVm(spec.name.clone()))?;

        let affinity = options
            .core_affinity
            .clone()
            .or_else(|| spec.cpu_affinity.clone());
        let cpu_count = affinity
            .as_ref()
            .map(|a| u32::try_from(a.len()).unwrap_or(u32::MAX))
            .unwrap_or(spec.cpu_count);

        let mut effective = spec.clone();
        effective.cpu_affinity = affinity;

        Ok(CreateRequest {
            spec: effective,
            cpu_count,
            disk_gb: spec
                .disk_gb
                .saturating_add(options.extra_disk_gb.unwrap_or(0)),
            pool_id: record.pool_id,
            volume_id: record.volume_id,
        })
    }

    async fn provision(&self, request: CreateRequest, gated: bool) -> Result<VmRecord> {
        let vm_name = request.spec.name.clone();

        let creation = match self.define(&request, gated).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(vm = %vm_name, error = %e, "hypervisor create failed");
                self.forget(&vm_name).await;
                return Err(e);
            }
        };

        self.update(&vm_name, |r| r.set_state(VmState::Booting))?;

        readiness::wait_for_creation_exit(
            &self.executor,
            &creation,
            PollSchedule::creation(&self.config.timings),
            &self.cancel,
        )
        .await;

        let outcome = match self.confirm_boot(&vm_name, request.spec.os_family).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(vm = %vm_name, error = %e, "guest reboot failed");
                self.update(&vm_name, |r| r.set_state(VmState::Unconfirmed))?;
                return Err(e);
            }
        };

        let record = self.apply_boot_outcome(&vm_name, outcome)?;
        info!(vm = %vm_name, state = %record.state, outcome = %outcome, "provisioning finished");
        Ok(record)
    }

    /// The hypervisor create call, behind the define gate when `gated`.
    async fn define(&self, request: &CreateRequest, gated: bool) -> Result<CreationHandle> {
        let vm_name = request.spec.name.as_str();
        let _permit = if gated {
            Some(self.gate.acquire(vm_name).await?)
        } else {
            None
        };

        info!(vm = vm_name, gated, "defining VM");
        let handle = self.hypervisor.create(request).await?;
        if gated {
            sleep_or_cancel(self.config.timings.define_settle(), &self.cancel).await;
        }
        Ok(handle)
    }

    /// Boot detection plus the single reboot a guest may get.
    ///
    /// Windows-like guests on a non-Windows host are always rebooted once
    /// after the first wait. Everything else is rebooted only when the first
    /// wait timed out.
    async fn confirm_boot(&self, vm_name: &str, os_family: GuestOsFamily) -> Result<BootOutcome> {
        let outcome = self.detect_boot(vm_name).await;
        if matches!(outcome, BootOutcome::Cancelled { .. }) {
            return Ok(outcome);
        }

        if os_family.is_windows_like() && !self.host_os.is_windows() {
            info!(vm = vm_name, "rebooting Windows guest once after first boot");
            self.hypervisor.reboot(vm_name).await?;
            sleep_or_cancel(self.config.timings.guest_reboot_settle(), &self.cancel).await;
            return Ok(self.detect_boot(vm_name).await);
        }

        if let BootOutcome::TimedOut { elapsed } = outcome {
            warn!(
                vm = vm_name,
                elapsed_secs = elapsed.as_secs(),
                "guest not reachable, rebooting once before giving up"
            );
            self.hypervisor.reboot(vm_name).await?;
            return Ok(self.detect_boot(vm_name).await);
        }
        Ok(outcome)
    }

    async fn detect_boot(&self, vm_name: &str) -> BootOutcome {
        let signals = GuestSignals {
            hypervisor: self.hypervisor.as_ref(),
            probe: &self.probe,
            vm_name,
        };
        readiness::detect_boot(
            vm_name,
            &signals,
            PollSchedule::boot(&self.config.timings),
            &self.cancel,
        )
        .await
    }

    fn apply_boot_outcome(&self, vm_name: &str, outcome: BootOutcome) -> Result<VmRecord> {
        self.update(vm_name, |r| match outcome {
            BootOutcome::Ready { ip, .. } => {
                r.ip = Some(ip);
                r.set_state(VmState::Ready);
            }
            BootOutcome::TimedOut { .. } | BootOutcome::Cancelled { .. } => {
                r.set_state(VmState::Unconfirmed)
            }
        })
    }

    /// Join every outstanding worker, then wait out the settle interval.
    ///
    /// Results come back in spawn order. A worker that panicked is reported
    /// as [`Error::WorkerPanicked`] and its record is dropped.
    pub async fn await_all(&self) -> Vec<(String, Result<VmRecord>)> {
        let workers = std::mem::take(&mut *self.workers.lock().expect("workers mutex poisoned"));
        if workers.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(workers.len());
        for (vm_name, handle) in workers {
            let result = match handle.await {
                Ok(result) => result,
                Err(join) => {
                    error!(vm = %vm_name, error = %join, "creation worker did not finish");
                    self.forget(&vm_name).await;
                    Err(Error::WorkerPanicked {
                        vm: vm_name.clone(),
                        reason: join.to_string(),
                    })
                }
            };
            results.push((vm_name, result));
        }

        info!(
            workers = results.len(),
            settle_secs = self.config.timings.await_settle_secs,
            "all creation workers joined, settling"
        );
        sleep_or_cancel(self.config.timings.await_settle(), &self.cancel).await;
        results
    }

    // -- pools --------------------------------------------------------------

    /// Find a usable pool among `candidates` or define a new one at
    /// `backing_path`. Returns the same id until the pool is consumed.
    pub async fn allocate_pool(&self, candidates: &[String], backing_path: &str) -> Result<String> {
        let mut pools = self.pools.lock().await;
        match pools.select(candidates)? {
            PoolSelection::Existing(pool_id) => Ok(pool_id),
            PoolSelection::Create(pool_id) => {
                if self.hypervisor.pool_exists(&pool_id).await? {
                    warn!(pool = %pool_id, "replacing stale pool left by an earlier run");
                    self.hypervisor.undefine_pool(&pool_id).await?;
                }
                self.hypervisor.define_pool(&pool_id, backing_path).await?;
                pools.register(&pool_id, backing_path);
                info!(pool = %pool_id, path = backing_path, "pool defined");
                Ok(pool_id)
            }
        }
    }

    /// Undefine a pool. Fails with `PoolBusy` while any live record uses it.
    pub async fn release_pool(&self, pool_id: &str) -> Result<()> {
        let mut pools = self.pools.lock().await;
        pools.ensure_releasable(pool_id)?;
        self.hypervisor.undefine_pool(pool_id).await?;
        pools.remove(pool_id)?;
        info!(pool = pool_id, "pool released");
        Ok(())
    }

    /// Release every pool nothing references; report the rest as busy.
    pub async fn cleanup_pools(&self) -> Result<PoolCleanup> {
        let ids = self.pools.lock().await.pool_ids();
        let mut report = PoolCleanup::default();
        for pool_id in ids {
            match self.release_pool(&pool_id).await {
                Ok(()) => report.released.push(pool_id),
                Err(Error::PoolBusy { .. }) => report.busy.push(pool_id),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Destroy the VM, drop its record and free its volume.
    pub async fn teardown_vm(&self, vm_name: &str) -> Result<()> {
        if self.record(vm_name).is_none() {
            return Err(Error::UnknownVm(vm_name.to_string()));
        }
        self.hypervisor.destroy(vm_name).await?;
        self.forget(vm_name).await;
        info!(vm = vm_name, "VM torn down");
        Ok(())
    }

    /// Forced power-off, power-on, then boot detection. The record's IP is
    /// refreshed from the new boot.
    pub async fn power_cycle(&self, vm_name: &str) -> Result<BootOutcome> {
        self.update(vm_name, |r| r.set_state(VmState::PowerCycling))?;
        info!(vm = vm_name, "power cycling");

        let restarted = async {
            self.hypervisor.power_off(vm_name).await?;
            self.hypervisor.power_on(vm_name).await
        }
        .await;
        if let Err(e) = restarted {
            self.update(vm_name, |r| r.set_state(VmState::Unconfirmed))?;
            return Err(e);
        }

        let outcome = self.detect_boot(vm_name).await;
        self.apply_boot_outcome(vm_name, outcome)?;
        Ok(outcome)
    }

    // -- devices ------------------------------------------------------------

    pub async fn attach_device(&self, vm_name: &str, locator: DeviceLocator) -> Result<AttachmentState> {
        self.require_booted(vm_name)?;
        AttachmentTransaction::new(self.hypervisor.as_ref(), vm_name, locator, AttachmentState::Detached)
            .attach(self)
            .await
    }

    pub async fn detach_device(&self, vm_name: &str, locator: DeviceLocator) -> Result<AttachmentState> {
        self.require_booted(vm_name)?;
        AttachmentTransaction::new(self.hypervisor.as_ref(), vm_name, locator, AttachmentState::Attached)
            .detach(self)
            .await
    }

    // -- misc ---------------------------------------------------------------

    /// Ping `ip` from the SUT for up to `max_wait`.
    pub async fn is_reachable(&self, ip: IpAddr, max_wait: Duration) -> bool {
        self.probe.is_reachable(ip, max_wait, &self.cancel).await
    }

    /// End every in-flight wait. Running remote commands are not interrupted.
    pub fn cancel(&self) {
        info!("cancelling in-flight waits");
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
impl PowerCycle for OrchestratorSession {
    async fn power_cycle(&self, vm_name: &str) -> Result<BootOutcome> {
        OrchestratorSession::power_cycle(self, vm_name).await
    }
}
