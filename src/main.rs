//! virt-provision: run VM provisioning plans against a hypervisor host.
//!
//! ```text
//! virt-provision run plan.toml          pools → VM batch → devices → summary
//! virt-provision ping --plan plan.toml 192.168.122.45
//! virt-provision check-config plan.toml
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use virt_provision::config::Plan;
use virt_provision::hypervisor::CommandHypervisor;
use virt_provision::logging;
use virt_provision::remote::{CommandExecutor, RetryPolicy, SshShell};
use virt_provision::vm::{
    AttachmentState, Creation, DeviceLocator, OrchestratorSession, PoolCleanup, VmRecord,
};

/// VM provisioning and device attachment for hardware validation hosts
#[derive(Parser, Debug)]
#[command(name = "virt-provision", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a plan and print a JSON summary of the resulting VMs
    Run {
        plan: PathBuf,
        /// Destroy the VMs and sweep pools afterwards, whatever the plan says
        #[arg(long)]
        teardown: bool,
    },
    /// Check from the SUT whether a guest answers pings
    Ping {
        ip: IpAddr,
        /// Plan whose [ssh] section names the SUT
        #[arg(long)]
        plan: PathBuf,
        #[arg(long, default_value_t = 30)]
        max_wait_secs: u64,
    },
    /// Validate a plan without touching the SUT
    CheckConfig {
        plan: PathBuf,
        /// Print the plan with every default filled in
        #[arg(long)]
        print: bool,
    },
}

#[derive(Debug, Serialize)]
struct Failure {
    vm: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct DeviceResult {
    vm: String,
    device: String,
    state: Option<AttachmentState>,
    error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    vms: Vec<VmRecord>,
    failures: Vec<Failure>,
    devices: Vec<DeviceResult>,
    pools: Option<PoolCleanup>,
}

impl RunSummary {
    fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.devices.iter().all(|d| d.error.is_none())
    }
}

fn connect(plan: &Plan) -> (CommandExecutor, Arc<CommandHypervisor>) {
    let shell = Arc::new(SshShell::from_config(&plan.ssh));
    let executor = CommandExecutor::new(
        shell,
        RetryPolicy::from(&plan.orchestrator.retry),
        plan.orchestrator.timings.command_timeout(),
    );
    let hypervisor = Arc::new(CommandHypervisor::new(executor.clone(), plan.hypervisor.clone()));
    (executor, hypervisor)
}

async fn run(path: &Path, force_teardown: bool) -> Result<RunSummary> {
    let plan = Plan::load(path)?;
    let (executor, hypervisor) = connect(&plan);
    let session = OrchestratorSession::new(hypervisor, executor, plan.orchestrator.clone(), plan.host_os);

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling waits");
            token.cancel();
        }
    });

    for pool in &plan.pools {
        let pool_id = session
            .allocate_pool(&pool.candidates, &pool.backing_path)
            .await
            .with_context(|| format!("allocating pool at {}", pool.backing_path))?;
        info!(pool = %pool_id, "pool ready");
    }

    let mut summary = RunSummary::default();

    for vm in &plan.vms {
        match session.create_vm(vm.spec.clone(), vm.create_options()).await {
            Ok(Creation::Spawned(name)) => info!(vm = %name, "creation running in background"),
            Ok(Creation::Completed(record)) => info!(vm = %record.name, state = %record.state, "VM created"),
            Err(e) => {
                error!(vm = %vm.spec.name, error = %e, "creation failed");
                summary.failures.push(Failure {
                    vm: vm.spec.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    for (vm, result) in session.await_all().await {
        if let Err(e) = result {
            summary.failures.push(Failure {
                vm,
                error: e.to_string(),
            });
        }
    }

    // Devices of one guest go in order; guests run in parallel.
    let attachments = plan
        .vms
        .iter()
        .filter(|vm| !vm.devices.is_empty() && session.record(&vm.spec.name).is_some())
        .map(|vm| {
            let session = Arc::clone(&session);
            async move {
                let mut results = Vec::new();
                for device in &vm.devices {
                    let outcome = match DeviceLocator::parse(device) {
                        Ok(locator) => session.attach_device(&vm.spec.name, locator).await,
                        Err(e) => Err(e),
                    };
                    results.push(DeviceResult {
                        vm: vm.spec.name.clone(),
                        device: device.clone(),
                        state: outcome.as_ref().ok().copied(),
                        error: outcome.err().map(|e| e.to_string()),
                    });
                }
                results
            }
        });
    summary.devices = join_all(attachments).await.into_iter().flatten().collect();

    summary.vms = session.records();

    if plan.teardown || force_teardown {
        for record in &summary.vms {
            if let Err(e) = session.teardown_vm(&record.name).await {
                warn!(vm = %record.name, error = %e, "teardown failed");
            }
        }
        summary.pools = Some(session.cleanup_pools().await.context("sweeping pools")?);
    }

    Ok(summary)
}

async fn ping(plan_path: &Path, ip: IpAddr, max_wait: Duration) -> Result<bool> {
    let plan = Plan::load(plan_path)?;
    let (executor, hypervisor) = connect(&plan);
    let session = OrchestratorSession::new(hypervisor, executor, plan.orchestrator.clone(), plan.host_os);
    Ok(session.is_reachable(ip, max_wait).await)
}

fn check_config(path: &Path, print: bool) -> Result<()> {
    let plan = Plan::load(path)?;
    if print {
        print!("{}", plan.to_toml().context("rendering plan")?);
    }
    let devices: usize = plan.vms.iter().map(|vm| vm.devices.len()).sum();
    println!(
        "{}: ok ({} pools, {} VMs, {} devices)",
        path.display(),
        plan.pools.len(),
        plan.vms.len(),
        devices
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _log_guard = logging::init();
    let args = Args::parse();

    match args.command {
        Command::Run { plan, teardown } => {
            let summary = run(&plan, teardown).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(if summary.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Ping {
            ip,
            plan,
            max_wait_secs,
        } => {
            let reachable = ping(&plan, ip, Duration::from_secs(max_wait_secs)).await?;
            println!("{ip}: {}", if reachable { "reachable" } else { "unreachable" });
            Ok(if reachable {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::CheckConfig { plan, print } => {
            check_config(&plan, print)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
