//! Bounded polling for things the hypervisor gives no event for: the
//! creation process exiting and the guest coming up on the network.
//!
//! Every wait carries its own wall-clock budget and a cancellation token.
//! Running out of time is an outcome, never an error.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use statig::prelude::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Timings;
use crate::error::Advisory;
use crate::hypervisor::CreationHandle;
use crate::remote::CommandExecutor;
use crate::state_machine::boot_sm::{BootEvent, BootMachine, State};

/// Pattern of one echo reply in `ping` output.
fn ping_reply_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*bytes\sfrom.*icmp_seq.*ttl.*time.*").expect("valid regex"))
}

/// Interval and budget of one polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }

    pub fn creation(timings: &Timings) -> Self {
        Self::new(
            Duration::from_secs(timings.creation_poll_interval_secs),
            Duration::from_secs(timings.creation_max_wait_secs),
        )
    }

    pub fn boot(timings: &Timings) -> Self {
        Self::new(
            Duration::from_secs(timings.boot_poll_interval_secs),
            Duration::from_secs(timings.boot_max_wait_secs),
        )
    }

    pub fn reachability(timings: &Timings) -> Self {
        Self::new(timings.reachability_retry(), timings.reachability_window())
    }
}

/// How a [`poll_until`] loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, elapsed: Duration },
    TimedOut { elapsed: Duration },
    Cancelled { elapsed: Duration },
}

impl<T> PollOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollOutcome::Ready { elapsed, .. }
            | PollOutcome::TimedOut { elapsed }
            | PollOutcome::Cancelled { elapsed } => *elapsed,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            PollOutcome::Ready { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run `check` until it yields a value, the budget runs out or `cancel`
/// fires. The first check happens immediately; later ones are spaced by
/// `schedule.interval`. A check is only started while the elapsed time is
/// within `schedule.max_wait`.
pub async fn poll_until<T, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled {
                elapsed: started.elapsed(),
            };
        }
        if let Some(value) = check().await {
            return PollOutcome::Ready {
                value,
                elapsed: started.elapsed(),
            };
        }
        if !sleep_or_cancel(schedule.interval, cancel).await {
            return PollOutcome::Cancelled {
                elapsed: started.elapsed(),
            };
        }
        if started.elapsed() > schedule.max_wait {
            return PollOutcome::TimedOut {
                elapsed: started.elapsed(),
            };
        }
    }
}

/// Lines of `ps -ef` output that belong to the creation process of `vm_name`.
pub fn creation_process_lines<'a>(ps_output: &'a str, vm_name: &str, marker: &str) -> Vec<&'a str> {
    ps_output
        .lines()
        .filter(|line| line.contains(marker) && names_vm(line, vm_name))
        .filter(|line| !line.contains("grep"))
        .collect()
}

/// Whether a process command line names `vm_name` as a whole argument
/// (`--name vm1`, `--name=vm1`, `'vm1'`), so `vm1` never matches `vm10`.
fn names_vm(line: &str, vm_name: &str) -> bool {
    const QUOTES: &[char] = &['\'', '"'];
    line.split_whitespace().any(|arg| {
        let arg = arg.trim_matches(QUOTES);
        arg == vm_name
            || arg
                .rsplit_once('=')
                .is_some_and(|(_, value)| value.trim_matches(QUOTES) == vm_name)
    })
}

/// Wait until the creation process is gone from the SUT's process table.
///
/// Advisory: an unreadable process table counts as "still running" and the
/// caller goes on to boot detection whatever the outcome.
pub async fn wait_for_creation_exit(
    executor: &CommandExecutor,
    handle: &CreationHandle,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> PollOutcome<()> {
    let Some(marker) = handle.process_marker.as_deref() else {
        return PollOutcome::Ready {
            value: (),
            elapsed: Duration::ZERO,
        };
    };

    let outcome = poll_until(schedule, cancel, || async move {
        match executor
            .execute_best_effort("ps -ef", executor.default_timeout())
            .await
        {
            Ok(out) => creation_process_lines(&out.stdout, &handle.vm_name, marker)
                .is_empty()
                .then_some(()),
            Err(e) => {
                debug!(vm = %handle.vm_name, reason = %e, "process table unavailable");
                None
            }
        }
    })
    .await;

    match &outcome {
        PollOutcome::Ready { elapsed, .. } => {
            info!(vm = %handle.vm_name, elapsed_secs = elapsed.as_secs(), "creation process exited")
        }
        PollOutcome::TimedOut { elapsed } => warn!(
            vm = %handle.vm_name,
            elapsed_secs = elapsed.as_secs(),
            "creation process still listed, continuing to boot detection"
        ),
        PollOutcome::Cancelled { .. } => debug!(vm = %handle.vm_name, "creation wait cancelled"),
    }
    outcome
}

/// ICMP reachability check run from the SUT.
#[derive(Clone)]
pub struct ReachabilityProbe {
    executor: CommandExecutor,
    schedule: PollSchedule,
    count: u32,
}

impl ReachabilityProbe {
    pub fn new(executor: CommandExecutor, timings: &Timings) -> Self {
        Self {
            executor,
            schedule: PollSchedule::reachability(timings),
            count: timings.ping_count.max(1),
        }
    }

    /// One burst of echo requests. Partial loss still counts as reachable.
    async fn ping_once(&self, ip: IpAddr) -> bool {
        let command = format!("ping -c {} {ip}", self.count);
        let stdout = match self
            .executor
            .execute_best_effort(&command, self.executor.default_timeout())
            .await
        {
            Ok(out) => out.stdout,
            Err(e) => e.into_partial().stdout,
        };
        stdout.lines().any(|line| ping_reply_regex().is_match(line))
    }

    /// Keep pinging `ip` for up to `max_wait`.
    pub async fn is_reachable(&self, ip: IpAddr, max_wait: Duration, cancel: &CancellationToken) -> bool {
        let schedule = PollSchedule::new(self.schedule.interval, max_wait);
        let outcome = poll_until(schedule, cancel, || async move {
            self.ping_once(ip).await.then_some(())
        })
        .await;
        debug!(%ip, reachable = outcome.is_ready(), elapsed_secs = outcome.elapsed().as_secs(), "reachability");
        outcome.is_ready()
    }

    /// [`is_reachable`](Self::is_reachable) with the configured window.
    pub async fn confirm(&self, ip: IpAddr, cancel: &CancellationToken) -> bool {
        self.is_reachable(ip, self.schedule.max_wait, cancel).await
    }
}

/// Inputs of boot detection for one guest.
#[async_trait]
pub trait BootSignals: Send + Sync {
    /// May fail while the guest is still coming up.
    async fn lookup_ip(&self) -> Advisory<IpAddr>;

    /// Reachability check with its own short retry window.
    async fn probe(&self, ip: IpAddr, cancel: &CancellationToken) -> bool;
}

/// Terminal result of boot detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Ready { ip: IpAddr, elapsed: Duration },
    /// Not fatal: the guest may still come up later.
    TimedOut { elapsed: Duration },
    Cancelled { elapsed: Duration },
}

impl BootOutcome {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            BootOutcome::Ready { ip, .. } => Some(*ip),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, BootOutcome::Ready { .. })
    }
}

impl fmt::Display for BootOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootOutcome::Ready { ip, elapsed } => {
                write!(f, "ready at {ip} after {}s", elapsed.as_secs())
            }
            BootOutcome::TimedOut { elapsed } => {
                write!(f, "timed out after {}s", elapsed.as_secs())
            }
            BootOutcome::Cancelled { elapsed } => {
                write!(f, "cancelled after {}s", elapsed.as_secs())
            }
        }
    }
}

/// Drive the boot state machine until it reaches a terminal state.
///
/// Each round either looks up the IP or probes the known one. A round that
/// does not reach `Ready` is followed by one `schedule.interval` sleep, and
/// the deadline is checked before every round.
pub async fn detect_boot(
    vm_name: &str,
    signals: &dyn BootSignals,
    schedule: PollSchedule,
    cancel: &CancellationToken,
) -> BootOutcome {
    let started = Instant::now();
    let mut sm = BootMachine::new(vm_name).state_machine();

    loop {
        if cancel.is_cancelled() {
            sm.handle(&BootEvent::Cancelled);
        } else if started.elapsed() > schedule.max_wait {
            sm.handle(&BootEvent::DeadlineElapsed);
        }

        let state = sm.state().clone();
        match state {
            State::Ready { ip } => {
                return BootOutcome::Ready {
                    ip,
                    elapsed: started.elapsed(),
                };
            }
            State::TimedOut {} => {
                return BootOutcome::TimedOut {
                    elapsed: started.elapsed(),
                };
            }
            State::Cancelled {} => {
                return BootOutcome::Cancelled {
                    elapsed: started.elapsed(),
                };
            }
            State::WaitingForIp {} => match signals.lookup_ip().await {
                Ok(ip) => {
                    // Probe straight away, no sleep between the two phases.
                    sm.handle(&BootEvent::IpDiscovered(ip));
                    continue;
                }
                Err(e) => {
                    debug!(vm = vm_name, reason = %e, "IP lookup not ready");
                    sm.handle(&BootEvent::IpLookupFailed);
                }
            },
            State::WaitingForReachable { ip } => {
                if signals.probe(ip, cancel).await {
                    sm.handle(&BootEvent::ProbeSucceeded);
                    continue;
                }
                sm.handle(&BootEvent::ProbeFailed);
            }
        }

        if !sleep_or_cancel(schedule.interval, cancel).await {
            sm.handle(&BootEvent::Cancelled);
        }
    }
}
