//! Boot detection state machine.
//!
//! Hierarchy:
//! ```text
//! Polling (superstate)            DeadlineElapsed ─► TimedOut
//!   ├── WaitingForIp              Cancelled       ─► Cancelled
//!   └── WaitingForReachable { ip }
//! Ready { ip }
//! TimedOut
//! Cancelled
//! ```
//!
//! The machine only decides transitions. The polling loop in
//! [`crate::vm::readiness`] performs the lookups and probes, feeds their
//! results in as events and owns the clock.

use std::net::IpAddr;

use statig::prelude::*;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BootEvent {
    /// The hypervisor reported an address for the guest.
    IpDiscovered(IpAddr),
    /// The lookup failed or the guest has no address yet.
    IpLookupFailed,
    /// The guest answered within the reachability window.
    ProbeSucceeded,
    ProbeFailed,
    /// The wall-clock budget ran out.
    DeadlineElapsed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Counters kept across transitions, reported when the wait ends.
pub struct BootMachine {
    pub vm_name: String,
    pub failed_lookups: u32,
    pub failed_probes: u32,
}

impl BootMachine {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            failed_lookups: 0,
            failed_probes: 0,
        }
    }

    /// Whether no further events can change the state.
    pub fn is_terminal(state: &State) -> bool {
        matches!(
            state,
            State::Ready { .. } | State::TimedOut {} | State::Cancelled {}
        )
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::waiting_for_ip()",
    state(derive(Debug, Clone, PartialEq))
)]
impl BootMachine {
    #[superstate]
    fn polling(&mut self, event: &BootEvent) -> Outcome<State> {
        match event {
            BootEvent::DeadlineElapsed => Transition(State::timed_out()),
            BootEvent::Cancelled => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state(superstate = "polling")]
    fn waiting_for_ip(&mut self, event: &BootEvent) -> Outcome<State> {
        match event {
            BootEvent::IpDiscovered(ip) => {
                debug!(vm = %self.vm_name, %ip, "guest IP discovered");
                Transition(State::waiting_for_reachable(*ip))
            }
            BootEvent::IpLookupFailed => {
                self.failed_lookups += 1;
                Handled
            }
            _ => Super,
        }
    }

    /// A failed probe goes back to the lookup: DHCP may hand out a new lease
    /// while the guest is still coming up.
    #[state(superstate = "polling")]
    fn waiting_for_reachable(&mut self, event: &BootEvent, ip: &IpAddr) -> Outcome<State> {
        match event {
            BootEvent::ProbeSucceeded => Transition(State::ready(*ip)),
            BootEvent::ProbeFailed => {
                self.failed_probes += 1;
                Transition(State::waiting_for_ip())
            }
            _ => Super,
        }
    }

    #[state(entry_action = "enter_ready")]
    fn ready(&mut self, event: &BootEvent, ip: &IpAddr) -> Outcome<State> {
        let _ = (event, ip);
        Handled
    }

    #[state(entry_action = "enter_timed_out")]
    fn timed_out(&mut self, event: &BootEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn cancelled(&mut self, event: &BootEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[action]
    fn enter_ready(&mut self) {
        info!(
            vm = %self.vm_name,
            failed_lookups = self.failed_lookups,
            failed_probes = self.failed_probes,
            "guest reachable"
        );
    }

    #[action]
    fn enter_timed_out(&mut self) {
        info!(
            vm = %self.vm_name,
            failed_lookups = self.failed_lookups,
            failed_probes = self.failed_probes,
            "boot detection timed out"
        );
    }
}
