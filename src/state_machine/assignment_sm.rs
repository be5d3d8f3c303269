//! GPU partition assignment lifecycle.
//!
//! Hierarchy:
//! ```text
//! Idle
//! InFlight (superstate: Fail → Finalizing)
//!     ├── Validating ──▶ Reserving? ──▶ Attaching
//!     ├── ProvisioningWindows
//!     ├── ProvisioningLinux { attempt } ⇄ RebootRetry { attempt }
//! Finalizing { verdict } ──▶ Succeeded | RebootPending | Failed { reason }
//! ```
//!
//! The machine only tracks where an attempt is; the orchestrator does the
//! I/O and reports each step's result as an event.

use statig::prelude::*;
use tracing::{info, warn};

/// Pipeline runs per assignment; the second reboot request is handed back
/// to the caller.
pub const MAX_LINUX_ATTEMPTS: u8 = 2;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Which provisioning path follows a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionTarget {
    Windows,
    Linux,
    /// Attach only.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    RebootRetry,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum AssignmentEvent {
    Begin,
    /// `exclusive` is true on hosts that need sibling GPUs disabled.
    PreconditionsMet { exclusive: bool },
    ExclusivityReserved,
    Attached(ProvisionTarget),
    Provisioned,
    RebootRequired,
    GuestReachable,
    Fail(String),
    Finalized,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

pub struct AssignmentMachine {
    pub guest: String,
}

impl AssignmentMachine {
    pub fn new(guest: impl Into<String>) -> Self {
        Self {
            guest: guest.into(),
        }
    }

    pub fn is_terminal(state: &State) -> bool {
        matches!(
            state,
            State::Succeeded {} | State::RebootPending {} | State::Failed { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::idle()",
    state(derive(Debug, Clone, PartialEq))
)]
impl AssignmentMachine {
    #[state]
    fn idle(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::Begin => Transition(State::validating()),
            _ => Handled,
        }
    }

    // ------------------------------------------------------------------
    // Superstate: InFlight
    // ------------------------------------------------------------------

    #[superstate]
    fn in_flight(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::Fail(reason) => {
                warn!(guest = %self.guest, reason = %reason, "assignment failed");
                Transition(State::finalizing(Verdict::Failed(reason.clone())))
            }
            other => {
                warn!(guest = %self.guest, event = ?other, "event ignored");
                Handled
            }
        }
    }

    #[state(superstate = "in_flight")]
    fn validating(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::PreconditionsMet { exclusive: true } => Transition(State::reserving()),
            AssignmentEvent::PreconditionsMet { exclusive: false } => Transition(State::attaching()),
            _ => Super,
        }
    }

    /// Legacy hosts only.
    #[state(superstate = "in_flight")]
    fn reserving(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::ExclusivityReserved => Transition(State::attaching()),
            _ => Super,
        }
    }

    #[state(superstate = "in_flight")]
    fn attaching(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::Attached(ProvisionTarget::Windows) => {
                Transition(State::provisioning_windows())
            }
            AssignmentEvent::Attached(ProvisionTarget::Linux) => {
                Transition(State::provisioning_linux(1))
            }
            AssignmentEvent::Attached(ProvisionTarget::Skip) => {
                Transition(State::finalizing(Verdict::Success))
            }
            _ => Super,
        }
    }

    #[state(superstate = "in_flight")]
    fn provisioning_windows(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        match event {
            AssignmentEvent::Provisioned => Transition(State::finalizing(Verdict::Success)),
            _ => Super,
        }
    }

    #[state(superstate = "in_flight")]
    fn provisioning_linux(&mut self, event: &AssignmentEvent, attempt: &u8) -> Outcome<State> {
        match event {
            AssignmentEvent::Provisioned => Transition(State::finalizing(Verdict::Success)),
            AssignmentEvent::RebootRequired if *attempt < MAX_LINUX_ATTEMPTS => {
                info!(guest = %self.guest, attempt, "guest rebooted mid-install");
                Transition(State::reboot_retry(*attempt))
            }
            AssignmentEvent::RebootRequired => {
                Transition(State::finalizing(Verdict::RebootRetry))
            }
            _ => Super,
        }
    }

    #[state(superstate = "in_flight")]
    fn reboot_retry(&mut self, event: &AssignmentEvent, attempt: &u8) -> Outcome<State> {
        match event {
            AssignmentEvent::GuestReachable => Transition(State::provisioning_linux(attempt + 1)),
            _ => Super,
        }
    }

    /// Cleanup runs while in this state, whatever the verdict.
    #[state(entry_action = "enter_finalizing")]
    fn finalizing(&mut self, event: &AssignmentEvent, verdict: &Verdict) -> Outcome<State> {
        match (event, verdict) {
            (AssignmentEvent::Finalized, Verdict::Success) => Transition(State::succeeded()),
            (AssignmentEvent::Finalized, Verdict::RebootRetry) => Transition(State::reboot_pending()),
            (AssignmentEvent::Finalized, Verdict::Failed(reason)) => {
                Transition(State::failed(reason.clone()))
            }
            _ => Handled,
        }
    }

    #[state]
    fn succeeded(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    /// The caller must invoke the assignment again.
    #[state]
    fn reboot_pending(&mut self, event: &AssignmentEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(&mut self, event: &AssignmentEvent, reason: &String) -> Outcome<State> {
        let _ = (event, reason);
        Handled
    }

    #[action]
    fn enter_finalizing(&mut self) {
        info!(guest = %self.guest, "finalizing assignment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> StateMachine<AssignmentMachine> {
        AssignmentMachine::new("lab").state_machine()
    }

    fn drive(events: &[AssignmentEvent]) -> State {
        let mut sm = machine();
        for event in events {
            sm.handle(event);
        }
        sm.state().clone()
    }

    #[test]
    fn legacy_windows_happy_path() {
        use AssignmentEvent::*;
        let mut sm = machine();
        sm.handle(&Begin);
        sm.handle(&PreconditionsMet { exclusive: true });
        assert_eq!(sm.state(), &State::reserving());
        sm.handle(&ExclusivityReserved);
        sm.handle(&Attached(ProvisionTarget::Windows));
        assert_eq!(sm.state(), &State::provisioning_windows());
        sm.handle(&Provisioned);
        assert_eq!(sm.state(), &State::finalizing(Verdict::Success));
        sm.handle(&Finalized);
        assert_eq!(sm.state(), &State::succeeded());
    }

    #[test]
    fn modern_host_skips_reservation() {
        use AssignmentEvent::*;
        let state = drive(&[Begin, PreconditionsMet { exclusive: false }]);
        assert_eq!(state, State::attaching());
    }

    #[test]
    fn linux_reenters_once_after_reboot() {
        use AssignmentEvent::*;
        let state = drive(&[
            Begin,
            PreconditionsMet { exclusive: false },
            Attached(ProvisionTarget::Linux),
            RebootRequired,
        ]);
        assert_eq!(state, State::reboot_retry(1));

        let state = drive(&[
            Begin,
            PreconditionsMet { exclusive: false },
            Attached(ProvisionTarget::Linux),
            RebootRequired,
            GuestReachable,
        ]);
        assert_eq!(state, State::provisioning_linux(2));
    }

    #[test]
    fn second_reboot_request_goes_back_to_the_caller() {
        use AssignmentEvent::*;
        let state = drive(&[
            Begin,
            PreconditionsMet { exclusive: false },
            Attached(ProvisionTarget::Linux),
            RebootRequired,
            GuestReachable,
            RebootRequired,
            Finalized,
        ]);
        assert_eq!(state, State::reboot_pending());
    }

    #[test]
    fn failure_from_any_in_flight_state_finalizes() {
        use AssignmentEvent::*;
        for prefix in [
            vec![Begin],
            vec![Begin, PreconditionsMet { exclusive: true }],
            vec![Begin, PreconditionsMet { exclusive: false }, Attached(ProvisionTarget::Linux)],
        ] {
            let mut events = prefix;
            events.push(Fail("boom".into()));
            assert_eq!(drive(&events), State::finalizing(Verdict::Failed("boom".into())));
            events.push(Finalized);
            assert_eq!(drive(&events), State::failed("boom".into()));
        }
    }

    #[test]
    fn attach_only_goes_straight_to_finalizing() {
        use AssignmentEvent::*;
        let state = drive(&[Begin, PreconditionsMet { exclusive: false }, Attached(ProvisionTarget::Skip)]);
        assert_eq!(state, State::finalizing(Verdict::Success));
        assert!(!AssignmentMachine::is_terminal(&state));
        assert!(AssignmentMachine::is_terminal(&State::succeeded()));
    }
}
