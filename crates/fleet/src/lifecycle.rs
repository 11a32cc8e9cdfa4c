//! Worker lifecycle state machine
//!
//! Pure: `transition(state, event)` returns the next state or `None` when
//! the event is not valid in that state. The registry applies transitions
//! under its lock; callers perform the I/O each state implies.
//!
//! ```text
//! Stopped ──StartRequested──▶ Starting ──IdentityConfirmed──▶ Running
//!    ▲                           │  │                            │
//!    │◀────────StartFailed───────┘  └──CredentialRevoked──┐      │
//!    │◀────────StopRequested─────────────────────────────────────┘
//!    │                                                    ▼      │
//!    │◀──PoolExhausted / StartFailed── Failing ◀──CredentialRevoked
//!    │                                   │
//!    │                             CandidateBound
//!    │                                   ▼
//!    └──────────StartFailed────────── Rebinding ──StartRequested──▶ Starting
//! ```
//!
//! `CandidatesUnreachable` takes the same edge as `PoolExhausted`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    /// Credential revoked; failover is looking for a replacement
    Failing,
    /// Replacement bound; the worker is about to restart on it
    Rebinding,
}

impl WorkerState {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Failing => "failing",
            WorkerState::Rebinding => "rebinding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    StartRequested,
    IdentityConfirmed,
    /// Identity check or restart failed without revoking the credential
    StartFailed,
    CredentialRevoked,
    CandidateBound,
    PoolExhausted,
    /// Free candidates remain but none could be reached
    CandidatesUnreachable,
    StopRequested,
}

/// Apply `event` to `state`.
///
/// `StopRequested` on a stopped worker is accepted and leaves it stopped.
/// `CredentialRevoked` is accepted from `Stopped` so an operator can force a
/// failover on a worker that is not running.
pub fn transition(state: WorkerState, event: WorkerEvent) -> Option<WorkerState> {
    use WorkerEvent as E;
    use WorkerState as S;

    match (state, event) {
        (S::Stopped, E::StartRequested) => Some(S::Starting),
        (S::Stopped, E::StopRequested) => Some(S::Stopped),
        (S::Stopped, E::CredentialRevoked) => Some(S::Failing),

        (S::Starting, E::IdentityConfirmed) => Some(S::Running),
        (S::Starting, E::StartFailed) => Some(S::Stopped),
        (S::Starting, E::CredentialRevoked) => Some(S::Failing),

        (S::Running, E::CredentialRevoked) => Some(S::Failing),
        (S::Running, E::StopRequested) => Some(S::Stopped),

        (S::Failing, E::CandidateBound) => Some(S::Rebinding),
        (S::Failing, E::PoolExhausted) => Some(S::Stopped),
        (S::Failing, E::CandidatesUnreachable) => Some(S::Stopped),
        (S::Failing, E::StartFailed) => Some(S::Stopped),

        (S::Rebinding, E::StartRequested) => Some(S::Starting),
        (S::Rebinding, E::StartFailed) => Some(S::Stopped),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerEvent as E;
    use WorkerState as S;

    #[test]
    fn normal_start_stop() {
        let s = transition(S::Stopped, E::StartRequested).unwrap();
        assert_eq!(s, S::Starting);
        let s = transition(s, E::IdentityConfirmed).unwrap();
        assert_eq!(s, S::Running);
        assert_eq!(transition(s, E::StopRequested), Some(S::Stopped));
    }

    #[test]
    fn failover_path_returns_to_running() {
        let mut s = S::Running;
        for event in [
            E::CredentialRevoked,
            E::CandidateBound,
            E::StartRequested,
            E::IdentityConfirmed,
        ] {
            s = transition(s, event).unwrap();
        }
        assert_eq!(s, S::Running);
    }

    #[test]
    fn exhaustion_ends_stopped() {
        assert_eq!(transition(S::Failing, E::PoolExhausted), Some(S::Stopped));
        assert_eq!(
            transition(S::Failing, E::CandidatesUnreachable),
            Some(S::Stopped)
        );
        assert_eq!(transition(S::Running, E::CandidatesUnreachable), None);
    }

    #[test]
    fn rejected_start_goes_straight_to_failing() {
        assert_eq!(transition(S::Starting, E::CredentialRevoked), Some(S::Failing));
    }

    #[test]
    fn transient_start_failure_stays_stopped() {
        assert_eq!(transition(S::Starting, E::StartFailed), Some(S::Stopped));
    }

    #[test]
    fn stop_is_idempotent() {
        assert_eq!(transition(S::Stopped, E::StopRequested), Some(S::Stopped));
    }

    #[test]
    fn no_concurrent_failover() {
        assert_eq!(transition(S::Failing, E::CredentialRevoked), None);
        assert_eq!(transition(S::Rebinding, E::CredentialRevoked), None);
    }

    #[test]
    fn busy_states_reject_stop_and_start() {
        for s in [S::Starting, S::Failing, S::Rebinding] {
            assert_eq!(transition(s, E::StopRequested), None, "{s:?}");
        }
        assert_eq!(transition(S::Running, E::StartRequested), None);
        assert_eq!(transition(S::Failing, E::StartRequested), None);
    }
}
