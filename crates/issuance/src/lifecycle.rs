//! Listener state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! The worker executes the I/O implied by each action.
//!
//! ```text
//! Connecting ──opened──► Connected ──verified──► Listening ──code──► Listening
//!     │  ▲                   │                       │
//!  net err│ retry timer   rejected               deadline / failure
//!     ▼  │                   ▼                       ▼
//!   Backoff ──exhausted──► Failed               TimedOut / Failed
//! ```
//!
//! Any state moves to `Stopped` on cancellation. Terminal states absorb
//! every later event, so nothing is reported after a timeout or failure.

use std::time::Duration;

use crate::error::ListenerFailure;

/// Connection attempts before the listener gives up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Backoff after the Nth failed attempt.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
];

fn retry_delay(failed_attempt: u32) -> Duration {
    let idx = (failed_attempt.saturating_sub(1) as usize).min(RETRY_DELAYS.len() - 1);
    RETRY_DELAYS[idx]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Connection attempt `attempt` (1-based) in flight
    Connecting { attempt: u32 },
    /// Waiting out the backoff after a failed attempt
    Backoff { attempt: u32 },
    /// Session open, authorization and identity not yet checked
    Connected,
    /// Waiting for inbound codes
    Listening { last_code: Option<String> },
    TimedOut,
    Failed,
    Stopped,
}

impl WorkerState {
    pub fn initial() -> Self {
        WorkerState::Connecting { attempt: 1 }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::TimedOut | WorkerState::Failed | WorkerState::Stopped
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerState::Connecting { .. } => "connecting",
            WorkerState::Backoff { .. } => "backoff",
            WorkerState::Connected => "connected",
            WorkerState::Listening { .. } => "listening",
            WorkerState::TimedOut => "timed_out",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub enum WorkerEvent {
    /// Session opened
    Opened,
    /// Connection attempt failed
    ConnectFailed(platform::Error),
    /// Backoff elapsed
    RetryTimer,
    /// Authorization and identity checks passed
    Verified,
    /// Authorization or identity check failed
    Rejected(ListenerFailure),
    /// A code was found in an inbound message
    CodeMatched(String),
    /// Failure while listening
    Failure(ListenerFailure),
    /// Overall deadline elapsed
    Deadline,
    /// Stop requested
    Cancelled,
}

#[derive(Debug, PartialEq)]
pub enum WorkerAction {
    /// Open a session with the current proxy
    Connect,
    /// Rotate the proxy, then wait `delay` before reconnecting
    ScheduleRetry { delay: Duration },
    /// Check authorization and reconcile identity
    Verify,
    /// Start (or keep) reading inbound messages
    Listen,
    DeliverCode(String),
    ReportTimeout,
    ReportError(ListenerFailure),
    None,
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: WorkerState, event: WorkerEvent) -> (WorkerState, WorkerAction) {
    match (state, event) {
        // --- Terminal states absorb everything ---
        (state, _) if state.is_terminal() => (state, WorkerAction::None),

        (_, WorkerEvent::Cancelled) => (WorkerState::Stopped, WorkerAction::None),

        (_, WorkerEvent::Deadline) => (WorkerState::TimedOut, WorkerAction::ReportTimeout),

        // --- Connecting ---
        (WorkerState::Connecting { .. }, WorkerEvent::Opened) => {
            (WorkerState::Connected, WorkerAction::Verify)
        }

        (WorkerState::Connecting { attempt }, WorkerEvent::ConnectFailed(e))
            if e.is_network() && attempt < MAX_CONNECT_ATTEMPTS =>
        {
            (
                WorkerState::Backoff { attempt },
                WorkerAction::ScheduleRetry {
                    delay: retry_delay(attempt),
                },
            )
        }

        (WorkerState::Connecting { attempt }, WorkerEvent::ConnectFailed(e)) if e.is_network() => (
            WorkerState::Failed,
            WorkerAction::ReportError(ListenerFailure::NetworkExhausted { attempts: attempt }),
        ),

        (WorkerState::Connecting { .. }, WorkerEvent::ConnectFailed(e)) => (
            WorkerState::Failed,
            WorkerAction::ReportError(ListenerFailure::from(e)),
        ),

        // --- Backoff ---
        (WorkerState::Backoff { attempt }, WorkerEvent::RetryTimer) => (
            WorkerState::Connecting {
                attempt: attempt + 1,
            },
            WorkerAction::Connect,
        ),

        // --- Connected ---
        (WorkerState::Connected, WorkerEvent::Verified) => {
            (WorkerState::Listening { last_code: None }, WorkerAction::Listen)
        }

        (WorkerState::Connected, WorkerEvent::Rejected(failure)) => {
            (WorkerState::Failed, WorkerAction::ReportError(failure))
        }

        // --- Listening ---
        (WorkerState::Listening { last_code }, WorkerEvent::CodeMatched(code)) => {
            if last_code.as_deref() == Some(code.as_str()) {
                (WorkerState::Listening { last_code }, WorkerAction::Listen)
            } else {
                (
                    WorkerState::Listening {
                        last_code: Some(code.clone()),
                    },
                    WorkerAction::DeliverCode(code),
                )
            }
        }

        (WorkerState::Listening { .. }, WorkerEvent::Failure(failure)) => {
            (WorkerState::Failed, WorkerAction::ReportError(failure))
        }

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, WorkerAction::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_err() -> platform::Error {
        platform::Error::Network("connection reset".into())
    }

    #[test]
    fn network_failures_back_off_then_exhaust() {
        let (state, action) = handle_event(
            WorkerState::initial(),
            WorkerEvent::ConnectFailed(net_err()),
        );
        assert_eq!(state, WorkerState::Backoff { attempt: 1 });
        assert_eq!(
            action,
            WorkerAction::ScheduleRetry {
                delay: Duration::from_secs(5)
            }
        );

        let (state, action) = handle_event(state, WorkerEvent::RetryTimer);
        assert_eq!(state, WorkerState::Connecting { attempt: 2 });
        assert_eq!(action, WorkerAction::Connect);

        let (state, action) = handle_event(state, WorkerEvent::ConnectFailed(net_err()));
        assert_eq!(
            action,
            WorkerAction::ScheduleRetry {
                delay: Duration::from_secs(15)
            }
        );

        let (state, _) = handle_event(state, WorkerEvent::RetryTimer);
        let (state, action) = handle_event(state, WorkerEvent::ConnectFailed(net_err()));
        assert_eq!(state, WorkerState::Failed);
        assert_eq!(
            action,
            WorkerAction::ReportError(ListenerFailure::NetworkExhausted { attempts: 3 })
        );
    }

    #[test]
    fn non_network_connect_error_is_terminal() {
        let (state, action) = handle_event(
            WorkerState::initial(),
            WorkerEvent::ConnectFailed(platform::Error::AuthKeyUnregistered),
        );
        assert_eq!(state, WorkerState::Failed);
        assert_eq!(action, WorkerAction::ReportError(ListenerFailure::AuthRevoked));
    }

    #[test]
    fn verified_session_starts_listening() {
        let (state, action) = handle_event(WorkerState::initial(), WorkerEvent::Opened);
        assert_eq!(state, WorkerState::Connected);
        assert_eq!(action, WorkerAction::Verify);

        let (state, action) = handle_event(state, WorkerEvent::Verified);
        assert_eq!(state, WorkerState::Listening { last_code: None });
        assert_eq!(action, WorkerAction::Listen);
    }

    #[test]
    fn rejected_session_fails() {
        let (state, action) = handle_event(
            WorkerState::Connected,
            WorkerEvent::Rejected(ListenerFailure::TwoFactorRequired),
        );
        assert_eq!(state, WorkerState::Failed);
        assert_eq!(
            action,
            WorkerAction::ReportError(ListenerFailure::TwoFactorRequired)
        );
    }

    #[test]
    fn repeated_code_is_suppressed_new_code_delivered() {
        let listening = WorkerState::Listening { last_code: None };
        let (state, action) = handle_event(listening, WorkerEvent::CodeMatched("12345".into()));
        assert_eq!(action, WorkerAction::DeliverCode("12345".into()));

        let (state, action) = handle_event(state, WorkerEvent::CodeMatched("12345".into()));
        assert_eq!(action, WorkerAction::Listen);

        let (state, action) = handle_event(state, WorkerEvent::CodeMatched("67890".into()));
        assert_eq!(action, WorkerAction::DeliverCode("67890".into()));
        assert_eq!(
            state,
            WorkerState::Listening {
                last_code: Some("67890".into())
            }
        );
    }

    #[test]
    fn deadline_fires_from_any_live_state_once() {
        for state in [
            WorkerState::initial(),
            WorkerState::Backoff { attempt: 1 },
            WorkerState::Connected,
            WorkerState::Listening { last_code: None },
        ] {
            let (state, action) = handle_event(state, WorkerEvent::Deadline);
            assert_eq!(state, WorkerState::TimedOut);
            assert_eq!(action, WorkerAction::ReportTimeout);

            let (state, action) = handle_event(state, WorkerEvent::Deadline);
            assert_eq!(state, WorkerState::TimedOut);
            assert_eq!(action, WorkerAction::None);
        }
    }

    #[test]
    fn nothing_reported_after_terminal_state() {
        let (state, action) =
            handle_event(WorkerState::TimedOut, WorkerEvent::CodeMatched("12345".into()));
        assert_eq!(state, WorkerState::TimedOut);
        assert_eq!(action, WorkerAction::None);

        let (_, action) = handle_event(
            WorkerState::Failed,
            WorkerEvent::Failure(ListenerFailure::ConnectionLost("x".into())),
        );
        assert_eq!(action, WorkerAction::None);
    }

    #[test]
    fn cancel_stops_silently() {
        let (state, action) = handle_event(
            WorkerState::Listening { last_code: None },
            WorkerEvent::Cancelled,
        );
        assert_eq!(state, WorkerState::Stopped);
        assert_eq!(action, WorkerAction::None);
    }

    #[test]
    fn retry_delays_clamp() {
        assert_eq!(retry_delay(1), Duration::from_secs(5));
        assert_eq!(retry_delay(2), Duration::from_secs(15));
        assert_eq!(retry_delay(3), Duration::from_secs(30));
        assert_eq!(retry_delay(9), Duration::from_secs(30));
    }
}
