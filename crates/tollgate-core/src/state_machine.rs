use std::fmt;

use crate::error::CoreError;

/// States of the provider-side invoice/promise exchange for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum InvoiceState {
    /// No invoice outstanding.
    Idle,
    /// An invoice was minted and is being delivered to the peer.
    InvoiceIssued,
    /// The invoice was delivered; waiting for the consumer's promise.
    AwaitingPromise,
    /// The session ended. Final state.
    Settled,
}

impl InvoiceState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Settled)
    }

    /// Whether an invoice is currently outstanding.
    pub fn has_outstanding_invoice(&self) -> bool {
        matches!(self, Self::InvoiceIssued | Self::AwaitingPromise)
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::InvoiceIssued => write!(f, "InvoiceIssued"),
            Self::AwaitingPromise => write!(f, "AwaitingPromise"),
            Self::Settled => write!(f, "Settled"),
        }
    }
}

/// Events driving [`InvoiceState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEvent {
    /// A new invoice was minted.
    Issued,
    /// The invoice reached the peer.
    Delivered,
    /// A promise fully paying the outstanding invoice was accepted.
    Paid,
    /// The session ended.
    SessionEnded,
}

/// Transition table for the invoice exchange.
///
/// Valid transitions:
/// - Idle → InvoiceIssued (Issued)
/// - InvoiceIssued → AwaitingPromise (Delivered)
/// - InvoiceIssued → Idle (Paid)
/// - AwaitingPromise → AwaitingPromise (Delivered, on resend)
/// - AwaitingPromise → Idle (Paid)
/// - any non-final → Settled (SessionEnded)
pub struct InvoiceStateMachine;

impl InvoiceStateMachine {
    pub fn transition(current: InvoiceState, event: InvoiceEvent) -> Result<InvoiceState, CoreError> {
        let new_state = match (current, event) {
            (InvoiceState::Idle, InvoiceEvent::Issued) => InvoiceState::InvoiceIssued,

            (InvoiceState::InvoiceIssued, InvoiceEvent::Delivered) => InvoiceState::AwaitingPromise,
            (InvoiceState::InvoiceIssued, InvoiceEvent::Paid) => InvoiceState::Idle,

            (InvoiceState::AwaitingPromise, InvoiceEvent::Delivered) => InvoiceState::AwaitingPromise,
            (InvoiceState::AwaitingPromise, InvoiceEvent::Paid) => InvoiceState::Idle,

            (state, InvoiceEvent::SessionEnded) if !state.is_final() => InvoiceState::Settled,

            _ => {
                let target = match event {
                    InvoiceEvent::Issued => InvoiceState::InvoiceIssued,
                    InvoiceEvent::Delivered => InvoiceState::AwaitingPromise,
                    InvoiceEvent::Paid => InvoiceState::Idle,
                    InvoiceEvent::SessionEnded => InvoiceState::Settled,
                };
                return Err(CoreError::InvalidStateTransition {
                    machine: "invoice",
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
        };

        tracing::debug!(from = %current, to = %new_state, event = ?event, "invoice state transition");

        Ok(new_state)
    }
}

/// Per-channel settlement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SettlementState {
    /// Nothing in flight.
    Idle,
    /// A settlement was decided; the channel is being re-validated.
    Triggered,
    /// The transaction was handed to the transactor.
    Submitted,
    /// The transaction was confirmed on chain.
    Confirmed,
    /// Confirmation did not arrive within the wait budget.
    TimedOut,
    /// Submission or execution failed.
    Failed,
}

impl SettlementState {
    /// Whether a settlement attempt currently owns the channel.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Triggered | Self::Submitted)
    }

    /// Whether this is the end of one attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::TimedOut | Self::Failed)
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Triggered => write!(f, "Triggered"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::TimedOut => write!(f, "TimedOut"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Events driving [`SettlementState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementEvent {
    /// A trigger (threshold, forced, beneficiary change) fired.
    Trigger,
    /// Re-validation found nothing to settle.
    Abandon,
    /// The transactor accepted the transaction.
    Submit,
    /// The chain confirmed the transaction.
    Confirm,
    /// Waiting for confirmation ran out of time.
    Timeout,
    /// Submission or execution failed.
    Fail,
    /// A finished attempt releases the channel.
    Reset,
}

/// Transition table for one channel's settlement attempts.
///
/// Valid transitions:
/// - Idle → Triggered (Trigger)
/// - Triggered → Idle (Abandon)
/// - Triggered → Submitted (Submit)
/// - Triggered → Failed (Fail)
/// - Submitted → Confirmed (Confirm)
/// - Submitted → TimedOut (Timeout)
/// - Submitted → Failed (Fail)
/// - Confirmed | TimedOut | Failed → Idle (Reset)
pub struct SettlementStateMachine;

impl SettlementStateMachine {
    pub fn transition(
        current: SettlementState,
        event: SettlementEvent,
    ) -> Result<SettlementState, CoreError> {
        let new_state = match (current, event) {
            (SettlementState::Idle, SettlementEvent::Trigger) => SettlementState::Triggered,

            (SettlementState::Triggered, SettlementEvent::Abandon) => SettlementState::Idle,
            (SettlementState::Triggered, SettlementEvent::Submit) => SettlementState::Submitted,
            (SettlementState::Triggered, SettlementEvent::Fail) => SettlementState::Failed,

            (SettlementState::Submitted, SettlementEvent::Confirm) => SettlementState::Confirmed,
            (SettlementState::Submitted, SettlementEvent::Timeout) => SettlementState::TimedOut,
            (SettlementState::Submitted, SettlementEvent::Fail) => SettlementState::Failed,

            (state, SettlementEvent::Reset) if state.is_terminal() => SettlementState::Idle,

            _ => {
                let target = match event {
                    SettlementEvent::Trigger => SettlementState::Triggered,
                    SettlementEvent::Abandon | SettlementEvent::Reset => SettlementState::Idle,
                    SettlementEvent::Submit => SettlementState::Submitted,
                    SettlementEvent::Confirm => SettlementState::Confirmed,
                    SettlementEvent::Timeout => SettlementState::TimedOut,
                    SettlementEvent::Fail => SettlementState::Failed,
                };
                return Err(CoreError::InvalidStateTransition {
                    machine: "settlement",
                    from: current.to_string(),
                    to: target.to_string(),
                });
            }
        };

        tracing::debug!(from = %current, to = %new_state, event = ?event, "settlement state transition");

        Ok(new_state)
    }

    pub fn can_transition(current: SettlementState, event: SettlementEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_happy_path() {
        let state = InvoiceState::Idle;
        let state = InvoiceStateMachine::transition(state, InvoiceEvent::Issued).unwrap();
        assert_eq!(state, InvoiceState::InvoiceIssued);
        assert!(state.has_outstanding_invoice());

        let state = InvoiceStateMachine::transition(state, InvoiceEvent::Delivered).unwrap();
        assert_eq!(state, InvoiceState::AwaitingPromise);

        let state = InvoiceStateMachine::transition(state, InvoiceEvent::Paid).unwrap();
        assert_eq!(state, InvoiceState::Idle);
        assert!(!state.has_outstanding_invoice());
    }

    #[test]
    fn test_cannot_issue_while_outstanding() {
        assert!(InvoiceStateMachine::transition(InvoiceState::InvoiceIssued, InvoiceEvent::Issued).is_err());
        assert!(InvoiceStateMachine::transition(InvoiceState::AwaitingPromise, InvoiceEvent::Issued).is_err());
    }

    #[test]
    fn test_resend_keeps_awaiting() {
        let state =
            InvoiceStateMachine::transition(InvoiceState::AwaitingPromise, InvoiceEvent::Delivered).unwrap();
        assert_eq!(state, InvoiceState::AwaitingPromise);
    }

    #[test]
    fn test_session_end_from_any_state() {
        for state in [InvoiceState::Idle, InvoiceState::InvoiceIssued, InvoiceState::AwaitingPromise] {
            let end = InvoiceStateMachine::transition(state, InvoiceEvent::SessionEnded).unwrap();
            assert_eq!(end, InvoiceState::Settled);
            assert!(end.is_final());
        }
        assert!(InvoiceStateMachine::transition(InvoiceState::Settled, InvoiceEvent::SessionEnded).is_err());
        assert!(InvoiceStateMachine::transition(InvoiceState::Settled, InvoiceEvent::Issued).is_err());
    }

    #[test]
    fn test_settlement_happy_path() {
        let state = SettlementState::Idle;
        let state = SettlementStateMachine::transition(state, SettlementEvent::Trigger).unwrap();
        assert!(state.is_in_flight());
        let state = SettlementStateMachine::transition(state, SettlementEvent::Submit).unwrap();
        assert_eq!(state, SettlementState::Submitted);
        let state = SettlementStateMachine::transition(state, SettlementEvent::Confirm).unwrap();
        assert!(state.is_terminal());
        let state = SettlementStateMachine::transition(state, SettlementEvent::Reset).unwrap();
        assert_eq!(state, SettlementState::Idle);
    }

    #[test]
    fn test_timeout_and_failure_return_to_idle() {
        for event in [SettlementEvent::Timeout, SettlementEvent::Fail] {
            let state = SettlementStateMachine::transition(SettlementState::Submitted, event).unwrap();
            let state = SettlementStateMachine::transition(state, SettlementEvent::Reset).unwrap();
            assert_eq!(state, SettlementState::Idle);
        }
    }

    #[test]
    fn test_no_second_trigger_while_in_flight() {
        assert!(!SettlementStateMachine::can_transition(SettlementState::Triggered, SettlementEvent::Trigger));
        assert!(!SettlementStateMachine::can_transition(SettlementState::Submitted, SettlementEvent::Trigger));
        assert!(SettlementStateMachine::can_transition(SettlementState::Idle, SettlementEvent::Trigger));
    }

    #[test]
    fn test_abandon_only_before_submit() {
        assert!(SettlementStateMachine::can_transition(SettlementState::Triggered, SettlementEvent::Abandon));
        assert!(!SettlementStateMachine::can_transition(SettlementState::Submitted, SettlementEvent::Abandon));
    }

    #[test]
    fn test_cannot_confirm_before_submit() {
        let err = SettlementStateMachine::transition(SettlementState::Triggered, SettlementEvent::Confirm)
            .unwrap_err();
        assert!(err.to_string().contains("settlement state transition"));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SettlementState::TimedOut), "TimedOut");
        assert_eq!(format!("{}", InvoiceState::AwaitingPromise), "AwaitingPromise");
    }
}
