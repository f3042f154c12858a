//! Pure predicates over exchange state.
//!
//! Every terminal/ready decision in the crate goes through here; no other
//! module compares state strings.

use crate::error::{ExchangeError, Result};

use super::types::{
    ConnectionState, CredentialState, ExchangeKind, ExchangeRole, ExchangeState,
    PresentationState,
};

static CONNECTION_PATH: [ExchangeState; 4] = [
    ExchangeState::Connection(ConnectionState::Invitation),
    ExchangeState::Connection(ConnectionState::Request),
    ExchangeState::Connection(ConnectionState::Response),
    ExchangeState::Connection(ConnectionState::Active),
];

static ISSUER_PATH: [ExchangeState; 4] = [
    ExchangeState::Credential(CredentialState::OfferSent),
    ExchangeState::Credential(CredentialState::RequestReceived),
    ExchangeState::Credential(CredentialState::Issued),
    ExchangeState::Credential(CredentialState::Done),
];

static HOLDER_PATH: [ExchangeState; 4] = [
    ExchangeState::Credential(CredentialState::OfferReceived),
    ExchangeState::Credential(CredentialState::RequestSent),
    ExchangeState::Credential(CredentialState::Received),
    ExchangeState::Credential(CredentialState::Done),
];

static VERIFIER_PATH: [ExchangeState; 3] = [
    ExchangeState::Presentation(PresentationState::RequestSent),
    ExchangeState::Presentation(PresentationState::PresentationReceived),
    ExchangeState::Presentation(PresentationState::Verified),
];

static PROVER_PATH: [ExchangeState; 3] = [
    ExchangeState::Presentation(PresentationState::RequestReceived),
    ExchangeState::Presentation(PresentationState::PresentationSent),
    ExchangeState::Presentation(PresentationState::Done),
];

/// The canonical forward path for a (kind, role) pair, failure excluded.
pub fn forward_path(kind: ExchangeKind, role: ExchangeRole) -> &'static [ExchangeState] {
    match (kind, role) {
        (ExchangeKind::Connection, _) => &CONNECTION_PATH,
        (ExchangeKind::Credential, ExchangeRole::Initiator) => &ISSUER_PATH,
        (ExchangeKind::Credential, ExchangeRole::Responder) => &HOLDER_PATH,
        (ExchangeKind::Presentation, ExchangeRole::Initiator) => &VERIFIER_PATH,
        (ExchangeKind::Presentation, ExchangeRole::Responder) => &PROVER_PATH,
    }
}

/// No further transition is expected after a terminal state.
pub fn is_terminal(state: &ExchangeState) -> bool {
    match state {
        ExchangeState::Connection(s) => {
            matches!(s, ConnectionState::Active | ConnectionState::Abandoned)
        }
        ExchangeState::Credential(s) => {
            matches!(s, CredentialState::Done | CredentialState::Abandoned)
        }
        ExchangeState::Presentation(s) => matches!(
            s,
            PresentationState::Verified | PresentationState::Done | PresentationState::Abandoned
        ),
    }
}

/// The exchange failed on the agent side.
pub fn is_failed(state: &ExchangeState) -> bool {
    state.is_abandoned()
}

/// Whether the flow may move on to the next stage.
///
/// The inviter may issue as soon as the connection has responded; the
/// invitee waits for `active`. Credential acknowledgement is optional, so
/// issued/received is enough. A prover is done once it has presented.
pub fn is_ready_for_next_stage(role: ExchangeRole, state: &ExchangeState) -> bool {
    if state.is_abandoned() {
        return false;
    }
    match (state, role) {
        (ExchangeState::Connection(s), ExchangeRole::Initiator) => {
            matches!(s, ConnectionState::Response | ConnectionState::Active)
        }
        (ExchangeState::Connection(s), ExchangeRole::Responder) => {
            matches!(s, ConnectionState::Active)
        }
        (ExchangeState::Credential(s), _) => s.rank() >= CredentialState::Issued.rank(),
        (ExchangeState::Presentation(s), ExchangeRole::Initiator) => {
            matches!(s, PresentationState::Verified | PresentationState::Done)
        }
        (ExchangeState::Presentation(s), ExchangeRole::Responder) => {
            s.rank() >= PresentationState::PresentationSent.rank()
        }
    }
}

/// Whether `role` can legitimately observe `state`.
///
/// Failure is always possible; terminal presentation states are accepted on
/// both sides since agents report either `verified` or `done`.
pub fn is_on_path(role: ExchangeRole, state: &ExchangeState) -> bool {
    if state.is_abandoned() {
        return true;
    }
    if matches!(state, ExchangeState::Presentation(_)) && is_terminal(state) {
        return true;
    }
    forward_path(state.kind(), role).contains(state)
}

/// Check that `from → to` moves forward (or stays) along the kind's order.
pub fn validate_transition(from: &ExchangeState, to: &ExchangeState) -> Result<()> {
    if from.kind() != to.kind() {
        return Err(ExchangeError::Validation(format!(
            "{} state cannot follow {} state",
            to.kind(),
            from.kind()
        )));
    }
    let forward = if from.is_abandoned() {
        to.is_abandoned()
    } else {
        to.is_abandoned() || to.rank() >= from.rank()
    };
    if forward {
        Ok(())
    } else {
        Err(ExchangeError::StateRegression {
            kind: from.kind(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}
