//! Exchange state — the shared vocabulary of every exchange kind.
//!
//! The state module provides:
//! - Typed per-kind state enums parsed from agent-reported strings
//! - Typed per-kind payloads with incremental-only merges
//! - `ExchangeRecord` snapshots with monotonic transitions
//! - Terminal / ready predicates per (kind, role)

pub mod predicates;
pub mod types;

pub use types::{
    ConnectionPayload, ConnectionState, CredentialPayload, CredentialState, ExchangeKind,
    ExchangePayload, ExchangeRecord, ExchangeRole, ExchangeState, Observation,
    PresentationPayload, PresentationState, ProofConstraint, Verified,
};

pub use predicates::{
    forward_path, is_failed, is_on_path, is_ready_for_next_stage, is_terminal,
    validate_transition,
};
