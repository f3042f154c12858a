//! Error types for AgenticExchange.
//!
//! All errors are scoped to a single exchange or flow instance; nothing in
//! this crate is fatal to the process.

use crate::state::{ExchangeKind, ExchangeRole};

/// Exchange error types covering all operations.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Malformed or missing local input. Never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The agent service rejected a state-changing command.
    #[error("Agent rejected {operation}: {diagnostic}")]
    Remote {
        operation: &'static str,
        diagnostic: String,
    },

    /// A state query failed. Transient; retried by the poller.
    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Ambiguous {kind} discovery: {count} candidates")]
    AmbiguousState { kind: ExchangeKind, count: usize },

    #[error("{kind} state cannot move backward from {from} to {to}")]
    StateRegression {
        kind: ExchangeKind,
        from: String,
        to: String,
    },

    #[error("Unknown {kind} state: {state}")]
    UnknownState { kind: ExchangeKind, state: String },

    #[error("A poll is already running for {0}")]
    AlreadyPolling(String),

    #[error("A {0} exchange is already in progress")]
    DuplicateExchange(ExchangeKind),

    #[error("Exchange id already assigned: {current} (attempted {attempted})")]
    IdReassigned { current: String, attempted: String },

    #[error("{stage} stage cannot start before {prerequisite} is ready")]
    StageNotReady {
        stage: ExchangeKind,
        prerequisite: ExchangeKind,
    },

    #[error("{0} stage is not part of this flow")]
    StageNotInFlow(ExchangeKind),

    #[error("{operation} is not available to the {role} role")]
    WrongRole {
        operation: &'static str,
        role: ExchangeRole,
    },

    #[error("No {0} exchange has been started")]
    NotStarted(ExchangeKind),

    #[error("{kind} exchange {id} was abandoned by the agent")]
    Abandoned { kind: ExchangeKind, id: String },

    #[error("Exchange cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExchangeError {
    /// Whether the poller should keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Poll(_) | Self::StateRegression { .. } | Self::UnknownState { .. }
        )
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Reject an empty or blank required input.
pub(crate) fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ExchangeError::Validation(format!("{what} is required")));
    }
    Ok(())
}
