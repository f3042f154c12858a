//! The agent service seam.
//!
//! Every exchange component talks to the agent through [`AgentService`]:
//! commands (POST) that start or advance an exchange, and idempotent
//! queries (GET) that report its current state. Only queries are retried.
//!
//! # Implementations
//!
//! - [`http::HttpAgentService`] for JSON over HTTP against an agent admin API.
//! - [`memory::InMemoryAgent`] for a scripted, in-process pair of agents.

pub mod http;
pub mod memory;
pub mod messages;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::ids::{ExchangeId, HolderIdentifier};
use crate::invitation::InvitationArtifact;
use crate::state::ProofConstraint;

pub use http::HttpAgentService;
pub use memory::{InMemoryAgent, ScriptStep};
pub use messages::{
    AcceptedInvitation, ConnectionStatus, CreatedInvitation, CredentialOfferRequest,
    CredentialStatus, OfferAcceptance, OfferSummary, PresentationStatus, PresentationSubmitted,
    ProofRequestSummary, PublishedCredentialDefinition, PublishedSchema, SchemaDefinition,
    SentOffer, SentProofRequest,
};

/// Failure reported by the agent service or the way to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent returned {status}: {diagnostic}")]
    Rejected { status: u16, diagnostic: String },

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("malformed agent response: {0}")]
    Malformed(String),
}

impl AgentError {
    /// Surface a failed command to the caller.
    pub fn into_remote(self, operation: &'static str) -> ExchangeError {
        let diagnostic = match self {
            Self::Rejected { status, diagnostic } => format!("{status}: {diagnostic}"),
            Self::Unavailable(msg) => format!("unavailable: {msg}"),
            Self::Malformed(msg) => format!("malformed response: {msg}"),
        };
        ExchangeError::Remote {
            operation,
            diagnostic,
        }
    }

    /// Report a failed query; the poller retries these.
    pub fn into_poll(self) -> ExchangeError {
        ExchangeError::Poll(self.to_string())
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Commands and queries offered by an agent.
#[async_trait]
pub trait AgentService: Send + Sync {
    // ── Connections ──────────────────────────────────────────────────────────

    async fn create_invitation(&self, alias: &str) -> AgentResult<CreatedInvitation>;

    async fn accept_invitation(
        &self,
        alias: &str,
        invitation: &InvitationArtifact,
    ) -> AgentResult<AcceptedInvitation>;

    async fn connection_state(&self, connection_id: &ExchangeId) -> AgentResult<ConnectionStatus>;

    // ── Issuer setup ─────────────────────────────────────────────────────────

    async fn publish_schema(&self, schema: &SchemaDefinition) -> AgentResult<PublishedSchema>;

    async fn publish_credential_definition(
        &self,
        schema_id: &str,
    ) -> AgentResult<PublishedCredentialDefinition>;

    // ── Credentials ──────────────────────────────────────────────────────────

    async fn send_credential_offer(&self, offer: &CredentialOfferRequest)
        -> AgentResult<SentOffer>;

    /// Pending offers on a connection, as seen by the holder.
    async fn credential_offers(&self, connection_id: &ExchangeId)
        -> AgentResult<Vec<OfferSummary>>;

    async fn accept_credential_offer(
        &self,
        exchange_id: &ExchangeId,
        holder_identifier: &HolderIdentifier,
    ) -> AgentResult<OfferAcceptance>;

    async fn credential_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<CredentialStatus>;

    // ── Presentations ────────────────────────────────────────────────────────

    async fn send_proof_request(
        &self,
        connection_id: &ExchangeId,
        constraint: &ProofConstraint,
    ) -> AgentResult<SentProofRequest>;

    /// Pending proof requests on a connection, as seen by the prover.
    async fn proof_requests(
        &self,
        connection_id: &ExchangeId,
    ) -> AgentResult<Vec<ProofRequestSummary>>;

    async fn send_presentation(
        &self,
        exchange_id: &ExchangeId,
        credential_id: &str,
    ) -> AgentResult<PresentationSubmitted>;

    async fn presentation_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<PresentationStatus>;
}
