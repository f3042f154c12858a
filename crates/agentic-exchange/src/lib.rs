//! AgenticExchange — Exchange-protocol orchestration for agents.
//!
//! Drives two independent agents through a multi-stage handshake: a
//! pairwise connection, a credential issued over it, and a proof presented
//! from that credential. Every exchange is owned by the remote agent and
//! observed only by polling; this crate tracks each one as a typed,
//! monotonic state record and gates each stage on the previous one.

pub mod agent;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod flow;
pub mod ids;
pub mod invitation;
pub mod poller;
pub mod presentation;
pub mod state;
pub mod time;
pub mod watch;

// Re-export primary types
pub use config::ExchangeConfig;
pub use error::{ExchangeError, Result};
pub use ids::{ExchangeId, HolderIdentifier};
pub use invitation::{DecodedInvitation, InvitationArtifact};

// Re-export state types
pub use state::{
    ConnectionPayload, ConnectionState, CredentialPayload, CredentialState, ExchangeKind,
    ExchangePayload, ExchangeRecord, ExchangeRole, ExchangeState, Observation,
    PresentationPayload, PresentationState, ProofConstraint, Verified,
};

// Re-export agent types
pub use agent::{AgentError, AgentService, HttpAgentService, InMemoryAgent, SchemaDefinition};

// Re-export polling types
pub use poller::{PollDiagnostic, PollHandle, PollOutcome, Poller};
pub use watch::{EventSink, ExchangeEvent, ExchangeWatch};

// Re-export exchange components
pub use connection::{AcceptedInvitation, ConnectionExchange, CreatedInvitation};
pub use credential::{
    AcceptedOffer, CredentialExchange, DiscoveredOffer, PublishedDefinition, SentOffer,
};
pub use presentation::{
    DiscoveredRequest, PresentationExchange, PresentationResult, SentProofRequest,
    SubmittedPresentation,
};

// Re-export flow types
pub use flow::{FlowCancel, FlowCoordinator, FlowSide, FlowStage, FlowVariant, StageStatus};
