//! Request and response bodies exchanged with the agent service.
//!
//! All bodies are JSON. State fields are kept as the agent's raw strings;
//! parsing into typed state happens in the exchange components.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{ExchangeId, HolderIdentifier};
use crate::invitation::InvitationArtifact;
use crate::state::ProofConstraint;

// ── Connections ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInvitationRequest {
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedInvitation {
    pub connection_id: ExchangeId,
    pub invitation: InvitationArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptInvitationRequest {
    pub alias: String,
    pub invitation: InvitationArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedInvitation {
    pub connection_id: ExchangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: String,
    #[serde(default)]
    pub their_label: Option<String>,
}

// ── Issuer setup ──────────────────────────────────────────────────────────────

/// A credential schema: a name, a version and the attribute names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub version: String,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedSchema {
    pub schema_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishDefinitionRequest {
    pub schema_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedCredentialDefinition {
    pub definition_id: String,
}

// ── Credentials ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialOfferRequest {
    pub connection_id: ExchangeId,
    pub definition_ref: String,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentOffer {
    pub exchange_id: ExchangeId,
}

/// One pending offer as seen by the holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferSummary {
    pub exchange_id: ExchangeId,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptOfferRequest {
    pub holder_identifier: HolderIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferAcceptance {
    pub holder_identifier: HolderIdentifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub state: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

// ── Presentations ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRequestBody {
    pub connection_id: ExchangeId,
    pub constraint: ProofConstraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentProofRequest {
    pub exchange_id: ExchangeId,
}

/// One pending proof request as seen by the prover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRequestSummary {
    pub exchange_id: ExchangeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPresentationRequest {
    pub credential_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationSubmitted {
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationStatus {
    pub state: String,
    #[serde(default)]
    pub revealed_attributes: BTreeMap<String, String>,
    /// Agents report this as a JSON bool or as `"true"`/`"false"`.
    #[serde(default, deserialize_with = "bool_or_string")]
    pub verified: Option<bool>,
}

/// List wrapper used by the agent's record queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Results<T> {
    pub results: Vec<T>,
}

fn bool_or_string<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(b)) => Ok(Some(b)),
        Some(Flag::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            "" => Ok(None),
            other => Err(serde::de::Error::custom(format!(
                "invalid verified flag: {other}"
            ))),
        },
    }
}
