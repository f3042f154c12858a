//! Data structures for exchange state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, Result};
use crate::ids::{ExchangeId, HolderIdentifier};
use crate::invitation::InvitationArtifact;

use super::predicates;

/// Rank given to failure states; they absorb every other state.
pub const ABANDONED_RANK: u8 = u8::MAX;

// ---------------------------------------------------------------------------
// Role and kind
// ---------------------------------------------------------------------------

/// Which side of an exchange the local agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeRole {
    /// Produces the initiating artifact (invitation, offer, proof request).
    Initiator,
    /// Consumes the initiating artifact.
    Responder,
}

impl ExchangeRole {
    /// Return a stable string tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }

    /// The role played by the other agent.
    pub fn counterpart(&self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

impl std::fmt::Display for ExchangeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// The three exchange protocols driven by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExchangeKind {
    Connection,
    Credential,
    Presentation,
}

impl ExchangeKind {
    pub const ALL: [Self; 3] = [Self::Connection, Self::Credential, Self::Presentation];

    /// Return a stable string tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Credential => "credential",
            Self::Presentation => "presentation",
        }
    }

    /// The stage that must be ready before this one may start.
    pub fn prerequisite(&self) -> Option<Self> {
        match self {
            Self::Connection => None,
            Self::Credential => Some(Self::Connection),
            Self::Presentation => Some(Self::Credential),
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Lowercase, trim, and unify `_` separators to `-`.
fn normalize(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('_', "-")
}

// ---------------------------------------------------------------------------
// Connection states
// ---------------------------------------------------------------------------

/// Connection handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Invitation,
    Request,
    Response,
    Active,
    Abandoned,
}

impl ConnectionState {
    pub const ALL: [Self; 5] = [
        Self::Invitation,
        Self::Request,
        Self::Response,
        Self::Active,
        Self::Abandoned,
    ];

    /// Parse an agent-reported connection state.
    pub fn parse(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "invitation" | "invitation-sent" | "invitation-received" | "start" | "init" => {
                Ok(Self::Invitation)
            }
            "request" | "request-sent" | "request-received" => Ok(Self::Request),
            "response" | "response-sent" | "response-received" => Ok(Self::Response),
            "active" | "completed" => Ok(Self::Active),
            "abandoned" | "error" => Ok(Self::Abandoned),
            _ => Err(ExchangeError::UnknownState {
                kind: ExchangeKind::Connection,
                state: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::Request => "request",
            Self::Response => "response",
            Self::Active => "active",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Invitation => 0,
            Self::Request => 1,
            Self::Response => 2,
            Self::Active => 3,
            Self::Abandoned => ABANDONED_RANK,
        }
    }
}

// ---------------------------------------------------------------------------
// Credential states
// ---------------------------------------------------------------------------

/// Credential issuance states. Issuer and holder see mirrored names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    OfferSent,
    OfferReceived,
    RequestSent,
    RequestReceived,
    Issued,
    Received,
    /// Acknowledged. Optional: counterparties may never send the ack.
    Done,
    Abandoned,
}

impl CredentialState {
    pub const ALL: [Self; 8] = [
        Self::OfferSent,
        Self::OfferReceived,
        Self::RequestSent,
        Self::RequestReceived,
        Self::Issued,
        Self::Received,
        Self::Done,
        Self::Abandoned,
    ];

    /// Parse an agent-reported credential exchange state.
    pub fn parse(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "offer-sent" => Ok(Self::OfferSent),
            "offer-received" => Ok(Self::OfferReceived),
            "request-sent" => Ok(Self::RequestSent),
            "request-received" => Ok(Self::RequestReceived),
            "credential-issued" | "issued" => Ok(Self::Issued),
            "credential-received" | "received" => Ok(Self::Received),
            "done" | "credential-acked" | "acked" | "stored" => Ok(Self::Done),
            "abandoned" | "error" | "deleted" => Ok(Self::Abandoned),
            _ => Err(ExchangeError::UnknownState {
                kind: ExchangeKind::Credential,
                state: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfferSent => "offer-sent",
            Self::OfferReceived => "offer-received",
            Self::RequestSent => "request-sent",
            Self::RequestReceived => "request-received",
            Self::Issued => "credential-issued",
            Self::Received => "credential-received",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::OfferSent | Self::OfferReceived => 0,
            Self::RequestSent | Self::RequestReceived => 1,
            Self::Issued | Self::Received => 2,
            Self::Done => 3,
            Self::Abandoned => ABANDONED_RANK,
        }
    }
}

// ---------------------------------------------------------------------------
// Presentation states
// ---------------------------------------------------------------------------

/// Proof presentation states. Verifier and prover see mirrored names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresentationState {
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    Verified,
    Done,
    Abandoned,
}

impl PresentationState {
    pub const ALL: [Self; 7] = [
        Self::RequestSent,
        Self::RequestReceived,
        Self::PresentationSent,
        Self::PresentationReceived,
        Self::Verified,
        Self::Done,
        Self::Abandoned,
    ];

    /// Parse an agent-reported presentation exchange state.
    pub fn parse(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "request-sent" => Ok(Self::RequestSent),
            "request-received" => Ok(Self::RequestReceived),
            "presentation-sent" => Ok(Self::PresentationSent),
            "presentation-received" => Ok(Self::PresentationReceived),
            "verified" => Ok(Self::Verified),
            "done" | "presentation-acked" | "acked" => Ok(Self::Done),
            "abandoned" | "error" | "deleted" => Ok(Self::Abandoned),
            _ => Err(ExchangeError::UnknownState {
                kind: ExchangeKind::Presentation,
                state: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestSent => "request-sent",
            Self::RequestReceived => "request-received",
            Self::PresentationSent => "presentation-sent",
            Self::PresentationReceived => "presentation-received",
            Self::Verified => "verified",
            Self::Done => "done",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::RequestSent | Self::RequestReceived => 0,
            Self::PresentationSent | Self::PresentationReceived => 1,
            Self::Verified | Self::Done => 2,
            Self::Abandoned => ABANDONED_RANK,
        }
    }
}

// ---------------------------------------------------------------------------
// ExchangeState
// ---------------------------------------------------------------------------

/// A lifecycle position, tagged with the exchange kind it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum ExchangeState {
    Connection(ConnectionState),
    Credential(CredentialState),
    Presentation(PresentationState),
}

impl ExchangeState {
    /// Parse an agent-reported state string for the given kind.
    pub fn parse(kind: ExchangeKind, s: &str) -> Result<Self> {
        match kind {
            ExchangeKind::Connection => ConnectionState::parse(s).map(Self::Connection),
            ExchangeKind::Credential => CredentialState::parse(s).map(Self::Credential),
            ExchangeKind::Presentation => PresentationState::parse(s).map(Self::Presentation),
        }
    }

    /// Every state of the given kind.
    pub fn all(kind: ExchangeKind) -> Vec<Self> {
        match kind {
            ExchangeKind::Connection => ConnectionState::ALL.map(Self::Connection).to_vec(),
            ExchangeKind::Credential => CredentialState::ALL.map(Self::Credential).to_vec(),
            ExchangeKind::Presentation => PresentationState::ALL.map(Self::Presentation).to_vec(),
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Connection(_) => ExchangeKind::Connection,
            Self::Credential(_) => ExchangeKind::Credential,
            Self::Presentation(_) => ExchangeKind::Presentation,
        }
    }

    /// Position along the kind's forward order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Connection(s) => s.rank(),
            Self::Credential(s) => s.rank(),
            Self::Presentation(s) => s.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection(s) => s.as_str(),
            Self::Credential(s) => s.as_str(),
            Self::Presentation(s) => s.as_str(),
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.rank() == ABANDONED_RANK
    }
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Verification outcome
// ---------------------------------------------------------------------------

/// Tri-state verification result.
///
/// Only meaningful once a presentation exchange is terminal; every earlier
/// read is `Unknown`, never `False`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verified {
    #[default]
    Unknown,
    True,
    False,
}

impl Verified {
    /// Derive the outcome from what the agent reported at `state`.
    pub fn from_report(state: &ExchangeState, reported: Option<bool>) -> Self {
        if !predicates::is_terminal(state) {
            return Self::Unknown;
        }
        match (reported, state) {
            (Some(true), _) => Self::True,
            (Some(false), _) => Self::False,
            (None, ExchangeState::Presentation(PresentationState::Verified)) => Self::True,
            (None, _) => Self::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::True => Some(true),
            Self::False => Some(false),
        }
    }
}

impl std::fmt::Display for Verified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::True => "true",
            Self::False => "false",
        })
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Restrictions a verifier places on acceptable credentials.
///
/// Opaque to this crate: passed through to the agent service unvalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofConstraint(pub serde_json::Value);

impl ProofConstraint {
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::String(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub alias: Option<String>,
    pub invitation: Option<InvitationArtifact>,
    pub their_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub connection_id: Option<ExchangeId>,
    pub definition_ref: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub credential_id: Option<String>,
    pub holder_identifier: Option<HolderIdentifier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentationPayload {
    pub connection_id: Option<ExchangeId>,
    pub constraint: Option<ProofConstraint>,
    pub credential_id: Option<String>,
    pub revealed_attributes: BTreeMap<String, String>,
    pub verified: Verified,
}

/// Kind-specific data extracted from an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangePayload {
    Connection(ConnectionPayload),
    Credential(CredentialPayload),
    Presentation(PresentationPayload),
}

impl ExchangePayload {
    /// An empty payload for the given kind.
    pub fn empty(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Connection => Self::Connection(ConnectionPayload::default()),
            ExchangeKind::Credential => Self::Credential(CredentialPayload::default()),
            ExchangeKind::Presentation => Self::Presentation(PresentationPayload::default()),
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Connection(_) => ExchangeKind::Connection,
            Self::Credential(_) => ExchangeKind::Credential,
            Self::Presentation(_) => ExchangeKind::Presentation,
        }
    }

    /// Fold `newer` into `self` without ever retracting a known field.
    pub fn merge(&mut self, newer: &ExchangePayload) -> Result<()> {
        match (self, newer) {
            (Self::Connection(cur), Self::Connection(new)) => {
                fill(&mut cur.alias, &new.alias);
                fill(&mut cur.invitation, &new.invitation);
                fill(&mut cur.their_label, &new.their_label);
            }
            (Self::Credential(cur), Self::Credential(new)) => {
                fill(&mut cur.connection_id, &new.connection_id);
                fill(&mut cur.definition_ref, &new.definition_ref);
                extend(&mut cur.attributes, &new.attributes);
                fill(&mut cur.credential_id, &new.credential_id);
                fill(&mut cur.holder_identifier, &new.holder_identifier);
            }
            (Self::Presentation(cur), Self::Presentation(new)) => {
                fill(&mut cur.connection_id, &new.connection_id);
                fill(&mut cur.constraint, &new.constraint);
                fill(&mut cur.credential_id, &new.credential_id);
                extend(&mut cur.revealed_attributes, &new.revealed_attributes);
                if new.verified.is_known() {
                    cur.verified = new.verified;
                }
            }
            (cur, new) => {
                return Err(ExchangeError::Validation(format!(
                    "cannot merge {} payload into {} payload",
                    new.kind(),
                    cur.kind()
                )))
            }
        }
        Ok(())
    }
}

fn fill<T: Clone>(current: &mut Option<T>, newer: &Option<T>) {
    if let Some(value) = newer {
        *current = Some(value.clone());
    }
}

fn extend(current: &mut BTreeMap<String, String>, newer: &BTreeMap<String, String>) {
    for (k, v) in newer {
        current.insert(k.clone(), v.clone());
    }
}

// ---------------------------------------------------------------------------
// Observation and record
// ---------------------------------------------------------------------------

/// What one query (or one command response) revealed about an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub state: ExchangeState,
    pub payload: ExchangePayload,
}

impl Observation {
    pub fn new(state: ExchangeState, payload: ExchangePayload) -> Self {
        Self { state, payload }
    }

    /// An observation carrying only a state.
    pub fn state_only(state: ExchangeState) -> Self {
        Self {
            state,
            payload: ExchangePayload::empty(state.kind()),
        }
    }
}

/// Snapshot of one exchange's lifecycle position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    id: Option<ExchangeId>,
    pub kind: ExchangeKind,
    pub role: ExchangeRole,
    state: ExchangeState,
    payload: ExchangePayload,
    /// Creation timestamp (microseconds since Unix epoch).
    pub created_at: u64,
    /// Last successful poll (microseconds since Unix epoch).
    pub last_polled_at: Option<u64>,
    pub poll_count: u64,
}

impl ExchangeRecord {
    /// Create a record at its first known state.
    ///
    /// The payload must belong to the same kind as the state.
    pub fn new(role: ExchangeRole, state: ExchangeState, payload: ExchangePayload) -> Result<Self> {
        if payload.kind() != state.kind() {
            return Err(ExchangeError::Validation(format!(
                "{} payload does not match {} state",
                payload.kind(),
                state.kind()
            )));
        }
        Ok(Self {
            id: None,
            kind: state.kind(),
            role,
            state,
            payload,
            created_at: crate::time::now_micros(),
            last_polled_at: None,
            poll_count: 0,
        })
    }

    /// Create a record already carrying its agent-assigned id.
    pub fn with_id(
        id: ExchangeId,
        role: ExchangeRole,
        state: ExchangeState,
        payload: ExchangePayload,
    ) -> Result<Self> {
        let mut record = Self::new(role, state, payload)?;
        record.assign_id(id)?;
        Ok(record)
    }

    pub fn id(&self) -> Option<&ExchangeId> {
        self.id.as_ref()
    }

    /// The id as a string, empty before assignment.
    pub fn id_str(&self) -> &str {
        self.id.as_ref().map(|id| id.as_str()).unwrap_or("")
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn payload(&self) -> &ExchangePayload {
        &self.payload
    }

    /// Assign the agent's id. Idempotent for the same value.
    pub fn assign_id(&mut self, id: ExchangeId) -> Result<()> {
        if id.is_empty() {
            return Err(ExchangeError::Validation("exchange id is empty".into()));
        }
        match &self.id {
            Some(current) if *current != id => Err(ExchangeError::IdReassigned {
                current: current.0.clone(),
                attempted: id.0,
            }),
            Some(_) => Ok(()),
            None => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    /// Return the record as it looks after `obs`, leaving `self` untouched.
    ///
    /// Fails on a backward transition, a state outside this role's path,
    /// or a payload of the wrong kind.
    pub fn observe(&self, obs: &Observation) -> Result<Self> {
        let mut next = self.clone();
        next.apply(obs)?;
        next.last_polled_at = Some(crate::time::now_micros());
        next.poll_count += 1;
        Ok(next)
    }

    /// Apply the result of one of our own commands in place.
    pub fn apply(&mut self, obs: &Observation) -> Result<()> {
        predicates::validate_transition(&self.state, &obs.state)?;
        if !predicates::is_on_path(self.role, &obs.state) {
            return Err(ExchangeError::UnknownState {
                kind: self.kind,
                state: format!("{} (unexpected for {})", obs.state, self.role),
            });
        }
        let mut payload = self.payload.clone();
        payload.merge(&obs.payload)?;
        if let ExchangePayload::Presentation(p) = &mut payload {
            if !predicates::is_terminal(&obs.state) {
                p.verified = Verified::Unknown;
            }
        }
        self.state = obs.state;
        self.payload = payload;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        predicates::is_terminal(&self.state)
    }

    pub fn is_ready(&self) -> bool {
        predicates::is_ready_for_next_stage(self.role, &self.state)
    }

    pub fn is_failed(&self) -> bool {
        predicates::is_failed(&self.state)
    }

    pub fn connection(&self) -> Option<&ConnectionPayload> {
        match &self.payload {
            ExchangePayload::Connection(p) => Some(p),
            _ => None,
        }
    }

    pub fn credential(&self) -> Option<&CredentialPayload> {
        match &self.payload {
            ExchangePayload::Credential(p) => Some(p),
            _ => None,
        }
    }

    pub fn presentation(&self) -> Option<&PresentationPayload> {
        match &self.payload {
            ExchangePayload::Presentation(p) => Some(p),
            _ => None,
        }
    }
}
