//! In-process simulation of a pair of agents.
//!
//! Both agents share one ledger. Each `InMemoryAgent` is a *view* of that
//! ledger from one side: the initiator (inviter / issuer / verifier) or the
//! responder (invitee / holder / prover). Without scripts, every state query
//! advances the caller's side one step along its forward path, but only once
//! the other side has joined the exchange. Scripts replace that behaviour
//! with an explicit sequence of states per exchange and side.
//!
//! Ids are deterministic: connections `c1, c2, ..`, credential exchanges
//! `e1, e2, ..`, presentation exchanges `p1, p2, ..`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::ids::{ExchangeId, HolderIdentifier};
use crate::invitation::InvitationArtifact;
use crate::state::{
    forward_path, is_terminal, ExchangeKind, ExchangeRole, ExchangeState, ProofConstraint,
};

use super::messages::*;
use super::{AgentError, AgentResult, AgentService};

const INVITATION_BASE: &str = "memory://agent/invite";

/// One scripted answer to a state query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptStep {
    pub state: String,
    pub credential_id: Option<String>,
    pub revealed_attributes: BTreeMap<String, String>,
    pub verified: Option<bool>,
}

impl ScriptStep {
    pub fn state(state: &str) -> Self {
        Self {
            state: state.to_string(),
            ..Default::default()
        }
    }

    pub fn with_credential_id(mut self, id: &str) -> Self {
        self.credential_id = Some(id.to_string());
        self
    }

    pub fn with_verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn with_revealed(mut self, name: &str, value: &str) -> Self {
        self.revealed_attributes
            .insert(name.to_string(), value.to_string());
        self
    }
}

/// One side's view of an exchange.
#[derive(Debug, Default)]
struct View {
    /// Index into the side's forward path; `None` until the side joins.
    cursor: Option<usize>,
    script: VecDeque<ScriptStep>,
}

#[derive(Debug)]
struct Entry {
    kind: ExchangeKind,
    connection_id: Option<String>,
    views: [View; 2],
    attributes: BTreeMap<String, String>,
    credential_id: Option<String>,
    revealed: BTreeMap<String, String>,
}

impl Entry {
    fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            connection_id: None,
            views: [View::default(), View::default()],
            attributes: BTreeMap::new(),
            credential_id: None,
            revealed: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    counters: HashMap<&'static str, u64>,
    entries: HashMap<(ExchangeKind, String), Entry>,
    pending_offers: HashMap<String, Vec<OfferSummary>>,
    pending_requests: HashMap<String, Vec<ProofRequestSummary>>,
    failing_queries: u32,
    rejected_commands: VecDeque<String>,
    query_delay: Duration,
    query_count: u64,
}

impl Ledger {
    fn next_id(&mut self, prefix: &'static str) -> String {
        let n = self.counters.entry(prefix).or_insert(0);
        *n += 1;
        format!("{prefix}{n}")
    }

    fn entry_mut(&mut self, kind: ExchangeKind, id: &str) -> AgentResult<&mut Entry> {
        self.entries
            .get_mut(&(kind, id.to_string()))
            .ok_or_else(|| not_found(kind, id))
    }

    /// Consume an injected command rejection, if any.
    fn check_command(&mut self) -> AgentResult<()> {
        match self.rejected_commands.pop_front() {
            Some(diagnostic) => Err(AgentError::Rejected {
                status: 400,
                diagnostic,
            }),
            None => Ok(()),
        }
    }

    /// Answer a state query for `side`, advancing the simulation.
    fn step(&mut self, kind: ExchangeKind, id: &str, side: ExchangeRole) -> AgentResult<ScriptStep> {
        let entry = self.entry_mut(kind, id)?;
        let me = side_index(side);
        let other_joined = entry.views[1 - me].cursor.is_some();

        let view = &mut entry.views[me];
        if let Some(step) = view.script.front().cloned() {
            if view.script.len() > 1 {
                view.script.pop_front();
            }
            return Ok(step);
        }

        let Some(cursor) = view.cursor else {
            return Err(not_found(kind, id));
        };
        let path = forward_path(kind, side);
        let state = path[cursor];
        if other_joined && cursor + 1 < path.len() {
            view.cursor = Some(cursor + 1);
        }
        Ok(simulated_step(entry, side, state))
    }
}

/// Fill in what the simulated agent knows at `state`.
fn simulated_step(entry: &Entry, side: ExchangeRole, state: ExchangeState) -> ScriptStep {
    let mut step = ScriptStep::state(state.as_str());
    match entry.kind {
        // The holder learns its credential id once the credential arrives.
        ExchangeKind::Credential if state.rank() >= 2 && side == ExchangeRole::Responder => {
            step.credential_id = entry.credential_id.clone();
        }
        ExchangeKind::Presentation if is_terminal(&state) => {
            step.revealed_attributes = entry.revealed.clone();
            if side == ExchangeRole::Initiator {
                step.verified = Some(true);
            }
        }
        _ => {}
    }
    step
}

fn side_index(side: ExchangeRole) -> usize {
    match side {
        ExchangeRole::Initiator => 0,
        ExchangeRole::Responder => 1,
    }
}

fn not_found(kind: ExchangeKind, id: &str) -> AgentError {
    AgentError::Rejected {
        status: 404,
        diagnostic: format!("{kind} record {id} not found"),
    }
}

/// One side of a simulated agent pair.
#[derive(Debug, Clone)]
pub struct InMemoryAgent {
    side: ExchangeRole,
    ledger: Arc<Mutex<Ledger>>,
}

impl Default for InMemoryAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgent {
    /// A fresh ledger, viewed from the initiator side.
    pub fn new() -> Self {
        Self {
            side: ExchangeRole::Initiator,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// A fresh ledger with both views: `(initiator, responder)`.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let inviter = Self::new();
        let invitee = inviter.counterpart();
        (Arc::new(inviter), Arc::new(invitee))
    }

    /// The other side's view of the same ledger.
    pub fn counterpart(&self) -> Self {
        Self {
            side: self.side.counterpart(),
            ledger: Arc::clone(&self.ledger),
        }
    }

    pub fn side(&self) -> ExchangeRole {
        self.side
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting and fault injection ────────────────────────────────────────

    /// Answer this side's state queries for `id` with `states`, in order.
    /// The last state repeats once the script runs out.
    pub fn script_states(&self, kind: ExchangeKind, id: &str, states: &[&str]) {
        self.script_steps(kind, id, states.iter().map(|s| ScriptStep::state(s)).collect());
    }

    /// Like [`script_states`](Self::script_states) with full steps.
    pub fn script_steps(&self, kind: ExchangeKind, id: &str, steps: Vec<ScriptStep>) {
        let me = side_index(self.side);
        let mut ledger = self.ledger();
        let entry = ledger
            .entries
            .entry((kind, id.to_string()))
            .or_insert_with(|| Entry::new(kind));
        entry.views[me].script = steps.into();
    }

    /// Make a credential offer visible to the holder on `connection_id`.
    pub fn inject_offer(&self, connection_id: &str, offer: OfferSummary) {
        let mut ledger = self.ledger();
        let key = (ExchangeKind::Credential, offer.exchange_id.0.clone());
        let entry = ledger
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(ExchangeKind::Credential));
        entry.connection_id = Some(connection_id.to_string());
        entry.attributes = offer.attributes.clone();
        entry.credential_id = Some(format!("cred-{}", offer.exchange_id));
        entry.views[0].cursor.get_or_insert(0);
        ledger
            .pending_offers
            .entry(connection_id.to_string())
            .or_default()
            .push(offer);
    }

    /// Make a proof request visible to the prover on `connection_id`.
    pub fn inject_proof_request(&self, connection_id: &str, request: ProofRequestSummary) {
        let mut ledger = self.ledger();
        let key = (ExchangeKind::Presentation, request.exchange_id.0.clone());
        let entry = ledger
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(ExchangeKind::Presentation));
        entry.connection_id = Some(connection_id.to_string());
        entry.views[0].cursor.get_or_insert(0);
        ledger
            .pending_requests
            .entry(connection_id.to_string())
            .or_default()
            .push(request);
    }

    /// Fail the next `n` queries (from either side) as unavailable.
    pub fn fail_next_queries(&self, n: u32) {
        self.ledger().failing_queries = n;
    }

    /// Reject the next command (from either side) with `diagnostic`.
    pub fn reject_next_command(&self, diagnostic: &str) {
        self.ledger()
            .rejected_commands
            .push_back(diagnostic.to_string());
    }

    /// Delay every query answer by `delay`.
    pub fn set_query_delay(&self, delay: Duration) {
        self.ledger().query_delay = delay;
    }

    /// Total queries answered or failed so far, both sides.
    pub fn query_count(&self) -> u64 {
        self.ledger().query_count
    }

    /// Shared prologue of every query: count, delay, injected failure.
    async fn begin_query(&self) -> AgentResult<()> {
        let delay = {
            let mut ledger = self.ledger();
            ledger.query_count += 1;
            ledger.query_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut ledger = self.ledger();
        if ledger.failing_queries > 0 {
            ledger.failing_queries -= 1;
            return Err(AgentError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentService for InMemoryAgent {
    async fn create_invitation(&self, alias: &str) -> AgentResult<CreatedInvitation> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        let id = ledger.next_id("c");
        let mut entry = Entry::new(ExchangeKind::Connection);
        entry.views[side_index(self.side)].cursor = Some(0);
        ledger
            .entries
            .insert((ExchangeKind::Connection, id.clone()), entry);

        let invitation = serde_json::json!({
            "@type": "https://didcomm.org/connections/1.0/invitation",
            "@id": id,
            "label": alias,
        });
        Ok(CreatedInvitation {
            connection_id: ExchangeId(id),
            invitation: InvitationArtifact::encode(INVITATION_BASE, &invitation),
        })
    }

    async fn accept_invitation(
        &self,
        _alias: &str,
        invitation: &InvitationArtifact,
    ) -> AgentResult<AcceptedInvitation> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        let decoded = invitation.decode().map_err(|e| AgentError::Rejected {
            status: 400,
            diagnostic: e.to_string(),
        })?;
        let id = decoded
            .content
            .get("@id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Rejected {
                status: 400,
                diagnostic: "invitation has no @id".into(),
            })?
            .to_string();
        let entry = ledger.entry_mut(ExchangeKind::Connection, &id)?;
        // Receiving the invitation and sending the request happen together.
        entry.views[side_index(self.side)].cursor = Some(1);
        Ok(AcceptedInvitation {
            connection_id: ExchangeId(id),
        })
    }

    async fn connection_state(&self, connection_id: &ExchangeId) -> AgentResult<ConnectionStatus> {
        self.begin_query().await?;
        let step = self
            .ledger()
            .step(ExchangeKind::Connection, connection_id.as_str(), self.side)?;
        Ok(ConnectionStatus {
            state: step.state,
            their_label: None,
        })
    }

    async fn publish_schema(&self, schema: &SchemaDefinition) -> AgentResult<PublishedSchema> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        let n = ledger.next_id("");
        Ok(PublishedSchema {
            schema_id: format!("memory:2:{}:{}:{n}", schema.name, schema.version),
        })
    }

    async fn publish_credential_definition(
        &self,
        schema_id: &str,
    ) -> AgentResult<PublishedCredentialDefinition> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        let n = ledger.next_id("def");
        Ok(PublishedCredentialDefinition {
            definition_id: format!("{schema_id}:CL:{n}"),
        })
    }

    async fn send_credential_offer(
        &self,
        offer: &CredentialOfferRequest,
    ) -> AgentResult<SentOffer> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        ledger.entry_mut(ExchangeKind::Connection, offer.connection_id.as_str())?;
        let id = ledger.next_id("e");
        let mut entry = Entry::new(ExchangeKind::Credential);
        entry.connection_id = Some(offer.connection_id.0.clone());
        entry.attributes = offer.attributes.clone();
        entry.credential_id = Some(format!("cred-{id}"));
        entry.views[side_index(self.side)].cursor = Some(0);
        ledger
            .entries
            .insert((ExchangeKind::Credential, id.clone()), entry);
        ledger
            .pending_offers
            .entry(offer.connection_id.0.clone())
            .or_default()
            .push(OfferSummary {
                exchange_id: ExchangeId(id.clone()),
                attributes: offer.attributes.clone(),
            });
        Ok(SentOffer {
            exchange_id: ExchangeId(id),
        })
    }

    async fn credential_offers(
        &self,
        connection_id: &ExchangeId,
    ) -> AgentResult<Vec<OfferSummary>> {
        self.begin_query().await?;
        Ok(self
            .ledger()
            .pending_offers
            .get(connection_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn accept_credential_offer(
        &self,
        exchange_id: &ExchangeId,
        holder_identifier: &HolderIdentifier,
    ) -> AgentResult<OfferAcceptance> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        let me = side_index(self.side);
        let entry = ledger.entry_mut(ExchangeKind::Credential, exchange_id.as_str())?;
        entry.views[me].cursor = Some(1);
        let connection_id = entry.connection_id.clone().unwrap_or_default();
        if let Some(offers) = ledger.pending_offers.get_mut(&connection_id) {
            offers.retain(|o| o.exchange_id != *exchange_id);
        }
        Ok(OfferAcceptance {
            holder_identifier: holder_identifier.clone(),
        })
    }

    async fn credential_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<CredentialStatus> {
        self.begin_query().await?;
        let mut ledger = self.ledger();
        let step = ledger.step(ExchangeKind::Credential, exchange_id.as_str(), self.side)?;
        let attributes = ledger
            .entry_mut(ExchangeKind::Credential, exchange_id.as_str())?
            .attributes
            .clone();
        Ok(CredentialStatus {
            state: step.state,
            credential_id: step.credential_id,
            attributes,
        })
    }

    async fn send_proof_request(
        &self,
        connection_id: &ExchangeId,
        _constraint: &ProofConstraint,
    ) -> AgentResult<SentProofRequest> {
        let mut ledger = self.ledger();
        ledger.check_command()?;
        ledger.entry_mut(ExchangeKind::Connection, connection_id.as_str())?;
        let id = ledger.next_id("p");
        let mut entry = Entry::new(ExchangeKind::Presentation);
        entry.connection_id = Some(connection_id.0.clone());
        entry.views[side_index(self.side)].cursor = Some(0);
        ledger
            .entries
            .insert((ExchangeKind::Presentation, id.clone()), entry);
        ledger
            .pending_requests
            .entry(connection_id.0.clone())
            .or_default()
            .push(ProofRequestSummary {
                exchange_id: ExchangeId(id.clone()),
            });
        Ok(SentProofRequest {
            exchange_id: ExchangeId(id),
        })
    }

    async fn proof_requests(
        &self,
        connection_id: &ExchangeId,
    ) -> AgentResult<Vec<ProofRequestSummary>> {
        self.begin_query().await?;
        Ok(self
            .ledger()
            .pending_requests
            .get(connection_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn send_presentation(
        &self,
        exchange_id: &ExchangeId,
        credential_id: &str,
    ) -> AgentResult<PresentationSubmitted> {
        let mut ledger = self.ledger();
        ledger.check_command()?;

        let revealed = ledger
            .entries
            .values()
            .find(|e| {
                e.kind == ExchangeKind::Credential
                    && e.credential_id.as_deref() == Some(credential_id)
            })
            .map(|e| e.attributes.clone())
            .unwrap_or_default();

        let me = side_index(self.side);
        let entry = ledger.entry_mut(ExchangeKind::Presentation, exchange_id.as_str())?;
        entry.views[me].cursor = Some(1);
        entry.revealed = revealed;
        let connection_id = entry.connection_id.clone().unwrap_or_default();
        let state = forward_path(ExchangeKind::Presentation, self.side)[1];
        if let Some(requests) = ledger.pending_requests.get_mut(&connection_id) {
            requests.retain(|r| r.exchange_id != *exchange_id);
        }
        Ok(PresentationSubmitted {
            state: state.as_str().to_string(),
        })
    }

    async fn presentation_exchange_state(
        &self,
        exchange_id: &ExchangeId,
    ) -> AgentResult<PresentationStatus> {
        self.begin_query().await?;
        let step =
            self.ledger()
                .step(ExchangeKind::Presentation, exchange_id.as_str(), self.side)?;
        Ok(PresentationStatus {
            state: step.state,
            revealed_attributes: step.revealed_attributes,
            verified: step.verified,
        })
    }
}
