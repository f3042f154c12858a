//! Presentation exchange — proof request, discovery, submission, verification.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::agent::{AgentError, AgentService};
use crate::config::ExchangeConfig;
use crate::error::{require, ExchangeError, Result};
use crate::ids::ExchangeId;
use crate::poller::Poller;
use crate::state::{
    is_terminal, ExchangeKind, ExchangePayload, ExchangeRecord, ExchangeRole, ExchangeState,
    Observation, PresentationPayload, PresentationState, ProofConstraint, Verified,
};
use crate::watch::{self, EventSink, ExchangeSlot, ExchangeWatch, WatchOptions};

const KIND: ExchangeKind = ExchangeKind::Presentation;

/// A proof request the verifier has sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SentProofRequest {
    pub exchange_id: ExchangeId,
}

/// A proof request found waiting for the prover.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRequest {
    pub exchange_id: ExchangeId,
}

/// The agent's answer to a submitted presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedPresentation {
    pub state: ExchangeState,
}

/// What a finished presentation revealed, and whether it verified.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationResult {
    pub revealed_attributes: BTreeMap<String, String>,
    pub verified: Verified,
}

impl PresentationResult {
    /// Derive the result from a terminal presentation record.
    ///
    /// # Errors
    ///
    /// `Validation` for a record of another kind or one that is still in
    /// progress, `Abandoned` if the exchange was abandoned.
    pub fn from_record(record: &ExchangeRecord) -> Result<Self> {
        let payload = record.presentation().ok_or_else(|| {
            ExchangeError::Validation(format!("{} record has no presentation result", record.kind))
        })?;
        if !record.is_terminal() {
            return Err(ExchangeError::Validation(format!(
                "presentation {} is still {}",
                record.id_str(),
                record.state()
            )));
        }
        if record.is_failed() {
            return Err(ExchangeError::Abandoned {
                kind: KIND,
                id: record.id_str().to_string(),
            });
        }
        Ok(Self {
            revealed_attributes: payload.revealed_attributes.clone(),
            verified: payload.verified,
        })
    }
}

/// Drives one presentation exchange at a time against an agent.
pub struct PresentationExchange {
    agent: Arc<dyn AgentService>,
    poller: Poller,
    config: ExchangeConfig,
    events: Option<EventSink>,
    slot: ExchangeSlot,
}

impl PresentationExchange {
    pub fn new(agent: Arc<dyn AgentService>, poller: Poller, config: &ExchangeConfig) -> Self {
        Self {
            agent,
            poller,
            config: config.clone(),
            events: None,
            slot: ExchangeSlot::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Ask the prover on `connection_id` for a presentation.
    ///
    /// The constraint is passed to the agent as is.
    pub async fn send_request(
        &mut self,
        connection_id: &ExchangeId,
        constraint: ProofConstraint,
    ) -> Result<SentProofRequest> {
        require(connection_id.as_str(), "connection id")?;
        if constraint.is_empty() {
            return Err(ExchangeError::Validation(
                "proof constraint is required".into(),
            ));
        }
        self.slot.ensure_idle(KIND)?;

        let sent = self
            .agent
            .send_proof_request(connection_id, &constraint)
            .await
            .map_err(|e| e.into_remote("send-proof-request"))?;

        let payload = PresentationPayload {
            connection_id: Some(connection_id.clone()),
            constraint: Some(constraint),
            ..Default::default()
        };
        let record = ExchangeRecord::with_id(
            sent.exchange_id.clone(),
            ExchangeRole::Initiator,
            ExchangeState::Presentation(PresentationState::RequestSent),
            ExchangePayload::Presentation(payload),
        )?;
        self.slot.begin(record);
        log::info!("proof request {} sent", sent.exchange_id);

        Ok(SentProofRequest {
            exchange_id: sent.exchange_id,
        })
    }

    /// Look once for a proof request pending on `connection_id`.
    ///
    /// # Errors
    ///
    /// `AmbiguousState` if more than one request is pending, `Poll` if the
    /// query fails.
    pub async fn discover_request(
        &mut self,
        connection_id: &ExchangeId,
    ) -> Result<Option<DiscoveredRequest>> {
        require(connection_id.as_str(), "connection id")?;
        let requests = self
            .agent
            .proof_requests(connection_id)
            .await
            .map_err(AgentError::into_poll)?;

        let exchange_id = match requests.as_slice() {
            [] => return Ok(None),
            [only] => only.exchange_id.clone(),
            many => {
                return Err(ExchangeError::AmbiguousState {
                    kind: KIND,
                    count: many.len(),
                })
            }
        };

        if self.slot.matching(KIND, &exchange_id).is_err() {
            self.slot.ensure_idle(KIND)?;
            let payload = PresentationPayload {
                connection_id: Some(connection_id.clone()),
                ..Default::default()
            };
            self.slot.begin(ExchangeRecord::with_id(
                exchange_id.clone(),
                ExchangeRole::Responder,
                ExchangeState::Presentation(PresentationState::RequestReceived),
                ExchangePayload::Presentation(payload),
            )?);
        }
        log::info!("proof request {exchange_id} discovered");
        Ok(Some(DiscoveredRequest { exchange_id }))
    }

    /// Answer the request `exchange_id` with the credential `credential_id`.
    pub async fn submit_presentation(
        &mut self,
        exchange_id: &ExchangeId,
        credential_id: &str,
    ) -> Result<SubmittedPresentation> {
        require(exchange_id.as_str(), "exchange id")?;
        require(credential_id, "credential id")?;
        let cell = self.slot.matching(KIND, exchange_id)?;

        let submitted = self
            .agent
            .send_presentation(exchange_id, credential_id)
            .await
            .map_err(|e| e.into_remote("send-presentation"))?;
        let state = ExchangeState::parse(KIND, &submitted.state)?;

        let payload = PresentationPayload {
            credential_id: Some(credential_id.to_string()),
            ..Default::default()
        };
        watch::lock_cell(&cell).apply(&Observation::new(
            state,
            ExchangePayload::Presentation(payload),
        ))?;
        log::info!("presentation {exchange_id} submitted ({state})");
        Ok(SubmittedPresentation { state })
    }

    /// Poll the exchange until verified (verifier) or sent (prover), then a
    /// bounded tail for the acknowledgement.
    ///
    /// Revealed attributes are only taken from terminal reports, and
    /// `verified` stays `Unknown` until then.
    pub fn await_verification(&mut self, exchange_id: &ExchangeId) -> Result<ExchangeWatch> {
        require(exchange_id.as_str(), "exchange id")?;
        let cell = self.slot.matching(KIND, exchange_id)?;

        let agent = Arc::clone(&self.agent);
        let id = exchange_id.clone();
        let fetch = move || {
            let agent = Arc::clone(&agent);
            let id = id.clone();
            async move {
                let status = agent
                    .presentation_exchange_state(&id)
                    .await
                    .map_err(AgentError::into_poll)?;
                let state = ExchangeState::parse(KIND, &status.state)?;
                let mut payload = PresentationPayload {
                    verified: Verified::from_report(&state, status.verified),
                    ..Default::default()
                };
                if is_terminal(&state) {
                    payload.revealed_attributes = status.revealed_attributes;
                }
                Ok(Observation::new(state, ExchangePayload::Presentation(payload)))
            }
        };

        let watch = watch::spawn(
            &self.poller,
            cell,
            fetch,
            WatchOptions {
                interval: self.config.poll_interval(),
                tail_limit: Some(self.config.ack_poll_limit),
                events: self.events.clone(),
            },
        )?;
        self.slot.set_poll(watch.handle());
        Ok(watch)
    }

    pub fn current(&self) -> Option<ExchangeRecord> {
        self.slot.current()
    }

    /// Cancel any poll, then forget the exchange.
    pub fn reset(&mut self) {
        self.slot.reset();
    }
}
