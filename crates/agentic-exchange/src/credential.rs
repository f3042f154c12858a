//! Credential exchange — offer, discovery, acceptance, issuance polling.
//!
//! Issuer: send an offer on a connection, then poll until the credential is
//! issued. Holder: discover the offer, accept it with a fresh holder
//! identifier, then poll until the credential is received. Both sides keep
//! polling a few more times after that for the acknowledgement; missing it
//! is not an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::agent::{AgentError, AgentService, CredentialOfferRequest, SchemaDefinition};
use crate::config::ExchangeConfig;
use crate::error::{require, ExchangeError, Result};
use crate::ids::{ExchangeId, HolderIdentifier};
use crate::poller::Poller;
use crate::state::{
    CredentialPayload, CredentialState, ExchangeKind, ExchangePayload, ExchangeRecord,
    ExchangeRole, ExchangeState, Observation,
};
use crate::watch::{self, EventSink, ExchangeSlot, ExchangeWatch, WatchOptions};

const KIND: ExchangeKind = ExchangeKind::Credential;

/// An offer the issuer has sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SentOffer {
    pub exchange_id: ExchangeId,
}

/// An offer found waiting for the holder.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredOffer {
    pub exchange_id: ExchangeId,
    pub attributes: BTreeMap<String, String>,
}

/// An accepted offer; the credential request has been sent.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedOffer {
    pub holder_identifier: HolderIdentifier,
}

/// Ids produced by publishing a schema and a credential definition over it.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedDefinition {
    pub schema_id: String,
    pub definition_id: String,
}

/// Drives one credential exchange at a time against an agent.
pub struct CredentialExchange {
    agent: Arc<dyn AgentService>,
    poller: Poller,
    config: ExchangeConfig,
    events: Option<EventSink>,
    slot: ExchangeSlot,
}

impl CredentialExchange {
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

    // -----------------------------------------------------------------------
    // Issuer
    // -----------------------------------------------------------------------

    /// Publish a schema, then a credential definition over it.
    pub async fn publish_definition(&self, schema: &SchemaDefinition) -> Result<PublishedDefinition> {
        require(&schema.name, "schema name")?;
        require(&schema.version, "schema version")?;
        if schema.attributes.is_empty() {
            return Err(ExchangeError::Validation(
                "schema needs at least one attribute".into(),
            ));
        }
        for name in &schema.attributes {
            require(name, "schema attribute name")?;
        }

        let published = self
            .agent
            .publish_schema(schema)
            .await
            .map_err(|e| e.into_remote("publish-schema"))?;
        let definition = self
            .agent
            .publish_credential_definition(&published.schema_id)
            .await
            .map_err(|e| e.into_remote("publish-definition"))?;

        log::info!(
            "published schema {} with definition {}",
            published.schema_id,
            definition.definition_id
        );
        Ok(PublishedDefinition {
            schema_id: published.schema_id,
            definition_id: definition.definition_id,
        })
    }

    /// Offer a credential on `connection_id`.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty connection id, definition reference or
    /// attribute name; `DuplicateExchange` while another credential
    /// exchange is in progress; `Remote` if the agent refuses.
    pub async fn send_offer(
        &mut self,
        connection_id: &ExchangeId,
        definition_ref: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<SentOffer> {
        require(connection_id.as_str(), "connection id")?;
        require(definition_ref, "credential definition")?;
        for name in attributes.keys() {
            require(name, "attribute name")?;
        }
        self.slot.ensure_idle(KIND)?;

        let request = CredentialOfferRequest {
            connection_id: connection_id.clone(),
            definition_ref: definition_ref.to_string(),
            attributes,
        };
        let sent = self
            .agent
            .send_credential_offer(&request)
            .await
            .map_err(|e| e.into_remote("send-offer"))?;

        let payload = CredentialPayload {
            connection_id: Some(request.connection_id),
            definition_ref: Some(request.definition_ref),
            attributes: request.attributes,
            ..Default::default()
        };
        let record = ExchangeRecord::with_id(
            sent.exchange_id.clone(),
            ExchangeRole::Initiator,
            ExchangeState::Credential(CredentialState::OfferSent),
            ExchangePayload::Credential(payload),
        )?;
        self.slot.begin(record);
        log::info!("credential offer {} sent", sent.exchange_id);

        Ok(SentOffer {
            exchange_id: sent.exchange_id,
        })
    }

    // -----------------------------------------------------------------------
    // Holder
    // -----------------------------------------------------------------------

    /// Look once for an offer pending on `connection_id`.
    ///
    /// # Errors
    ///
    /// `AmbiguousState` if more than one offer is pending, `Poll` if the
    /// query fails.
    pub async fn discover_offer(
        &mut self,
        connection_id: &ExchangeId,
    ) -> Result<Option<DiscoveredOffer>> {
        require(connection_id.as_str(), "connection id")?;
        let mut offers = self
            .agent
            .credential_offers(connection_id)
            .await
            .map_err(AgentError::into_poll)?;

        let offer = match offers.len() {
            0 => return Ok(None),
            1 => offers.remove(0),
            count => return Err(ExchangeError::AmbiguousState { kind: KIND, count }),
        };
        let discovered = DiscoveredOffer {
            exchange_id: offer.exchange_id,
            attributes: offer.attributes,
        };
        self.track_offer(connection_id, &discovered)?;
        log::info!("credential offer {} discovered", discovered.exchange_id);
        Ok(Some(discovered))
    }

    /// Record a discovered offer unless it is already the current exchange.
    fn track_offer(&mut self, connection_id: &ExchangeId, offer: &DiscoveredOffer) -> Result<()> {
        if self.slot.matching(KIND, &offer.exchange_id).is_ok() {
            return Ok(());
        }
        self.slot.ensure_idle(KIND)?;
        let payload = CredentialPayload {
            connection_id: Some(connection_id.clone()),
            attributes: offer.attributes.clone(),
            ..Default::default()
        };
        let record = ExchangeRecord::with_id(
            offer.exchange_id.clone(),
            ExchangeRole::Responder,
            ExchangeState::Credential(CredentialState::OfferReceived),
            ExchangePayload::Credential(payload),
        )?;
        self.slot.begin(record);
        Ok(())
    }

    /// Accept the offer `exchange_id` with a freshly generated holder
    /// identifier.
    pub async fn accept_offer(&mut self, exchange_id: &ExchangeId) -> Result<AcceptedOffer> {
        require(exchange_id.as_str(), "exchange id")?;
        let cell = match self.slot.matching(KIND, exchange_id) {
            Ok(cell) => cell,
            Err(_) => {
                self.slot.ensure_idle(KIND)?;
                let record = ExchangeRecord::with_id(
                    exchange_id.clone(),
                    ExchangeRole::Responder,
                    ExchangeState::Credential(CredentialState::OfferReceived),
                    ExchangePayload::empty(KIND),
                )?;
                self.slot.begin(record)
            }
        };

        let holder_identifier = HolderIdentifier::generate(exchange_id);
        let acceptance = self
            .agent
            .accept_credential_offer(exchange_id, &holder_identifier)
            .await
            .map_err(|e| e.into_remote("accept-offer"))?;

        let payload = CredentialPayload {
            holder_identifier: Some(acceptance.holder_identifier.clone()),
            ..Default::default()
        };
        watch::lock_cell(&cell).apply(&Observation::new(
            ExchangeState::Credential(CredentialState::RequestSent),
            ExchangePayload::Credential(payload),
        ))?;
        log::info!("credential offer {exchange_id} accepted");

        Ok(AcceptedOffer {
            holder_identifier: acceptance.holder_identifier,
        })
    }

    // -----------------------------------------------------------------------
    // Both sides
    // -----------------------------------------------------------------------

    /// Poll the exchange until the credential is issued (issuer) or
    /// received (holder), then a bounded tail for the acknowledgement.
    pub fn await_issuance(&mut self, exchange_id: &ExchangeId) -> Result<ExchangeWatch> {
        require(exchange_id.as_str(), "exchange id")?;
        let cell = self.slot.matching(KIND, exchange_id)?;

        let agent = Arc::clone(&self.agent);
        let id = exchange_id.clone();
        let fetch = move || {
            let agent = Arc::clone(&agent);
            let id = id.clone();
            async move {
                let status = agent
                    .credential_exchange_state(&id)
                    .await
                    .map_err(AgentError::into_poll)?;
                let state = ExchangeState::parse(KIND, &status.state)?;
                let payload = CredentialPayload {
                    attributes: status.attributes,
                    credential_id: status.credential_id,
                    ..Default::default()
                };
                Ok(Observation::new(state, ExchangePayload::Credential(payload)))
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
