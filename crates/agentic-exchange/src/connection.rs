//! Connection exchange — invitation, acceptance, handshake polling.
//!
//! Initiator: create an invitation, then poll until the invitee's request
//! has been answered (`response`) and the connection goes `active`.
//! Responder: accept an invitation (which sends the request), then poll
//! until `active`.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentError, AgentService};
use crate::config::ExchangeConfig;
use crate::error::{require, Result};
use crate::ids::ExchangeId;
use crate::invitation::InvitationArtifact;
use crate::poller::Poller;
use crate::state::{
    ConnectionPayload, ConnectionState, ExchangeKind, ExchangePayload, ExchangeRecord,
    ExchangeRole, ExchangeState, Observation,
};
use crate::watch::{self, EventSink, ExchangeSlot, ExchangeWatch, WatchOptions};

/// A freshly created invitation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInvitation {
    pub id: ExchangeId,
    pub invitation: InvitationArtifact,
}

/// An accepted invitation; the request has been sent.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedInvitation {
    pub id: ExchangeId,
    /// Label the inviter put in the invitation, if any.
    pub their_label: Option<String>,
}

/// Drives one connection at a time against an agent.
pub struct ConnectionExchange {
    agent: Arc<dyn AgentService>,
    poller: Poller,
    interval: Duration,
    events: Option<EventSink>,
    slot: ExchangeSlot,
}

impl ConnectionExchange {
    pub fn new(agent: Arc<dyn AgentService>, poller: Poller, config: &ExchangeConfig) -> Self {
        Self {
            agent,
            poller,
            interval: config.poll_interval(),
            events: None,
            slot: ExchangeSlot::default(),
        }
    }

    /// Publish progress of every poll started from here on.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Create an invitation for a new connection (initiator side).
    ///
    /// # Errors
    ///
    /// `Validation` for a blank alias, `DuplicateExchange` while another
    /// connection is in progress, `Remote` if the agent refuses.
    pub async fn create_invitation(&mut self, alias: &str) -> Result<CreatedInvitation> {
        require(alias, "alias")?;
        self.slot.ensure_idle(ExchangeKind::Connection)?;

        let created = self
            .agent
            .create_invitation(alias.trim())
            .await
            .map_err(|e| e.into_remote("create-invitation"))?;

        let payload = ConnectionPayload {
            alias: Some(alias.trim().to_string()),
            invitation: Some(created.invitation.clone()),
            their_label: None,
        };
        let record = ExchangeRecord::with_id(
            created.connection_id.clone(),
            ExchangeRole::Initiator,
            ExchangeState::Connection(ConnectionState::Invitation),
            ExchangePayload::Connection(payload),
        )?;
        self.slot.begin(record);
        log::info!("connection {} invitation created", created.connection_id);

        Ok(CreatedInvitation {
            id: created.connection_id,
            invitation: created.invitation,
        })
    }

    /// Accept an invitation, which sends the connection request (responder
    /// side).
    ///
    /// # Errors
    ///
    /// `Validation` for a blank alias or an undecodable artifact,
    /// `DuplicateExchange` while another connection is in progress, `Remote`
    /// if the agent refuses.
    pub async fn accept_invitation(
        &mut self,
        alias: &str,
        invitation: &InvitationArtifact,
    ) -> Result<AcceptedInvitation> {
        require(alias, "alias")?;
        let decoded = invitation.decode()?;
        self.slot.ensure_idle(ExchangeKind::Connection)?;

        let accepted = self
            .agent
            .accept_invitation(alias.trim(), invitation)
            .await
            .map_err(|e| e.into_remote("accept-invitation"))?;

        let payload = ConnectionPayload {
            alias: Some(alias.trim().to_string()),
            invitation: Some(invitation.clone()),
            their_label: decoded.label.clone(),
        };
        let record = ExchangeRecord::with_id(
            accepted.connection_id.clone(),
            ExchangeRole::Responder,
            ExchangeState::Connection(ConnectionState::Request),
            ExchangePayload::Connection(payload),
        )?;
        self.slot.begin(record);
        log::info!("connection {} request sent", accepted.connection_id);

        Ok(AcceptedInvitation {
            id: accepted.connection_id,
            their_label: decoded.label,
        })
    }

    /// Poll the connection until it is active (or abandoned).
    ///
    /// The watch is ready at `response` for the initiator and at `active`
    /// for the responder.
    pub fn await_active(&mut self, id: &ExchangeId) -> Result<ExchangeWatch> {
        require(id.as_str(), "connection id")?;
        let cell = self.slot.matching(ExchangeKind::Connection, id)?;

        let agent = Arc::clone(&self.agent);
        let id = id.clone();
        let fetch = move || {
            let agent = Arc::clone(&agent);
            let id = id.clone();
            async move {
                let status = agent
                    .connection_state(&id)
                    .await
                    .map_err(AgentError::into_poll)?;
                let state = ExchangeState::parse(ExchangeKind::Connection, &status.state)?;
                let payload = ConnectionPayload {
                    their_label: status.their_label,
                    ..Default::default()
                };
                Ok(Observation::new(state, ExchangePayload::Connection(payload)))
            }
        };

        let watch = watch::spawn(
            &self.poller,
            cell,
            fetch,
            WatchOptions {
                interval: self.interval,
                tail_limit: None,
                events: self.events.clone(),
            },
        )?;
        self.slot.set_poll(watch.handle());
        Ok(watch)
    }

    /// Snapshot of the current connection, if any.
    pub fn current(&self) -> Option<ExchangeRecord> {
        self.slot.current()
    }

    /// Cancel any poll, then forget the connection.
    pub fn reset(&mut self) {
        self.slot.reset();
    }
}
