//! Flow coordinator — sequences connection, credential and presentation.
//!
//! A flow is one side's view of a multi-stage handshake. The issuer side
//! initiates every stage (invitation, offer, proof request); the holder
//! side responds. Each stage may only start once the previous one has been
//! *observed* ready: the exchange components publish [`ExchangeEvent`]s,
//! the coordinator folds them into a readiness table, and every guard reads
//! that table and nothing else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use crate::agent::AgentService;
use crate::config::ExchangeConfig;
use crate::connection::{AcceptedInvitation, ConnectionExchange, CreatedInvitation};
use crate::credential::{AcceptedOffer, CredentialExchange, DiscoveredOffer, SentOffer};
use crate::error::{ExchangeError, Result};
use crate::ids::ExchangeId;
use crate::invitation::InvitationArtifact;
use crate::poller::{PollDiagnostic, PollOutcome, Poller};
use crate::presentation::{
    DiscoveredRequest, PresentationExchange, PresentationResult, SentProofRequest,
    SubmittedPresentation,
};
use crate::state::{ExchangeKind, ExchangeRecord, ExchangeRole, ProofConstraint};
use crate::watch::{ExchangeEvent, ExchangeWatch};

/// A stage of a flow; one per exchange kind.
pub type FlowStage = ExchangeKind;

/// Which party this coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowSide {
    /// Inviter, issuer and verifier.
    Issuer,
    /// Invitee, holder and prover.
    Holder,
}

impl FlowSide {
    pub fn role(&self) -> ExchangeRole {
        match self {
            Self::Issuer => ExchangeRole::Initiator,
            Self::Holder => ExchangeRole::Responder,
        }
    }
}

impl std::fmt::Display for FlowSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Issuer => "issuer",
            Self::Holder => "holder",
        })
    }
}

/// Which stages a flow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowVariant {
    Connect,
    Issue,
    IssueAndPresent,
}

impl FlowVariant {
    pub fn stages(&self) -> &'static [FlowStage] {
        match self {
            Self::Connect => &[ExchangeKind::Connection],
            Self::Issue => &[ExchangeKind::Connection, ExchangeKind::Credential],
            Self::IssueAndPresent => &ExchangeKind::ALL,
        }
    }

    pub fn includes(&self, stage: FlowStage) -> bool {
        self.stages().contains(&stage)
    }
}

/// What the coordinator has observed of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Started, not yet ready.
    InProgress,
    Ready,
    Failed,
}

/// Cancels a flow's discovery loops and polls from another task.
#[derive(Debug, Clone)]
pub struct FlowCancel {
    signal: Arc<watch::Sender<bool>>,
    poller: Poller,
}

impl FlowCancel {
    pub fn cancel(&self) {
        self.signal.send_replace(true);
        self.poller.shutdown();
    }
}

/// Sequences the three exchanges of one flow for one side.
pub struct FlowCoordinator {
    side: FlowSide,
    variant: FlowVariant,
    agent: Arc<dyn AgentService>,
    config: ExchangeConfig,
    poller: Poller,
    connection: ConnectionExchange,
    credential: CredentialExchange,
    presentation: PresentationExchange,
    events: mpsc::UnboundedReceiver<ExchangeEvent>,
    stages: BTreeMap<FlowStage, StageStatus>,
    watches: HashMap<FlowStage, ExchangeWatch>,
    cancel: Arc<watch::Sender<bool>>,
}

impl FlowCoordinator {
    pub fn new(
        side: FlowSide,
        variant: FlowVariant,
        agent: Arc<dyn AgentService>,
        config: ExchangeConfig,
    ) -> Self {
        let poller = Poller::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (cancel, _) = watch::channel(false);
        Self {
            connection: ConnectionExchange::new(Arc::clone(&agent), poller.clone(), &config)
                .with_events(events_tx.clone()),
            credential: CredentialExchange::new(Arc::clone(&agent), poller.clone(), &config)
                .with_events(events_tx.clone()),
            presentation: PresentationExchange::new(Arc::clone(&agent), poller.clone(), &config)
                .with_events(events_tx),
            side,
            variant,
            agent,
            config,
            poller,
            events,
            stages: BTreeMap::new(),
            watches: HashMap::new(),
            cancel: Arc::new(cancel),
        }
    }

    pub fn side(&self) -> FlowSide {
        self.side
    }

    pub fn variant(&self) -> FlowVariant {
        self.variant
    }

    /// Query failures of this flow's polls.
    pub fn diagnostics(&self) -> broadcast::Receiver<PollDiagnostic> {
        self.poller.diagnostics()
    }

    pub fn cancel_handle(&self) -> FlowCancel {
        FlowCancel {
            signal: Arc::clone(&self.cancel),
            poller: self.poller.clone(),
        }
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Create an invitation and start polling the connection.
    pub async fn create_invitation(&mut self, alias: &str) -> Result<CreatedInvitation> {
        self.guard(ExchangeKind::Connection, "create-invitation", FlowSide::Issuer)?;
        let created = self.connection.create_invitation(alias).await?;
        let watch = self.connection.await_active(&created.id)?;
        self.track(ExchangeKind::Connection, watch);
        Ok(created)
    }

    /// Accept an invitation and start polling the connection.
    pub async fn accept_invitation(
        &mut self,
        alias: &str,
        invitation: &InvitationArtifact,
    ) -> Result<AcceptedInvitation> {
        self.guard(ExchangeKind::Connection, "accept-invitation", FlowSide::Holder)?;
        let accepted = self.connection.accept_invitation(alias, invitation).await?;
        let watch = self.connection.await_active(&accepted.id)?;
        self.track(ExchangeKind::Connection, watch);
        Ok(accepted)
    }

    /// Wait until the connection is ready for the credential stage.
    pub async fn connection_ready(&mut self) -> Result<ExchangeRecord> {
        self.stage_ready(ExchangeKind::Connection).await
    }

    // ── Credential ───────────────────────────────────────────────────────────

    /// Offer a credential over the ready connection.
    pub async fn offer_credential(
        &mut self,
        definition_ref: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<SentOffer> {
        self.guard(ExchangeKind::Credential, "offer-credential", FlowSide::Issuer)?;
        let connection_id = self.connection_id()?;
        let sent = self
            .credential
            .send_offer(&connection_id, definition_ref, attributes)
            .await?;
        let watch = self.credential.await_issuance(&sent.exchange_id)?;
        self.track(ExchangeKind::Credential, watch);
        Ok(sent)
    }

    /// Poll for the issuer's offer until one shows up or the flow is
    /// cancelled.
    pub async fn wait_for_offer(&mut self) -> Result<DiscoveredOffer> {
        self.guard(ExchangeKind::Credential, "wait-for-offer", FlowSide::Holder)?;
        let connection_id = self.connection_id()?;
        let mut cancel = self.cancel.subscribe();
        let interval = self.config.discovery_interval();
        loop {
            match self.credential.discover_offer(&connection_id).await {
                Ok(Some(offer)) => return Ok(offer),
                Ok(None) => log::debug!("no credential offer on {connection_id} yet"),
                Err(err) if err.is_transient() => log::warn!("offer discovery: {err}"),
                Err(err) => return Err(err),
            }
            pause(&mut cancel, interval).await?;
        }
    }

    /// Accept the offer `exchange_id` and start polling the issuance.
    pub async fn accept_credential(&mut self, exchange_id: &ExchangeId) -> Result<AcceptedOffer> {
        self.guard(ExchangeKind::Credential, "accept-credential", FlowSide::Holder)?;
        let accepted = self.credential.accept_offer(exchange_id).await?;
        let watch = self.credential.await_issuance(exchange_id)?;
        self.track(ExchangeKind::Credential, watch);
        Ok(accepted)
    }

    /// Wait until the credential is issued (issuer) or received (holder).
    pub async fn credential_ready(&mut self) -> Result<ExchangeRecord> {
        self.stage_ready(ExchangeKind::Credential).await
    }

    // ── Presentation ─────────────────────────────────────────────────────────

    /// Request a presentation of the issued credential.
    pub async fn request_presentation(
        &mut self,
        constraint: ProofConstraint,
    ) -> Result<SentProofRequest> {
        self.guard(
            ExchangeKind::Presentation,
            "request-presentation",
            FlowSide::Issuer,
        )?;
        let connection_id = self.connection_id()?;
        let sent = self
            .presentation
            .send_request(&connection_id, constraint)
            .await?;
        let watch = self.presentation.await_verification(&sent.exchange_id)?;
        self.track(ExchangeKind::Presentation, watch);
        Ok(sent)
    }

    /// Poll for the verifier's request until one shows up or the flow is
    /// cancelled.
    pub async fn wait_for_request(&mut self) -> Result<DiscoveredRequest> {
        self.guard(
            ExchangeKind::Presentation,
            "wait-for-request",
            FlowSide::Holder,
        )?;
        let connection_id = self.connection_id()?;
        let mut cancel = self.cancel.subscribe();
        let interval = self.config.discovery_interval();
        loop {
            match self.presentation.discover_request(&connection_id).await {
                Ok(Some(request)) => return Ok(request),
                Ok(None) => log::debug!("no proof request on {connection_id} yet"),
                Err(err) if err.is_transient() => log::warn!("request discovery: {err}"),
                Err(err) => return Err(err),
            }
            pause(&mut cancel, interval).await?;
        }
    }

    /// Present the received credential for the request `exchange_id`.
    pub async fn present_credential(
        &mut self,
        exchange_id: &ExchangeId,
    ) -> Result<SubmittedPresentation> {
        self.guard(
            ExchangeKind::Presentation,
            "present-credential",
            FlowSide::Holder,
        )?;
        let credential_id = self
            .credential
            .current()
            .and_then(|r| r.credential().and_then(|c| c.credential_id.clone()))
            .ok_or_else(|| {
                ExchangeError::Validation("received credential has no credential id".into())
            })?;
        let submitted = self
            .presentation
            .submit_presentation(exchange_id, &credential_id)
            .await?;
        let watch = self.presentation.await_verification(exchange_id)?;
        self.track(ExchangeKind::Presentation, watch);
        Ok(submitted)
    }

    /// Wait for the presentation poll to end and read its result.
    pub async fn presentation_result(&mut self) -> Result<PresentationResult> {
        if !self.variant.includes(ExchangeKind::Presentation) {
            return Err(ExchangeError::StageNotInFlow(ExchangeKind::Presentation));
        }
        let outcome = self
            .watches
            .get(&ExchangeKind::Presentation)
            .ok_or(ExchangeError::NotStarted(ExchangeKind::Presentation))?
            .finished()
            .await;
        self.drain_events();
        match outcome {
            PollOutcome::Completed(record) => PresentationResult::from_record(&record),
            PollOutcome::Cancelled => Err(ExchangeError::Cancelled),
        }
    }

    // ── Readiness and events ─────────────────────────────────────────────────

    /// Whether `stage` has been observed ready.
    pub fn is_ready(&mut self, stage: FlowStage) -> bool {
        self.drain_events();
        self.stages.get(&stage) == Some(&StageStatus::Ready)
    }

    pub fn status(&mut self, stage: FlowStage) -> Option<StageStatus> {
        self.drain_events();
        self.stages.get(&stage).copied()
    }

    /// The next event from any stage, folded into the readiness table.
    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        let event = self.events.recv().await?;
        self.record_event(&event);
        Some(event)
    }

    /// Snapshot of a stage's exchange.
    pub fn record(&self, stage: FlowStage) -> Option<ExchangeRecord> {
        match stage {
            ExchangeKind::Connection => self.connection.current(),
            ExchangeKind::Credential => self.credential.current(),
            ExchangeKind::Presentation => self.presentation.current(),
        }
    }

    /// Cancel every poll and discovery loop, then discard every record.
    ///
    /// The coordinator starts over as a fresh flow afterwards.
    pub fn teardown(&mut self) {
        self.cancel.send_replace(true);
        for watch in self.watches.values() {
            watch.cancel();
        }
        self.poller.shutdown();
        self.watches.clear();

        self.presentation.reset();
        self.credential.reset();
        self.connection.reset();
        self.stages.clear();
        while self.events.try_recv().is_ok() {}

        // A fresh flow instance shares nothing with the old one.
        let fresh = Self::new(
            self.side,
            self.variant,
            Arc::clone(&self.agent),
            self.config.clone(),
        );
        *self = fresh;
        log::info!("{} flow torn down", self.side);
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn guard(&mut self, stage: FlowStage, operation: &'static str, side: FlowSide) -> Result<()> {
        if !self.variant.includes(stage) {
            return Err(ExchangeError::StageNotInFlow(stage));
        }
        if self.side != side {
            return Err(ExchangeError::WrongRole {
                operation,
                role: self.side.role(),
            });
        }
        if let Some(prerequisite) = stage.prerequisite() {
            if !self.is_ready(prerequisite) {
                return Err(ExchangeError::StageNotReady {
                    stage,
                    prerequisite,
                });
            }
        }
        Ok(())
    }

    fn connection_id(&self) -> Result<ExchangeId> {
        self.connection
            .current()
            .and_then(|r| r.id().cloned())
            .ok_or(ExchangeError::NotStarted(ExchangeKind::Connection))
    }

    fn track(&mut self, stage: FlowStage, watch: ExchangeWatch) {
        self.stages.insert(stage, StageStatus::InProgress);
        if let Some(previous) = self.watches.insert(stage, watch) {
            previous.cancel();
        }
        log::info!("{} flow: {stage} stage started", self.side);
    }

    async fn stage_ready(&mut self, stage: FlowStage) -> Result<ExchangeRecord> {
        if !self.variant.includes(stage) {
            return Err(ExchangeError::StageNotInFlow(stage));
        }
        let ready = self
            .watches
            .get(&stage)
            .ok_or(ExchangeError::NotStarted(stage))?
            .ready()
            .await;
        self.drain_events();
        ready
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.record_event(&event);
        }
    }

    fn record_event(&mut self, event: &ExchangeEvent) {
        let stage = event.kind();
        let status = self.stages.entry(stage).or_insert(StageStatus::InProgress);
        match event {
            ExchangeEvent::Ready(_) => *status = StageStatus::Ready,
            ExchangeEvent::Failed(_) => *status = StageStatus::Failed,
            ExchangeEvent::Updated(_) => {}
        }
    }
}

/// Sleep for `interval` unless the flow is cancelled first.
async fn pause(cancel: &mut watch::Receiver<bool>, interval: Duration) -> Result<()> {
    if *cancel.borrow() {
        return Err(ExchangeError::Cancelled);
    }
    tokio::select! {
        _ = cancel.changed() => Err(ExchangeError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}
