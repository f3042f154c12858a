//! Resilience tests: agent outages, rejected commands, abandoned exchanges,
//! and garbage from the agent.
//!
//! Query failures are retried silently; command failures surface at once;
//! nothing a misbehaving agent reports corrupts a committed record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentic_exchange::{
    ConnectionExchange, ExchangeConfig, ExchangeError, ExchangeKind, FlowCoordinator, FlowSide,
    FlowVariant, HttpAgentService, InMemoryAgent, Poller, StageStatus,
};

fn config() -> ExchangeConfig {
    ExchangeConfig {
        poll_interval_ms: 2,
        discovery_interval_ms: 2,
        ack_poll_limit: 2,
        ..Default::default()
    }
}

fn attributes() -> BTreeMap<String, String> {
    BTreeMap::from([("name".to_string(), "Alice".to_string())])
}

async fn connected_flows(
    variant: FlowVariant,
) -> (FlowCoordinator, FlowCoordinator, Arc<InMemoryAgent>) {
    let (a, b) = InMemoryAgent::pair();
    let mut issuer = FlowCoordinator::new(FlowSide::Issuer, variant, a.clone(), config());
    let mut holder = FlowCoordinator::new(FlowSide::Holder, variant, b, config());
    let created = issuer.create_invitation("Org-A").await.unwrap();
    holder
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();
    tokio::try_join!(issuer.connection_ready(), holder.connection_ready()).unwrap();
    (issuer, holder, a)
}

#[tokio::test]
async fn outage_during_handshake_is_retried() {
    let (inviter, invitee) = InMemoryAgent::pair();
    let poller = Poller::new();
    let mut diagnostics = poller.diagnostics();
    let mut org_a = ConnectionExchange::new(inviter.clone(), poller, &config());
    let mut org_b = ConnectionExchange::new(invitee, Poller::new(), &config());

    let created = org_a.create_invitation("Org-A").await.unwrap();
    org_b
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();

    // Only the inviter polls, so every injected failure lands on its watch.
    inviter.fail_next_queries(6);
    let watch = org_a.await_active(&created.id).unwrap();
    let ready = watch.ready().await.unwrap();
    assert_eq!(ready.state().as_str(), "response");

    for _ in 0..6 {
        let diagnostic = tokio::time::timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .expect("every failed query should be reported")
            .unwrap();
        assert_eq!(diagnostic.key, "connection:c1");
        assert!(diagnostic.message.contains("unavailable"));
    }
}

#[tokio::test]
async fn discovery_rides_out_an_outage() {
    let (mut issuer, mut holder, agent) = connected_flows(FlowVariant::Issue).await;
    agent.fail_next_queries(5);
    issuer.offer_credential("def1", attributes()).await.unwrap();
    let offer = holder.wait_for_offer().await.unwrap();
    assert_eq!(offer.exchange_id.as_str(), "e1");
}

#[tokio::test]
async fn rejected_command_surfaces_and_is_not_retried() {
    let (mut issuer, _holder, agent) = connected_flows(FlowVariant::Issue).await;
    agent.reject_next_command("ledger offline");

    let err = issuer
        .offer_credential("def1", attributes())
        .await
        .unwrap_err();
    match err {
        ExchangeError::Remote {
            operation,
            diagnostic,
        } => {
            assert_eq!(operation, "send-offer");
            assert!(diagnostic.contains("ledger offline"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(issuer.record(ExchangeKind::Credential).is_none());
    assert_eq!(issuer.status(ExchangeKind::Credential), None);

    // The caller decides to try again; nothing was left half-started.
    let sent = issuer.offer_credential("def1", attributes()).await.unwrap();
    assert_eq!(sent.exchange_id.as_str(), "e1");
}

#[tokio::test]
async fn abandoned_credential_fails_the_stage() {
    let (mut issuer, mut holder, agent) = connected_flows(FlowVariant::IssueAndPresent).await;
    issuer.offer_credential("def1", attributes()).await.unwrap();
    let offer = holder.wait_for_offer().await.unwrap();

    agent.counterpart().script_states(
        ExchangeKind::Credential,
        offer.exchange_id.as_str(),
        &["request-sent", "abandoned"],
    );
    holder.accept_credential(&offer.exchange_id).await.unwrap();

    let err = holder.credential_ready().await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Abandoned {
            kind: ExchangeKind::Credential,
            ..
        }
    ));
    assert_eq!(
        holder.status(ExchangeKind::Credential),
        Some(StageStatus::Failed)
    );

    // A failed credential never unlocks the presentation stage.
    let err = holder.wait_for_request().await.unwrap_err();
    assert!(matches!(err, ExchangeError::StageNotReady { .. }));
}

#[tokio::test]
async fn unknown_state_is_reported_and_ignored() {
    let agent = Arc::new(InMemoryAgent::new());
    let poller = Poller::new();
    let mut diagnostics = poller.diagnostics();
    let mut org_a = ConnectionExchange::new(agent.clone(), poller, &config());
    let created = org_a.create_invitation("Org-A").await.unwrap();

    agent.script_states(ExchangeKind::Connection, "c1", &["completed-ish"]);
    let watch = org_a.await_active(&created.id).unwrap();

    let diagnostic = diagnostics.recv().await.unwrap();
    assert!(diagnostic.message.contains("completed-ish"));
    assert_eq!(watch.latest().state().as_str(), "invitation");
    assert!(!watch.is_ready());
    watch.cancel();
}

#[tokio::test]
async fn unreachable_agent_rejects_commands() {
    let agent = HttpAgentService::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let mut connection = ConnectionExchange::new(Arc::new(agent), Poller::new(), &config());

    let err = connection.create_invitation("Org-A").await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::Remote {
            operation: "create-invitation",
            ..
        }
    ));
    assert!(connection.current().is_none());
}
