//! Stress test: many issue-and-present flows running at once.
//!
//! Flows are independent: each gets its own coordinators, polls and
//! records, even when their agents share one ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentic_exchange::{
    ExchangeConfig, FlowCoordinator, FlowSide, FlowVariant, InMemoryAgent, PresentationResult,
    ProofConstraint, Verified,
};
use tokio::task::JoinSet;

fn config() -> ExchangeConfig {
    ExchangeConfig {
        poll_interval_ms: 2,
        discovery_interval_ms: 2,
        ack_poll_limit: 2,
        ..Default::default()
    }
}

async fn run_flow(
    issuer_agent: Arc<InMemoryAgent>,
    holder_agent: Arc<InMemoryAgent>,
    n: usize,
) -> PresentationResult {
    let variant = FlowVariant::IssueAndPresent;
    let mut issuer = FlowCoordinator::new(FlowSide::Issuer, variant, issuer_agent, config());
    let mut holder = FlowCoordinator::new(FlowSide::Holder, variant, holder_agent, config());

    let created = issuer
        .create_invitation(&format!("issuer-{n}"))
        .await
        .expect("invitation should succeed");
    holder
        .accept_invitation(&format!("holder-{n}"), &created.invitation)
        .await
        .expect("accept should succeed");
    tokio::try_join!(issuer.connection_ready(), holder.connection_ready())
        .expect("connection should become ready");

    let attributes = BTreeMap::from([("name".to_string(), format!("holder-{n}"))]);
    issuer
        .offer_credential("def1", attributes)
        .await
        .expect("offer should succeed");
    let offer = holder.wait_for_offer().await.expect("offer should appear");
    holder
        .accept_credential(&offer.exchange_id)
        .await
        .expect("accept should succeed");
    tokio::try_join!(issuer.credential_ready(), holder.credential_ready())
        .expect("credential should become ready");

    issuer
        .request_presentation(ProofConstraint(serde_json::json!({"attr": "name"})))
        .await
        .expect("proof request should succeed");
    let request = holder.wait_for_request().await.expect("request should appear");
    holder
        .present_credential(&request.exchange_id)
        .await
        .expect("presentation should succeed");
    let result = issuer
        .presentation_result()
        .await
        .expect("verification should finish");

    issuer.teardown();
    holder.teardown();
    result
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_20_independent_flows() {
    let mut flows = JoinSet::new();
    for n in 0..20 {
        let (issuer_agent, holder_agent) = InMemoryAgent::pair();
        flows.spawn(async move { (n, run_flow(issuer_agent, holder_agent, n).await) });
    }

    let mut finished = 0;
    while let Some(joined) = flows.join_next().await {
        let (n, result) = joined.expect("flow task should not panic");
        assert_eq!(result.verified, Verified::True);
        assert_eq!(result.revealed_attributes["name"], format!("holder-{n}"));
        finished += 1;
    }
    assert_eq!(finished, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_10_flows_sharing_one_agent() {
    let inviter = InMemoryAgent::new();
    let invitee = inviter.counterpart();
    let issuer_agent = Arc::new(inviter);
    let holder_agent = Arc::new(invitee);

    let mut flows = JoinSet::new();
    for n in 0..10 {
        let issuer_agent = Arc::clone(&issuer_agent);
        let holder_agent = Arc::clone(&holder_agent);
        flows.spawn(async move { (n, run_flow(issuer_agent, holder_agent, n).await) });
    }

    while let Some(joined) = flows.join_next().await {
        let (n, result) = joined.expect("flow task should not panic");
        // Each holder presents its own credential, never a neighbour's.
        assert_eq!(result.revealed_attributes["name"], format!("holder-{n}"));
        assert_eq!(result.verified, Verified::True);
    }
    assert!(issuer_agent.query_count() > 0);
}
