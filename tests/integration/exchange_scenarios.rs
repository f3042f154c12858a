//! Integration test: the handshake scenarios, one exchange kind at a time.
//!
//! Each scenario drives a single component against a scripted agent and
//! checks the exact polling behaviour the caller observes.

use std::collections::BTreeMap;
use std::sync::Arc;

use agentic_exchange::agent::{OfferSummary, ProofRequestSummary, ScriptStep};
use agentic_exchange::{
    ConnectionExchange, CredentialExchange, ExchangeConfig, ExchangeId, ExchangeKind,
    InMemoryAgent, Poller, PresentationExchange, PresentationResult, ProofConstraint, Verified,
};

fn config() -> ExchangeConfig {
    ExchangeConfig {
        poll_interval_ms: 5,
        ack_poll_limit: 2,
        ..Default::default()
    }
}

fn alice() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("name".to_string(), "Alice".to_string()),
        ("expiry".to_string(), "2030".to_string()),
    ])
}

#[tokio::test]
async fn connection_resolves_after_second_poll() {
    let (inviter, invitee) = InMemoryAgent::pair();
    let mut org_a = ConnectionExchange::new(inviter, Poller::new(), &config());
    let mut org_b = ConnectionExchange::new(invitee.clone(), Poller::new(), &config());

    let created = org_a.create_invitation("Org-A").await.unwrap();
    assert_eq!(created.id.as_str(), "c1");

    invitee.script_states(ExchangeKind::Connection, "c1", &["request", "active"]);
    let accepted = org_b
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();
    assert_eq!(accepted.id.as_str(), "c1");
    assert_eq!(accepted.their_label.as_deref(), Some("Org-A"));

    let watch = org_b.await_active(&accepted.id).unwrap();
    let active = watch.ready().await.unwrap();
    assert_eq!(active.state().as_str(), "active");
    assert_eq!(active.poll_count, 2);
    assert!(!org_b.current().unwrap().state().is_abandoned());
}

#[tokio::test]
async fn offer_is_discovered_once_the_agent_reports_it() {
    let (issuer_agent, holder_agent) = InMemoryAgent::pair();
    let mut org_a = ConnectionExchange::new(issuer_agent.clone(), Poller::new(), &config());
    let created = org_a.create_invitation("Org-A").await.unwrap();
    let c1 = created.id;

    let mut issuer = CredentialExchange::new(issuer_agent, Poller::new(), &config());
    let mut holder = CredentialExchange::new(holder_agent.clone(), Poller::new(), &config());

    assert!(holder.discover_offer(&c1).await.unwrap().is_none());
    assert!(holder.current().is_none());

    let sent = issuer.send_offer(&c1, "def1", alice()).await.unwrap();
    assert_eq!(sent.exchange_id.as_str(), "e1");

    let offer = holder
        .discover_offer(&c1)
        .await
        .unwrap()
        .expect("offer should be visible now");
    assert_eq!(offer.exchange_id.as_str(), "e1");
    assert_eq!(offer.attributes, alice());
    assert_eq!(
        holder.current().unwrap().state().as_str(),
        "offer-received"
    );

    let first = holder.accept_offer(&offer.exchange_id).await.unwrap();

    // A second offer on the same connection, taken by a fresh component.
    holder_agent.inject_offer(
        "c1",
        OfferSummary {
            exchange_id: ExchangeId::from("e9"),
            attributes: alice(),
        },
    );
    let mut second_holder = CredentialExchange::new(holder_agent, Poller::new(), &config());
    let again = second_holder.discover_offer(&c1).await.unwrap().unwrap();
    assert_eq!(again.exchange_id.as_str(), "e9");
    let second = second_holder.accept_offer(&again.exchange_id).await.unwrap();

    assert_ne!(first.holder_identifier, second.holder_identifier);
}

#[tokio::test]
async fn prover_sees_verified_only_at_done() {
    let prover_agent = Arc::new(InMemoryAgent::new().counterpart());
    prover_agent.inject_proof_request(
        "c1",
        ProofRequestSummary {
            exchange_id: ExchangeId::from("p1"),
        },
    );
    let mut prover = PresentationExchange::new(prover_agent.clone(), Poller::new(), &config());

    let found = prover
        .discover_request(&ExchangeId::from("c1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        prover.current().unwrap().state().as_str(),
        "request-received"
    );
    prover
        .submit_presentation(&found.exchange_id, "cred-e1")
        .await
        .unwrap();

    prover_agent.script_steps(
        ExchangeKind::Presentation,
        "p1",
        vec![
            ScriptStep::state("presentation-sent").with_verified(false),
            ScriptStep::state("presentation-sent"),
            ScriptStep::state("done")
                .with_verified(true)
                .with_revealed("name", "Alice"),
        ],
    );
    let mut watch = prover.await_verification(&found.exchange_id).unwrap();

    let mut states = Vec::new();
    while let Some(record) = watch.next().await {
        let payload = record.presentation().unwrap().clone();
        if record.is_terminal() {
            assert_eq!(payload.verified, Verified::True);
            assert_eq!(payload.revealed_attributes["name"], "Alice");
        } else {
            assert_eq!(payload.verified, Verified::Unknown);
            assert!(payload.revealed_attributes.is_empty());
        }
        states.push(record.state().as_str());
    }
    assert_eq!(states, ["presentation-sent", "presentation-sent", "done"]);

    let last = watch.finished().await.completed().unwrap();
    let result = PresentationResult::from_record(&last).unwrap();
    assert_eq!(result.verified, Verified::True);
}

#[tokio::test]
async fn verifier_reports_failed_verification() {
    let (verifier_agent, _) = InMemoryAgent::pair();
    let mut org_a = ConnectionExchange::new(verifier_agent.clone(), Poller::new(), &config());
    let c1 = org_a.create_invitation("Org-A").await.unwrap().id;

    let mut verifier = PresentationExchange::new(verifier_agent.clone(), Poller::new(), &config());
    let sent = verifier
        .send_request(&c1, ProofConstraint(serde_json::json!({"attr": "name"})))
        .await
        .unwrap();
    verifier_agent.script_steps(
        ExchangeKind::Presentation,
        sent.exchange_id.as_str(),
        vec![
            ScriptStep::state("presentation-received"),
            ScriptStep::state("verified")
                .with_verified(false)
                .with_revealed("name", "Mallory"),
        ],
    );

    let watch = verifier.await_verification(&sent.exchange_id).unwrap();
    let last = watch.finished().await.completed().unwrap();
    let result = PresentationResult::from_record(&last).unwrap();
    assert_eq!(result.verified, Verified::False);
    assert_eq!(result.revealed_attributes["name"], "Mallory");
}

#[tokio::test]
async fn backward_state_is_flagged_and_ignored() {
    let (inviter, _) = InMemoryAgent::pair();
    let poller = Poller::new();
    let mut diagnostics = poller.diagnostics();
    let mut org_a = ConnectionExchange::new(inviter.clone(), poller, &config());
    let created = org_a.create_invitation("Org-A").await.unwrap();

    inviter.script_states(ExchangeKind::Connection, "c1", &["response", "request"]);
    let watch = org_a.await_active(&created.id).unwrap();
    let ready = watch.ready().await.unwrap();
    assert_eq!(ready.state().as_str(), "response");

    let diagnostic = diagnostics.recv().await.unwrap();
    assert_eq!(diagnostic.key, "connection:c1");
    assert!(diagnostic.message.contains("backward"));
    assert_eq!(watch.latest().state().as_str(), "response");

    watch.cancel();
    assert!(watch.finished().await.is_cancelled());
}
