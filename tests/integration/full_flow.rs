//! Integration test: complete issue-and-present flow for both sides.
//!
//! Exercises connection → credential → presentation through two
//! `FlowCoordinator`s sharing a simulated agent ledger.

use std::collections::BTreeMap;

use agentic_exchange::{
    CredentialExchange, ExchangeConfig, ExchangeError, ExchangeEvent, ExchangeKind, FlowCoordinator,
    FlowSide, FlowVariant, InMemoryAgent, Poller, ProofConstraint, SchemaDefinition, StageStatus,
    Verified,
};

fn config() -> ExchangeConfig {
    ExchangeConfig {
        poll_interval_ms: 5,
        discovery_interval_ms: 5,
        ack_poll_limit: 3,
        ..Default::default()
    }
}

fn coordinators(variant: FlowVariant) -> (FlowCoordinator, FlowCoordinator, InMemoryAgent) {
    let (a, b) = InMemoryAgent::pair();
    let handle = (*a).clone();
    (
        FlowCoordinator::new(FlowSide::Issuer, variant, a, config()),
        FlowCoordinator::new(FlowSide::Holder, variant, b, config()),
        handle,
    )
}

fn employee_attributes() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("name".to_string(), "Alice".to_string()),
        ("expiry".to_string(), "2030".to_string()),
    ])
}

#[tokio::test]
async fn full_issue_and_present_flow() {
    let (mut issuer, mut holder, agent) = coordinators(FlowVariant::IssueAndPresent);

    // Issuer setup
    let setup = CredentialExchange::new(std::sync::Arc::new(agent), Poller::new(), &config());
    let published = setup
        .publish_definition(&SchemaDefinition {
            name: "employee".into(),
            version: "1.0".into(),
            attributes: vec!["name".into(), "expiry".into()],
        })
        .await
        .expect("publish should succeed");
    assert!(published.definition_id.contains("employee"));

    // Connection
    let created = issuer
        .create_invitation("Org-A")
        .await
        .expect("invitation should succeed");
    let accepted = holder
        .accept_invitation("Org-B", &created.invitation)
        .await
        .expect("accept should succeed");
    assert_eq!(created.id, accepted.id);

    let (inviter_conn, invitee_conn) =
        tokio::try_join!(issuer.connection_ready(), holder.connection_ready())
            .expect("connection should become ready");
    assert!(inviter_conn.is_ready());
    assert_eq!(invitee_conn.state().as_str(), "active");

    // Credential
    let sent = issuer
        .offer_credential(&published.definition_id, employee_attributes())
        .await
        .expect("offer should succeed");
    let offer = holder.wait_for_offer().await.expect("offer should appear");
    assert_eq!(offer.exchange_id, sent.exchange_id);
    assert_eq!(offer.attributes, employee_attributes());

    let taken = holder
        .accept_credential(&offer.exchange_id)
        .await
        .expect("accept should succeed");
    assert!(!taken.holder_identifier.as_str().is_empty());

    let (issued, received) =
        tokio::try_join!(issuer.credential_ready(), holder.credential_ready())
            .expect("credential should become ready");
    assert!(issued.is_ready());
    let credential_id = received
        .credential()
        .and_then(|c| c.credential_id.clone())
        .expect("holder should learn the credential id");
    assert_eq!(credential_id, format!("cred-{}", sent.exchange_id));

    // Presentation
    let request = issuer
        .request_presentation(ProofConstraint(serde_json::json!({
            "requested_attributes": { "name": {} }
        })))
        .await
        .expect("proof request should succeed");
    let found = holder
        .wait_for_request()
        .await
        .expect("request should appear");
    assert_eq!(found.exchange_id, request.exchange_id);

    let submitted = holder
        .present_credential(&found.exchange_id)
        .await
        .expect("presentation should succeed");
    assert_eq!(submitted.state.as_str(), "presentation-sent");

    let result = issuer
        .presentation_result()
        .await
        .expect("verification should finish");
    assert_eq!(result.verified, Verified::True);
    assert_eq!(result.revealed_attributes, employee_attributes());

    for stage in FlowVariant::IssueAndPresent.stages() {
        assert!(issuer.is_ready(*stage), "issuer {stage} should be ready");
    }
    assert_eq!(
        issuer.status(ExchangeKind::Presentation),
        Some(StageStatus::Ready)
    );

    issuer.teardown();
    holder.teardown();
    assert!(issuer.record(ExchangeKind::Connection).is_none());
    assert!(holder.record(ExchangeKind::Credential).is_none());
}

#[tokio::test]
async fn connect_only_flow_stops_after_connection() {
    let (mut issuer, mut holder, _) = coordinators(FlowVariant::Connect);
    let created = issuer.create_invitation("Org-A").await.unwrap();
    holder
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();
    holder.connection_ready().await.unwrap();

    let err = holder.wait_for_offer().await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::StageNotInFlow(ExchangeKind::Credential)
    ));
    let err = issuer.presentation_result().await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::StageNotInFlow(ExchangeKind::Presentation)
    ));
}

#[tokio::test]
async fn holder_sees_credential_ready_event() {
    let (mut issuer, mut holder, _) = coordinators(FlowVariant::Issue);
    let created = issuer.create_invitation("Org-A").await.unwrap();
    holder
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();
    tokio::try_join!(issuer.connection_ready(), holder.connection_ready()).unwrap();

    issuer
        .offer_credential("def1", employee_attributes())
        .await
        .unwrap();
    let offer = holder.wait_for_offer().await.unwrap();
    holder.accept_credential(&offer.exchange_id).await.unwrap();

    let ready = loop {
        match holder.next_event().await {
            Some(ExchangeEvent::Ready(record)) if record.kind == ExchangeKind::Credential => {
                break record;
            }
            Some(ExchangeEvent::Failed(record)) => panic!("unexpected failure: {record:?}"),
            Some(_) => {}
            None => panic!("event stream closed"),
        }
    };
    assert_eq!(ready.state().as_str(), "credential-received");
    assert!(holder.is_ready(ExchangeKind::Credential));
}

#[tokio::test]
async fn coordinator_is_reusable_after_teardown() {
    let (mut issuer, mut holder, _) = coordinators(FlowVariant::Connect);
    for round in 0..2 {
        let created = issuer
            .create_invitation(&format!("Org-A-{round}"))
            .await
            .unwrap();
        holder
            .accept_invitation("Org-B", &created.invitation)
            .await
            .unwrap();
        tokio::try_join!(issuer.connection_ready(), holder.connection_ready()).unwrap();
        issuer.teardown();
        holder.teardown();
    }
}
