//! Edge-case tests: exhaustive state properties, discovery cardinality,
//! and malformed caller input.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agentic_exchange::agent::{OfferSummary, ProofRequestSummary};
use agentic_exchange::state::{
    forward_path, is_ready_for_next_stage, is_terminal, validate_transition,
};
use agentic_exchange::{
    ConnectionExchange, CredentialExchange, ExchangeConfig, ExchangeError, ExchangeId,
    ExchangeKind, ExchangePayload, ExchangeRecord, ExchangeRole, ExchangeState, InMemoryAgent,
    InvitationArtifact, Observation, Poller, PresentationExchange, PresentationPayload,
    ProofConstraint, Verified,
};

const ROLES: [ExchangeRole; 2] = [ExchangeRole::Initiator, ExchangeRole::Responder];

fn config() -> ExchangeConfig {
    ExchangeConfig {
        poll_interval_ms: 2,
        ..Default::default()
    }
}

// ── Exhaustive state properties ──────────────────────────────────────────────

#[test]
fn edge_verified_unknown_for_every_non_terminal_state() {
    for state in ExchangeState::all(ExchangeKind::Presentation) {
        for reported in [None, Some(true), Some(false)] {
            let verified = Verified::from_report(&state, reported);
            if !is_terminal(&state) {
                assert_eq!(verified, Verified::Unknown, "{state} reported {reported:?}");
            } else if let Some(v) = reported {
                assert_eq!(verified.as_bool(), Some(v), "{state} reported {reported:?}");
            }
        }
    }
}

#[test]
fn edge_record_never_reports_false_before_terminal() {
    for role in ROLES {
        let path = forward_path(ExchangeKind::Presentation, role);
        let mut record = ExchangeRecord::with_id(
            ExchangeId::from("p1"),
            role,
            path[0],
            ExchangePayload::empty(ExchangeKind::Presentation),
        )
        .unwrap();
        for state in path {
            // Even a misbehaving agent claiming `false` early is ignored.
            let payload = PresentationPayload {
                verified: Verified::False,
                ..Default::default()
            };
            record = record
                .observe(&Observation::new(*state, ExchangePayload::Presentation(payload)))
                .unwrap();
            let verified = record.presentation().unwrap().verified;
            if is_terminal(state) {
                assert_eq!(verified, Verified::False);
            } else {
                assert_eq!(verified, Verified::Unknown, "{role} at {state}");
            }
        }
    }
}

#[test]
fn edge_transition_order_is_total_per_kind() {
    for kind in ExchangeKind::ALL {
        let states = ExchangeState::all(kind);
        for from in &states {
            for to in &states {
                let allowed = validate_transition(from, to).is_ok();
                let expected = if from.is_abandoned() {
                    to.is_abandoned()
                } else {
                    to.is_abandoned() || to.rank() >= from.rank()
                };
                assert_eq!(allowed, expected, "{kind}: {from} -> {to}");
            }
        }
    }
}

#[test]
fn edge_every_path_reaches_ready_and_terminal() {
    for kind in ExchangeKind::ALL {
        for role in ROLES {
            let path = forward_path(kind, role);
            let last = path.last().unwrap();
            assert!(is_terminal(last), "{kind}/{role} path ends at {last}");
            assert!(is_ready_for_next_stage(role, last));
            assert!(!is_ready_for_next_stage(role, &path[0]));
            assert!(
                path.windows(2).all(|w| w[0].rank() < w[1].rank()),
                "{kind}/{role} path must strictly advance"
            );
        }
    }
}

#[test]
fn edge_state_strings_are_normalised() {
    let cases = [
        (ExchangeKind::Connection, "ACTIVE", "active"),
        (ExchangeKind::Credential, "credential_issued", "credential-issued"),
        (ExchangeKind::Presentation, " presentation_received ", "presentation-received"),
    ];
    for (kind, raw, canonical) in cases {
        assert_eq!(ExchangeState::parse(kind, raw).unwrap().as_str(), canonical);
    }
    assert!(matches!(
        ExchangeState::parse(ExchangeKind::Credential, "active"),
        Err(ExchangeError::UnknownState { .. })
    ));
    assert!(ExchangeState::parse(ExchangeKind::Connection, "").is_err());
}

// ── Discovery cardinality ────────────────────────────────────────────────────

#[tokio::test]
async fn edge_discovery_counts() {
    let holder = Arc::new(InMemoryAgent::new().counterpart());
    let c1 = ExchangeId::from("c1");
    let mut credentials = CredentialExchange::new(holder.clone(), Poller::new(), &config());
    let mut presentations = PresentationExchange::new(holder.clone(), Poller::new(), &config());

    assert!(credentials.discover_offer(&c1).await.unwrap().is_none());
    assert!(presentations.discover_request(&c1).await.unwrap().is_none());

    for n in 1..=3 {
        holder.inject_offer(
            "c1",
            OfferSummary {
                exchange_id: ExchangeId::from(format!("e{n}")),
                attributes: BTreeMap::new(),
            },
        );
        holder.inject_proof_request(
            "c1",
            ProofRequestSummary {
                exchange_id: ExchangeId::from(format!("p{n}")),
            },
        );
    }

    assert!(matches!(
        credentials.discover_offer(&c1).await,
        Err(ExchangeError::AmbiguousState { count: 3, .. })
    ));
    assert!(matches!(
        presentations.discover_request(&c1).await,
        Err(ExchangeError::AmbiguousState { count: 3, .. })
    ));
    // Ambiguity never starts tracking anything.
    assert!(credentials.current().is_none());
    assert!(presentations.current().is_none());

    // Other connections stay empty.
    let c2 = ExchangeId::from("c2");
    assert!(credentials.discover_offer(&c2).await.unwrap().is_none());
}

#[tokio::test]
async fn edge_rediscovering_same_offer_is_idempotent() {
    let holder = Arc::new(InMemoryAgent::new().counterpart());
    holder.inject_offer(
        "c1",
        OfferSummary {
            exchange_id: ExchangeId::from("e1"),
            attributes: BTreeMap::new(),
        },
    );
    let mut credentials = CredentialExchange::new(holder, Poller::new(), &config());
    let c1 = ExchangeId::from("c1");
    let first = credentials.discover_offer(&c1).await.unwrap().unwrap();
    let second = credentials.discover_offer(&c1).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(credentials.current().unwrap().id_str(), "e1");
}

// ── Malformed input ──────────────────────────────────────────────────────────

#[tokio::test]
async fn edge_blank_and_mismatched_ids() {
    let (inviter, _) = InMemoryAgent::pair();
    let mut connection = ConnectionExchange::new(inviter, Poller::new(), &config());

    assert!(matches!(
        connection.await_active(&ExchangeId::from("c1")),
        Err(ExchangeError::NotStarted(ExchangeKind::Connection))
    ));

    let created = connection.create_invitation("Org-A").await.unwrap();
    assert!(matches!(
        connection.await_active(&ExchangeId::from("")),
        Err(ExchangeError::Validation(_))
    ));
    assert!(matches!(
        connection.await_active(&ExchangeId::from("c99")),
        Err(ExchangeError::Validation(_))
    ));
    let watch = connection.await_active(&created.id).unwrap();
    assert!(matches!(
        connection.await_active(&created.id),
        Err(ExchangeError::AlreadyPolling(_))
    ));
    watch.cancel();
}

#[tokio::test]
async fn edge_malformed_invitations() {
    let (_, invitee) = InMemoryAgent::pair();
    let mut connection = ConnectionExchange::new(invitee, Poller::new(), &config());
    for raw in ["", "not base64 !!", "https://agent.example/invite?c_i=%%%", "{\"label\": 1"] {
        let err = connection
            .accept_invitation("Org-B", &InvitationArtifact::new(raw))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)), "{raw:?}: {err}");
    }
    assert!(connection.current().is_none());
}

#[tokio::test]
async fn edge_empty_proof_constraints_rejected() {
    let (verifier, _) = InMemoryAgent::pair();
    let mut presentations = PresentationExchange::new(verifier, Poller::new(), &config());
    let c1 = ExchangeId::from("c1");
    for empty in [
        serde_json::Value::Null,
        serde_json::json!({}),
        serde_json::json!([]),
    ] {
        let err = presentations
            .send_request(&c1, ProofConstraint(empty))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }
}

#[tokio::test]
async fn edge_poller_arguments() {
    let poller = Poller::new();
    let zero = poller.start("k", || async { Ok(()) }, |_| true, |_| {}, Duration::ZERO);
    assert!(matches!(zero, Err(ExchangeError::Validation(_))));
    let blank = poller.start(" ", || async { Ok(()) }, |_| true, |_| {}, Duration::from_millis(1));
    assert!(matches!(blank, Err(ExchangeError::Validation(_))));
    assert_eq!(poller.active_count(), 0);
}
