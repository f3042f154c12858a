//! Stress test: cancellation racing in-flight queries.
//!
//! Once `cancel` returns, no result may reach `on_update`, whether the
//! query was sleeping, mid-flight, or about to deliver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentic_exchange::{ConnectionExchange, ExchangeConfig, InMemoryAgent, PollOutcome, Poller};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_cancel_during_in_flight_query() {
    let poller = Poller::new();
    let mut handles = Vec::new();
    let mut counters = Vec::new();

    for i in 0..100u32 {
        let updates = Arc::new(AtomicU32::new(0));
        let u = Arc::clone(&updates);
        let handle = poller
            .start(
                &format!("p{i}"),
                move || async move {
                    tokio::time::sleep(Duration::from_millis(20 + u64::from(i % 7))).await;
                    Ok(i)
                },
                |_| false,
                move |_| {
                    u.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(1),
            )
            .expect("poll should start");
        handles.push(handle);
        counters.push(updates);
    }

    // Cancel while every query is still sleeping.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let at_cancel: Vec<u32> = handles
        .iter()
        .zip(&counters)
        .map(|(h, c)| {
            h.cancel();
            c.load(Ordering::SeqCst)
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(80)).await;
    for ((handle, counter), before) in handles.iter().zip(&counters).zip(at_cancel) {
        assert_eq!(handle.finished().await, PollOutcome::Cancelled);
        assert_eq!(
            counter.load(Ordering::SeqCst),
            before,
            "{} delivered after cancel",
            handle.key()
        );
    }
    assert_eq!(poller.active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_cancel_at_random_points() {
    let poller = Poller::new();
    for round in 0..50u64 {
        let updates = Arc::new(AtomicU32::new(0));
        let u = Arc::clone(&updates);
        let handle = poller
            .start(
                "race",
                || async {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(())
                },
                |_| false,
                move |_| {
                    u.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(1),
            )
            .expect("key should be free again");

        tokio::time::sleep(Duration::from_millis(round % 9)).await;
        handle.cancel();
        let before = updates.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(updates.load(Ordering::SeqCst), before, "round {round}");
        assert!(handle.is_cancelled());
        assert!(!poller.is_polling("race"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_shutdown_cancels_every_watch() {
    let poller = Poller::new();
    let config = ExchangeConfig {
        poll_interval_ms: 1,
        ..Default::default()
    };

    // Inviters whose invitees never show up poll forever.
    let agent = Arc::new(InMemoryAgent::new());
    let mut watches = Vec::new();
    for _ in 0..30 {
        let mut connection = ConnectionExchange::new(agent.clone(), poller.clone(), &config);
        let created = connection.create_invitation("Org-A").await.unwrap();
        watches.push((connection.await_active(&created.id).unwrap(), connection));
    }
    assert_eq!(poller.active_count(), 30);

    poller.shutdown();
    for (watch, connection) in &watches {
        assert!(watch.finished().await.is_cancelled());
        assert!(watch.ready().await.is_err());
        // The record survives cancellation as last committed.
        assert_eq!(
            connection.current().unwrap().state().as_str(),
            "invitation"
        );
    }
    assert_eq!(poller.active_count(), 0);
}

#[tokio::test]
async fn stress_cancelled_watch_keeps_last_record() {
    let (inviter, invitee) = InMemoryAgent::pair();
    inviter.set_query_delay(Duration::from_millis(30));
    let config = ExchangeConfig {
        poll_interval_ms: 1,
        ..Default::default()
    };
    let mut org_a = ConnectionExchange::new(inviter.clone(), Poller::new(), &config);
    let mut org_b = ConnectionExchange::new(invitee, Poller::new(), &config);

    let created = org_a.create_invitation("Org-A").await.unwrap();
    org_b
        .accept_invitation("Org-B", &created.invitation)
        .await
        .unwrap();

    let watch = org_a.await_active(&created.id).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    watch.cancel();
    let before = watch.latest();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(watch.latest(), before);
    assert_eq!(before.poll_count, 0);
    assert!(inviter.query_count() >= 1);
}
