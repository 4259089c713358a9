//! Subscription lifecycle against a live mock relay.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use relay_pool::{Broker, Filter, InstantOverflow, RelaySelection, StreamEnd, SubscribeOptions};
use std::time::Duration;

#[tokio::test]
async fn test_instant_subscription_completes_on_eose() {
    let relay = MockRelay::with_responder(stored_events(vec![event("old", 10), event("new", 20)])).await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let handle = consumer
        .subscribe(Filter::new().kinds(vec![1]), SubscribeOptions::instant().id("q"))
        .await
        .unwrap();
    let events = handle.collect_events(None).await;
    let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);

    let req = relay.next_frame().await;
    assert_eq!(frame_kind(&req), "REQ");
    assert_eq!(frame_id(&req), format!("{}:q", consumer.id()));
    let close = relay.next_frame().await;
    assert_eq!(frame_kind(&close), "CLOSE");
    assert_eq!(frame_id(&close), frame_id(&req));

    let stats = consumer.stats().await.unwrap();
    assert_eq!(stats[0].instant, 0);
    assert_eq!(stats[0].sinks, 0);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_keep_alive_sends_no_frame() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let filter = Filter::new().kinds(vec![1]).authors(vec!["alice".to_string()]);
    let mut first = consumer
        .subscribe(filter.clone(), SubscribeOptions::keep_alive().id("a"))
        .await
        .unwrap();
    let req = relay.next_frame().await;
    assert_eq!(frame_kind(&req), "REQ");

    let mut second = consumer
        .subscribe(filter, SubscribeOptions::keep_alive().id("b"))
        .await
        .unwrap();
    relay.expect_no_frame(Duration::from_millis(300)).await;

    let stats = consumer.stats().await.unwrap();
    assert_eq!(stats[0].keep_alive, 1);
    assert_eq!(stats[0].sinks, 2);

    // Both handles read the one relay subscription.
    relay.send(event_frame(frame_id(&req), &event("e1", 1)));
    let from_first = first.next().await.unwrap();
    let from_second = second.next().await.unwrap();
    assert_eq!(from_first.event.id, "e1");
    assert_eq!(from_second.event.id, "e1");
    assert_eq!(from_first.subscription_id, "a");
    assert_eq!(from_second.subscription_id, "b");

    // CLOSE goes out only when the last reader lets go.
    second.unsubscribe();
    relay.expect_no_frame(Duration::from_millis(300)).await;
    first.unsubscribe();
    let close = relay.next_frame().await;
    assert_eq!(frame_kind(&close), "CLOSE");
    assert_eq!(frame_id(&close), frame_id(&req));

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_by_id_detaches_shared_keep_alive() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let filter = Filter::new().kinds(vec![1]);
    let mut first = consumer
        .subscribe(filter.clone(), SubscribeOptions::keep_alive().id("a"))
        .await
        .unwrap();
    let req = relay.next_frame().await;
    let mut second = consumer
        .subscribe(filter.clone(), SubscribeOptions::keep_alive().id("b"))
        .await
        .unwrap();
    assert_eq!(second.id(), "b");

    consumer.unsubscribe("b").await.unwrap();
    relay.expect_no_frame(Duration::from_millis(300)).await;

    relay.send(event_frame(frame_id(&req), &event("after-unsub", 2)));
    let received = first.next().await.unwrap();
    assert_eq!(received.event.id, "after-unsub");
    assert_eq!(received.subscription_id, "a");
    assert!(second.next().await.is_none());
    assert_eq!(second.streams()[0].end_reason(), Some(&StreamEnd::Unsubscribed));

    let stats = consumer.stats().await.unwrap();
    assert_eq!(stats[0].keep_alive, 1);
    assert_eq!(stats[0].sinks, 1);

    // Shared again, then the consumer leaves: one CLOSE for the live id.
    let _third = consumer
        .subscribe(filter, SubscribeOptions::keep_alive().id("b"))
        .await
        .unwrap();
    relay.expect_no_frame(Duration::from_millis(200)).await;
    consumer.disconnect();
    let close = relay.next_frame().await;
    assert_eq!(frame_kind(&close), "CLOSE");
    assert_eq!(frame_id(&close), frame_id(&req));
    relay.expect_no_frame(Duration::from_millis(300)).await;

    let observer = broker.connect().unwrap();
    let stats = observer.stats().await.unwrap();
    assert_eq!(stats[0].keep_alive, 0);
    assert_eq!(stats[0].sinks, 0);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_instant_pool_evicts_oldest() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let config = test_config(urls.clone()).limits(4, 2);
    let broker = Broker::spawn(config).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let mut a = consumer
        .subscribe(Filter::new().kinds(vec![1]), SubscribeOptions::instant().id("a"))
        .await
        .unwrap();
    let _b = consumer
        .subscribe(Filter::new().kinds(vec![2]), SubscribeOptions::instant().id("b"))
        .await
        .unwrap();
    let _c = consumer
        .subscribe(Filter::new().kinds(vec![3]), SubscribeOptions::instant().id("c"))
        .await
        .unwrap();

    let prefix = consumer.id().to_string();
    let frames: Vec<(String, String)> = [
        relay.next_frame().await,
        relay.next_frame().await,
        relay.next_frame().await,
        relay.next_frame().await,
    ]
    .iter()
    .map(|f| (frame_kind(f).to_string(), frame_id(f).to_string()))
    .collect();
    assert_eq!(
        frames,
        vec![
            ("REQ".to_string(), format!("{}:a", prefix)),
            ("REQ".to_string(), format!("{}:b", prefix)),
            ("CLOSE".to_string(), format!("{}:a", prefix)),
            ("REQ".to_string(), format!("{}:c", prefix)),
        ]
    );

    assert!(a.next().await.is_none());
    assert_eq!(a.streams()[0].end_reason(), Some(&StreamEnd::Evicted));

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_instant_is_promoted_when_slot_frees() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let config = test_config(urls.clone())
        .limits(3, 1)
        .instant_overflow(InstantOverflow::Queue);
    let broker = Broker::spawn(config).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let mut a = consumer
        .subscribe(Filter::new().kinds(vec![1]), SubscribeOptions::instant().id("a"))
        .await
        .unwrap();
    let _b = consumer
        .subscribe(Filter::new().kinds(vec![2]), SubscribeOptions::instant().id("b"))
        .await
        .unwrap();
    assert_eq!(frame_kind(&relay.next_frame().await), "REQ");
    assert_eq!(frame_kind(&relay.next_frame().await), "REQ");

    let _q = consumer
        .subscribe(Filter::new().kinds(vec![3]), SubscribeOptions::instant().id("q"))
        .await
        .unwrap();
    relay.expect_no_frame(Duration::from_millis(300)).await;
    assert_eq!(consumer.stats().await.unwrap()[0].pending, 1);

    a.unsubscribe();
    let close = relay.next_frame().await;
    assert_eq!(frame_kind(&close), "CLOSE");
    assert_eq!(frame_id(&close), format!("{}:a", consumer.id()));
    let promoted = relay.next_frame().await;
    assert_eq!(frame_kind(&promoted), "REQ");
    assert_eq!(frame_id(&promoted), format!("{}:q", consumer.id()));

    let stats = consumer.stats().await.unwrap();
    assert_eq!(stats[0].pending, 0);
    assert_eq!(stats[0].instant, 2);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_same_id_from_two_consumers_is_isolated() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let alice = broker.connect().unwrap();
    let bob = broker.connect().unwrap();
    wait_connected(&alice, &urls).await;

    let filter = Filter::new().kinds(vec![1]);
    let mut alice_feed = alice
        .subscribe(filter.clone(), SubscribeOptions::keep_alive().id("feed"))
        .await
        .unwrap();
    let mut bob_feed = bob
        .subscribe(filter, SubscribeOptions::keep_alive().id("feed"))
        .await
        .unwrap();

    let first = relay.next_frame().await;
    let second = relay.next_frame().await;
    assert_eq!(frame_id(&first), format!("{}:feed", alice.id()));
    assert_eq!(frame_id(&second), format!("{}:feed", bob.id()));

    relay.send(event_frame(frame_id(&first), &event("for-alice", 1)));
    let received = alice_feed.next().await.unwrap();
    assert_eq!(received.event.id, "for-alice");
    assert_eq!(received.subscription_id, "feed");

    let nothing = tokio::time::timeout(Duration::from_millis(300), bob_feed.next()).await;
    assert!(nothing.is_err(), "bob received alice's event");

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inactive_stream_completes_once_and_closes() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let mut handle = consumer
        .subscribe(
            Filter::new().kinds(vec![1]),
            SubscribeOptions::instant()
                .id("idle")
                .inactivity_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert_eq!(frame_kind(&relay.next_frame().await), "REQ");

    assert!(handle.next().await.is_none());
    assert!(handle.next().await.is_none());
    assert!(handle.summary().idle_relays.contains(&relay.url()));
    assert_eq!(handle.streams()[0].end_reason(), Some(&StreamEnd::IdleTimeout));

    let close = relay.next_frame().await;
    assert_eq!(frame_kind(&close), "CLOSE");
    relay.expect_no_frame(Duration::from_millis(300)).await;

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_relay_closed_frame_ends_stream_without_close() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let mut handle = consumer
        .subscribe(Filter::new().kinds(vec![1]), SubscribeOptions::keep_alive().id("k"))
        .await
        .unwrap();
    let req = relay.next_frame().await;

    relay.send(serde_json::json!(["CLOSED", frame_id(&req), "rate-limited: slow down"]).to_string());
    assert!(handle.next().await.is_none());
    assert_eq!(
        handle.streams()[0].end_reason(),
        Some(&StreamEnd::ClosedByRelay("rate-limited: slow down".to_string()))
    );
    assert_eq!(
        handle.summary().errored_relays.get(&relay.url()).map(String::as_str),
        Some("rate-limited: slow down")
    );
    relay.expect_no_frame(Duration::from_millis(300)).await;
    assert_eq!(consumer.stats().await.unwrap()[0].keep_alive, 0);

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_relay_selection_selects_nothing() {
    let relay = MockRelay::start().await;
    let urls = vec![relay.url()];
    let broker = Broker::spawn(test_config(urls.clone())).unwrap();
    let consumer = broker.connect().unwrap();
    wait_connected(&consumer, &urls).await;

    let mut handle = consumer
        .subscribe(
            Filter::new(),
            SubscribeOptions::instant().selection(RelaySelection::Single("ws://127.0.0.1:9".to_string())),
        )
        .await
        .unwrap();
    assert!(handle.streams().is_empty());
    assert!(handle.next().await.is_none());
    relay.expect_no_frame(Duration::from_millis(200)).await;

    broker.shutdown().await.unwrap();
}
