//! Claim exclusivity, lease expiry, and owner fencing of handler calls.

use std::sync::Arc;
use std::time::Duration;

use ddq_rs::config::QueueConfig;
use ddq_rs::engine::{Listener, PollOutcome, ReapOutcome, RemoveOutcome, WrappedMessage};
use ddq_rs::event::{EventReceiver, ListenerEvent};
use ddq_rs::store::memory::{FailurePoint, InjectedFailure, MemoryStore};

fn listener(store: &Arc<MemoryStore>, topics: &[&str]) -> (Listener, EventReceiver) {
    let config = QueueConfig::new("jobs").topics(topics.iter().copied());
    Listener::new(store.clone(), config).unwrap()
}

/// Claim one record through `check_now` and take it off the channel.
async fn claim(listener: &Listener, events: &mut EventReceiver) -> WrappedMessage {
    assert!(matches!(listener.check_now().await, PollOutcome::Claimed(_)));
    match events.try_recv() {
        Ok(ListenerEvent::Data(message)) => message,
        other => panic!("expected a data event, got {other:?}"),
    }
}

#[tokio::test]
async fn hello_topic_a_claim_heartbeat_remove() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &["topicA"]);
    listener.send("hello", Some("topicA")).await.unwrap();
    assert_eq!(store.len(), 1);

    let message = claim(&listener, &mut events).await;
    assert_eq!(message.message(), "hello");
    let claimed_at = store.snapshot(message.hash()).unwrap().heartbeat_date;

    store.advance_clock(Duration::from_secs(1));
    assert!(message.heartbeat().await.unwrap());
    assert!(store.snapshot(message.hash()).unwrap().heartbeat_date > claimed_at);

    assert_eq!(message.remove().await.unwrap(), RemoveOutcome::Removed);
    assert_eq!(store.len(), 0);
}

#[tokio::test]
async fn remove_after_requeue_flag_releases_instead() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &["a"]);
    listener.send("job", Some("a")).await.unwrap();
    let message = claim(&listener, &mut events).await;
    let hash = message.hash().clone();

    // Re-sent while in flight.
    listener.send("job", Some("a")).await.unwrap();
    assert!(store.snapshot(&hash).unwrap().requeued);

    assert_eq!(message.remove().await.unwrap(), RemoveOutcome::Released);
    let record = store.snapshot(&hash).unwrap();
    assert!(!record.is_processing);
    assert!(!record.requeued);
    assert!(record.owner.is_none());

    // And it is claimable again.
    let again = claim(&listener, &mut events).await;
    assert_eq!(again.hash(), &hash);
}

#[tokio::test]
async fn failed_delete_falls_back_to_release() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &[]);
    listener.send("job", None).await.unwrap();
    let message = claim(&listener, &mut events).await;
    let hash = message.hash().clone();

    store.inject_failure(FailurePoint::Remove, InjectedFailure::Storage);
    assert_eq!(message.remove().await.unwrap(), RemoveOutcome::Released);
    assert!(!store.snapshot(&hash).unwrap().is_processing);
}

#[tokio::test]
async fn requeue_returns_record_to_the_pool() {
    let store = Arc::new(MemoryStore::new());
    let (first, mut first_events) = listener(&store, &["a"]);
    let (second, mut second_events) = listener(&store, &["a"]);
    first.send("job", Some("a")).await.unwrap();

    let message = claim(&first, &mut first_events).await;
    assert_eq!(second.check_now().await, PollOutcome::Empty);

    assert!(message.requeue().await.unwrap());
    let again = claim(&second, &mut second_events).await;
    assert_eq!(again.owner(), second.owner());
}

#[tokio::test]
async fn lease_expires_only_after_lifetime() {
    let store = Arc::new(MemoryStore::new());
    let (dead, mut dead_events) = listener(&store, &[]);
    let (live, mut live_events) = listener(&store, &[]);
    dead.send("job", None).await.unwrap();
    let _abandoned = claim(&dead, &mut dead_events).await;

    store.advance_clock(Duration::from_secs(3));
    assert_eq!(live.reap_now().await, ReapOutcome::Reaped(0));
    assert_eq!(live.check_now().await, PollOutcome::Empty);

    store.advance_clock(Duration::from_secs(3));
    assert_eq!(live.reap_now().await, ReapOutcome::Reaped(1));
    let reclaimed = claim(&live, &mut live_events).await;
    assert_eq!(reclaimed.message(), "job");
}

#[tokio::test]
async fn heartbeats_keep_the_lease_alive() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &[]);
    listener.send("long job", None).await.unwrap();
    let message = claim(&listener, &mut events).await;

    for _ in 0..4 {
        store.advance_clock(Duration::from_secs(3));
        assert!(message.heartbeat().await.unwrap());
        assert_eq!(listener.reap_now().await, ReapOutcome::Reaped(0));
    }
    assert!(store.snapshot(message.hash()).unwrap().is_owned_by(listener.owner()));
}

#[tokio::test]
async fn stale_handle_cannot_touch_a_reclaimed_record() {
    let store = Arc::new(MemoryStore::new());
    let (old, mut old_events) = listener(&store, &[]);
    let (new, mut new_events) = listener(&store, &[]);
    old.send("job", None).await.unwrap();
    let stale = claim(&old, &mut old_events).await;
    let hash = stale.hash().clone();

    store.advance_clock(Duration::from_secs(10));
    assert_eq!(new.reap_now().await, ReapOutcome::Reaped(1));
    let _current = claim(&new, &mut new_events).await;

    assert!(!stale.heartbeat().await.unwrap());
    assert_eq!(stale.remove().await.unwrap(), RemoveOutcome::NotOwner);

    let record = store.snapshot(&hash).unwrap();
    assert!(record.is_owned_by(new.owner()));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn stale_requeue_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let (old, mut old_events) = listener(&store, &[]);
    let (new, mut new_events) = listener(&store, &[]);
    old.send("job", None).await.unwrap();
    let stale = claim(&old, &mut old_events).await;

    store.advance_clock(Duration::from_secs(10));
    new.reap_now().await;
    let current = claim(&new, &mut new_events).await;

    assert!(!stale.requeue().await.unwrap());
    assert!(store.snapshot(current.hash()).unwrap().is_owned_by(new.owner()));
}

#[tokio::test]
async fn heartbeat_store_errors_are_returned() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &[]);
    listener.send("job", None).await.unwrap();
    let message = claim(&listener, &mut events).await;

    store.inject_failure(FailurePoint::Heartbeat, InjectedFailure::Storage);
    assert!(message.heartbeat().await.is_err());
    assert!(message.heartbeat().await.unwrap());
}

#[tokio::test]
async fn topic_filter_limits_what_is_claimed() {
    let store = Arc::new(MemoryStore::new());
    let (listener, mut events) = listener(&store, &["mine"]);
    listener.send("theirs", Some("other")).await.unwrap();
    assert_eq!(listener.check_now().await, PollOutcome::Empty);

    listener.send("anyone", None).await.unwrap();
    let message = claim(&listener, &mut events).await;
    assert_eq!(message.message(), "anyone");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_take_a_record_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    // Receivers stay alive; a dropped receiver would make claims bounce back.
    let mut listeners = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..8 {
        let (listener, events) = listener(&store, &[]);
        listeners.push(Arc::new(listener));
        receivers.push(events);
    }
    listeners[0].send("contended", None).await.unwrap();

    let mut handles = Vec::new();
    for listener in &listeners {
        let listener = Arc::clone(listener);
        handles.push(tokio::spawn(async move { listener.check_now().await }));
    }

    let mut claimed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            PollOutcome::Claimed(_) => claimed += 1,
            PollOutcome::Empty => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(claimed, 1);
    let delivered = receivers
        .iter_mut()
        .filter_map(|r| r.try_recv().ok())
        .count();
    assert_eq!(delivered, 1);
}
