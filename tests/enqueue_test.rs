//! Deduplicating send against the in-process store.

use std::sync::Arc;

use ddq_rs::engine::{Enqueuer, SendOutcome};
use ddq_rs::error::Error;
use ddq_rs::model::{MessageHash, OwnerToken, TopicFilter};
use ddq_rs::store::RecordStore;
use ddq_rs::store::memory::{FailurePoint, InjectedFailure, MemoryStore};

fn enqueuer(store: &Arc<MemoryStore>, cycle_limit: u32) -> Enqueuer {
    Enqueuer::new(store.clone(), cycle_limit)
}

#[tokio::test]
async fn send_creates_one_record_keyed_by_content() {
    let store = Arc::new(MemoryStore::new());
    let outcome = enqueuer(&store, 3).send("hello", Some("topicA")).await.unwrap();

    let expected = MessageHash::compute("hello", Some("topicA"));
    assert_eq!(outcome, SendOutcome::Created(expected.clone()));

    let record = store.snapshot(&expected).unwrap();
    assert_eq!(record.message, "hello");
    assert_eq!(record.topic.as_deref(), Some("topicA"));
    assert!(!record.is_processing);
    assert!(!record.requeued);
    assert!(record.owner.is_none());
}

#[tokio::test]
async fn same_message_on_other_topic_is_a_separate_record() {
    let store = Arc::new(MemoryStore::new());
    let send = enqueuer(&store, 3);
    send.send("hello", Some("a")).await.unwrap();
    send.send("hello", Some("b")).await.unwrap();
    send.send("hello", None).await.unwrap();
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn empty_topic_is_stored_as_no_topic() {
    let store = Arc::new(MemoryStore::new());
    let outcome = enqueuer(&store, 3).send("hello", Some("")).await.unwrap();
    assert_eq!(outcome.hash(), &MessageHash::compute("hello", None));
    assert!(store.snapshot(outcome.hash()).unwrap().topic.is_none());
}

#[tokio::test]
async fn duplicate_of_pending_record_exhausts_retries() {
    let store = Arc::new(MemoryStore::new());
    let send = enqueuer(&store, 3);
    send.send("hello", None).await.unwrap();

    let err = send.send("hello", None).await.unwrap_err();
    assert!(matches!(err, Error::SendExhausted { attempts: 3 }));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn zero_cycle_limit_fails_without_touching_the_store() {
    let store = Arc::new(MemoryStore::new());
    let err = enqueuer(&store, 0).send("hello", None).await.unwrap_err();
    assert!(matches!(err, Error::SendExhausted { attempts: 0 }));
    assert!(store.is_empty());
}

#[tokio::test]
async fn duplicate_of_claimed_record_flags_requeue() {
    let store = Arc::new(MemoryStore::new());
    let send = enqueuer(&store, 3);
    let hash = send.send("hello", Some("a")).await.unwrap().hash().clone();
    store
        .claim_next(&TopicFilter::new(["a"]), &OwnerToken::generate())
        .await
        .unwrap()
        .unwrap();

    let outcome = send.send("hello", Some("a")).await.unwrap();
    assert_eq!(outcome, SendOutcome::Requeued(hash.clone()));

    let record = store.snapshot(&hash).unwrap();
    assert!(record.is_processing);
    assert!(record.requeued);
}

#[tokio::test]
async fn insert_errors_other_than_duplicates_are_not_retried() {
    let store = Arc::new(MemoryStore::new());
    store.inject_failure(FailurePoint::Insert, InjectedFailure::Storage);
    let err = enqueuer(&store, 5).send("hello", None).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
    assert!(store.is_empty());

    // The failure was one-shot; the next send goes through.
    assert!(enqueuer(&store, 5).send("hello", None).await.is_ok());
}

#[tokio::test]
async fn requeue_flag_errors_are_surfaced() {
    let store = Arc::new(MemoryStore::new());
    let send = enqueuer(&store, 5);
    send.send("hello", None).await.unwrap();

    store.inject_failure(FailurePoint::MarkRequeued, InjectedFailure::Storage);
    let err = send.send("hello", None).await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));
}
