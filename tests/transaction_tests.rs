use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use streamtab::core::{Ack, AckOutcome, Batch, Message, MetaValue, Transaction};

#[test]
fn test_ack_runs_callback_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let ack = Ack::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let clone = ack.clone();
    assert!(ack.resolve(AckOutcome::Success));
    assert!(!clone.resolve(AckOutcome::failure("late")));
    assert!(!ack.resolve(AckOutcome::Success));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(clone.is_resolved());
}

#[test]
fn test_first_outcome_wins() {
    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    let txn = Transaction::new(Batch::single(Message::new("a")), move |o| {
        *slot.lock().unwrap() = Some(o);
    });

    let (_, ack) = txn.into_parts();
    ack.resolve(AckOutcome::failure("sink unavailable"));
    ack.resolve(AckOutcome::Success);

    assert_eq!(
        outcome.lock().unwrap().clone(),
        Some(AckOutcome::Failure("sink unavailable".to_string()))
    );
}

#[tokio::test]
async fn test_channel_transaction_reports_outcome() {
    let (txn, rx) = Transaction::channel(Batch::single(Message::new("payload")));
    assert_eq!(txn.batch().len(), 1);
    assert!(!txn.ack().is_resolved());

    let ack = txn.ack().clone();
    tokio::spawn(async move {
        ack.resolve(AckOutcome::Success);
    });

    assert_eq!(rx.await.unwrap(), AckOutcome::Success);
}

#[test]
fn test_derived_message_keeps_metadata_and_provenance() {
    let original = Message::new("a,b").with_metadata("source", "kafka");
    let mut derived = original.derive("a");
    derived.set_meta("part", 0i64);

    assert_eq!(derived.meta("source").and_then(MetaValue::as_str), Some("kafka"));
    assert_eq!(derived.provenance(), original.provenance());
    assert!(original.meta("part").is_none());
}

#[test]
fn test_merged_message_takes_first_metadata() {
    let a = Message::new("a").with_metadata("x", "1");
    let b = Message::new("b").with_metadata("y", "2");
    let merged = Message::merge([&a, &b], "ab");

    assert_eq!(merged.payload().as_ref(), b"ab");
    assert_eq!(merged.meta("x").and_then(MetaValue::as_str), Some("1"));
    assert!(merged.meta("y").is_none());
}

#[test]
fn test_noop_ack_resolves_silently() {
    let ack = Ack::noop();
    assert!(ack.resolve(AckOutcome::Success));
    assert!(ack.is_resolved());
}
