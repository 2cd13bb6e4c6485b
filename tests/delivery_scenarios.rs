use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use trfc_delivery::{
    AttemptOutcome, Destination, DeliveryConfig, Document, DocumentList, FlowName, LoopbackTarget,
    Operation, RetryPolicy, SendError, SendOutcome, SendRequest, SenderState, TransactionKey,
    TransactionState, TransactionalSender, TransportError,
};

fn key(dest: &str) -> TransactionKey {
    TransactionKey::parse(dest, "default").unwrap()
}

fn fast_config() -> DeliveryConfig {
    DeliveryConfig {
        allocation: RetryPolicy::immediate(3),
        delivery: RetryPolicy::immediate(5),
        commit: RetryPolicy::immediate(3),
        ..DeliveryConfig::default()
    }
}

fn sender(target: &Arc<LoopbackTarget>) -> TransactionalSender<LoopbackTarget> {
    TransactionalSender::new(Arc::clone(target), fast_config()).unwrap()
}

fn idocs(numbers: &[&str]) -> DocumentList {
    DocumentList::from_numbers("ORDERS05", numbers.iter().copied())
}

#[tokio::test]
async fn first_try_success_commits_with_one_acknowledged_attempt() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let outcome = sender.send(&key("DEST1"), &idocs(&["IDOC-1"])).await.unwrap();
    let report = outcome.report().expect("delivered");

    assert_eq!(report.final_state, TransactionState::Committed);
    assert_eq!(report.path.last(), Some(&SenderState::Done));
    assert!(report.path.contains(&SenderState::Committing));
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Acknowledged);
    assert_eq!(report.attempts[0].sequence_number, 1);
    assert_eq!(report.attempts[0].attempt_count, 1);

    assert!(target.is_committed(&report.tid).await);
    assert_eq!(target.posted_documents(&Destination::new("DEST1").unwrap()).await, vec!["IDOC-1"]);
    assert!(!sender.store().contains(&key("DEST1")));
}

#[tokio::test]
async fn transient_failures_are_resent_under_the_same_sequence_number() {
    let target = Arc::new(LoopbackTarget::new());
    target.fail_next(Operation::Send, TransportError::transient("NET", "reset")).await;
    target.fail_next(Operation::Send, TransportError::transient("NET", "reset")).await;
    let sender = sender(&target);

    let outcome = sender.send(&key("DEST1"), &idocs(&["IDOC-1"])).await.unwrap();
    let report = outcome.report().unwrap();

    let attempt = &report.attempts[0];
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(attempt.outcome, AttemptOutcome::Acknowledged);
    assert_eq!(attempt.attempt_count, 3);
    assert_eq!(attempt.errors.len(), 2);

    let sends = target.calls_of(Operation::Send).await;
    assert_eq!(sends.len(), 3);
    assert!(sends.iter().all(|c| c.sequence_number == Some(1)));
    assert!(sends.iter().all(|c| c.tid.as_ref() == Some(&report.tid)));
    assert_eq!(sender.metrics().retries, 2);
}

#[tokio::test]
async fn permanent_failure_rolls_back_and_releases() {
    let target = Arc::new(LoopbackTarget::new());
    target
        .fail_next(
            Operation::Send,
            TransportError::permanent("IDOC_SYNTAX", "segment E1EDK01 invalid"),
        )
        .await;
    let sender = sender(&target);

    let error = sender.send(&key("DEST1"), &idocs(&["IDOC-1"])).await.unwrap_err();
    let tid = error.tid().cloned().expect("tid attached");

    match &error {
        SendError::Transport { source, .. } => {
            assert!(matches!(source, TransportError::Permanent { .. }));
            assert_eq!(source.code(), "IDOC_SYNTAX");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(target.is_rolled_back(&tid).await);
    assert!(!sender.store().contains(&key("DEST1")));
    assert_eq!(sender.store().final_state(&tid), Some(TransactionState::RolledBack));

    let outcome = sender.recent_outcome(&tid).unwrap();
    assert_eq!(
        &outcome.path[outcome.path.len() - 3..],
        &[SenderState::AwaitingAck, SenderState::RollingBack, SenderState::Done]
    );
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::PermanentFailure);
}

#[tokio::test]
async fn absent_or_empty_payload_is_a_no_op() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);
    let dest = Destination::new("DEST1").unwrap();

    let absent = sender.process(SendRequest::new(dest.clone(), None)).await.unwrap();
    let empty = sender
        .process(SendRequest::new(dest.clone(), Some(DocumentList::new("ORDERS05"))))
        .await
        .unwrap();
    let direct = sender.send(&key("DEST1"), &DocumentList::new("ORDERS05")).await.unwrap();

    assert_eq!(absent, SendOutcome::NoPayload);
    assert_eq!(empty, SendOutcome::NoPayload);
    assert_eq!(direct, SendOutcome::NoPayload);
    assert!(target.calls().await.is_empty());
    assert_eq!(sender.allocator().outstanding_count(), 0);
    assert_eq!(sender.metrics().no_payload, 3);
}

#[tokio::test]
async fn concurrent_sends_for_one_key_are_serialized() {
    let target = Arc::new(LoopbackTarget::new());
    target.hold_sends();
    let sender = sender(&target);

    let first = tokio::spawn({
        let sender = sender.clone();
        async move { sender.send(&key("DEST1"), &idocs(&["IDOC-1"])).await }
    });
    target.wait_for_sends(1).await;

    let second = tokio::spawn({
        let sender = sender.clone();
        async move { sender.send(&key("DEST1"), &idocs(&["IDOC-2"])).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(target.calls_of(Operation::CreateTid).await.len(), 1);

    target.open_sends();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    let first_tid = first.report().unwrap().tid.clone();
    let second_tid = second.report().unwrap().tid.clone();
    assert_ne!(first_tid, second_tid);

    // The second transaction only started once the first was done.
    let calls = target.calls().await;
    let first_commit = calls
        .iter()
        .position(|c| c.operation == Operation::Commit && c.tid.as_ref() == Some(&first_tid))
        .unwrap();
    let second_create = calls
        .iter()
        .position(|c| c.operation == Operation::CreateTid && c.tid.as_ref() == Some(&second_tid))
        .unwrap();
    assert!(first_commit < second_create);
}

#[tokio::test]
async fn inbound_request_uses_its_flow_key() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let request = SendRequest::new(Destination::new("DEST1").unwrap(), Some(idocs(&["IDOC-7"])))
        .with_flow(FlowName::new("invoices").unwrap());
    let outcome = sender.process(request).await.unwrap();

    let report = outcome.report().unwrap();
    assert_eq!(report.key, TransactionKey::parse("DEST1", "invoices").unwrap());
    assert!(target.is_committed(&report.tid).await);
}

#[tokio::test]
async fn batch_window_shares_one_tid_and_one_commit() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let payloads = vec![
        idocs(&["IDOC-1"]),
        DocumentList::new("ORDERS05"),
        idocs(&["IDOC-2", "IDOC-3"]),
        idocs(&["IDOC-4"]),
    ];
    let outcome = sender.send_batch(&key("DEST1"), &payloads).await.unwrap();
    let report = outcome.report().unwrap();

    let sequences: Vec<u64> = report.attempts.iter().map(|a| a.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(target.calls_of(Operation::CreateTid).await.len(), 1);
    assert_eq!(target.calls_of(Operation::Commit).await.len(), 1);
    assert_eq!(
        target.posted_documents(&Destination::new("DEST1").unwrap()).await,
        vec!["IDOC-1", "IDOC-2", "IDOC-3", "IDOC-4"]
    );

    let sending = report.path.iter().filter(|s| **s == SenderState::Sending).count();
    assert_eq!(sending, 3);
}

#[tokio::test]
async fn scope_sends_then_commits() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let mut scope = sender.begin(&key("DEST1")).await;
    let first = scope.send(&idocs(&["IDOC-1"])).await.unwrap();
    let invoice = DocumentList::new("INVOIC02")
        .with_document(Document::new("IDOC-2", b"E1EDK01".to_vec()));
    let second = scope.send(&invoice).await.unwrap();

    assert_eq!(first.tid, second.tid);
    assert_eq!((first.sequence_number, second.sequence_number), (1, 2));
    assert_eq!(scope.state(), SenderState::AwaitingAck);
    assert_eq!(
        sender.store().get(&key("DEST1")).unwrap().state,
        TransactionState::InUse
    );

    let outcome = scope.commit().await.unwrap();
    assert_eq!(outcome.report().unwrap().attempts.len(), 2);
    assert!(target.is_committed(&first.tid).await);
}

#[tokio::test]
async fn scope_rollback_discards_sent_documents() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let mut scope = sender.begin(&key("DEST1")).await;
    let receipt = scope.send(&idocs(&["IDOC-1"])).await.unwrap();
    scope.rollback().await.unwrap();

    assert!(target.is_rolled_back(&receipt.tid).await);
    assert!(target.posted_documents(&Destination::new("DEST1").unwrap()).await.is_empty());
    assert_eq!(sender.store().final_state(&receipt.tid), Some(TransactionState::RolledBack));
    assert_eq!(sender.metrics().transactions_rolled_back, 1);
}

#[tokio::test]
async fn different_keys_get_different_tids() {
    let target = Arc::new(LoopbackTarget::new());
    let sender = sender(&target);

    let a = sender.send(&key("DEST1"), &idocs(&["IDOC-1"])).await.unwrap();
    let b = sender
        .send(&TransactionKey::parse("DEST1", "invoices").unwrap(), &idocs(&["IDOC-2"]))
        .await
        .unwrap();
    assert_ne!(a.report().unwrap().tid, b.report().unwrap().tid);
}

fn document_numbers() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec("[A-Z]{2}-[0-9]{1,6}", 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn committed_send_leaves_no_active_record(
        numbers in document_numbers(),
        flow in "[a-z]{1,12}",
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let target = Arc::new(LoopbackTarget::new());
            let sender = sender(&target);
            let key = TransactionKey::parse("DEST1", &flow).unwrap();
            let payload =
                DocumentList::from_numbers("ORDERS05", numbers.iter().map(String::as_str));

            let outcome = sender.send(&key, &payload).await.unwrap();
            let report = outcome.report().unwrap();

            prop_assert!(!sender.store().contains(&key));
            prop_assert_eq!(sender.store().active_count(), 0);
            prop_assert_eq!(sender.tracker().tracked_count(), 0);
            prop_assert_eq!(
                target.posted_documents(key.destination()).await,
                numbers.clone()
            );
            prop_assert_eq!(report.final_state, TransactionState::Committed);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
