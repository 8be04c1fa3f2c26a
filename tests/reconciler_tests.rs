/// Reconciler Tests
///
/// Drives the reconciler against scripted in-memory submit functions and
/// checks how partial results are merged, retried and reported.
use dynamo_batch::{
    BATCH_READ_SIZE, BATCH_WRITE_SIZE, CancellationToken, ExponentialBackoff, MaxAttempts,
    Reconciler, TerminalState, Unlimited, reconcile_chunked, run,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod helpers;
use helpers::*;

/// A batch the service fully processes finishes after one attempt
#[tokio::test]
async fn test_complete_in_one_attempt() {
    let submit = ScriptedSubmit::new();
    let keys = gets(0..5);

    let result = run(keys.clone(), &submit, &mut MaxAttempts(3)).await.unwrap();

    assert_eq!(result.state, TerminalState::Complete);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.retry_count(), 0);
    assert!(result.outcome.unprocessed.is_empty());
    assert_eq!(
        result.outcome.processed.keys().cloned().collect::<HashSet<_>>(),
        keys
    );
    for key in &keys {
        assert_eq!(result.outcome.processed[key], result_for(key));
    }
    assert_eq!(submit.call_count(), 1);
}

/// Only the unprocessed remainder is resubmitted
#[tokio::test]
async fn test_resubmits_only_the_remainder() {
    let (k1, k2, k3) = (get(1), get(2), get(3));

    let submit = ScriptedSubmit::new()
        .then_process(HashSet::from([k1.clone()]))
        .then_process(HashSet::from([k2.clone()]))
        .then_process(HashSet::from([k3.clone()]));

    let result = run([k1.clone(), k2.clone(), k3.clone()], &submit, &mut Unlimited)
        .await
        .unwrap();

    assert_eq!(result.state, TerminalState::Complete);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.outcome.processed_count(), 3);
    assert_eq!(result.outcome.processed[&k2], result_for(&k2));

    assert_eq!(
        submit.calls(),
        vec![
            HashSet::from([k1, k2.clone(), k3.clone()]),
            HashSet::from([k2, k3.clone()]),
            HashSet::from([k3]),
        ]
    );
}

/// A batch that never makes progress is abandoned after exactly the allowed attempts
#[tokio::test]
async fn test_abandoned_after_max_attempts() {
    let submit = ScriptedSubmit::with_fallback(|submitted| Ok(split(submitted, &HashSet::new())));

    let result = run([get(1)], &submit, &mut MaxAttempts(3)).await.unwrap();

    assert_eq!(result.state, TerminalState::Abandoned);
    assert!(!result.is_complete());
    assert_eq!(result.attempts, 3);
    assert_eq!(submit.call_count(), 3);
    assert!(result.outcome.processed.is_empty());
    assert_eq!(result.outcome.unprocessed, gets([1]));
}

/// A fatal error carries every result accumulated before it
#[tokio::test]
async fn test_fatal_error_carries_partial_outcome() {
    let (k1, k2) = (get(1), get(2));

    let submit = ScriptedSubmit::new()
        .then_process(HashSet::from([k1.clone()]))
        .then_fatal("validation failed");

    let err = run([k1.clone(), k2.clone()], &submit, &mut Unlimited)
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert!(err.to_string().contains("validation failed"));

    match err {
        Error::Fatal {
            partial, attempts, ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(partial.processed.len(), 1);
            assert_eq!(partial.processed[&k1], result_for(&k1));
            assert_eq!(partial.unprocessed, HashSet::from([k2]));
        }
        other => panic!("expected a fatal error, got {other:?}"),
    }
    assert_eq!(submit.call_count(), 2);
}

/// Retryable failures count as attempts and resubmit the whole pending set
#[tokio::test]
async fn test_retryable_error_resubmits_pending_set() {
    let keys = gets(0..3);

    let submit = ScriptedSubmit::new()
        .then_retryable("throttled")
        .then_retryable("throttled");

    let result = run(keys.clone(), &submit, &mut MaxAttempts(5))
        .await
        .unwrap();

    assert_eq!(result.state, TerminalState::Complete);
    assert_eq!(result.attempts, 3);
    assert_eq!(submit.calls(), vec![keys.clone(), keys.clone(), keys]);
}

/// Retryable failures on every attempt end in Abandoned, not an error
#[tokio::test]
async fn test_retryable_errors_exhaust_policy() {
    let submit = ScriptedSubmit::with_fallback(|_| Err(SubmitError::retryable("throttled")));

    let result = run(gets(0..2), &submit, &mut MaxAttempts(2)).await.unwrap();

    assert_eq!(result.state, TerminalState::Abandoned);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.outcome.unprocessed, gets(0..2));
}

/// The same deterministic service yields the same outcome twice
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let script = || {
        ScriptedSubmit::new()
            .then_process(gets([0, 2, 4]))
            .then_process(gets([1]))
    };

    let first = run(gets(0..5), &script(), &mut MaxAttempts(2))
        .await
        .unwrap();
    let second = run(gets(0..5), &script(), &mut MaxAttempts(2))
        .await
        .unwrap();

    assert_eq!(first.state, TerminalState::Abandoned);
    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.attempts, second.attempts);
    assert_eq!(first.outcome.unprocessed, gets([3]));
}

/// Extra retry headroom does not change a batch that completes
#[tokio::test]
async fn test_completed_batch_ignores_policy_headroom() {
    let script = || {
        ScriptedSubmit::new()
            .then_process(gets([0, 2, 4]))
            .then_process(gets([1]))
    };

    let mut outcomes = Vec::new();

    let submit = script();
    let result = run(gets(0..5), &submit, &mut MaxAttempts(3)).await.unwrap();
    outcomes.push((result, submit.call_count()));

    let submit = script();
    let result = run(gets(0..5), &submit, &mut MaxAttempts(10)).await.unwrap();
    outcomes.push((result, submit.call_count()));

    let submit = script();
    let result = run(gets(0..5), &submit, &mut Unlimited).await.unwrap();
    outcomes.push((result, submit.call_count()));

    for (result, calls) in &outcomes {
        assert_eq!(result.state, TerminalState::Complete);
        assert_eq!(result.attempts, 3);
        assert_eq!(*calls, 3);
        assert_eq!(result.outcome, outcomes[0].0.outcome);
        assert_eq!(result.outcome.processed_count(), 5);
    }
}

/// Keys the submit function forgets to report are retried
#[tokio::test]
async fn test_omitted_keys_stay_pending() {
    let submit = ScriptedSubmit::new().then(|_| Ok(BatchOutcome::new()));

    let result = run(gets(0..3), &submit, &mut MaxAttempts(2)).await.unwrap();

    assert_eq!(result.state, TerminalState::Complete);
    assert_eq!(result.attempts, 2);
    assert_eq!(submit.calls()[1], gets(0..3));
}

/// Reporting an already processed key again is a conflict
#[tokio::test]
async fn test_duplicate_result_conflict() {
    let (k1, k2) = (get(1), get(2));
    let again = k1.clone();

    let submit = ScriptedSubmit::new()
        .then_process(HashSet::from([k1.clone()]))
        .then(move |submitted| {
            Ok(split(submitted, submitted).with_processed(again.clone(), result_for(&again)))
        });

    let err = run([k1.clone(), k2.clone()], &submit, &mut Unlimited)
        .await
        .unwrap_err();

    assert!(err.is_invariant_violation());
    match err {
        Error::DuplicateResultConflict { key, partial } => {
            assert_eq!(*key, k1);
            assert_eq!(partial.processed.len(), 1);
            assert_eq!(partial.unprocessed, HashSet::from([k2]));
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
}

/// A key reported both processed and unprocessed is a conflict
#[tokio::test]
async fn test_overlapping_outcome_is_a_conflict() {
    let submit = ScriptedSubmit::new().then(|submitted| {
        let mut outcome = split(submitted, submitted);
        outcome.unprocessed.extend(submitted.iter().cloned());
        Ok(outcome)
    });

    let err = run(gets([1]), &submit, &mut Unlimited).await.unwrap_err();

    assert!(matches!(err, Error::DuplicateResultConflict { .. }));
    assert_eq!(err.partial().map(BatchOutcome::processed_count), Some(0));
}

/// Results for keys that were never submitted are rejected
#[tokio::test]
async fn test_unexpected_sub_request() {
    let submit = ScriptedSubmit::new().then(|submitted| {
        let stranger = get(99);
        Ok(split(submitted, submitted).with_processed(stranger.clone(), result_for(&stranger)))
    });

    let err = run(gets([1]), &submit, &mut Unlimited).await.unwrap_err();

    match err {
        Error::UnexpectedSubRequest { key, partial } => {
            assert_eq!(*key, get(99));
            assert!(partial.processed.is_empty());
            assert_eq!(partial.unprocessed, gets([1]));
        }
        other => panic!("expected an unexpected sub-request error, got {other:?}"),
    }
}

/// Starting without keys is an error, not an empty success
#[tokio::test]
async fn test_empty_batch() {
    let submit = ScriptedSubmit::new();

    let err = run(Vec::new(), &submit, &mut Unlimited).await.unwrap_err();

    assert!(matches!(err, Error::EmptyBatch));
    assert!(err.partial().is_none());
    assert_eq!(submit.call_count(), 0);
}

/// The policy sees the attempt count and the pending count after every attempt
#[tokio::test]
async fn test_policy_receives_progress() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let mut policy = move |attempts: usize, pending: usize| {
        recorded.lock().unwrap().push((attempts, pending));
        true
    };

    let submit = ScriptedSubmit::new()
        .then_process(gets([0]))
        .then_process(gets([1]));

    let result = run(gets(0..3), &submit, &mut policy).await.unwrap();

    assert!(result.is_complete());
    assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 1)]);
}

/// A cancelled token stops the batch before the first attempt
#[tokio::test]
async fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();

    let submit = ScriptedSubmit::new();
    let mut reconciler = Reconciler::new(Unlimited).with_cancellation(token);

    let result = reconciler.run(gets(0..3), &submit).await.unwrap();

    assert_eq!(result.state, TerminalState::Cancelled);
    assert_eq!(result.attempts, 0);
    assert_eq!(result.outcome.unprocessed, gets(0..3));
    assert_eq!(submit.call_count(), 0);
}

/// Cancelling during backoff returns the split reached so far
#[tokio::test(start_paused = true)]
async fn test_cancelled_during_backoff() {
    let token = CancellationToken::new();
    let submit = ScriptedSubmit::with_fallback(|submitted| Ok(split(submitted, &gets([1]))));

    let policy = ExponentialBackoff::new(10, Duration::from_secs(60), Duration::from_secs(60));
    let mut reconciler = Reconciler::new(policy).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let result = reconciler.run(gets(1..3), &submit).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(result.state, TerminalState::Cancelled);
    assert_eq!(result.attempts, 1);
    assert_eq!(submit.call_count(), 1);
    assert_eq!(result.outcome.processed_count(), 1);
    assert_eq!(result.outcome.unprocessed, gets([2]));
    assert!(result.total_duration < Duration::from_secs(60));
}

/// Chunks respect per-call limits and never mix reads with writes
#[tokio::test]
async fn test_reconcile_chunked_respects_limits() {
    let submit = ScriptedSubmit::new();
    let mut keys: Vec<SubRequestKey> = (0..250).map(get).collect();
    keys.extend((0..30).map(put));

    let result = reconcile_chunked(keys.clone(), &submit, || MaxAttempts(3), 4)
        .await
        .unwrap();

    assert_eq!(result.state, TerminalState::Complete);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.outcome.processed_count(), 280);

    let calls = submit.calls();
    assert_eq!(calls.len(), 5);
    for call in &calls {
        let writes = call.iter().filter(|key| key.operation().is_write()).count();
        if writes == 0 {
            assert!(call.len() <= BATCH_READ_SIZE);
        } else {
            assert_eq!(writes, call.len());
            assert!(call.len() <= BATCH_WRITE_SIZE);
        }
    }
}

/// One abandoned chunk makes the merged batch abandoned
#[tokio::test]
async fn test_reconcile_chunked_merges_abandoned_chunk() {
    let submit = ScriptedSubmit::with_fallback(|submitted| {
        let reads: HashSet<SubRequestKey> = submitted
            .iter()
            .filter(|key| !key.operation().is_write())
            .cloned()
            .collect();
        Ok(split(submitted, &reads))
    });

    let mut keys: Vec<SubRequestKey> = (0..10).map(get).collect();
    keys.extend((0..5).map(put));

    let result = reconcile_chunked(keys, &submit, || MaxAttempts(2), 2)
        .await
        .unwrap();

    assert_eq!(result.state, TerminalState::Abandoned);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.outcome.processed_count(), 10);
    assert_eq!(
        result.outcome.unprocessed,
        (0..5).map(put).collect::<HashSet<_>>()
    );
}

/// A fatal chunk still reports every key, processed or not
#[tokio::test]
async fn test_reconcile_chunked_fatal_accounts_for_every_key() {
    let submit = ScriptedSubmit::with_fallback(|submitted| {
        if submitted.iter().any(|key| key.operation().is_write()) {
            Err(SubmitError::fatal("access denied"))
        } else {
            Ok(split(submitted, submitted))
        }
    });

    let mut keys: Vec<SubRequestKey> = (0..120).map(get).collect();
    keys.extend((0..60).map(put));

    let err = reconcile_chunked(keys.clone(), &submit, || MaxAttempts(1), 1)
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    let partial = err.into_partial().unwrap();

    assert_eq!(partial.processed_count(), 120);
    assert_eq!(partial.total_requested(), keys.len());
    assert!(partial.unprocessed.iter().all(|key| key.operation().is_write()));

    // Two read chunks and the failing write chunk; later write chunks never start
    assert_eq!(submit.call_count(), 3);
}

/// Chunks in flight when another chunk fails keep what they processed
#[tokio::test(start_paused = true)]
async fn test_reconcile_chunked_fatal_keeps_in_flight_progress() {
    let submit = ScriptedSubmit::with_fallback(|submitted| {
        if submitted.iter().any(|key| key.operation().is_write()) {
            Err(SubmitError::fatal("access denied"))
        } else {
            Ok(split(submitted, &gets([0])))
        }
    });

    let keys = vec![get(0), get(1), put(0)];
    let policy = || ExponentialBackoff::new(5, Duration::from_secs(10), Duration::from_secs(10));

    let err = reconcile_chunked(keys, &submit, policy, 2)
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    let partial = err.into_partial().unwrap();

    assert!(partial.processed.contains_key(&get(0)));
    assert_eq!(partial.processed_count(), 1);
    assert_eq!(partial.unprocessed, HashSet::from([get(1), put(0)]));

    // The read chunk stopped in its backoff instead of retrying
    assert_eq!(submit.call_count(), 2);
}
