//! Batch partial-failure reconciliation
//!
//! A batch call against a DynamoDB-style service may come back partially
//! processed. [`run`] keeps resubmitting only the unprocessed remainder,
//! merging partial results, until everything is processed, the retry policy
//! gives up, the caller cancels, or the submit function fails fatally.

use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};
use std::{cmp, fmt};
use tokio_stream::{self as stream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, SubmitError};
use crate::key::SubRequestKey;
use crate::outcome::{BatchOutcome, ConsumedCapacity, InvariantViolation, SubRequestResult};
use crate::policy::RetryPolicy;

/// Default number of chunks reconciled concurrently by [`reconcile_chunked`]
pub const DEFAULT_CONCURRENCY: usize = 10;

/// One attempt at executing a set of sub-requests
///
/// Implementations wrap the actual service call. They return every submitted
/// key either in `processed` or in `unprocessed`, and classify failures as
/// [`SubmitError::Retryable`] or [`SubmitError::Fatal`] instead of returning
/// them inline.
///
/// Closures `Fn(HashSet<SubRequestKey>) -> impl Future<Output = Result<..>>`
/// implement this trait.
pub trait Submit {
    /// Submit the keys as one batch call
    fn submit(
        &self,
        keys: HashSet<SubRequestKey>,
    ) -> impl Future<Output = Result<BatchOutcome, SubmitError>> + Send;
}

impl<F, Fut> Submit for F
where
    F: Fn(HashSet<SubRequestKey>) -> Fut,
    Fut: Future<Output = Result<BatchOutcome, SubmitError>> + Send,
{
    fn submit(
        &self,
        keys: HashSet<SubRequestKey>,
    ) -> impl Future<Output = Result<BatchOutcome, SubmitError>> + Send {
        self(keys)
    }
}

/// How a successful reconciliation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalState {
    /// Every sub-request was processed
    Complete,
    /// The retry policy stopped with sub-requests still pending
    Abandoned,
    /// The caller cancelled between attempts
    Cancelled,
}

impl TerminalState {
    fn severity(self) -> u8 {
        match self {
            Self::Complete => 0,
            Self::Abandoned => 1,
            Self::Cancelled => 2,
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Final result of a reconciled batch
///
/// Even a successful call may leave `outcome.unprocessed` non-empty when
/// the batch was abandoned or cancelled.
#[must_use = "reconciled batches may contain unprocessed sub-requests that should be checked"]
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    /// Accumulated results and remaining sub-requests
    pub outcome: BatchOutcome,
    /// How the batch ended
    pub state: TerminalState,
    /// Number of calls made to the submit function
    pub attempts: usize,
    /// Total execution time including all retries
    pub total_duration: Duration,
}

impl Reconciled {
    /// Check if every sub-request was processed
    pub fn is_complete(&self) -> bool {
        self.state == TerminalState::Complete
    }

    /// Number of retries made (0 means no retries needed)
    pub fn retry_count(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Mutable state of one logical batch call
///
/// Owned by a single [`run`]; `pending` and `accumulated` never share a key.
#[derive(Debug)]
struct BatchState {
    pending: HashSet<SubRequestKey>,
    accumulated: HashMap<SubRequestKey, SubRequestResult>,
    consumed_capacity: Vec<ConsumedCapacity>,
    attempts: usize,
    started: Instant,
}

impl BatchState {
    fn new(pending: HashSet<SubRequestKey>) -> Self {
        Self {
            pending,
            accumulated: HashMap::new(),
            consumed_capacity: Vec::new(),
            attempts: 0,
            started: Instant::now(),
        }
    }

    fn snapshot(&self) -> BatchOutcome {
        BatchOutcome {
            processed: self.accumulated.clone(),
            unprocessed: self.pending.clone(),
            consumed_capacity: self.consumed_capacity.clone(),
        }
    }

    fn into_outcome(self) -> BatchOutcome {
        BatchOutcome {
            processed: self.accumulated,
            unprocessed: self.pending,
            consumed_capacity: self.consumed_capacity,
        }
    }

    fn finish(self, state: TerminalState) -> Reconciled {
        let attempts = self.attempts;
        let total_duration = self.started.elapsed();
        Reconciled {
            outcome: self.into_outcome(),
            state,
            attempts,
            total_duration,
        }
    }

    /// Merge one attempt's outcome; `pending` must still be the submitted set
    ///
    /// Validation happens before any mutation, so on error the state (and
    /// the partial outcome attached to the error) is exactly as it was
    /// before the attempt.
    fn absorb(&mut self, outcome: BatchOutcome) -> Result<(), Error> {
        if let Some(key) = outcome
            .processed
            .keys()
            .find(|key| self.accumulated.contains_key(*key))
        {
            return Err(Error::DuplicateResultConflict {
                key: Box::new(key.clone()),
                partial: Box::new(self.snapshot()),
            });
        }

        let missing = outcome
            .check_against(&self.pending)
            .map_err(|violation| match violation {
                InvariantViolation::Overlap(key) => Error::DuplicateResultConflict {
                    key: Box::new(key),
                    partial: Box::new(self.snapshot()),
                },
                InvariantViolation::Unexpected(key) => Error::UnexpectedSubRequest {
                    key: Box::new(key),
                    partial: Box::new(self.snapshot()),
                },
            })?;

        if !missing.is_empty() {
            tracing::warn!(
                missing = missing.len(),
                first = %missing[0],
                "submit omitted sub-requests from its outcome, treating them as unprocessed"
            );
        }

        let BatchOutcome {
            processed,
            unprocessed,
            consumed_capacity,
        } = outcome;

        self.accumulated.extend(processed);
        self.pending = unprocessed;
        self.pending.extend(missing);
        self.consumed_capacity.extend(consumed_capacity);
        Ok(())
    }
}

/// Drives a batch to completion under a retry policy
///
/// ```rust,no_run
/// use dynamo_batch::{BatchOutcome, ExponentialBackoff, Reconciler, SubRequestKey, SubmitError};
/// use std::collections::HashSet;
/// use dynamo_batch::CancellationToken;
///
/// # async fn example(keys: Vec<SubRequestKey>) -> Result<(), dynamo_batch::Error> {
/// let cancel = CancellationToken::new();
/// let mut reconciler = Reconciler::new(ExponentialBackoff::dynamodb_default())
///     .with_cancellation(cancel.clone());
///
/// let submit = |keys: HashSet<SubRequestKey>| async move {
///     // Call the service here
///     Ok::<_, SubmitError>(BatchOutcome::all_unprocessed(keys))
/// };
///
/// let result = reconciler.run(keys, &submit).await?;
/// println!("{} processed, {} left", result.outcome.processed_count(), result.outcome.unprocessed_count());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Reconciler<P> {
    policy: P,
    cancellation: Option<CancellationToken>,
}

impl<P: RetryPolicy> Reconciler<P> {
    /// Create a reconciler with the given retry policy
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            cancellation: None,
        }
    }

    /// Stop between attempts once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The retry policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Reconcile one batch, see [`run`]
    pub async fn run<S: Submit>(
        &mut self,
        initial_keys: impl IntoIterator<Item = SubRequestKey>,
        submit: &S,
    ) -> Result<Reconciled, Error> {
        drive(
            initial_keys,
            submit,
            &mut self.policy,
            self.cancellation.as_ref(),
        )
        .await
    }
}

/// Reconcile one batch
///
/// Submits `initial_keys`, merges processed results and resubmits only the
/// unprocessed remainder for as long as `policy` allows. The policy is
/// consulted after every attempt that leaves sub-requests pending, including
/// the first. A [`SubmitError::Retryable`] failure counts as an attempt that
/// processed nothing.
///
/// The reconciler does not chunk: `initial_keys` must already respect the
/// service's per-call limit (see [`reconcile_chunked`]).
///
/// Errors carry the partial outcome accumulated so far, see
/// [`Error::partial`].
pub async fn run<S, P>(
    initial_keys: impl IntoIterator<Item = SubRequestKey>,
    submit: &S,
    policy: &mut P,
) -> Result<Reconciled, Error>
where
    S: Submit,
    P: RetryPolicy,
{
    drive(initial_keys, submit, policy, None).await
}

async fn drive<S, P>(
    initial_keys: impl IntoIterator<Item = SubRequestKey>,
    submit: &S,
    policy: &mut P,
    cancellation: Option<&CancellationToken>,
) -> Result<Reconciled, Error>
where
    S: Submit,
    P: RetryPolicy,
{
    let mut state = BatchState::new(initial_keys.into_iter().collect());

    if state.pending.is_empty() {
        return Err(Error::EmptyBatch);
    }

    loop {
        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            tracing::info!(
                attempts = state.attempts,
                processed = state.accumulated.len(),
                pending = state.pending.len(),
                "batch cancelled"
            );
            return Ok(state.finish(TerminalState::Cancelled));
        }

        let attempt = state.attempts + 1;
        let submitted = state.pending.len();

        match submit.submit(state.pending.clone()).await {
            Ok(outcome) => {
                tracing::debug!(
                    attempt,
                    submitted,
                    processed = outcome.processed.len(),
                    unprocessed = outcome.unprocessed.len(),
                    "batch attempt finished"
                );
                state.absorb(outcome)?;
            }
            Err(SubmitError::Retryable(source)) => {
                tracing::debug!(
                    attempt,
                    submitted,
                    error = %source,
                    "batch attempt failed with a retryable error"
                );
            }
            Err(SubmitError::Fatal(source)) => {
                tracing::warn!(
                    attempt,
                    submitted,
                    processed = state.accumulated.len(),
                    error = %source,
                    "batch attempt failed with a fatal error"
                );
                return Err(Error::Fatal {
                    source,
                    partial: Box::new(state.into_outcome()),
                    attempts: attempt,
                });
            }
        }

        state.attempts = attempt;

        if state.pending.is_empty() {
            tracing::debug!(
                attempts = state.attempts,
                processed = state.accumulated.len(),
                "batch complete"
            );
            return Ok(state.finish(TerminalState::Complete));
        }

        let pending = state.pending.len();
        let retry = match cancellation {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => None,
                retry = policy.should_retry(state.attempts, pending) => Some(retry),
            },
            None => Some(policy.should_retry(state.attempts, pending).await),
        };

        match retry {
            Some(true) => {}
            Some(false) => {
                tracing::warn!(
                    attempts = state.attempts,
                    processed = state.accumulated.len(),
                    pending,
                    "retry policy gave up with sub-requests still pending"
                );
                return Ok(state.finish(TerminalState::Abandoned));
            }
            None => {
                tracing::info!(
                    attempts = state.attempts,
                    processed = state.accumulated.len(),
                    pending,
                    "batch cancelled during backoff"
                );
                return Ok(state.finish(TerminalState::Cancelled));
            }
        }
    }
}

/// Split keys into per-call chunks: reads and writes apart, each within its
/// service limit
///
/// Duplicate keys collapse into one sub-request. A put and a delete of the
/// same item never share a chunk, since `BatchWriteItem` rejects a request
/// touching one item twice; the two run as separate calls in no particular
/// order.
pub fn chunk_keys(keys: impl IntoIterator<Item = SubRequestKey>) -> Vec<Vec<SubRequestKey>> {
    let mut by_class: BTreeMap<bool, Vec<SubRequestKey>> = BTreeMap::new();

    let unique: BTreeSet<SubRequestKey> = keys.into_iter().collect();
    for key in unique {
        by_class
            .entry(key.operation().is_write())
            .or_default()
            .push(key);
    }

    let mut chunks = Vec::new();
    for (_, keys) in by_class {
        let first_chunk = chunks.len();

        for key in keys {
            let limit = key.operation().batch_limit();
            let slot = chunks[first_chunk..].iter().position(|chunk: &Vec<SubRequestKey>| {
                chunk.len() < limit && !chunk.iter().any(|other| other.same_item(&key))
            });

            match slot {
                Some(index) => chunks[first_chunk + index].push(key),
                None => chunks.push(vec![key]),
            }
        }
    }

    chunks
}

/// Reconcile an arbitrarily large set of keys
///
/// Keys are chunked with [`chunk_keys`] and up to `concurrency` chunks are
/// reconciled at once, each under a fresh policy from `make_policy`. The
/// merged result is `Complete` only if every chunk completed; `attempts` is
/// the largest attempt count of any chunk.
///
/// The first chunk error cancels the other chunks. Chunks in flight finish
/// their current submit and stop between attempts; chunks not yet started
/// never submit. Everything they processed is merged into the error's partial
/// outcome and every other key is reported unprocessed.
pub async fn reconcile_chunked<S, P, F>(
    keys: impl IntoIterator<Item = SubRequestKey>,
    submit: &S,
    mut make_policy: F,
    concurrency: usize,
) -> Result<Reconciled, Error>
where
    S: Submit,
    P: RetryPolicy,
    F: FnMut() -> P,
{
    let started = Instant::now();
    let chunks = chunk_keys(keys);

    if chunks.is_empty() {
        return Err(Error::EmptyBatch);
    }

    let all_keys: Vec<SubRequestKey> = chunks.iter().flatten().cloned().collect();
    let concurrency = cmp::max(1, chunks.len().min(concurrency));
    let abort = CancellationToken::new();

    tracing::debug!(
        sub_requests = all_keys.len(),
        chunks = chunks.len(),
        concurrency,
        "reconciling chunked batch"
    );

    let runs = chunks.into_iter().map(|chunk| {
        let mut reconciler = Reconciler::new(make_policy()).with_cancellation(abort.clone());
        async move { reconciler.run(chunk, submit).await }
    });

    let mut results = stream::iter(runs).buffer_unordered(concurrency);

    let mut merged = Reconciled {
        outcome: BatchOutcome::new(),
        state: TerminalState::Complete,
        attempts: 0,
        total_duration: Duration::ZERO,
    };
    let mut failure: Option<Error> = None;

    while let Some(result) = results.next().await {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(err) if failure.is_none() => {
                tracing::warn!(error = %err, "chunk failed, cancelling remaining chunks");
                abort.cancel();
                failure = Some(err);
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "another chunk failed while draining");
                if let Some(partial) = err.into_partial() {
                    if let Err(key) = merged.outcome.merge(partial) {
                        tracing::warn!(%key, "sub-request reported by two chunks");
                    }
                }
                continue;
            }
        };

        if chunk.state.severity() > merged.state.severity() {
            merged.state = chunk.state;
        }
        merged.attempts = merged.attempts.max(chunk.attempts);

        if let Err(key) = merged.outcome.merge(chunk.outcome) {
            if failure.is_none() {
                abort.cancel();
                failure = Some(Error::DuplicateResultConflict {
                    key: Box::new(key),
                    partial: Box::default(),
                });
            }
        }
    }

    if let Some(err) = failure {
        let finished = merged.outcome;
        return Err(err.map_partial(|partial| {
            if let Err(key) = partial.merge(finished) {
                tracing::warn!(%key, "sub-request reported by two chunks");
            }
            for key in &all_keys {
                if !partial.processed.contains_key(key) {
                    let _ = partial.unprocessed.insert(key.clone());
                }
            }
        }));
    }

    merged.total_duration = started.elapsed();
    Ok(merged)
}
