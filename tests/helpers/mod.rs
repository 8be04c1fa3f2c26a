//! Test helpers shared by the integration tests
//!
//! Provides key constructors, a scripted in-memory submit function and
//! LocalStack setup utilities.
#![allow(dead_code, unused_imports)]

pub use dynamo_batch::{
    BatchOutcome, Error, OperationKind, SubRequestKey, SubRequestResult, Submit, SubmitError,
    setup,
};

use aws_sdk_dynamodb::types::AttributeValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::{self, Future};
use std::sync::Mutex;
use tokio::sync::OnceCell;

/// Table name used by in-memory tests
pub const TABLE: &str = "items";

/// Read sub-request for item `id`
pub fn get(id: usize) -> SubRequestKey {
    SubRequestKey::new(TABLE, OperationKind::Get, [("id", id)]).unwrap()
}

/// Put sub-request for item `id`
pub fn put(id: usize) -> SubRequestKey {
    get(id).with_operation(OperationKind::Put)
}

/// Read sub-requests for every id
pub fn gets(ids: impl IntoIterator<Item = usize>) -> HashSet<SubRequestKey> {
    ids.into_iter().map(get).collect()
}

/// Deterministic result for a key: the item echoes the key
pub fn result_for(key: &SubRequestKey) -> SubRequestResult {
    match key.operation() {
        OperationKind::Get => SubRequestResult::item(key.to_attribute_map()),
        OperationKind::Put | OperationKind::Delete => SubRequestResult::acknowledged(),
    }
}

/// Outcome processing `done` (when submitted) and leaving every other
/// submitted key unprocessed
pub fn split(submitted: &HashSet<SubRequestKey>, done: &HashSet<SubRequestKey>) -> BatchOutcome {
    let mut outcome = BatchOutcome::new();
    for key in submitted {
        if done.contains(key) {
            let _ = outcome.processed.insert(key.clone(), result_for(key));
        } else {
            let _ = outcome.unprocessed.insert(key.clone());
        }
    }
    outcome
}

type Step = Box<dyn Fn(&HashSet<SubRequestKey>) -> Result<BatchOutcome, SubmitError> + Send + Sync>;

/// Submit function replaying a script, one step per call
///
/// Every call records the submitted keys. Once the script is exhausted the
/// fallback step is used.
pub struct ScriptedSubmit {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<HashSet<SubRequestKey>>>,
}

impl ScriptedSubmit {
    /// Script whose fallback processes everything
    pub fn new() -> Self {
        Self::with_fallback(|submitted| Ok(split(submitted, submitted)))
    }

    /// Script with a custom fallback step
    pub fn with_fallback(
        fallback: impl Fn(&HashSet<SubRequestKey>) -> Result<BatchOutcome, SubmitError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Append a step
    pub fn then(
        self,
        step: impl Fn(&HashSet<SubRequestKey>) -> Result<BatchOutcome, SubmitError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.steps.lock().unwrap().push_back(Box::new(step));
        self
    }

    /// Append a step processing exactly `done`
    pub fn then_process(self, done: HashSet<SubRequestKey>) -> Self {
        self.then(move |submitted| Ok(split(submitted, &done)))
    }

    /// Append a step failing with a retryable error
    pub fn then_retryable(self, message: &'static str) -> Self {
        self.then(move |_| Err(SubmitError::retryable(message)))
    }

    /// Append a step failing with a fatal error
    pub fn then_fatal(self, message: &'static str) -> Self {
        self.then(move |_| Err(SubmitError::fatal(message)))
    }

    /// Keys submitted on every call so far
    pub fn calls(&self) -> Vec<HashSet<SubRequestKey>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Submit for ScriptedSubmit {
    fn submit(
        &self,
        keys: HashSet<SubRequestKey>,
    ) -> impl Future<Output = Result<BatchOutcome, SubmitError>> + Send {
        let step = self.steps.lock().unwrap().pop_front();
        let result = match step {
            Some(step) => step(&keys),
            None => (self.fallback)(&keys),
        };
        self.calls.lock().unwrap().push(keys);
        future::ready(result)
    }
}

/// Ensure DynamoDB client is initialized for tests
static TEST_INIT: OnceCell<()> = OnceCell::const_new();

/// Initialize DynamoDB client for tests (idempotent)
pub async fn init_test_client() {
    TEST_INIT
        .get_or_init(|| async {
            // Trigger auto-initialization
            let _ = dynamo_batch::dynamodb_client().await;
        })
        .await;
}

/// Unique table name so LocalStack runs never collide
pub fn unique_table_name(name: &str) -> String {
    format!("{}_{}", name, rusty_ulid::generate_ulid_string().to_lowercase())
}

/// Item with a string partition key and a payload attribute
pub fn string_item(pk: &str, payload: &str) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("pk".to_string(), AttributeValue::S(pk.to_string())),
        ("payload".to_string(), AttributeValue::S(payload.to_string())),
    ])
}
