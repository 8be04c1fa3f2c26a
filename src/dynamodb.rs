//! `Submit` implementations backed by `aws-sdk-dynamodb`
//!
//! [`BatchGetSubmitter`] drives `BatchGetItem` and [`BatchWriteSubmitter`]
//! drives `BatchWriteItem`. Both translate the service's `UnprocessedKeys` /
//! `UnprocessedItems` back into [`SubRequestKey`]s and classify SDK errors
//! into retryable and fatal failures.

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::operation::batch_get_item::BatchGetItemOutput;
use aws_sdk_dynamodb::operation::batch_write_item::BatchWriteItemOutput;
use aws_sdk_dynamodb::types::{
    DeleteRequest, KeysAndAttributes, PutRequest, ReturnConsumedCapacity, WriteRequest,
};
use aws_smithy_runtime_api::client::result::SdkError;
use serde::Serialize;
use serde_dynamo::to_item;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;

use crate::error::{Error, SubmitError};
use crate::key::{KeySchema, OperationKind, SubRequestKey};
use crate::outcome::{BatchOutcome, ConsumedCapacity, Item, SubRequestResult};
use crate::policy::RetryPolicy;
use crate::reconciler::{DEFAULT_CONCURRENCY, Reconciled, Submit, reconcile_chunked};

/// Service error codes that mean "try again later"
const RETRYABLE_ERROR_CODES: [&str; 8] = [
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
    "LimitExceededException",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Check if a DynamoDB error code denotes a transient failure
pub fn is_retryable_error_code(code: &str) -> bool {
    RETRYABLE_ERROR_CODES.contains(&code)
}

/// Classify an SDK error for the reconciler
///
/// Throttling, internal server errors, timeouts, dispatch failures and
/// unparseable responses are retryable. Everything else (validation, access
/// denied, missing tables, request construction) is fatal.
pub fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> SubmitError
where
    E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    R: fmt::Debug + Send + Sync + 'static,
{
    let retryable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(context) => context.err().code().is_some_and(is_retryable_error_code),
        _ => false,
    };

    if retryable {
        SubmitError::retryable(err)
    } else {
        SubmitError::fatal(err)
    }
}

fn wrong_operation(key: &SubRequestKey, submitter: &str) -> SubmitError {
    SubmitError::fatal(format!("{submitter} cannot execute sub-request {key}"))
}

/// Key attribute names per table, taken from the submitted keys
fn key_names_by_table(submitted: &HashSet<SubRequestKey>) -> HashMap<&str, Vec<&str>> {
    let mut names: HashMap<&str, Vec<&str>> = HashMap::new();
    for key in submitted {
        let _ = names
            .entry(key.table_name())
            .or_insert_with(|| key.attribute_names().collect());
    }
    names
}

fn project_key(
    names: &HashMap<&str, Vec<&str>>,
    table: &str,
    operation: OperationKind,
    item: &Item,
) -> Result<SubRequestKey, SubmitError> {
    let table_names = names
        .get(table)
        .ok_or_else(|| SubmitError::fatal(format!("response mentions unrequested table '{table}'")))?;

    SubRequestKey::project(table, operation, table_names.iter().copied(), item)
        .map_err(SubmitError::fatal)
}

fn collect_capacity(
    outcome: &mut BatchOutcome,
    capacities: Option<Vec<aws_sdk_dynamodb::types::ConsumedCapacity>>,
) {
    outcome.consumed_capacity.extend(
        capacities
            .unwrap_or_default()
            .iter()
            .map(ConsumedCapacity::from),
    );
}

/// Executes `Get` sub-requests with `BatchGetItem`
#[derive(Clone, Debug)]
pub struct BatchGetSubmitter {
    client: Client,
    consistent_read: bool,
}

impl BatchGetSubmitter {
    /// Submitter over an explicit client, with eventually consistent reads
    pub fn new(client: Client) -> Self {
        Self {
            client,
            consistent_read: false,
        }
    }

    /// Submitter over the global client
    pub async fn from_global() -> Self {
        Self::new(crate::dynamodb_client().await.clone())
    }

    /// Use strongly consistent reads on every table
    pub fn consistent_read(mut self, consistent_read: bool) -> Self {
        self.consistent_read = consistent_read;
        self
    }

    fn request_items(
        &self,
        keys: &HashSet<SubRequestKey>,
    ) -> Result<HashMap<String, KeysAndAttributes>, SubmitError> {
        let mut by_table: HashMap<String, Vec<Item>> = HashMap::new();

        for key in keys {
            if key.operation() != OperationKind::Get {
                return Err(wrong_operation(key, "BatchGetItem"));
            }

            by_table
                .entry(key.table_name().to_string())
                .or_default()
                .push(key.to_attribute_map());
        }

        by_table
            .into_iter()
            .map(|(table, keys)| {
                KeysAndAttributes::builder()
                    .set_keys(Some(keys))
                    .consistent_read(self.consistent_read)
                    .build()
                    .map(|keys_and_attributes| (table, keys_and_attributes))
                    .map_err(SubmitError::fatal)
            })
            .collect()
    }
}

impl Submit for BatchGetSubmitter {
    fn submit(
        &self,
        keys: HashSet<SubRequestKey>,
    ) -> impl Future<Output = Result<BatchOutcome, SubmitError>> + Send {
        async move {
            let request_items = self.request_items(&keys)?;

            let output = self
                .client
                .batch_get_item()
                .set_request_items(Some(request_items))
                .return_consumed_capacity(ReturnConsumedCapacity::Total)
                .send()
                .await
                .map_err(classify_sdk_error)?;

            outcome_from_get_output(&keys, output)
        }
    }
}

/// Map a `BatchGetItem` response back onto the submitted keys
///
/// Returned items become [`SubRequestResult::item`], `UnprocessedKeys` become
/// unprocessed keys, and every other submitted key was read but does not
/// exist.
pub fn outcome_from_get_output(
    submitted: &HashSet<SubRequestKey>,
    output: BatchGetItemOutput,
) -> Result<BatchOutcome, SubmitError> {
    let names = key_names_by_table(submitted);
    let mut outcome = BatchOutcome::new();

    if let Some(unprocessed_keys) = output.unprocessed_keys {
        for (table, keys_and_attributes) in unprocessed_keys {
            for key_map in keys_and_attributes.keys {
                let key = project_key(&names, &table, OperationKind::Get, &key_map)?;
                let _ = outcome.unprocessed.insert(key);
            }
        }
    }

    if let Some(responses) = output.responses {
        for (table, items) in responses {
            for item in items {
                let key = project_key(&names, &table, OperationKind::Get, &item)?;
                let _ = outcome.processed.insert(key, SubRequestResult::item(item));
            }
        }
    }

    for key in submitted {
        if !outcome.processed.contains_key(key) && !outcome.unprocessed.contains(key) {
            let _ = outcome
                .processed
                .insert(key.clone(), SubRequestResult::not_found());
        }
    }

    collect_capacity(&mut outcome, output.consumed_capacity);

    Ok(outcome)
}

/// Executes `Put` and `Delete` sub-requests with `BatchWriteItem`
///
/// Put payloads are registered up front; the sub-request key identifies
/// which payload to send on every attempt.
#[derive(Clone, Debug)]
pub struct BatchWriteSubmitter {
    client: Client,
    puts: HashMap<SubRequestKey, Item>,
}

impl BatchWriteSubmitter {
    /// Submitter over an explicit client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            puts: HashMap::new(),
        }
    }

    /// Submitter over the global client
    pub async fn from_global() -> Self {
        Self::new(crate::dynamodb_client().await.clone())
    }

    /// Register an item to put, returning its sub-request key
    ///
    /// Registering the same key twice replaces the earlier payload.
    pub fn put_item(
        &mut self,
        table_name: impl Into<String>,
        schema: &KeySchema,
        item: Item,
    ) -> Result<SubRequestKey, Error> {
        let key = SubRequestKey::from_item(table_name, OperationKind::Put, schema, &item)?;
        let _ = self.puts.insert(key.clone(), item);
        Ok(key)
    }

    /// Serialize a value and register it as an item to put
    pub fn put<T: Serialize>(
        &mut self,
        table_name: impl Into<String>,
        schema: &KeySchema,
        value: &T,
    ) -> Result<SubRequestKey, Error> {
        let item = to_item::<_, Item>(value)?;
        self.put_item(table_name, schema, item)
    }

    /// Keys of every registered put
    pub fn put_keys(&self) -> impl Iterator<Item = &SubRequestKey> {
        self.puts.keys()
    }

    fn request_items(
        &self,
        keys: &HashSet<SubRequestKey>,
    ) -> Result<HashMap<String, Vec<WriteRequest>>, SubmitError> {
        let mut by_table: HashMap<String, Vec<WriteRequest>> = HashMap::new();

        for key in keys {
            let request = match key.operation() {
                OperationKind::Put => {
                    let item = self.puts.get(key).ok_or_else(|| {
                        SubmitError::fatal(format!("no payload registered for sub-request {key}"))
                    })?;

                    let put_request = PutRequest::builder()
                        .set_item(Some(item.clone()))
                        .build()
                        .map_err(SubmitError::fatal)?;

                    WriteRequest::builder()
                        .set_put_request(Some(put_request))
                        .build()
                }
                OperationKind::Delete => {
                    let delete_request = DeleteRequest::builder()
                        .set_key(Some(key.to_attribute_map()))
                        .build()
                        .map_err(SubmitError::fatal)?;

                    WriteRequest::builder()
                        .set_delete_request(Some(delete_request))
                        .build()
                }
                OperationKind::Get => return Err(wrong_operation(key, "BatchWriteItem")),
            };

            by_table
                .entry(key.table_name().to_string())
                .or_default()
                .push(request);
        }

        Ok(by_table)
    }
}

impl Submit for BatchWriteSubmitter {
    fn submit(
        &self,
        keys: HashSet<SubRequestKey>,
    ) -> impl Future<Output = Result<BatchOutcome, SubmitError>> + Send {
        async move {
            let request_items = self.request_items(&keys)?;

            let output = self
                .client
                .batch_write_item()
                .set_request_items(Some(request_items))
                .return_consumed_capacity(ReturnConsumedCapacity::Total)
                .send()
                .await
                .map_err(classify_sdk_error)?;

            outcome_from_write_output(&keys, output)
        }
    }
}

/// Map a `BatchWriteItem` response back onto the submitted keys
///
/// `UnprocessedItems` become unprocessed keys; every other submitted key was
/// applied.
pub fn outcome_from_write_output(
    submitted: &HashSet<SubRequestKey>,
    output: BatchWriteItemOutput,
) -> Result<BatchOutcome, SubmitError> {
    let names = key_names_by_table(submitted);
    let mut outcome = BatchOutcome::new();

    if let Some(unprocessed_items) = output.unprocessed_items {
        for (table, requests) in unprocessed_items {
            for request in requests {
                if let Some(put_request) = request.put_request {
                    let key = project_key(&names, &table, OperationKind::Put, &put_request.item)?;
                    let _ = outcome.unprocessed.insert(key);
                }

                if let Some(delete_request) = request.delete_request {
                    let key =
                        project_key(&names, &table, OperationKind::Delete, &delete_request.key)?;
                    let _ = outcome.unprocessed.insert(key);
                }
            }
        }
    }

    for key in submitted {
        if !outcome.unprocessed.contains(key) {
            let _ = outcome
                .processed
                .insert(key.clone(), SubRequestResult::acknowledged());
        }
    }

    collect_capacity(&mut outcome, output.consumed_capacity);

    Ok(outcome)
}

/// Batch retrieve any number of keys with the global client
///
/// Keys are chunked into calls of at most 100 and unprocessed keys are
/// retried under a fresh policy per chunk.
///
/// ```rust,no_run
/// use dynamo_batch::{ExponentialBackoff, OperationKind, SubRequestKey};
///
/// # async fn example() -> Result<(), dynamo_batch::Error> {
/// let keys = (0..250)
///     .map(|i| SubRequestKey::new("users", OperationKind::Get, [("user_id", format!("u{i}"))]))
///     .collect::<Result<Vec<_>, _>>()?;
///
/// let result = dynamo_batch::dynamodb::batch_get(keys, ExponentialBackoff::default).await?;
/// if !result.is_complete() {
///     println!("{} keys left unread", result.outcome.unprocessed_count());
/// }
/// # Ok(())
/// # }
/// ```
pub async fn batch_get<P, F>(
    keys: impl IntoIterator<Item = SubRequestKey>,
    make_policy: F,
) -> Result<Reconciled, Error>
where
    P: RetryPolicy,
    F: FnMut() -> P,
{
    let submitter = BatchGetSubmitter::from_global().await;
    reconcile_chunked(keys, &submitter, make_policy, DEFAULT_CONCURRENCY).await
}

/// Batch write every registered put plus `deletes`
///
/// Writes are chunked into calls of at most 25 and unprocessed items are
/// retried under a fresh policy per chunk.
pub async fn batch_write<P, F>(
    writer: &BatchWriteSubmitter,
    deletes: impl IntoIterator<Item = SubRequestKey>,
    make_policy: F,
) -> Result<Reconciled, Error>
where
    P: RetryPolicy,
    F: FnMut() -> P,
{
    let keys: Vec<SubRequestKey> = writer.put_keys().cloned().chain(deletes).collect();
    reconcile_chunked(keys, writer, make_policy, DEFAULT_CONCURRENCY).await
}
