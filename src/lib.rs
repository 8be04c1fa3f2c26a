//! # DynamoDB Batch Reconciler
//!
//! `BatchGetItem` and `BatchWriteItem` may process only part of a request and
//! hand the rest back as `UnprocessedKeys` / `UnprocessedItems`. This crate
//! resubmits exactly that remainder until the whole batch is processed, the
//! retry policy gives up, or the caller cancels, and merges the partial
//! results into one [`BatchOutcome`].
//!
//! - **Service agnostic core**: [`run`] drives any [`Submit`] implementation
//! - **Pluggable retry policies**: [`MaxAttempts`], [`ExponentialBackoff`], [`Unlimited`] or a closure
//! - **Chunking**: [`reconcile_chunked`] splits large batches into 100 reads / 25 writes per call
//! - **DynamoDB adapter**: [`BatchGetSubmitter`] and [`BatchWriteSubmitter`]
//! - **Partial results on failure**: every error raised mid-batch carries what was processed
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dynamo_batch::{BatchGetSubmitter, ExponentialBackoff, Error, OperationKind, Reconciler, SubRequestKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let keys = vec![
//!         SubRequestKey::new("users", OperationKind::Get, [("user_id", "u1")])?,
//!         SubRequestKey::new("users", OperationKind::Get, [("user_id", "u2")])?,
//!     ];
//!
//!     let submitter = BatchGetSubmitter::from_global().await;
//!     let mut reconciler = Reconciler::new(ExponentialBackoff::default());
//!     let result = reconciler.run(keys, &submitter).await?;
//!
//!     for (key, item) in result.outcome.items() {
//!         println!("{key}: {item:?}");
//!     }
//!     if !result.is_complete() {
//!         println!("gave up on {} keys", result.outcome.unprocessed_count());
//!     }
//!
//!     Ok(())
//! }
//! ```
#![deny(
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    deprecated,
    unknown_lints,
    unreachable_code,
    unused_mut
)]

mod error;
pub use error::{BoxError, Error, SubmitError};

mod key;
pub use key::{
    BATCH_READ_SIZE, BATCH_WRITE_SIZE, KeySchema, KeyValue, Number, OperationKind, SubRequestKey,
    SubRequestKeyBuilder,
};

mod outcome;
pub use outcome::{
    BatchOutcome, ConsumedCapacity, InvariantViolation, Item, ResultPayload, SubRequestResult,
};

mod policy;
pub use policy::{ExponentialBackoff, MaxAttempts, RetryPolicy, Unlimited};

mod reconciler;
pub use reconciler::{
    DEFAULT_CONCURRENCY, Reconciled, Reconciler, Submit, TerminalState, chunk_keys,
    reconcile_chunked, run,
};

pub mod dynamodb;
pub use dynamodb::{BatchGetSubmitter, BatchWriteSubmitter};

/// Table setup utilities for testing
pub mod setup;

// Re-export aws-config types for configuration
pub use aws_config::{
    BehaviorVersion, Region, SdkConfig, defaults,
    meta::region::{ProvideRegion, RegionProviderChain},
    retry::{RetryConfig, RetryMode},
    timeout::TimeoutConfig,
};

// Re-export aws-types for advanced configuration
pub use aws_types::sdk_config::Builder as SdkConfigBuilder;

// Re-export the cancellation token accepted by `Reconciler::with_cancellation`
pub use tokio_util::sync::CancellationToken;

use aws_sdk_dynamodb::Client as DynamoDbClient;
use tokio::sync::OnceCell;

/// Global DynamoDB client instance
static GLOBAL_CLIENT: OnceCell<DynamoDbClient> = OnceCell::const_new();

/// Initialize the global DynamoDB client with default sensible settings
///
/// This is called automatically by `dynamodb_client()` if not already initialized.
/// It configures:
/// - Adaptive retry mode with 3 max attempts
/// - Exponential backoff starting at 1 second
/// - Connect timeout: 3 seconds
/// - Read timeout: 20 seconds
/// - Operation timeout: 60 seconds
/// - LocalStack support via AWS_PROFILE=localstack
///
/// The SDK retry layer covers throttled or failed *calls*; unprocessed
/// sub-requests of a successful call are left to the retry policy of the
/// reconciler.
async fn aws_config_defaults() -> SdkConfig {
    use aws_config::BehaviorVersion;
    use aws_types::sdk_config::{RetryConfig, TimeoutConfig};
    use std::time::Duration;

    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(Duration::from_secs(3))
        .read_timeout(Duration::from_secs(20))
        .operation_timeout(Duration::from_secs(60))
        .build();

    let mut loader = defaults(BehaviorVersion::latest())
        .retry_config(
            RetryConfig::adaptive()
                .with_max_attempts(3)
                .with_initial_backoff(Duration::from_secs(1)),
        )
        .timeout_config(timeout_config);

    // Support LocalStack via AWS_PROFILE=localstack
    if std::env::var("AWS_PROFILE").unwrap_or_default() == "localstack" {
        loader = loader.endpoint_url("http://127.0.0.1:4566");
    }

    loader.load().await
}

/// Initialize the global DynamoDB client with a custom AWS config
///
/// Use this when you need custom AWS configuration beyond the defaults.
/// Has no effect once the client exists.
///
/// # Example
///
/// ```rust,no_run
/// #[tokio::main]
/// async fn main() {
///     let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
///         .region(aws_config::Region::new("us-west-2"))
///         .load()
///         .await;
///     dynamo_batch::init(&config).await;
///
///     // Submitters created from now on share this client
/// }
/// ```
pub async fn init(config: &SdkConfig) {
    let _ = GLOBAL_CLIENT
        .get_or_init(|| async { DynamoDbClient::new(config) })
        .await;
}

/// Initialize the global DynamoDB client with a custom client instance
///
/// Useful for testing or when you need fine-grained control over client configuration.
///
/// # Example
///
/// ```rust,no_run
/// use aws_sdk_dynamodb::Client;
///
/// #[tokio::main]
/// async fn main() {
///     let config = aws_config::load_from_env().await;
///     let client = Client::new(&config);
///     dynamo_batch::init_with_client(client).await;
/// }
/// ```
pub async fn init_with_client(client: DynamoDbClient) {
    let _ = GLOBAL_CLIENT.get_or_init(|| async { client }).await;
}

/// Get a reference to the global DynamoDB client
///
/// Automatically initializes the client with sensible defaults if not already initialized.
/// For custom configuration, call [`init`] or [`init_with_client`] before using this function.
///
/// # Auto-Initialization
///
/// If not explicitly initialized, this function will automatically configure:
/// - Adaptive retry mode with 3 max attempts
/// - Exponential backoff starting at 1 second
/// - Connect timeout: 3 seconds
/// - Read timeout: 20 seconds
/// - Operation timeout: 60 seconds
/// - LocalStack support via AWS_PROFILE=localstack
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() {
/// // Client auto-initializes with defaults on first use
/// let client = dynamo_batch::dynamodb_client().await;
/// // Use client for custom operations
/// # }
/// ```
///
/// # Custom Configuration Example
///
/// ```rust,no_run
/// # async fn example() {
/// // Initialize with custom config before first use
/// let config = dynamo_batch::defaults(dynamo_batch::BehaviorVersion::latest())
///     .region(dynamo_batch::Region::new("us-west-2"))
///     .load()
///     .await;
/// dynamo_batch::init(&config).await;
///
/// // Now uses custom configuration
/// let client = dynamo_batch::dynamodb_client().await;
/// # }
/// ```
pub async fn dynamodb_client() -> &'static DynamoDbClient {
    GLOBAL_CLIENT
        .get_or_init(|| async {
            let config = aws_config_defaults().await;
            DynamoDbClient::new(&config)
        })
        .await
}
