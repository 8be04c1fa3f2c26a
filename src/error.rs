use aws_sdk_dynamodb::error::BuildError;
use aws_sdk_dynamodb::operation::create_table::CreateTableError;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use serde_dynamo::Error as SerdeDynamoError;
use std::error::Error as StdError;
use thiserror::Error;

use crate::key::SubRequestKey;
use crate::outcome::BatchOutcome;

type DynamoCreateTableError = SdkError<CreateTableError, Response>;

/// Boxed source error carried by submit failures
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Batch reconciliation error
///
/// Every variant raised while a batch is running carries the partial
/// [`BatchOutcome`] accumulated up to the failure, see [`Error::partial`].
#[derive(Debug, Error)]
pub enum Error {
    /// A sub-request key does not match the table's primary key schema
    #[error("invalid key schema for table '{table}': {reason}")]
    InvalidKeySchema {
        /// Table the key was built for
        table: String,
        /// What is wrong with the key
        reason: String,
    },
    /// An operation name could not be parsed
    #[error("invalid operation kind '{0}'")]
    InvalidOperationKind(String),
    /// A number key attribute is not a decimal number DynamoDB accepts
    #[error("invalid number key value '{0}'")]
    InvalidNumber(String),
    /// A batch was started without any sub-requests
    #[error("batch must contain at least one sub-request")]
    EmptyBatch,
    /// The submit function reported a second result for the same sub-request
    #[error("sub-request {key} reported more than one result")]
    DuplicateResultConflict {
        /// Offending sub-request
        key: Box<SubRequestKey>,
        /// Results accumulated before the conflict
        partial: Box<BatchOutcome>,
    },
    /// The submit function reported a sub-request that was never submitted
    #[error("sub-request {key} was not part of the submitted batch")]
    UnexpectedSubRequest {
        /// Offending sub-request
        key: Box<SubRequestKey>,
        /// Results accumulated before the violation
        partial: Box<BatchOutcome>,
    },
    /// The submit function failed with a non-retryable error
    #[error("batch failed after {attempts} attempt(s): {source}")]
    Fatal {
        /// Error raised by the submit function
        #[source]
        source: BoxError,
        /// Results accumulated before the failure
        partial: Box<BatchOutcome>,
        /// Attempts made, including the failed one
        attempts: usize,
    },
    /// Serde DynamoDB serialization/deserialization error
    #[error("DynamoDB serialization error: {0}")]
    SerdeDynamo(#[from] SerdeDynamoError),
    /// DynamoDB request builder error
    #[error("DynamoDB request builder error: {0}")]
    BuildError(#[from] BuildError),
    /// DynamoDB CreateTable operation error
    #[error("DynamoDB CreateTable operation failed: {0}")]
    DynamoCreateTableError(#[from] DynamoCreateTableError),
}

impl Error {
    pub(crate) fn invalid_key_schema(table: &str, reason: impl Into<String>) -> Self {
        Self::InvalidKeySchema {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    /// Partial results attached to a failed batch
    ///
    /// `processed` holds everything completed before the failure and
    /// `unprocessed` every sub-request still pending, so no work is lost.
    pub fn partial(&self) -> Option<&BatchOutcome> {
        match self {
            Self::DuplicateResultConflict { partial, .. }
            | Self::UnexpectedSubRequest { partial, .. }
            | Self::Fatal { partial, .. } => Some(&**partial),
            _ => None,
        }
    }

    /// Take the partial results out of a failed batch
    pub fn into_partial(self) -> Option<BatchOutcome> {
        match self {
            Self::DuplicateResultConflict { partial, .. }
            | Self::UnexpectedSubRequest { partial, .. }
            | Self::Fatal { partial, .. } => Some(*partial),
            _ => None,
        }
    }

    pub(crate) fn map_partial(mut self, f: impl FnOnce(&mut BatchOutcome)) -> Self {
        match &mut self {
            Self::DuplicateResultConflict { partial, .. }
            | Self::UnexpectedSubRequest { partial, .. }
            | Self::Fatal { partial, .. } => f(&mut **partial),
            _ => {}
        }
        self
    }

    /// Check if the error is a non-retryable failure of the submit function
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Check if the submit function broke the batch outcome contract
    ///
    /// These indicate a bug in the submit implementation rather than a
    /// service failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateResultConflict { .. } | Self::UnexpectedSubRequest { .. }
        )
    }

    /// Check if the error is a serialization/deserialization error
    pub fn is_serialization_error(&self) -> bool {
        matches!(self, Self::SerdeDynamo(_))
    }

    /// Check if the error comes from the DynamoDB SDK
    pub fn is_dynamodb_error(&self) -> bool {
        matches!(self, Self::BuildError(_) | Self::DynamoCreateTableError(_))
    }
}

/// Classified failure of one batch submission
///
/// The reconciler branches on the classification only; it never looks at
/// the transport error itself.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Transient failure: the whole pending set is treated as unprocessed
    #[error("retryable batch failure: {0}")]
    Retryable(#[source] BoxError),
    /// Permanent failure: the batch stops immediately
    #[error("fatal batch failure: {0}")]
    Fatal(#[source] BoxError),
}

impl SubmitError {
    /// Wrap a transient failure (throttling, timeouts, dropped connections)
    pub fn retryable(source: impl Into<BoxError>) -> Self {
        Self::Retryable(source.into())
    }

    /// Wrap a permanent failure (validation, access denied, missing table)
    pub fn fatal(source: impl Into<BoxError>) -> Self {
        Self::Fatal(source.into())
    }

    /// Check if the failure may succeed on resubmission
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Underlying error
    pub fn into_source(self) -> BoxError {
        match self {
            Self::Retryable(source) | Self::Fatal(source) => source,
        }
    }
}
