use aws_sdk_dynamodb::types::{self as ddb, AttributeValue};
use serde::de::DeserializeOwned;
use serde_dynamo::from_item;
use std::collections::{HashMap, HashSet};

use crate::Error;
use crate::key::SubRequestKey;

/// DynamoDB item as returned by the service
pub type Item = HashMap<String, AttributeValue>;

/// What a processed sub-request produced
#[derive(Clone, Debug, PartialEq)]
pub enum ResultPayload {
    /// A read that found its item
    Item(Item),
    /// A read whose item does not exist
    NotFound,
    /// A write (put or delete) the service applied
    Acknowledged,
}

/// Outcome of one sub-request the service actually processed
#[derive(Clone, Debug, PartialEq)]
pub struct SubRequestResult {
    /// Returned item or write acknowledgement
    pub payload: ResultPayload,
    /// Capacity units attributed to this sub-request, when known
    pub consumed_capacity: Option<f64>,
}

impl SubRequestResult {
    /// Read result carrying an item
    pub fn item(item: Item) -> Self {
        Self {
            payload: ResultPayload::Item(item),
            consumed_capacity: None,
        }
    }

    /// Read result for a missing item
    pub fn not_found() -> Self {
        Self {
            payload: ResultPayload::NotFound,
            consumed_capacity: None,
        }
    }

    /// Write acknowledgement
    pub fn acknowledged() -> Self {
        Self {
            payload: ResultPayload::Acknowledged,
            consumed_capacity: None,
        }
    }

    /// Attach capacity accounting
    pub fn with_consumed_capacity(mut self, units: f64) -> Self {
        self.consumed_capacity = Some(units);
        self
    }

    /// Returned item, if this was a read that found one
    pub fn as_item(&self) -> Option<&Item> {
        match &self.payload {
            ResultPayload::Item(item) => Some(item),
            _ => None,
        }
    }

    /// Deserialize the returned item
    ///
    /// Returns `Ok(None)` for missing items and write acknowledgements.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<Option<T>, Error> {
        self.as_item()
            .map(|item| from_item(item.clone()))
            .transpose()
            .map_err(Into::into)
    }
}

/// Table-level capacity reported by the service for one attempt
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedCapacity {
    /// Table the capacity was consumed on
    pub table_name: String,
    /// Total capacity units
    pub capacity_units: f64,
}

impl From<&ddb::ConsumedCapacity> for ConsumedCapacity {
    fn from(capacity: &ddb::ConsumedCapacity) -> Self {
        Self {
            table_name: capacity.table_name().unwrap_or_default().to_string(),
            capacity_units: capacity.capacity_units().unwrap_or(0.0),
        }
    }
}

/// How a submit function broke the outcome contract
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The key is reported both processed and unprocessed
    Overlap(SubRequestKey),
    /// The key was never submitted in this attempt
    Unexpected(SubRequestKey),
}

/// Result of a batch: processed results plus the unprocessed remainder
///
/// For a single attempt, `processed` and `unprocessed` are disjoint and
/// together cover every submitted sub-request. Ordering carries no meaning.
#[must_use = "batch outcomes contain unprocessed sub-requests that should be checked"]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Results of processed sub-requests
    pub processed: HashMap<SubRequestKey, SubRequestResult>,
    /// Sub-requests the service did not complete
    pub unprocessed: HashSet<SubRequestKey>,
    /// Capacity reported by the service, one entry per table per attempt
    pub consumed_capacity: Vec<ConsumedCapacity>,
}

impl BatchOutcome {
    /// Empty outcome
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome marking every key unprocessed
    pub fn all_unprocessed(keys: impl IntoIterator<Item = SubRequestKey>) -> Self {
        Self {
            unprocessed: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Add a processed result
    pub fn with_processed(mut self, key: SubRequestKey, result: SubRequestResult) -> Self {
        let _ = self.processed.insert(key, result);
        self
    }

    /// Add an unprocessed key
    pub fn with_unprocessed(mut self, key: SubRequestKey) -> Self {
        let _ = self.unprocessed.insert(key);
        self
    }

    /// Check if every sub-request was processed
    pub fn is_complete(&self) -> bool {
        self.unprocessed.is_empty()
    }

    /// Number of processed sub-requests
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Number of unprocessed sub-requests
    pub fn unprocessed_count(&self) -> usize {
        self.unprocessed.len()
    }

    /// Number of sub-requests the outcome accounts for
    pub fn total_requested(&self) -> usize {
        self.processed_count() + self.unprocessed_count()
    }

    /// Get success rate as a percentage (0.0 to 100.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requested();
        if total == 0 {
            return 100.0;
        }
        (self.processed_count() as f64 / total as f64) * 100.0
    }

    /// Sum of all reported capacity units
    pub fn total_capacity_units(&self) -> f64 {
        self.consumed_capacity
            .iter()
            .map(|capacity| capacity.capacity_units)
            .sum()
    }

    /// Items returned by processed reads
    pub fn items(&self) -> impl Iterator<Item = (&SubRequestKey, &Item)> {
        self.processed
            .iter()
            .filter_map(|(key, result)| result.as_item().map(|item| (key, item)))
    }

    /// Deserialize every returned item
    pub fn deserialize_items<T: DeserializeOwned>(&self) -> Result<Vec<T>, Error> {
        self.processed
            .values()
            .filter_map(|result| result.deserialize::<T>().transpose())
            .collect()
    }

    /// Validate a single attempt's outcome against the keys submitted for it
    ///
    /// Returns the submitted keys the outcome does not mention at all, in
    /// key order. Those must be treated as unprocessed by the caller.
    pub fn check_against(
        &self,
        submitted: &HashSet<SubRequestKey>,
    ) -> Result<Vec<SubRequestKey>, InvariantViolation> {
        if let Some(key) = self
            .processed
            .keys()
            .find(|key| self.unprocessed.contains(*key))
        {
            return Err(InvariantViolation::Overlap(key.clone()));
        }

        if let Some(key) = self
            .processed
            .keys()
            .chain(self.unprocessed.iter())
            .find(|key| !submitted.contains(*key))
        {
            return Err(InvariantViolation::Unexpected(key.clone()));
        }

        let mut missing: Vec<SubRequestKey> = submitted
            .iter()
            .filter(|key| !self.processed.contains_key(*key) && !self.unprocessed.contains(*key))
            .cloned()
            .collect();
        missing.sort();

        Ok(missing)
    }

    /// Merge the outcome of an independent batch into this one
    ///
    /// Fails with the first key that already has a result here.
    pub fn merge(&mut self, other: Self) -> Result<(), SubRequestKey> {
        if let Some(key) = other
            .processed
            .keys()
            .find(|key| self.processed.contains_key(*key))
        {
            return Err(key.clone());
        }

        self.processed.extend(other.processed);
        self.unprocessed
            .retain(|key| !self.processed.contains_key(key));
        self.unprocessed.extend(
            other
                .unprocessed
                .into_iter()
                .filter(|key| !self.processed.contains_key(key)),
        );
        self.consumed_capacity.extend(other.consumed_capacity);
        Ok(())
    }
}
