use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use serde::Serialize;
use serde_dynamo::to_item;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Maximum number of keys a single `BatchGetItem` call accepts
pub const BATCH_READ_SIZE: usize = 100;

/// Maximum number of put/delete requests a single `BatchWriteItem` call accepts
pub const BATCH_WRITE_SIZE: usize = 25;

/// Kind of item operation a sub-request performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    /// Read one item (`BatchGetItem`)
    Get,
    /// Insert or replace one item (`BatchWriteItem` put request)
    Put,
    /// Delete one item (`BatchWriteItem` delete request)
    Delete,
}

impl OperationKind {
    /// Wire name of the operation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::Put => "Put",
            Self::Delete => "Delete",
        }
    }

    /// Whether the operation goes through `BatchWriteItem`
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Put | Self::Delete)
    }

    /// Per-call limit the service enforces for this kind of operation
    pub const fn batch_limit(self) -> usize {
        match self {
            Self::Get => BATCH_READ_SIZE,
            Self::Put | Self::Delete => BATCH_WRITE_SIZE,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Get, Self::Put, Self::Delete]
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidOperationKind(s.to_string()))
    }
}

/// Canonical decimal form of a DynamoDB number
///
/// The service trims leading and trailing zeros from the numbers it returns,
/// so `1.50`, `01.5` and `15E-1` are all the same key value. Numbers are
/// stored in plain decimal notation without a `+` sign, redundant zeros or an
/// exponent, and zero is always `0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Number(String);

impl Number {
    /// Largest decimal exponent DynamoDB accepts (`9.99E+125`)
    const MAX_EXPONENT: i64 = 126;
    /// Smallest decimal exponent DynamoDB accepts (`1E-130`)
    const MIN_EXPONENT: i64 = -130;

    /// Parse a decimal number, optionally signed and with an exponent
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (negative, rest) = match raw.as_bytes().first()? {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };

        let (mantissa, exponent) = match rest.find(|c: char| c == 'e' || c == 'E') {
            Some(index) => (&rest[..index], rest[index + 1..].parse::<i64>().ok()?),
            None => (rest, 0),
        };
        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));

        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }

        // Significant digits plus the position of the decimal point within them
        let all_digits = format!("{int_part}{frac_part}");
        let leading = all_digits.bytes().take_while(|b| *b == b'0').count();
        let digits = all_digits[leading..].trim_end_matches('0');

        if digits.is_empty() {
            return Some(Self("0".to_string()));
        }

        let point = i64::try_from(int_part.len())
            .ok()?
            .checked_sub(i64::try_from(leading).ok()?)?
            .checked_add(exponent)?;
        if !(Self::MIN_EXPONENT..=Self::MAX_EXPONENT).contains(&point) {
            return None;
        }

        let mut canonical = String::with_capacity(digits.len() + 4);
        if negative {
            canonical.push('-');
        }

        match usize::try_from(point) {
            Ok(0) | Err(_) => {
                canonical.push_str("0.");
                canonical.extend(std::iter::repeat('0').take(point.unsigned_abs() as usize));
                canonical.push_str(digits);
            }
            Ok(point) if point >= digits.len() => {
                canonical.push_str(digits);
                canonical.extend(std::iter::repeat('0').take(point - digits.len()));
            }
            Ok(point) => {
                let (int_digits, frac_digits) = digits.split_at(point);
                canonical.push_str(int_digits);
                canonical.push('.');
                canonical.push_str(frac_digits);
            }
        }

        Some(Self(canonical))
    }

    /// Canonical decimal string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed value of a primary key attribute
///
/// DynamoDB only allows string, number and binary scalars in key attributes.
/// Numbers are kept in [`Number`]'s canonical form so that equality matches
/// whatever representation the service echoes back.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// String attribute (`S`)
    S(String),
    /// Number attribute (`N`)
    N(Number),
    /// Binary attribute (`B`)
    B(Vec<u8>),
}

impl KeyValue {
    /// Number attribute from its decimal representation
    ///
    /// Fails with [`Error::InvalidNumber`] unless `raw` is a decimal number
    /// within DynamoDB's range.
    pub fn number(raw: &str) -> Result<Self, Error> {
        Number::parse(raw)
            .map(Self::N)
            .ok_or_else(|| Error::InvalidNumber(raw.to_string()))
    }

    /// Convert a DynamoDB attribute into a key value
    ///
    /// Returns `None` for attribute types that cannot appear in a primary key
    /// and for malformed numbers.
    pub fn from_attribute(value: &AttributeValue) -> Option<Self> {
        match value {
            AttributeValue::S(s) => Some(Self::S(s.clone())),
            AttributeValue::N(n) => Number::parse(n).map(Self::N),
            AttributeValue::B(b) => Some(Self::B(b.as_ref().to_vec())),
            _ => None,
        }
    }

    /// Convert into the DynamoDB attribute representation
    pub fn to_attribute(&self) -> AttributeValue {
        match self {
            Self::S(s) => AttributeValue::S(s.clone()),
            Self::N(n) => AttributeValue::N(n.0.clone()),
            Self::B(b) => AttributeValue::B(Blob::new(b.clone())),
        }
    }
}

impl From<KeyValue> for AttributeValue {
    fn from(value: KeyValue) -> Self {
        match value {
            KeyValue::S(s) => AttributeValue::S(s),
            KeyValue::N(n) => AttributeValue::N(n.0),
            KeyValue::B(b) => AttributeValue::B(Blob::new(b)),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        Self::S(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        Self::S(value)
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(value: Vec<u8>) -> Self {
        Self::B(value)
    }
}

impl From<Number> for KeyValue {
    fn from(value: Number) -> Self {
        Self::N(value)
    }
}

// Integer formatting is already canonical
macro_rules! impl_from_number {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for KeyValue {
                fn from(value: $ty) -> Self {
                    Self::N(Number(value.to_string()))
                }
            }
        )*
    };
}

impl_from_number!(i32, i64, u32, u64, usize);

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S(s) => write!(f, "{s:?}"),
            Self::N(n) => write!(f, "{n}"),
            Self::B(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Declared primary key of a table: partition key and optional sort key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeySchema {
    /// Partition (hash) key attribute name
    pub partition_key: String,
    /// Sort (range) key attribute name
    pub sort_key: Option<String>,
}

impl KeySchema {
    /// Schema with only a partition key
    pub fn new(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    /// Add a sort key to the schema
    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Key attribute names, partition key first
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.partition_key.as_str()).chain(self.sort_key.as_deref())
    }
}

/// Identity of one item operation inside a batch
///
/// Two keys are the same sub-request when table, operation and key
/// attributes are all equal. Key attributes are kept in name order, so the
/// order they were supplied in never matters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubRequestKey {
    table_name: String,
    operation: OperationKind,
    key: BTreeMap<String, KeyValue>,
}

impl SubRequestKey {
    /// Create a sub-request key
    ///
    /// Fails with [`Error::InvalidKeySchema`] when the table name or the key
    /// attributes are empty.
    pub fn new<I, N, V>(
        table_name: impl Into<String>,
        operation: OperationKind,
        attributes: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<KeyValue>,
    {
        let table_name = table_name.into();
        let key: BTreeMap<String, KeyValue> = attributes
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();

        if table_name.is_empty() {
            return Err(Error::invalid_key_schema(&table_name, "table name is empty"));
        }

        if key.is_empty() {
            return Err(Error::invalid_key_schema(
                &table_name,
                "key attributes are empty",
            ));
        }

        Ok(Self {
            table_name,
            operation,
            key,
        })
    }

    /// Start building a key attribute by attribute
    pub fn builder(table_name: impl Into<String>, operation: OperationKind) -> SubRequestKeyBuilder {
        SubRequestKeyBuilder {
            table_name: table_name.into(),
            operation,
            key: BTreeMap::new(),
        }
    }

    /// Create a key and check it carries exactly the schema's attributes
    pub fn for_schema<I, N, V>(
        table_name: impl Into<String>,
        operation: OperationKind,
        schema: &KeySchema,
        attributes: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<KeyValue>,
    {
        let key = Self::new(table_name, operation, attributes)?;

        let expected: Vec<&str> = {
            let mut names: Vec<&str> = schema.attribute_names().collect();
            names.sort_unstable();
            names
        };
        let actual: Vec<&str> = key.attribute_names().collect();

        if expected != actual {
            return Err(Error::invalid_key_schema(
                &key.table_name,
                format!("expected key attributes {expected:?}, got {actual:?}"),
            ));
        }

        Ok(key)
    }

    /// Extract the key of a full item according to the table schema
    pub fn from_item(
        table_name: impl Into<String>,
        operation: OperationKind,
        schema: &KeySchema,
        item: &HashMap<String, AttributeValue>,
    ) -> Result<Self, Error> {
        Self::project(table_name, operation, schema.attribute_names(), item)
    }

    /// Serialize a value and extract its key according to the table schema
    pub fn from_serialize<T: Serialize>(
        table_name: impl Into<String>,
        operation: OperationKind,
        schema: &KeySchema,
        value: &T,
    ) -> Result<Self, Error> {
        let item = to_item::<_, HashMap<String, AttributeValue>>(value)?;
        Self::from_item(table_name, operation, schema, &item)
    }

    /// Build a key from a DynamoDB key map, taking every attribute in it
    pub fn from_key_map(
        table_name: impl Into<String>,
        operation: OperationKind,
        key_map: &HashMap<String, AttributeValue>,
    ) -> Result<Self, Error> {
        Self::project(
            table_name,
            operation,
            key_map.keys().map(String::as_str),
            key_map,
        )
    }

    /// Build a key from the named attributes of an item
    pub(crate) fn project<'a>(
        table_name: impl Into<String>,
        operation: OperationKind,
        names: impl IntoIterator<Item = &'a str>,
        item: &HashMap<String, AttributeValue>,
    ) -> Result<Self, Error> {
        let table_name = table_name.into();
        let mut key = BTreeMap::new();

        for name in names {
            let attribute = item.get(name).ok_or_else(|| {
                Error::invalid_key_schema(&table_name, format!("missing key attribute '{name}'"))
            })?;

            let value = KeyValue::from_attribute(attribute).ok_or_else(|| {
                Error::invalid_key_schema(
                    &table_name,
                    format!("key attribute '{name}' is not a string, number or binary"),
                )
            })?;

            let _ = key.insert(name.to_string(), value);
        }

        Self::new(table_name, operation, key)
    }

    /// Table the sub-request targets
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Operation the sub-request performs
    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// Key attributes in name order
    pub fn key(&self) -> &BTreeMap<String, KeyValue> {
        &self.key
    }

    /// Key attribute names in name order
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.key.keys().map(String::as_str)
    }

    /// Check if both sub-requests target the same item, whatever the operation
    pub fn same_item(&self, other: &Self) -> bool {
        self.table_name == other.table_name && self.key == other.key
    }

    /// Same item, different operation
    pub fn with_operation(&self, operation: OperationKind) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }

    /// Key as a DynamoDB key map
    pub fn to_attribute_map(&self) -> HashMap<String, AttributeValue> {
        self.key
            .iter()
            .map(|(name, value)| (name.clone(), value.to_attribute()))
            .collect()
    }
}

impl fmt::Display for SubRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[", self.operation, self.table_name)?;
        for (i, (name, value)) in self.key.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("]")
    }
}

/// Incremental builder for [`SubRequestKey`]
#[derive(Clone, Debug)]
pub struct SubRequestKeyBuilder {
    table_name: String,
    operation: OperationKind,
    key: BTreeMap<String, KeyValue>,
}

impl SubRequestKeyBuilder {
    /// Add (or replace) a key attribute
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<KeyValue>) -> Self {
        let _ = self.key.insert(name.into(), value.into());
        self
    }

    /// Finish the key
    pub fn build(self) -> Result<SubRequestKey, Error> {
        SubRequestKey::new(self.table_name, self.operation, self.key)
    }
}
