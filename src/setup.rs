use aws_sdk_dynamodb::operation::create_table::{CreateTableError, CreateTableOutput};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, KeySchemaElement, KeyType, ProvisionedThroughput, ScalarAttributeType,
};

use crate::dynamodb_client;
use crate::error::Error;
use crate::key::KeySchema;

fn key_element(name: &str, key_type: KeyType) -> Result<KeySchemaElement, Error> {
    Ok(KeySchemaElement::builder()
        .attribute_name(name)
        .key_type(key_type)
        .build()?)
}

fn string_attribute(name: &str) -> Result<AttributeDefinition, Error> {
    Ok(AttributeDefinition::builder()
        .attribute_name(name)
        .attribute_type(ScalarAttributeType::S)
        .build()?)
}

/// Create a table whose key attributes are all strings
///
/// Automatically initializes the DynamoDB client with defaults if not already initialized.
/// An existing table with the same name is left alone.
pub async fn table(table_name: &str, schema: &KeySchema) -> Result<CreateTableOutput, Error> {
    let client = dynamodb_client().await;

    let mut builder = client
        .create_table()
        .table_name(table_name)
        .key_schema(key_element(&schema.partition_key, KeyType::Hash)?)
        .attribute_definitions(string_attribute(&schema.partition_key)?)
        .provisioned_throughput(
            ProvisionedThroughput::builder()
                .read_capacity_units(10)
                .write_capacity_units(10)
                .build()?,
        );

    if let Some(sort_key) = &schema.sort_key {
        builder = builder
            .key_schema(key_element(sort_key, KeyType::Range)?)
            .attribute_definitions(string_attribute(sort_key)?);
    }

    match builder.send().await {
        Ok(output) => Ok(output),
        Err(e) => {
            if let Some(CreateTableError::ResourceInUseException(_)) = e.as_service_error() {
                tracing::debug!(table_name, "table already exists");
                return Ok(CreateTableOutput::builder().build());
            }
            Err(e.into())
        }
    }
}
