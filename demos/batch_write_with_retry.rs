/// Example: Writing and reading back a large batch with partial-failure retry
///
/// DynamoDB may leave part of a batch unprocessed under throttling or
/// capacity limits. The reconciler resubmits exactly that remainder with
/// exponential backoff and reports whatever is still left.
///
/// Run against LocalStack with `AWS_PROFILE=localstack cargo run --example batch_write_with_retry`.
use dynamo_batch::dynamodb::{batch_get, batch_write};
use dynamo_batch::{BatchWriteSubmitter, ExponentialBackoff, KeySchema, OperationKind, setup};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    order_id: String,
    customer: String,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> Result<(), dynamo_batch::Error> {
    let schema = KeySchema::new("order_id");
    let _ = setup::table("orders", &schema).await?;

    let mut writer = BatchWriteSubmitter::from_global().await;
    let mut keys = Vec::new();
    for i in 0..100 {
        let order = Order {
            order_id: format!("order_{i:03}"),
            customer: format!("customer_{}", i % 7),
            total_cents: 1_000 + i,
        };
        keys.push(writer.put("orders", &schema, &order)?);
    }

    // 100 puts go out as 4 calls of 25, each with its own backoff schedule
    let policy = || ExponentialBackoff::new(5, Duration::from_millis(100), Duration::from_secs(2));
    let written = batch_write(&writer, Vec::new(), policy).await?;

    println!(
        "write {}: {} processed, {} unprocessed, {} retries, {:.1} WCU in {:?}",
        written.state,
        written.outcome.processed_count(),
        written.outcome.unprocessed_count(),
        written.retry_count(),
        written.outcome.total_capacity_units(),
        written.total_duration,
    );

    for key in &written.outcome.unprocessed {
        println!("  gave up on {key}");
    }

    let reads = keys
        .iter()
        .map(|key| key.with_operation(OperationKind::Get));

    match batch_get(reads, ExponentialBackoff::dynamodb_default).await {
        Ok(read) => {
            let orders: Vec<Order> = read.outcome.deserialize_items()?;
            println!(
                "read {}: {} orders, success rate {:.1}%",
                read.state,
                orders.len(),
                read.outcome.success_rate()
            );
        }
        Err(err) => {
            // Fatal errors still report what was read before the failure
            let read = err.partial().map_or(0, |partial| partial.processed_count());
            println!("read failed after {read} items: {err}");
        }
    }

    Ok(())
}
