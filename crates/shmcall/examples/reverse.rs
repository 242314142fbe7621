//! Reverse strings on an executor thread while the driver thread spins.
//!
//! This example shows:
//! - Creating a channel and handing it to a spawned executor
//! - An asynchronous operation that suspends before answering
//! - Synchronous-looking calls from the driver, including a message that
//!   spans several chunks
//! - Shutting the executor down
//!
//! Run with: `RUST_LOG=shmcall=trace cargo run --example reverse -p shmcall`

use std::time::Duration;

use shmcall::{operation_fn, spawn_executor, Channel, ChannelConfig, Client, OperationFailure};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // A small chunk size so the long message below needs several transfers.
    let channel = Channel::new(ChannelConfig::default().with_capacity(16))?;

    let reverse = operation_fn(|request: String| async move {
        // Stand-in for a slow asynchronous API on the executor side.
        tokio::time::sleep(Duration::from_millis(5)).await;
        if request.is_empty() {
            anyhow::bail!("nothing to reverse");
        }
        Ok(request.chars().rev().collect::<String>())
    });
    let executor = spawn_executor(channel.clone(), reverse)?;

    let client = Client::new(channel);

    println!("=== Short message ===");
    println!("Response: {}", client.call("12345")?);

    println!("\n=== Multi-chunk message ===");
    let long = "The quick brown fox jumps over the lazy dog. 🦀".repeat(3);
    println!("Response: {}", client.call(&long)?);

    println!("\n=== Failing request ===");
    let response = client.call("")?;
    match OperationFailure::from_payload(&response) {
        Some(failure) => println!("{}", failure),
        None => println!("Response: {}", response),
    }

    client.request_shutdown()?;
    let report = executor.join()?;
    println!(
        "\nExecutor served {} requests ({} failed)",
        report.requests, report.failures
    );

    Ok(())
}
