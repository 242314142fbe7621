//! End-to-end calls through a spawned executor.

use shmcall::{
    operation_fn, spawn_executor, Channel, ChannelConfig, Client, OperationFailure, State,
    DEFAULT_CAPACITY,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn reverse() -> impl shmcall::Operation + Send + 'static {
    operation_fn(|req: String| async move {
        tokio::task::yield_now().await;
        Ok::<_, anyhow::Error>(req.chars().rev().collect::<String>())
    })
}

#[test]
fn test_large_message_default_capacity() {
    init_tracing();

    let channel = Channel::new(ChannelConfig::default()).unwrap();
    assert_eq!(channel.capacity(), DEFAULT_CAPACITY);
    let executor = spawn_executor(channel.clone(), reverse()).unwrap();

    let message: String = ('a'..='z').cycle().take(DEFAULT_CAPACITY * 5 + 3).collect();
    let expected: String = message.chars().rev().collect();

    let client = Client::new(channel.clone());
    assert_eq!(client.call(&message).unwrap(), expected);
    assert_eq!(channel.state(), Ok(State::Idle));
    assert_eq!(channel.transfer_size(), Ok(0));

    client.request_shutdown().unwrap();
    assert_eq!(executor.join().unwrap().requests, 1);
}

#[test]
fn test_response_longer_than_request() {
    init_tracing();

    let channel = Channel::with_capacity(4).unwrap();
    let op = operation_fn(|req: String| async move {
        Ok::<_, anyhow::Error>(req.repeat(10))
    });
    let executor = spawn_executor(channel.clone(), op).unwrap();

    let client = Client::new(channel);
    assert_eq!(client.call("abc").unwrap(), "abc".repeat(10));
    assert_eq!(client.call("").unwrap(), "");

    client.request_shutdown().unwrap();
    executor.join().unwrap();
}

#[test]
fn test_failure_payload_is_distinguishable() {
    init_tracing();

    let channel = Channel::with_capacity(16).unwrap();
    let op = operation_fn(|req: String| async move {
        let n: u64 = req.parse()?;
        Ok::<_, anyhow::Error>((n * 2).to_string())
    });
    let executor = spawn_executor(channel.clone(), op).unwrap();

    let client = Client::new(channel);
    assert_eq!(client.call("21").unwrap(), "42");

    let response = client.call("twenty-one").unwrap();
    let failure = OperationFailure::from_payload(&response).expect("failure payload");
    assert!(failure.error.contains("invalid digit"), "{}", failure.error);

    assert_eq!(OperationFailure::from_payload("42"), None);

    client.request_shutdown().unwrap();
    assert_eq!(executor.join().unwrap().failures, 1);
}

/// The driver may be a thread that is itself running async work; it still
/// never suspends while waiting for the executor.
#[tokio::test(flavor = "current_thread")]
async fn test_driver_on_async_thread() {
    init_tracing();

    let channel = Channel::with_capacity(8).unwrap();
    let executor = spawn_executor(channel.clone(), reverse()).unwrap();
    let client = Client::new(channel);

    for word in ["one", "two", "three hundred and forty"] {
        let expected: String = word.chars().rev().collect();
        assert_eq!(client.call(word).unwrap(), expected);
        tokio::task::yield_now().await;
    }

    client.request_shutdown().unwrap();
    assert_eq!(executor.join().unwrap().requests, 3);
}

/// An executor that is never shut down keeps serving; the driver simply
/// stops calling.
#[test]
fn test_executor_without_shutdown_keeps_serving() {
    init_tracing();

    let channel = Channel::with_capacity(2).unwrap();
    let executor = spawn_executor(channel.clone(), reverse()).unwrap();
    let client = Client::new(channel.clone());

    for _ in 0..10 {
        assert_eq!(client.call("abc").unwrap(), "cba");
    }

    assert!(!executor.is_finished());
    assert_eq!(channel.state(), Ok(State::Idle));
}
