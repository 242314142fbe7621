//! shmcall-testkit: Conformance scenarios for shmcall channels.
//!
//! Provides the `ChannelFactory` trait and shared scenarios that every
//! channel configuration must pass.
//!
//! # Usage
//!
//! ```ignore
//! use shmcall_testkit::ChannelFactory;
//!
//! struct SpinFactory;
//!
//! impl ChannelFactory for SpinFactory {
//!     fn config(capacity: usize) -> ChannelConfig {
//!         ChannelConfig::default().with_capacity(capacity)
//!     }
//! }
//!
//! #[test]
//! fn spin_identity_round_trip() {
//!     shmcall_testkit::run_identity_round_trip::<SpinFactory>();
//! }
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shmcall::{
    spawn_executor, Channel, ChannelConfig, ChannelError, Client, ExecutorHandle, Operation,
    OperationFailure, ServeReport, State,
};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Channel or executor creation failed.
    Setup(String),
    /// A channel operation failed.
    Channel(ChannelError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Channel(e) => write!(f, "channel error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ChannelError> for TestError {
    fn from(e: ChannelError) -> Self {
        TestError::Channel(e)
    }
}

/// Factory trait for building channels under test.
///
/// Implementations choose everything about the configuration except the
/// capacity, which each scenario picks for itself.
pub trait ChannelFactory: 'static {
    /// Configuration for a channel with the given chunk capacity.
    fn config(capacity: usize) -> ChannelConfig;

    /// Build the channel.
    fn connect(capacity: usize) -> Result<Arc<Channel>, TestError> {
        Channel::new(Self::config(capacity)).map_err(TestError::Channel)
    }
}

macro_rules! ensure_eq {
    ($left:expr, $right:expr, $($ctx:tt)+) => {{
        let (left, right) = (&$left, &$right);
        if left != right {
            return Err(TestError::Assertion(format!(
                "{}: expected {:?}, got {:?}",
                format!($($ctx)+),
                right,
                left
            )));
        }
    }};
}

// ============================================================================
// Test operations
// ============================================================================

/// Returns the request unchanged.
#[derive(Debug, Default)]
pub struct Echo;

impl Operation for Echo {
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        Ok(request)
    }
}

/// Reverses the request, yielding to the runtime first like a real
/// asynchronous operation would.
#[derive(Debug, Default)]
pub struct Reverse;

impl Operation for Reverse {
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        tokio::task::yield_now().await;
        Ok(request.chars().rev().collect())
    }
}

/// Records every request it sees and answers with its length in units.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn requests(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl Operation for Recorder {
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        let len = request.chars().count();
        self.seen.lock().push(request);
        Ok(len.to_string())
    }
}

/// Fails whenever the request starts with `fail`.
#[derive(Debug, Default)]
pub struct Flaky;

impl Operation for Flaky {
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Some(reason) = request.strip_prefix("fail") {
            anyhow::bail!("refused{}", reason);
        }
        Ok(request)
    }
}

/// Holds each request until the test releases it.
#[derive(Debug)]
pub struct Gated {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// Test side of a [`Gated`] operation.
#[derive(Debug)]
pub struct Gate {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl Gated {
    pub fn new() -> (Self, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            Self {
                entered: entered_tx,
                release: release_rx,
            },
            Gate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl Gate {
    /// Block until the operation has started on a request.
    pub fn wait_entered(&self) -> Result<(), TestError> {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .map_err(|e| TestError::Setup(format!("operation never started: {}", e)))
    }

    /// Let the operation finish its current request.
    pub fn release(&self) -> Result<(), TestError> {
        self.release
            .send(())
            .map_err(|e| TestError::Setup(format!("operation gone: {}", e)))
    }
}

impl Operation for Gated {
    async fn call(&mut self, request: String) -> anyhow::Result<String> {
        self.entered.send(())?;
        // The executor thread is allowed to block.
        self.release.recv()?;
        Ok(request)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A channel with a running executor and a client attached.
#[derive(Debug)]
pub struct Harness {
    channel: Arc<Channel>,
    client: Client,
    executor: ExecutorHandle,
}

impl Harness {
    pub fn start<F, O>(capacity: usize, op: O) -> Result<Self, TestError>
    where
        F: ChannelFactory,
        O: Operation + Send + 'static,
    {
        let channel = F::connect(capacity)?;
        let executor = spawn_executor(channel.clone(), op)
            .map_err(|e| TestError::Setup(format!("failed to spawn executor: {}", e)))?;
        let client = Client::new(channel.clone());
        tracing::debug!(capacity = channel.capacity(), "harness started");
        Ok(Self {
            channel,
            client,
            executor,
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Check the channel words while no exchange is in flight.
    pub fn check_quiescent(&self) -> Result<(), TestError> {
        let snapshot = self.channel.snapshot();
        if !snapshot.is_consistent(self.channel.capacity()) {
            return Err(TestError::Assertion(format!(
                "inconsistent channel words: {:?}",
                snapshot
            )));
        }
        ensure_eq!(snapshot.state(), Ok(State::Idle), "state between calls");
        Ok(())
    }

    /// Request shutdown and collect the executor's report.
    pub fn finish(self) -> Result<ServeReport, TestError> {
        self.client.request_shutdown()?;
        let report = self.executor.join()?;
        tracing::debug!(requests = report.requests, failures = report.failures, "harness finished");
        Ok(report)
    }
}

// ============================================================================
// Test scenarios
// ============================================================================

fn run(name: &str, result: Result<(), TestError>) {
    if let Err(e) = result {
        panic!("{} failed: {}", name, e);
    }
}

/// With an identity operation, every message comes back unchanged.
///
/// Covers the empty message, exactly one full chunk, one unit over, several
/// chunks, and non-ASCII text.
pub fn run_identity_round_trip<F: ChannelFactory>() {
    run("run_identity_round_trip", run_identity_round_trip_inner::<F>());
}

fn run_identity_round_trip_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let capacity = 8;
    let harness = Harness::start::<F, _>(capacity, Echo)?;

    let messages = [
        String::new(),
        "x".to_string(),
        "a".repeat(capacity),
        "b".repeat(capacity + 1),
        "0123456789".repeat(5),
        "ünïcødé → 🦀🦀🦀 ✓".to_string(),
    ];

    for message in &messages {
        let response = harness.client().call(message)?;
        ensure_eq!(response, *message, "identity round trip of {} units", message.chars().count());
        harness.check_quiescent()?;
    }

    let report = harness.finish()?;
    ensure_eq!(report.requests, messages.len() as u64, "requests served");
    Ok(())
}

/// The executor reassembles exactly what the driver sent, for every length
/// from empty up to several chunks.
pub fn run_request_reassembly<F: ChannelFactory>() {
    run("run_request_reassembly", run_request_reassembly_inner::<F>());
}

fn run_request_reassembly_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let capacity = 4;
    let recorder = Recorder::default();
    let harness = Harness::start::<F, _>(capacity, recorder.clone())?;

    let sent: Vec<String> = (0..=3 * capacity + 1)
        .map(|len| ('a'..='z').cycle().take(len).collect())
        .collect();

    for message in &sent {
        let response = harness.client().call(message)?;
        ensure_eq!(response, message.chars().count().to_string(), "length reply");
    }

    harness.finish()?;
    ensure_eq!(recorder.requests(), sent, "requests seen by the operation");
    Ok(())
}

/// Capacity 4, "ABCDE": a partial chunk then a final one, both ways.
pub fn run_chunk_boundaries<F: ChannelFactory>() {
    run("run_chunk_boundaries", run_chunk_boundaries_inner::<F>());
}

fn run_chunk_boundaries_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let harness = Harness::start::<F, _>(4, Reverse)?;

    ensure_eq!(harness.client().call("ABCDE")?, "EDCBA", "five units");
    ensure_eq!(harness.client().call("ABCD")?, "DCBA", "exactly one chunk");
    ensure_eq!(harness.client().call("")?, "", "empty message");
    harness.check_quiescent()?;

    harness.finish()?;
    Ok(())
}

/// Many calls in a row on one channel.
pub fn run_sequential_calls<F: ChannelFactory>() {
    run("run_sequential_calls", run_sequential_calls_inner::<F>());
}

fn run_sequential_calls_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let harness = Harness::start::<F, _>(16, Reverse)?;

    for i in 0..200 {
        let message = format!("request-{}-{}", i, "z".repeat(i % 40));
        let expected: String = message.chars().rev().collect();
        ensure_eq!(harness.client().call(&message)?, expected, "call {}", i);
    }

    let report = harness.finish()?;
    ensure_eq!(report.requests, 200, "requests served");
    Ok(())
}

/// A failing operation yields an error payload and leaves the channel
/// ready for the next call.
pub fn run_operation_failure<F: ChannelFactory>() {
    run("run_operation_failure", run_operation_failure_inner::<F>());
}

fn run_operation_failure_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let harness = Harness::start::<F, _>(8, Flaky)?;

    let response = harness.client().call("fail: no entropy")?;
    ensure_eq!(
        OperationFailure::from_payload(&response),
        Some(OperationFailure::new("refused: no entropy")),
        "failure payload"
    );
    harness.check_quiescent()?;

    // A long failure message still arrives whole across chunks.
    let long_reason = "!".repeat(50);
    let response = harness.client().call(&format!("fail{}", long_reason))?;
    ensure_eq!(
        OperationFailure::from_payload(&response).map(|f| f.error),
        Some(format!("refused{}", long_reason)),
        "multi-chunk failure payload"
    );

    ensure_eq!(harness.client().call("fine")?, "fine", "call after failure");

    let report = harness.finish()?;
    ensure_eq!(report, ServeReport { requests: 3, failures: 2 }, "serve report");
    Ok(())
}

/// After shutdown the serve loop ends and the operation is not invoked
/// again; later calls are refused.
pub fn run_shutdown<F: ChannelFactory>() {
    run("run_shutdown", run_shutdown_inner::<F>());
}

fn run_shutdown_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let recorder = Recorder::default();
    let harness = Harness::start::<F, _>(8, recorder.clone())?;

    harness.client().call("one")?;
    harness.client().call("two")?;

    let channel = harness.channel().clone();
    let client = harness.client().clone();
    let report = harness.finish()?;

    ensure_eq!(report.requests, 2, "requests before shutdown");
    ensure_eq!(channel.state(), Ok(State::Shutdown), "state after shutdown");

    match client.call("three") {
        Err(ChannelError::ChannelBusy {
            state: State::Shutdown,
        }) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "call after shutdown should be refused, got {:?}",
                other
            )))
        }
    }

    ensure_eq!(recorder.requests(), vec!["one".to_string(), "two".to_string()], "operation calls");
    Ok(())
}

/// A second call while the first is in flight is refused with
/// `ChannelBusy`, and the first call still completes intact.
pub fn run_concurrent_call_is_busy<F: ChannelFactory>() {
    run("run_concurrent_call_is_busy", run_concurrent_call_is_busy_inner::<F>());
}

fn run_concurrent_call_is_busy_inner<F: ChannelFactory>() -> Result<(), TestError> {
    let (gated, gate) = Gated::new();
    let harness = Harness::start::<F, _>(4, gated)?;

    let first = std::thread::spawn({
        let client = harness.client().clone();
        move || client.call("first request")
    });

    gate.wait_entered()?;

    let intruder = Client::new(harness.channel().clone());
    match intruder.call("second") {
        Err(ChannelError::ChannelBusy { .. }) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "concurrent call should be busy, got {:?}",
                other
            )))
        }
    }
    match intruder.request_shutdown() {
        Err(ChannelError::ChannelBusy { .. }) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "shutdown during a call should be busy, got {:?}",
                other
            )))
        }
    }

    gate.release()?;
    let response = first
        .join()
        .map_err(|_| TestError::Setup("driver thread panicked".into()))??;
    ensure_eq!(response, "first request", "first call response");
    harness.check_quiescent()?;

    drop(gate);
    let report = harness.finish()?;
    ensure_eq!(report.requests, 1, "requests served");
    Ok(())
}
