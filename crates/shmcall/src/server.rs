//! Executor side: block for requests, run the operation, send responses.
//!
//! Unlike the client, every wait here is a real futex sleep on the state
//! word. The operation itself runs on a current-thread tokio runtime owned
//! by the serve loop, so the executor thread is suspended while it is
//! pending as well.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use futures::FutureExt;

use crate::codec::{ChunkReader, ChunkWriter};
use crate::error::{ChannelError, Violation};
use crate::layout::{Channel, State};
use crate::operation::{Operation, OperationFailure};

/// Name given to threads started by [`spawn_executor`].
pub const EXECUTOR_THREAD_NAME: &str = "shmcall-executor";

/// Counters returned when the serve loop shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    /// Requests fully received and answered.
    pub requests: u64,
    /// Requests whose operation failed or panicked.
    pub failures: u64,
}

/// Executor-side handle to a channel.
#[derive(Debug)]
pub struct Server {
    channel: Arc<Channel>,
}

/// What woke the serve loop.
enum Incoming {
    Request(State),
    Shutdown,
}

impl Server {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    #[inline]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Run the serve loop until the driver requests shutdown.
    ///
    /// Blocks the calling thread. Operation failures are answered with an
    /// [`OperationFailure`] payload and never end the loop; a protocol
    /// violation poisons the channel and is returned.
    pub fn serve<O: Operation>(&self, mut op: O) -> Result<ServeReport, ChannelError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ChannelError::Runtime)?;

        tracing::info!(capacity = self.channel.capacity(), "executor serving");
        let mut report = ServeReport::default();

        loop {
            let first = match self.wait_for_request().map_err(|v| self.channel.poison(v))? {
                Incoming::Request(state) => state,
                Incoming::Shutdown => {
                    tracing::info!(
                        requests = report.requests,
                        failures = report.failures,
                        "executor shut down"
                    );
                    return Ok(report);
                }
            };

            let request = self
                .read_request(first)
                .map_err(|v| self.channel.poison(v))?;
            report.requests += 1;

            let response = match runtime.block_on(run_isolated(&mut op, request)) {
                Ok(response) => response,
                Err(failure) => {
                    report.failures += 1;
                    tracing::warn!(error = %failure.error, "operation failed, replying with error payload");
                    failure.to_payload()
                }
            };

            self.send_response(&response)
                .map_err(|v| self.channel.poison(v))?;
        }
    }

    /// Sleep until the driver leaves Idle.
    fn wait_for_request(&self) -> Result<Incoming, Violation> {
        let raw = self.channel.state_word().wait_while_eq(State::Idle.as_raw());

        match State::from_raw(raw)? {
            State::Shutdown => Ok(Incoming::Shutdown),
            state @ (State::RequestPartial | State::RequestFull) => Ok(Incoming::Request(state)),
            found => Err(Violation::UnexpectedState {
                found,
                phase: "waiting for request",
            }),
        }
    }

    fn read_request(&self, mut state: State) -> Result<String, Violation> {
        let channel = &*self.channel;
        let mut reader = ChunkReader::new();

        loop {
            let size = channel.transfer_size()?;
            reader.read_chunk(channel, size)?;
            tracing::trace!(len = size, is_final = state.is_final_chunk(), "request chunk read");

            if state == State::RequestFull {
                break;
            }

            channel.store_transfer_size(0);
            channel.transition(State::RequestPartial, State::Await)?;

            let raw = channel.state_word().wait_while_eq(State::Await.as_raw());
            state = match State::from_raw(raw)? {
                next @ (State::RequestPartial | State::RequestFull) => next,
                found => {
                    return Err(Violation::UnexpectedState {
                        found,
                        phase: "receiving request",
                    })
                }
            };
        }

        tracing::debug!(units = reader.units(), chunks = reader.chunks(), "request received");
        Ok(reader.finish())
    }

    fn send_response(&self, response: &str) -> Result<(), Violation> {
        let channel = &*self.channel;
        let mut writer = ChunkWriter::new(response);
        let mut from = State::RequestFull;

        while let Some(chunk) = writer.next_chunk(channel) {
            let to = State::response(chunk.is_final);
            channel.store_transfer_size(chunk.len);
            channel.transition(from, to)?;
            tracing::trace!(len = chunk.len, is_final = chunk.is_final, "response chunk sent");

            // Sleep until the driver has consumed the chunk.
            let raw = channel.state_word().wait_while_eq(to.as_raw());
            let next = State::from_raw(raw)?;

            if chunk.is_final {
                // The driver released the channel; it may already have
                // started the next exchange or asked for shutdown.
                if matches!(
                    next,
                    State::Idle | State::RequestPartial | State::RequestFull | State::Shutdown
                ) {
                    break;
                }
            } else if next == State::Await {
                from = State::Await;
                continue;
            }

            return Err(Violation::UnexpectedState {
                found: next,
                phase: "sending response",
            });
        }

        tracing::debug!(units = writer.len(), "response sent");
        Ok(())
    }
}

/// Await the operation, turning errors and panics into failure payloads.
async fn run_isolated<O: Operation>(op: &mut O, request: String) -> Result<String, OperationFailure> {
    match AssertUnwindSafe(op.call(request)).catch_unwind().await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(OperationFailure::from_error(&err)),
        Err(panic) => Err(OperationFailure::from_panic(panic)),
    }
}

/// Start a named executor thread serving `op` on `channel`.
///
/// The thread owns its own handle to the channel; the caller keeps the
/// other one for the [`Client`](crate::Client).
pub fn spawn_executor<O>(channel: Arc<Channel>, op: O) -> io::Result<ExecutorHandle>
where
    O: Operation + Send + 'static,
{
    let server = Server::new(channel);
    let thread = std::thread::Builder::new()
        .name(EXECUTOR_THREAD_NAME.to_string())
        .spawn(move || server.serve(op))?;

    Ok(ExecutorHandle { thread })
}

/// Join handle for a thread started by [`spawn_executor`].
#[derive(Debug)]
pub struct ExecutorHandle {
    thread: JoinHandle<Result<ServeReport, ChannelError>>,
}

impl ExecutorHandle {
    /// Whether the serve loop has returned.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the serve loop to return.
    ///
    /// Only returns after [`Client::request_shutdown`](crate::Client::request_shutdown)
    /// or a protocol violation.
    pub fn join(self) -> Result<ServeReport, ChannelError> {
        self.thread
            .join()
            .map_err(|_| ChannelError::ExecutorPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::operation::operation_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reverse;

    impl Operation for Reverse {
        async fn call(&mut self, request: String) -> anyhow::Result<String> {
            tokio::task::yield_now().await;
            Ok(request.chars().rev().collect())
        }
    }

    #[test]
    fn test_reverse_round_trip() {
        let channel = Channel::with_capacity(1024).unwrap();
        let executor = spawn_executor(channel.clone(), Reverse).unwrap();

        let client = Client::new(channel);
        assert_eq!(client.call("12345").unwrap(), "54321");

        client.request_shutdown().unwrap();
        let report = executor.join().unwrap();
        assert_eq!(report, ServeReport { requests: 1, failures: 0 });
    }

    #[test]
    fn test_multi_chunk_both_directions() {
        let channel = Channel::with_capacity(3).unwrap();
        let executor = spawn_executor(channel.clone(), Reverse).unwrap();

        let client = Client::new(channel);
        assert_eq!(client.call("abcdefghij").unwrap(), "jihgfedcba");
        assert_eq!(client.call("xy").unwrap(), "yx");

        client.request_shutdown().unwrap();
        assert_eq!(executor.join().unwrap().requests, 2);
    }

    #[test]
    fn test_error_becomes_payload() {
        let channel = Channel::with_capacity(8).unwrap();
        let op = operation_fn(|req: String| async move {
            if req == "bad" {
                anyhow::bail!("cannot handle {req}");
            }
            Ok(req)
        });
        let executor = spawn_executor(channel.clone(), op).unwrap();

        let client = Client::new(channel.clone());
        let response = client.call("bad").unwrap();
        assert_eq!(
            OperationFailure::from_payload(&response),
            Some(OperationFailure::new("cannot handle bad"))
        );
        assert_eq!(channel.state(), Ok(State::Idle));
        assert_eq!(client.call("good").unwrap(), "good");

        client.request_shutdown().unwrap();
        assert_eq!(executor.join().unwrap(), ServeReport { requests: 2, failures: 1 });
    }

    #[test]
    fn test_panic_becomes_payload() {
        let channel = Channel::with_capacity(8).unwrap();
        let op = operation_fn(|_req: String| async move {
            if true {
                panic!("exploded");
            }
            Ok::<_, anyhow::Error>(String::new())
        });
        let executor = spawn_executor(channel.clone(), op).unwrap();

        let client = Client::new(channel);
        let response = client.call("anything").unwrap();
        let failure = OperationFailure::from_payload(&response).unwrap();
        assert_eq!(failure.error, "operation panicked: exploded");

        client.request_shutdown().unwrap();
        assert_eq!(executor.join().unwrap().failures, 1);
    }

    #[test]
    fn test_immediate_shutdown_never_calls_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = Channel::with_capacity(8).unwrap();
        let op = operation_fn({
            let calls = calls.clone();
            move |req: String| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(req) }
            }
        });
        let executor = spawn_executor(channel.clone(), op).unwrap();

        Client::new(channel).request_shutdown().unwrap();
        assert_eq!(executor.join().unwrap(), ServeReport::default());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_state_poisons_and_stops_executor() {
        let channel = Channel::with_capacity(8).unwrap();
        let executor = spawn_executor(channel.clone(), Reverse).unwrap();

        // Corrupt the word the executor is sleeping on.
        channel.state_word().swap(42);
        channel.state_word().wake_all();

        assert!(matches!(
            executor.join(),
            Err(ChannelError::ProtocolViolation(Violation::UnknownState(42)))
        ));
        assert!(channel.is_poisoned());
    }

    #[test]
    fn test_oversize_request_poisons_and_stops_executor() {
        let channel = Channel::with_capacity(4).unwrap();
        let executor = spawn_executor(channel.clone(), Reverse).unwrap();

        // A driver announcing more units than the buffer holds.
        channel.store_raw_transfer_size(9);
        channel.transition(State::Idle, State::RequestFull).unwrap();

        assert!(matches!(
            executor.join(),
            Err(ChannelError::ProtocolViolation(Violation::SizeExceedsCapacity {
                size: 9,
                capacity: 4
            }))
        ));
        assert!(channel.is_poisoned());
    }
}
