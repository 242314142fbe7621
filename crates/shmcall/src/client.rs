//! Driver side: synchronous-looking calls from a thread that may not block.
//!
//! Every wait on this side is a busy-poll of the state word. The client has
//! no access to the futex wait, only to the wake, so it cannot suspend the
//! driver thread even by accident.

use std::sync::Arc;

use crate::codec::{ChunkReader, ChunkWriter};
use crate::error::{ChannelError, Violation};
use crate::layout::{Channel, State};

/// Driver-side handle to a channel.
#[derive(Debug, Clone)]
pub struct Client {
    channel: Arc<Channel>,
}

impl Client {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    #[inline]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Send `message` to the executor and spin until its response arrives.
    ///
    /// Fails with [`ChannelError::ChannelBusy`] if another call is in
    /// flight on this channel or the channel is not idle. A failing
    /// operation is not an error here: its failure payload is returned as
    /// the response text.
    pub fn call(&self, message: &str) -> Result<String, ChannelError> {
        let _claim = DriverClaim::acquire(&self.channel)?;

        match self.channel.state()? {
            State::Idle => {}
            state => return Err(ChannelError::ChannelBusy { state }),
        }

        self.exchange(message)
            .map_err(|violation| self.channel.poison(violation))
    }

    /// Ask the executor to leave its serve loop.
    ///
    /// Only valid while the channel is idle.
    pub fn request_shutdown(&self) -> Result<(), ChannelError> {
        let _claim = DriverClaim::acquire(&self.channel)?;

        match self.channel.transition(State::Idle, State::Shutdown) {
            Ok(()) => {
                tracing::debug!("shutdown requested");
                Ok(())
            }
            Err(Violation::UnexpectedState { found, .. }) => {
                Err(ChannelError::ChannelBusy { state: found })
            }
            Err(violation) => Err(violation.into()),
        }
    }

    fn exchange(&self, message: &str) -> Result<String, Violation> {
        self.send_request(message)?;
        self.read_response()
    }

    fn send_request(&self, message: &str) -> Result<(), Violation> {
        let channel = &*self.channel;
        let mut writer = ChunkWriter::new(message);
        let mut from = State::Idle;

        while let Some(chunk) = writer.next_chunk(channel) {
            channel.store_transfer_size(chunk.len);
            channel.transition(from, State::request(chunk.is_final))?;
            tracing::trace!(len = chunk.len, is_final = chunk.is_final, "request chunk sent");

            if chunk.is_final {
                break;
            }

            // The executor acknowledges each partial chunk with Await.
            self.poll_until(&[State::Await], &[State::RequestPartial], "sending request")?;
            from = State::Await;
        }

        tracing::debug!(units = writer.len(), "request sent");
        Ok(())
    }

    fn read_response(&self) -> Result<String, Violation> {
        let channel = &*self.channel;
        let mut reader = ChunkReader::new();

        loop {
            let state = self.poll_until(
                &[State::ResponsePartial, State::ResponseFull],
                &[State::RequestFull, State::Await],
                "awaiting response",
            )?;

            let size = channel.transfer_size()?;
            reader.read_chunk(channel, size)?;
            channel.store_transfer_size(0);
            tracing::trace!(len = size, is_final = state.is_final_chunk(), "response chunk read");

            if state == State::ResponseFull {
                channel.transition(State::ResponseFull, State::Idle)?;
                break;
            }

            channel.transition(State::ResponsePartial, State::Await)?;
        }

        tracing::debug!(units = reader.units(), chunks = reader.chunks(), "response received");
        Ok(reader.finish())
    }

    /// Spin until the state is one of `ready`.
    ///
    /// States in `pending` are the ones the peer may legitimately still be
    /// in; anything else is a protocol violation.
    fn poll_until(
        &self,
        ready: &[State],
        pending: &[State],
        phase: &'static str,
    ) -> Result<State, Violation> {
        let word = self.channel.state_word();
        let spins_per_yield = self.channel.spin_before_yield();
        let mut spins: u32 = 0;

        loop {
            let state = State::from_raw(word.load())?;
            if ready.contains(&state) {
                return Ok(state);
            }
            if !pending.contains(&state) {
                return Err(Violation::UnexpectedState { found: state, phase });
            }

            spins = spins.wrapping_add(1);
            if spins_per_yield != 0 && spins % spins_per_yield == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Exclusive hold on the driver role for the duration of one call.
struct DriverClaim<'a> {
    channel: &'a Channel,
}

impl<'a> DriverClaim<'a> {
    fn acquire(channel: &'a Channel) -> Result<Self, ChannelError> {
        if channel.try_claim_driver() {
            return Ok(Self { channel });
        }
        let state = channel.state()?;
        Err(ChannelError::ChannelBusy { state })
    }
}

impl Drop for DriverClaim<'_> {
    fn drop(&mut self) {
        self.channel.release_driver();
    }
}
