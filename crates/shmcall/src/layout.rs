//! Shared channel layout and the handshake state machine.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ state word     (u32, futex)  │  which side may write next
//! │ transfer size  (u32)         │  units valid in the buffer
//! ├──────────────────────────────┤
//! │ text buffer [u32; capacity]  │  one chunk, reused both ways
//! └──────────────────────────────┘
//! ```
//!
//! Ownership of the state word alternates between driver and executor; the
//! current value names the only side allowed to move it. Every move is a
//! compare-exchange from the state the mover expects, so a concurrent write
//! (or a poisoned channel) shows up as a failed transition instead of being
//! silently overwritten.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Violation};
use crate::futex::Futex;

/// Value stored in the state word once the channel is poisoned.
const POISONED: u32 = u32::MAX;

/// Handshake states.
///
/// Discriminants are the values stored in the shared state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum State {
    /// No exchange in flight; only the driver may leave this state.
    Idle = 0,
    /// The driver wrote the final request chunk.
    RequestFull = 1,
    /// The executor wrote the final response chunk.
    ResponseFull = 2,
    /// The driver wrote a request chunk and more follow.
    RequestPartial = 3,
    /// The executor wrote a response chunk and more follow.
    ResponsePartial = 4,
    /// The reader consumed the buffer; the writer may fill it again.
    Await = 5,
    /// Terminal: the executor leaves its serve loop.
    Shutdown = 6,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Idle,
        State::RequestFull,
        State::ResponseFull,
        State::RequestPartial,
        State::ResponsePartial,
        State::Await,
        State::Shutdown,
    ];

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a raw state word.
    pub fn from_raw(raw: u32) -> Result<Self, Violation> {
        match raw {
            0 => Ok(State::Idle),
            1 => Ok(State::RequestFull),
            2 => Ok(State::ResponseFull),
            3 => Ok(State::RequestPartial),
            4 => Ok(State::ResponsePartial),
            5 => Ok(State::Await),
            6 => Ok(State::Shutdown),
            POISONED => Err(Violation::Poisoned),
            other => Err(Violation::UnknownState(other)),
        }
    }

    /// State announcing a request chunk.
    #[inline]
    pub const fn request(is_final: bool) -> Self {
        if is_final {
            State::RequestFull
        } else {
            State::RequestPartial
        }
    }

    /// State announcing a response chunk.
    #[inline]
    pub const fn response(is_final: bool) -> Self {
        if is_final {
            State::ResponseFull
        } else {
            State::ResponsePartial
        }
    }

    /// Whether the size word is meaningful in this state.
    #[inline]
    pub const fn carries_payload(self) -> bool {
        matches!(
            self,
            State::RequestFull | State::RequestPartial | State::ResponseFull | State::ResponsePartial
        )
    }

    /// Whether this state announces the last chunk of a message.
    #[inline]
    pub const fn is_final_chunk(self) -> bool {
        matches!(self, State::RequestFull | State::ResponseFull)
    }
}

/// The single shared coordination record plus its text buffer.
///
/// Created once and handed to both sides as `Arc<Channel>`.
pub struct Channel {
    state: Futex,
    transfer_size: AtomicU32,
    buffer: Box<[AtomicU32]>,
    /// Sticky copy of the poison, so it survives a racing transition.
    poisoned: AtomicBool,
    /// Held by the client for the whole of a call.
    driver_claimed: AtomicBool,
    spin_before_yield: u32,
}

impl Channel {
    /// Build a channel from a validated configuration.
    pub fn new(config: ChannelConfig) -> Result<Arc<Self>, ChannelError> {
        config.validate()?;

        let buffer = (0..config.capacity).map(|_| AtomicU32::new(0)).collect();

        Ok(Arc::new(Self {
            state: Futex::new(State::Idle.as_raw()),
            transfer_size: AtomicU32::new(0),
            buffer,
            poisoned: AtomicBool::new(false),
            driver_claimed: AtomicBool::new(false),
            spin_before_yield: config.spin_before_yield,
        }))
    }

    /// Build a channel with default settings and the given chunk capacity.
    pub fn with_capacity(capacity: usize) -> Result<Arc<Self>, ChannelError> {
        Self::new(ChannelConfig::default().with_capacity(capacity))
    }

    /// Buffer capacity in text units.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Current state.
    pub fn state(&self) -> Result<State, Violation> {
        if self.is_poisoned() {
            return Err(Violation::Poisoned);
        }
        State::from_raw(self.state.load())
    }

    /// Units announced by the size word, validated against the capacity.
    pub fn transfer_size(&self) -> Result<usize, Violation> {
        let size = self.transfer_size.load(Ordering::SeqCst) as usize;
        if size > self.capacity() {
            return Err(Violation::SizeExceedsCapacity {
                size,
                capacity: self.capacity(),
            });
        }
        Ok(size)
    }

    /// Read both words.
    ///
    /// The two loads are independent, so the pair is only guaranteed
    /// consistent while neither side is mid-transition.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            state: self.state.load(),
            transfer_size: self.transfer_size.load(Ordering::SeqCst),
        }
    }

    /// Whether a protocol violation has been reported on this channel.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Crate-internal protocol primitives
    // ------------------------------------------------------------------

    pub(crate) fn buffer(&self) -> &[AtomicU32] {
        &self.buffer
    }

    pub(crate) fn spin_before_yield(&self) -> u32 {
        self.spin_before_yield
    }

    pub(crate) fn store_transfer_size(&self, size: usize) {
        debug_assert!(size <= self.capacity());
        self.transfer_size.store(size as u32, Ordering::SeqCst);
    }

    /// Write the size word unchecked, to simulate a misbehaving peer.
    #[cfg(test)]
    pub(crate) fn store_raw_transfer_size(&self, size: u32) {
        self.transfer_size.store(size, Ordering::SeqCst);
    }

    /// Move the state word from `from` to `to` and wake the executor.
    ///
    /// Fails if the word no longer holds `from`: either the peer broke the
    /// alternation or the channel was poisoned.
    pub(crate) fn transition(&self, from: State, to: State) -> Result<(), Violation> {
        match self.state.compare_exchange(from.as_raw(), to.as_raw()) {
            Ok(_) => {
                self.state.wake_all();
                Ok(())
            }
            Err(observed) => match State::from_raw(observed) {
                Ok(found) => Err(Violation::UnexpectedState {
                    found,
                    phase: "transitioning",
                }),
                Err(violation) => Err(violation),
            },
        }
    }

    /// Raw state word, for the polling and blocking wait loops.
    pub(crate) fn state_word(&self) -> &Futex {
        &self.state
    }

    /// Mark the channel dead and wake anyone waiting on it.
    ///
    /// Returns the error to hand back to the caller that found the problem.
    pub(crate) fn poison(&self, violation: Violation) -> ChannelError {
        if violation != Violation::Poisoned {
            tracing::error!(%violation, "protocol violation, poisoning channel");
        }
        self.poisoned.store(true, Ordering::SeqCst);
        self.state.swap(POISONED);
        self.state.wake_all();
        ChannelError::ProtocolViolation(violation)
    }

    /// Take the driver role for one exchange.
    pub(crate) fn try_claim_driver(&self) -> bool {
        self.driver_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_driver(&self) {
        self.driver_claimed.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity())
            .field("snapshot", &self.snapshot())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

/// Point-in-time copy of the two channel words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Raw state word.
    pub state: u32,
    /// Raw size word.
    pub transfer_size: u32,
}

impl ChannelSnapshot {
    pub fn state(&self) -> Result<State, Violation> {
        State::from_raw(self.state)
    }

    /// Whether the pair satisfies the channel invariants.
    ///
    /// The state must be one of the defined values, and the size must be
    /// zero whenever no chunk is on offer.
    pub fn is_consistent(&self, capacity: usize) -> bool {
        match self.state() {
            Ok(state) if state.carries_payload() => self.transfer_size as usize <= capacity,
            Ok(_) => self.transfer_size == 0,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_raw_roundtrip() {
        for state in State::ALL {
            assert_eq!(State::from_raw(state.as_raw()), Ok(state));
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert_eq!(State::from_raw(7), Err(Violation::UnknownState(7)));
        assert_eq!(State::from_raw(POISONED), Err(Violation::Poisoned));
    }

    #[test]
    fn test_new_channel_is_idle_and_empty() {
        let channel = Channel::with_capacity(8).unwrap();
        assert_eq!(channel.capacity(), 8);
        assert_eq!(channel.state(), Ok(State::Idle));
        assert_eq!(channel.transfer_size(), Ok(0));
        assert!(channel.snapshot().is_consistent(8));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            Channel::with_capacity(0),
            Err(ChannelError::Config(_))
        ));
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let channel = Channel::with_capacity(4).unwrap();
        channel.transition(State::Idle, State::RequestFull).unwrap();

        let err = channel.transition(State::Idle, State::RequestPartial).unwrap_err();
        assert_eq!(
            err,
            Violation::UnexpectedState {
                found: State::RequestFull,
                phase: "transitioning",
            }
        );
    }

    #[test]
    fn test_oversized_transfer_is_violation() {
        let channel = Channel::with_capacity(4).unwrap();
        channel.transfer_size.store(5, Ordering::SeqCst);
        assert_eq!(
            channel.transfer_size(),
            Err(Violation::SizeExceedsCapacity { size: 5, capacity: 4 })
        );
    }

    #[test]
    fn test_poison_is_sticky() {
        let channel = Channel::with_capacity(4).unwrap();
        let err = channel.poison(Violation::UnknownState(42));
        assert!(matches!(
            err,
            ChannelError::ProtocolViolation(Violation::UnknownState(42))
        ));
        assert!(channel.is_poisoned());
        assert_eq!(channel.state(), Err(Violation::Poisoned));
        assert_eq!(
            channel.transition(State::Idle, State::RequestFull),
            Err(Violation::Poisoned)
        );
    }

    #[test]
    fn test_snapshot_consistency() {
        let payload = ChannelSnapshot {
            state: State::RequestPartial.as_raw(),
            transfer_size: 4,
        };
        assert!(payload.is_consistent(4));
        assert!(!payload.is_consistent(3));

        let idle_with_size = ChannelSnapshot {
            state: State::Await.as_raw(),
            transfer_size: 1,
        };
        assert!(!idle_with_size.is_consistent(4));
    }

    #[test]
    fn test_driver_claim_is_exclusive() {
        let channel = Channel::with_capacity(4).unwrap();
        assert!(channel.try_claim_driver());
        assert!(!channel.try_claim_driver());
        channel.release_driver();
        assert!(channel.try_claim_driver());
    }
}
