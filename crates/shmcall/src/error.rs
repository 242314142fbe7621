//! Error types for the channel.

use crate::layout::State;

/// A channel-level failure.
///
/// Failures of the operation performed by the executor are not represented
/// here: they travel back to the driver as ordinary response text (see
/// [`OperationFailure`](crate::OperationFailure)).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// An exchange was started while the channel was not idle.
    ///
    /// Callers must serialize their calls; this is never retried.
    #[error("channel busy (state {state:?})")]
    ChannelBusy {
        /// State observed when the exchange was refused.
        state: State,
    },

    /// The shared state is inconsistent with the handshake protocol.
    ///
    /// The channel is poisoned once this is reported and refuses further
    /// transfers.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),

    /// The channel configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The executor could not build its async runtime.
    #[error("failed to start executor runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The executor thread panicked outside of the operation.
    #[error("executor thread panicked")]
    ExecutorPanicked,
}

/// The specific inconsistency behind a [`ChannelError::ProtocolViolation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// The state word holds a value outside the defined states.
    #[error("unknown state value {0}")]
    UnknownState(u32),

    /// The size word claims more units than the buffer holds.
    #[error("transfer size {size} exceeds capacity {capacity}")]
    SizeExceedsCapacity { size: usize, capacity: usize },

    /// A buffer unit is not a Unicode scalar value.
    #[error("invalid text unit {unit:#x} at index {index}")]
    InvalidTextUnit { index: usize, unit: u32 },

    /// A state appeared that the current phase does not allow.
    #[error("unexpected state {found:?} while {phase}")]
    UnexpectedState { found: State, phase: &'static str },

    /// The peer (or an earlier call) already reported a violation.
    #[error("channel poisoned by an earlier protocol violation")]
    Poisoned,
}

/// Rejected [`ChannelConfig`](crate::ChannelConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("capacity must be at least 1 text unit")]
    ZeroCapacity,

    #[error("capacity {capacity} exceeds maximum {max}")]
    CapacityTooLarge { capacity: usize, max: usize },
}
