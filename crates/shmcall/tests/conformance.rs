//! Conformance scenarios from shmcall-testkit, run against each driver
//! polling configuration.

use shmcall::ChannelConfig;
use shmcall_testkit::ChannelFactory;

/// Driver spins in a tight loop.
struct SpinFactory;

impl ChannelFactory for SpinFactory {
    fn config(capacity: usize) -> ChannelConfig {
        ChannelConfig::default().with_capacity(capacity)
    }
}

/// Driver yields its time slice every few spins.
struct YieldingFactory;

impl ChannelFactory for YieldingFactory {
    fn config(capacity: usize) -> ChannelConfig {
        ChannelConfig::default()
            .with_capacity(capacity)
            .with_spin_before_yield(16)
    }
}

macro_rules! conformance {
    ($factory:ty, $($name:ident),+ $(,)?) => {
        $(
            #[test]
            fn $name() {
                shmcall_testkit::$name::<$factory>();
            }
        )+
    };
}

mod spin {
    use super::*;

    conformance!(
        SpinFactory,
        run_identity_round_trip,
        run_request_reassembly,
        run_chunk_boundaries,
        run_sequential_calls,
        run_operation_failure,
        run_shutdown,
        run_concurrent_call_is_busy,
    );
}

mod yielding {
    use super::*;

    conformance!(
        YieldingFactory,
        run_identity_round_trip,
        run_request_reassembly,
        run_chunk_boundaries,
        run_sequential_calls,
        run_operation_failure,
        run_shutdown,
        run_concurrent_call_is_busy,
    );
}
