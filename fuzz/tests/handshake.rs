//! Bolero fuzzer for the driver/executor handshake.
//!
//! Properties tested:
//! - No interleaving of the two sides breaks the state invariants
//! - Every request arrives intact, in order
//! - Every response matches its request
//! - Shutdown is reached from Idle and stops the executor

use bolero::check;
use shmcall_fuzz::channel_model::{execute_and_verify, Side};

const MAX_MESSAGES: usize = 6;
const MAX_UNITS: usize = 40;

fn main() {
    check!()
        .with_type::<HandshakeInput>()
        .for_each(|input| {
            let capacity = usize::from(input.capacity % 8) + 1;
            let messages: Vec<String> = input
                .messages
                .iter()
                .take(MAX_MESSAGES)
                .map(|m| m.chars().take(MAX_UNITS).collect())
                .collect();
            let schedule: Vec<Side> = input.schedule.iter().map(|s| s.to_side()).collect();

            if let Err(e) = execute_and_verify(capacity, &messages, &schedule) {
                panic!("Invariant violated: {}", e);
            }
        });
}

#[derive(Debug, Clone, bolero::TypeGenerator)]
struct HandshakeInput {
    capacity: u8,
    messages: Vec<String>,
    schedule: Vec<SideInput>,
}

/// Fuzz-friendly stand-in for `Side`.
#[derive(Debug, Clone, Copy, bolero::TypeGenerator)]
enum SideInput {
    Driver,
    Executor,
}

impl SideInput {
    fn to_side(self) -> Side {
        match self {
            SideInput::Driver => Side::Driver,
            SideInput::Executor => Side::Executor,
        }
    }
}
