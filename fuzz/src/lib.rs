//! Fuzzing harnesses for the shmcall channel.
//!
//! The handshake fuzzer runs a single-threaded replica of the two-party
//! state machine, letting the fuzzer pick which side moves next. The
//! chunking fuzzer drives the real codec against an in-process channel.

pub mod channel_model;
