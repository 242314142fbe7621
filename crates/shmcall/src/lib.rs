//! shmcall: synchronous-looking calls from a thread that must never block.
//!
//! A *driver* thread (one that may not use a blocking wait) sends a text
//! request to an *executor* thread, which performs an asynchronous
//! [`Operation`] and sends the text response back. Both sides share one
//! [`Channel`]: two atomic words and a fixed-capacity text buffer.
//!
//! # Characteristics
//!
//! - One channel, one driver, one executor
//! - Messages of any length, moved in chunks of at most `capacity` units
//! - Driver busy-polls; executor sleeps on a futex
//! - Operation failures come back as data, never as channel errors
//! - Protocol violations poison the channel
//!
//! # Handshake
//!
//! ```text
//!   driver                   state word                 executor
//!   ──────                   ──────────                 ────────
//!   write chunk  ──────────▶ RequestPartial ─────────▶ read chunk
//!   (spin)       ◀────────── Await          ◀───────── (futex sleep)
//!   write last   ──────────▶ RequestFull    ─────────▶ read, run op
//!   read chunk   ◀────────── ResponsePartial ◀──────── write chunk
//!   (spin)       ──────────▶ Await          ─────────▶ write last
//!   read last    ◀────────── ResponseFull   ◀───────── (futex sleep)
//!   release      ──────────▶ Idle           ─────────▶ wait for next
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use shmcall::{operation_fn, spawn_executor, Channel, Client};
//!
//! let channel = Channel::with_capacity(1024)?;
//! let executor = spawn_executor(channel.clone(), operation_fn(|req: String| async move {
//!     Ok::<_, anyhow::Error>(req.chars().rev().collect())
//! }))?;
//!
//! let client = Client::new(channel);
//! assert_eq!(client.call("12345")?, "54321");
//!
//! client.request_shutdown()?;
//! executor.join()?;
//! ```

mod client;
pub mod codec;
mod config;
mod error;
mod futex;
pub mod layout;
mod operation;
mod server;

pub use client::Client;
pub use config::{ChannelConfig, DEFAULT_CAPACITY, MAX_CAPACITY};
pub use error::{ChannelError, ConfigError, Violation};
pub use layout::{Channel, ChannelSnapshot, State};
pub use operation::{operation_fn, FnOperation, Operation, OperationFailure};
pub use server::{spawn_executor, ExecutorHandle, ServeReport, Server, EXECUTOR_THREAD_NAME};
