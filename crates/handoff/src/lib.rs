//! # handoff
//!
//! Zero-downtime process succession for a network server.
//!
//! ## Overview
//!
//! A running server hands its live listening socket to a freshly spawned
//! replacement process, then retires itself:
//! 1. On `SIGHUP` the old process opens a unix-domain control channel
//! 2. It spawns its own executable with the listening socket inherited at fd 3
//! 3. The new process dials the control channel, sends `get_listener` and
//!    receives the listener metadata (address, fd, descriptor name)
//! 4. The new process adopts fd 3 and starts accepting
//! 5. The old process stops accepting, drains in-flight connections (bounded
//!    by the shutdown timeout) and exits
//!
//! If no replacement dials back within 4 seconds the attempt is abandoned and
//! the old process keeps serving.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: succession (spawn replacement, hand off, drain, exit)
//! - `SIGTERM`, `SIGINT`: graceful shutdown (drain and exit)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

pub mod config;
mod error;
pub mod lifecycle;
pub mod listener;
pub mod metadata;
pub mod responder;
pub mod server;
pub mod shutdown;
pub mod succession;

pub use config::Config;
pub use error::{AcquireError, ConfigError, Error, HandoffError, ShutdownError, SpawnError};
pub use lifecycle::{Lifecycle, LifecycleOutcome, LifecycleSignal, LifecycleState};
pub use listener::{acquire, ListenerHandle};
pub use metadata::ListenerMetadata;
pub use responder::HandoffEvent;
pub use server::{Generation, Server};
pub use shutdown::{ConnectionGuard, GracefulShutdown};
pub use succession::{ExecSpawner, Spawner, Succession};
