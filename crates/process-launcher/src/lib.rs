//! Local process launching for devstack
//!
//! This crate spawns the OS processes that back supervised services. It
//! provides a reusable [`Command`] builder, a [`LocalLauncher`] that starts a
//! command in its own process group with piped output, an [`OutputStream`]
//! yielding captured lines tagged with an inferred [`LogLevel`], and
//! pid-level signalling helpers used both for our own children and for
//! foreign processes that occupy a port.

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod event;
pub mod launcher;
pub mod process;

pub use command::Command;
pub use error::{Error, Result};
pub use event::{LogLevel, LogSource, OutputLine};
pub use launcher::{CapturedOutput, LocalLauncher, OutputStream};
pub use process::{
    ExitStatus, LocalProcessHandle, SignalScope, is_alive, resident_memory, send_signal,
};

/// Signals re-exported so callers don't need a direct `nix` dependency
pub use nix::sys::signal::Signal;
