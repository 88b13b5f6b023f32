//! # multitask
//!
//! Round-robin multitasking for bare-metal microcontrollers, without an
//! operating system or a heap.
//!
//! Two schedulers are provided:
//!
//! * [`Cooperative`] switches tasks only when a task calls
//!   [`Cooperative::yield_now`].
//! * [`Preemptive`] switches tasks from a periodic timer interrupt, and
//!   splices newly created tasks into the rotation with an admission
//!   handshake.
//!
//! Both keep a fixed table of [`MAX_TASKS`] slots. Slot [`MAIN_TASK`] is the
//! context which called `run()`. Task stacks are carved out of one arena that
//! lives in the stack frame of `run()`, so no task can outlive its session.
//!
//! Everything that touches registers, the interrupt mask or a timer sits
//! behind the [`Port`] and [`Timer`] traits. See [`port`] for the available
//! backends.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

#[cfg(any(test, feature = "host"))]
extern crate std;

#[macro_use]
mod log;

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod asm;

mod config;
mod cooperative;
mod error;
pub mod port;
mod preemptive;
mod scheduler;
mod stack;
#[cfg(any(test, feature = "host", all(target_arch = "arm", target_os = "none")))]
mod stack_pusher;
mod task;

pub use config::Config;
pub use cooperative::{CoopState, Cooperative};
pub use error::Error;
pub use port::{Port, TickHandler, Timer};
pub use preemptive::{PreemptState, Preemptive};
pub use stack::Arena;
#[cfg(any(test, feature = "host", all(target_arch = "arm", target_os = "none")))]
use stack_pusher::StackPusher;
pub use task::{TaskEntry, TaskId};

/// The number of slots in a task table, including the one reserved for Main
pub const MAX_TASKS: usize = 8;

/// The slot which represents the caller of `run()`
pub const MAIN_TASK: usize = 0;

/// Default arena capacity, in bytes
///
/// Enough for every user slot to have the port's default stack: 2 KiB on a
/// microcontroller.
#[cfg(target_os = "none")]
pub const DEFAULT_ARENA_SIZE: usize = (MAX_TASKS - 1) * 2048;

/// Default arena capacity, in bytes
///
/// Enough for every user slot to have the port's default stack: 32 KiB on
/// the host.
#[cfg(not(target_os = "none"))]
pub const DEFAULT_ARENA_SIZE: usize = (MAX_TASKS - 1) * 32 * 1024;

// End of File
