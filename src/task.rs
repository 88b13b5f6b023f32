//! Holds the [`Tcb`] type, and the [`TaskId`] and [`TaskEntry`] types

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::Port;

/// The body of a task
///
/// It is handed the scheduler that runs it, so it can yield or create more
/// tasks. When it returns, the task is over and its slot becomes free.
pub type TaskEntry<'a, S> = &'a dyn Fn(&S);

/// Identifies a slot in a task table
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// The Main pseudo-task, which is whoever called `run()`
    pub const MAIN: TaskId = TaskId(crate::MAIN_TASK);

    /// Get the slot index
    pub const fn index(self) -> usize {
        self.0
    }

    /// Is this the Main pseudo-task?
    pub const fn is_main(self) -> bool {
        self.0 == crate::MAIN_TASK
    }
}

#[cfg(target_os = "none")]
impl defmt::Format for TaskId {
    fn format(&self, fmt: defmt::Formatter) {
        if self.is_main() {
            defmt::write!(fmt, "MAIN");
        } else {
            defmt::write!(fmt, "T{=usize:03}", self.0);
        }
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_main() {
            write!(fmt, "MAIN")
        } else {
            write!(fmt, "T{:03}", self.0)
        }
    }
}

/// The lifecycle states of a slot, for one kind of scheduler
///
/// Each scheduler has its own set of states, but they all start at `FREE`
/// and move to `CREATED` when a task is registered.
pub(crate) trait State: Copy + Eq {
    /// Nothing lives in this slot
    const FREE: Self;
    /// A task is registered but has no stack yet
    const CREATED: Self;

    /// Convert to the stored representation
    fn into_raw(self) -> u8;

    /// Convert from the stored representation
    fn from_raw(raw: u8) -> Self;
}

/// A task control block
///
/// Only ever lives inside a task table.
pub(crate) struct Tcb<'a, P: Port, S> {
    /// Register state, valid whenever this task is not the live one
    snapshot: UnsafeCell<P::Snapshot>,
    /// One of the scheduler's states, stored raw
    state: AtomicU8,
    /// What this task runs
    entry: UnsafeCell<Option<TaskEntry<'a, S>>>,
}

impl<'a, P: Port, S> Tcb<'a, P, S> {
    /// Make a free slot
    pub(crate) fn new() -> Tcb<'a, P, S> {
        Tcb {
            snapshot: UnsafeCell::new(P::Snapshot::default()),
            state: AtomicU8::new(0),
            entry: UnsafeCell::new(None),
        }
    }

    /// Get the state of this slot
    pub(crate) fn state<T: State>(&self) -> T {
        T::from_raw(self.state.load(Ordering::Relaxed))
    }

    /// Set the state of this slot
    pub(crate) fn set_state<T: State>(&self, state: T) {
        self.state.store(state.into_raw(), Ordering::Relaxed)
    }

    /// Get a pointer to the register snapshot, for the port to fill or use
    pub(crate) fn snapshot(&self) -> *mut P::Snapshot {
        self.snapshot.get()
    }

    /// Get the entry function
    pub(crate) fn entry(&self) -> Option<TaskEntry<'a, S>> {
        // SAFETY: only written by `set_entry`, which the table calls with
        // interrupts masked on a slot nobody is running
        unsafe { *self.entry.get() }
    }

    /// Set the entry function
    ///
    /// # Safety
    ///
    /// Interrupts must be masked, and the slot must not be running.
    pub(crate) unsafe fn set_entry(&self, entry: Option<TaskEntry<'a, S>>) {
        unsafe { *self.entry.get() = entry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;

    #[test]
    fn task_ids_print_like_slots() {
        assert_eq!(format!("{}", TaskId::MAIN), "MAIN");
        assert_eq!(format!("{}", TaskId(3)), "T003");
        assert!(TaskId(0).is_main());
        assert_eq!(TaskId(5).index(), 5);
    }
}

// End of File
