//! Contains the [`TaskTable`] type, shared by both schedulers

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    Arena, Config, Error, MAIN_TASK, MAX_TASKS, Port, TaskEntry,
    port::EntryTrampoline,
    stack,
    task::{State, Tcb},
};

/// A fixed table of task slots, plus the state of the current session
///
/// `S` is the type handed to each task's entry function (the scheduler that
/// owns this table).
///
/// Everything here is either only touched by whichever task is live, or is
/// touched with interrupts masked. There are no locks.
pub(crate) struct TaskTable<'a, P: Port, S> {
    /// A fixed list of all our task slots
    tasks: [Tcb<'a, P, S>; MAX_TASKS],
    /// Which slot is live (executing, with a stale snapshot)
    current: AtomicUsize,
    /// Is a session running?
    running: AtomicBool,
    /// Base of the arena, only valid while running
    stack_base: AtomicPtr<u8>,
    /// The configuration given to `begin`, with the stack size made valid
    config: Cell<Config>,
}

impl<'a, P: Port, S> TaskTable<'a, P, S> {
    /// Build an empty table, with the default configuration
    pub(crate) fn new() -> TaskTable<'a, P, S> {
        let table = TaskTable {
            tasks: core::array::from_fn(|_| Tcb::new()),
            current: AtomicUsize::new(MAIN_TASK),
            running: AtomicBool::new(false),
            stack_base: AtomicPtr::new(core::ptr::null_mut()),
            config: Cell::new(Config::new()),
        };
        table.configure(Config::new());
        table
    }

    /// Mark every slot free and adopt a new configuration
    pub(crate) fn reset<T: State>(&self, config: Config) {
        let was_masked = P::mask();
        for task in self.tasks.iter() {
            task.set_state(T::FREE);
            // SAFETY: interrupts are masked and no session is running
            unsafe { task.set_entry(None) };
        }
        self.current.store(MAIN_TASK, Ordering::Relaxed);
        self.stack_base.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.configure(config);
        if !was_masked {
            P::unmask();
        }
    }

    /// Store the configuration, with a stack size we can actually use
    fn configure(&self, config: Config) {
        let stack_size = stack::effective_stack_size::<P>(config.stack_size);
        self.config.set(config.stack_size(stack_size));
    }

    /// Get the configuration in use
    pub(crate) fn config(&self) -> Config {
        self.config.get()
    }

    /// Get the live slot
    pub(crate) fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Change which slot is live
    ///
    /// Do this just before switching to it.
    pub(crate) fn set_current(&self, slot: usize) {
        self.current.store(slot, Ordering::Relaxed)
    }

    /// Is a session running?
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Flag the session as running, or not
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed)
    }

    /// Get a slot
    pub(crate) fn tcb(&self, slot: usize) -> &Tcb<'a, P, S> {
        &self.tasks[slot]
    }

    /// Get the state of a slot
    pub(crate) fn state<T: State>(&self, slot: usize) -> T {
        self.tasks[slot].state()
    }

    /// Set the state of a slot
    pub(crate) fn set_state<T: State>(&self, slot: usize, state: T) {
        self.tasks[slot].set_state(state)
    }

    /// Does any slot satisfy `pred`?
    pub(crate) fn any<T: State>(&self, pred: impl Fn(T) -> bool) -> bool {
        self.tasks.iter().any(|task| pred(task.state()))
    }

    /// Register `entry` in the first free slot after Main
    ///
    /// The slot moves to `CREATED`. Call with interrupts masked.
    pub(crate) fn register<T: State>(&self, entry: TaskEntry<'a, S>) -> Result<usize, Error> {
        if self.is_running() && !self.config().preallocate {
            return Err(Error::SessionActive);
        }
        let slot = (0..MAX_TASKS)
            .filter(|&idx| idx != MAIN_TASK)
            .find(|&idx| self.state::<T>(idx) == T::FREE)
            .ok_or(Error::NoFreeSlot)?;
        // SAFETY: interrupts are masked and the slot is free, so nobody runs it
        unsafe { self.tasks[slot].set_entry(Some(entry)) };
        self.set_state(slot, T::CREATED);
        Ok(slot)
    }

    /// Select the next slot in the round-robin
    ///
    /// We start with the one after `from` and wrap around, so `from` itself
    /// is the last slot we look at. Returns the first slot whose state
    /// satisfies `pred`.
    pub(crate) fn next_in_rotation<T: State>(
        &self,
        from: usize,
        pred: impl Fn(T) -> bool,
    ) -> Option<usize> {
        for mut idx in (from + 1)..=(from + MAX_TASKS) {
            // do the wrap-around
            if idx >= MAX_TASKS {
                idx -= MAX_TASKS;
            }
            // is this a task we can run right now?
            if pred(self.state(idx)) {
                return Some(idx);
            }
        }
        None
    }

    /// Carve the arena into stacks, and get every `CREATED` slot ready to run
    ///
    /// Each waiting slot gets a snapshot which starts `trampoline(arg)` on
    /// its own stack, and moves to `ready`. Returns the number of tasks made
    /// ready. Fails, changing nothing, if the arena is too small.
    pub(crate) fn open_session<T: State, const LEN: usize>(
        &self,
        arena: &Arena<LEN>,
        ready: T,
        trampoline: EntryTrampoline,
        arg: *const (),
    ) -> Result<usize, Error> {
        let config = self.config();
        let highest_slot = (0..MAX_TASKS)
            .rev()
            .find(|&idx| idx != MAIN_TASK && self.state::<T>(idx) != T::FREE)
            .unwrap_or(MAIN_TASK);
        let needed = stack::arena_needed(config.stack_size, config.preallocate, highest_slot);
        if needed > arena.len() {
            warn!(
                "Arena of {=usize} bytes cannot hold {=usize} bytes of stacks",
                arena.len(),
                needed
            );
            return Err(Error::ArenaTooSmall {
                needed,
                available: arena.len(),
            });
        }

        self.stack_base.store(arena.base(), Ordering::Relaxed);
        let mut count = 0;
        for slot in (0..MAX_TASKS).filter(|&idx| idx != MAIN_TASK) {
            if self.state::<T>(slot) == T::CREATED {
                // SAFETY: the arena is big enough for this slot, and outlives
                // the session
                unsafe { self.prepare(slot, trampoline, arg) };
                self.set_state(slot, ready);
                count += 1;
            }
        }
        info!(
            "Session using {=usize} of {=usize} arena bytes, {=usize} tasks",
            needed,
            arena.len(),
            count
        );
        Ok(count)
    }

    /// Give a slot a fresh snapshot, on its own stack in the arena
    ///
    /// # Safety
    ///
    /// A session must be running (so the arena exists) and the arena must
    /// cover this slot. Nobody may be running in the slot.
    pub(crate) unsafe fn prepare(&self, slot: usize, trampoline: EntryTrampoline, arg: *const ()) {
        let stack_size = self.config().stack_size;
        let top = stack::stack_top(self.stack_base.load(Ordering::Relaxed), stack_size, slot);
        debug!(
            "Init task frame {=usize}, with stack @ 0x{=usize:08x}",
            slot,
            top as usize
        );
        unsafe { P::prepare(self.tasks[slot].snapshot(), top, trampoline, arg) };
    }

    /// Forget the arena, once the session is over
    pub(crate) fn close_session(&self) {
        self.stack_base.store(core::ptr::null_mut(), Ordering::Relaxed);
        self.current.store(MAIN_TASK, Ordering::Relaxed);
    }
}

// End of File
