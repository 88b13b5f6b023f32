//! Contains the [`Cooperative`] scheduler

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{
    Arena, Config, DEFAULT_ARENA_SIZE, Error, MAIN_TASK, MAX_TASKS, Port, TaskEntry, TaskId,
    scheduler::TaskTable, task::State,
};

/// The lifecycle of a slot under the [`Cooperative`] scheduler
///
/// There is no separate "running" state. The live task is still `Ready`.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum CoopState {
    /// Nothing lives in this slot
    Free = 0,
    /// A task is registered, waiting for `run()` to give it a stack
    Created = 1,
    /// The task has a stack and takes part in the rotation
    Ready = 2,
}

impl State for CoopState {
    const FREE: Self = CoopState::Free;
    const CREATED: Self = CoopState::Created;

    fn into_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CoopState::Created,
            2 => CoopState::Ready,
            _ => CoopState::Free,
        }
    }
}

/// A cooperative, round-robin scheduler
///
/// Tasks only give up the CPU when they call [`Cooperative::yield_now`].
/// The arena for task stacks holds `ARENA` bytes and lives inside
/// [`Cooperative::run`].
pub struct Cooperative<'a, P: Port, const ARENA: usize = DEFAULT_ARENA_SIZE> {
    table: TaskTable<'a, P, Cooperative<'a, P, ARENA>>,
}

impl<'a, P: Port, const ARENA: usize> Cooperative<'a, P, ARENA> {
    /// Build an idle scheduler, with every slot free
    pub fn new() -> Cooperative<'a, P, ARENA> {
        Cooperative {
            table: TaskTable::new(),
        }
    }

    /// Start a new session with the default configuration
    pub fn begin(&self) {
        self.begin_with(Config::new())
    }

    /// Start a new session with the given stack size per task
    pub fn begin_with_stack_size(&self, stack_size: usize) {
        self.begin_with(Config::new().stack_size(stack_size))
    }

    /// Start a new session, marking every slot free
    ///
    /// Ignored if a session is running.
    pub fn begin_with(&self, config: Config) {
        if self.table.is_running() {
            warn!("begin() ignored - session running");
            return;
        }
        self.table.reset::<CoopState>(config);
    }

    /// Register a task
    ///
    /// If the session is already running (which needs pre-allocated stacks)
    /// the task joins the rotation straight away.
    pub fn create_task(&self, entry: TaskEntry<'a, Self>) -> Result<TaskId, Error> {
        let was_masked = P::mask();
        let result = self.table.register::<CoopState>(entry).map(|slot| {
            debug!("Created task {=usize}", slot);
            if self.table.is_running() {
                // SAFETY: the session is running with pre-allocated stacks,
                // so the arena covers every slot
                unsafe {
                    self.table
                        .prepare(slot, Self::trampoline, self as *const Self as *const ())
                };
                self.table.set_state(slot, CoopState::Ready);
            }
            TaskId(slot)
        });
        if !was_masked {
            P::unmask();
        }
        result
    }

    /// Run every task until they have all finished
    ///
    /// Blocks the caller, which becomes the Main pseudo-task for the session.
    pub fn run(&self) -> Result<(), Error> {
        if self.table.is_running() {
            return Err(Error::AlreadyRunning);
        }

        // the stacks live here, so no task can outlive this call
        let arena = Arena::<ARENA>::new();
        self.table.open_session(
            &arena,
            CoopState::Ready,
            Self::trampoline,
            self as *const Self as *const (),
        )?;

        self.table.set_current(MAIN_TASK);
        self.table.set_running(true);

        let was_masked = P::mask();
        self.reschedule();
        if !was_masked {
            P::unmask();
        }

        self.table.set_running(false);
        self.table.close_session();
        info!("Session finished");
        Ok(())
    }

    /// Give the CPU to the next ready task
    ///
    /// Does nothing outside a session, from an interrupt handler, or with
    /// interrupts masked, because the calling context could not be resumed
    /// safely.
    pub fn yield_now(&self) {
        if !self.table.is_running() || P::in_interrupt() {
            return;
        }
        if P::mask() {
            // they were already masked
            return;
        }
        self.reschedule();
        P::unmask();
    }

    /// Is a session running?
    pub fn is_running(&self) -> bool {
        self.table.is_running()
    }

    /// Which task is executing?
    pub fn current_task(&self) -> TaskId {
        TaskId(self.table.current())
    }

    /// Get the state of a slot, if it exists
    pub fn state(&self, id: TaskId) -> Option<CoopState> {
        (id.0 < MAX_TASKS).then(|| self.table.state::<CoopState>(id.0))
    }

    /// Switch to the next ready slot after the current one
    ///
    /// Interrupts must be masked. If nothing else is ready we go back to
    /// Main, unless Main is the one asking.
    fn reschedule(&self) {
        let prev = self.table.current();
        match self
            .table
            .next_in_rotation(prev, |state: CoopState| state == CoopState::Ready)
        {
            Some(next) if next == prev => {
                // nobody else wants the CPU
            }
            Some(next) => {
                trace!("Switch {=usize} -> {=usize}", prev, next);
                self.table.set_current(next);
                // SAFETY: `next` is Ready, so its snapshot is resumable and its
                // stack is in the live arena
                unsafe {
                    P::switch(
                        self.table.tcb(prev).snapshot(),
                        self.table.tcb(next).snapshot(),
                    )
                };
            }
            None if prev == MAIN_TASK => {
                // no tasks at all
            }
            None => {
                trace!("No tasks left, back to Main");
                self.table.set_current(MAIN_TASK);
                // SAFETY: Main switched away from `run()` to start the
                // session, so its snapshot was captured
                unsafe { P::restore(self.table.tcb(MAIN_TASK).snapshot()) };
            }
        }
    }

    /// Where every task starts
    ///
    /// Runs the entry function, frees the slot and moves on. Never returns
    /// because a free slot is never resumed.
    extern "C" fn trampoline(context: *const ()) -> ! {
        // SAFETY: `run()` and `create_task()` pass `self`, which outlives the
        // session
        let this = unsafe { &*(context as *const Self) };
        let slot = this.table.current();
        P::unmask();
        if let Some(entry) = this.table.tcb(slot).entry() {
            entry(this);
        }
        let _ = P::mask();
        this.table.set_state(slot, CoopState::Free);
        debug!("Task {=usize} finished", slot);
        this.reschedule();
        unreachable!();
    }
}

impl<'a, P: Port, const ARENA: usize> Default for Cooperative<'a, P, ARENA> {
    fn default() -> Self {
        Cooperative::new()
    }
}


// End of File
