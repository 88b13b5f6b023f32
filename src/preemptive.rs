//! Contains the [`Preemptive`] scheduler

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::cell::RefCell;

use crate::{
    Arena, Config, DEFAULT_ARENA_SIZE, Error, MAIN_TASK, MAX_TASKS, Port, TaskEntry, TaskId,
    TickHandler, Timer, scheduler::TaskTable, task::State,
};

/// The lifecycle of a slot under the [`Preemptive`] scheduler
///
/// The order matters: anything from `Preparing` upwards counts as a live
/// task.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum PreemptState {
    /// Nothing lives in this slot
    Free = 0,
    /// A task is registered, waiting for `run()` to give it a stack
    Created = 1,
    /// The task in this slot is part-way through admitting another task,
    /// and is waiting for the timer to switch away from it once
    Preparing = 2,
    /// The task has a valid snapshot, but the timer has never switched away
    /// from it, so only a direct jump may resume it
    ReadyJmp = 3,
    /// The timer has switched away from this task at least once, so it is
    /// part of the rotation
    ReadyInt = 4,
}

impl PreemptState {
    /// Does this slot hold a task which has not finished?
    pub fn is_live(self) -> bool {
        self >= PreemptState::Preparing
    }
}

impl State for PreemptState {
    const FREE: Self = PreemptState::Free;
    const CREATED: Self = PreemptState::Created;

    fn into_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => PreemptState::Created,
            2 => PreemptState::Preparing,
            3 => PreemptState::ReadyJmp,
            4 => PreemptState::ReadyInt,
            _ => PreemptState::Free,
        }
    }
}

/// A pre-emptive, round-robin scheduler
///
/// A periodic [`Timer`] interrupt rotates the CPU between tasks, whether or
/// not they have work to do. New tasks are spliced into the rotation with an
/// admission handshake, so a task is never resumed by the timer until the
/// timer has captured it at least once.
///
/// The arena for task stacks holds `ARENA` bytes and lives inside
/// [`Preemptive::run`].
pub struct Preemptive<'a, P: Port, T: Timer, const ARENA: usize = DEFAULT_ARENA_SIZE> {
    table: TaskTable<'a, P, Preemptive<'a, P, T, ARENA>>,
    timer: RefCell<T>,
}

impl<'a, P: Port, T: Timer, const ARENA: usize> Preemptive<'a, P, T, ARENA> {
    /// Build an idle scheduler which pre-empts using the given timer
    pub fn new(timer: T) -> Preemptive<'a, P, T, ARENA> {
        let scheduler = Preemptive {
            table: TaskTable::new(),
            timer: RefCell::new(timer),
        };
        scheduler.table.set_state(MAIN_TASK, PreemptState::Created);
        scheduler
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
    /// Main is marked as created, until the first quantum is over. Ignored if
    /// a session is running.
    pub fn begin_with(&self, config: Config) {
        if self.table.is_running() {
            warn!("begin() ignored - session running");
            return;
        }
        self.table.reset::<PreemptState>(config);
        self.table.set_state(MAIN_TASK, PreemptState::Created);
    }

    /// Register a task
    ///
    /// If the session is already running (which needs pre-allocated stacks)
    /// the task is admitted before this returns: the caller is parked until
    /// the timer has switched away from it, then jumps straight into the new
    /// task.
    pub fn create_task(&self, entry: TaskEntry<'a, Self>) -> Result<TaskId, Error> {
        let was_masked = P::mask();
        let result = self.table.register::<PreemptState>(entry);
        if let Ok(slot) = result {
            debug!("Created task {=usize}", slot);
            if self.table.is_running() {
                // SAFETY: the session is running with pre-allocated stacks,
                // so the arena covers every slot
                unsafe { self.table.prepare(slot, Self::trampoline, self.context()) };
                self.table.set_state(slot, PreemptState::ReadyJmp);
                // An interrupt handler cannot wait for the timer. Main picks
                // the task up on its next pass instead.
                if !P::in_interrupt() {
                    self.fork_task(slot);
                }
            }
        }
        if !was_masked {
            P::unmask();
        }
        result.map(TaskId)
    }

    /// Run every task until they have all finished
    ///
    /// Blocks the caller, which becomes the Main pseudo-task. Main admits
    /// each task in turn and then drops out of the rotation, only getting the
    /// CPU back when no task is ready.
    pub fn run(&self) -> Result<(), Error> {
        let was_masked = P::mask();
        if self.table.is_running() {
            if !was_masked {
                P::unmask();
            }
            return Err(Error::AlreadyRunning);
        }

        // the stacks live here, so no task can outlive this call
        let arena = Arena::<ARENA>::new();
        if let Err(e) = self.table.open_session(
            &arena,
            PreemptState::ReadyJmp,
            Self::trampoline,
            self.context(),
        ) {
            if !was_masked {
                P::unmask();
            }
            return Err(e);
        }
        self.table.set_current(MAIN_TASK);

        {
            let mut timer = self.timer.borrow_mut();
            timer.configure(self.table.config().tick_period);
            // SAFETY: the handler only runs while the timer is enabled, and we
            // disable it before `self` can go away
            timer.attach(unsafe { TickHandler::new(Self::tick_handler, self.context()) });
            timer.enable();
        }

        self.table.set_running(true);
        P::unmask();

        loop {
            self.fork_all();
            // Main only bootstraps tasks - it does not stay in the rotation
            self.table.set_state(MAIN_TASK, PreemptState::Free);
            if !self.has_tasks() {
                break;
            }
        }

        let _ = P::mask();
        self.timer.borrow_mut().disable();
        self.table.set_running(false);
        self.table.close_session();
        info!("Session finished");
        if !was_masked {
            P::unmask();
        }
        Ok(())
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
    pub fn state(&self, id: TaskId) -> Option<PreemptState> {
        (id.0 < MAX_TASKS).then(|| self.table.state::<PreemptState>(id.0))
    }

    /// The timer path - switch to the next task in the rotation
    ///
    /// Only tasks in `ReadyInt` are candidates. The task we leave has now
    /// been captured by the timer path, so if it was waiting for that, it
    /// joins the rotation. With no candidates at all, Main gets the CPU.
    pub fn on_tick(&self) {
        if !self.table.is_running() {
            return;
        }
        let was_masked = P::mask();

        let prev = self.table.current();
        let next = self
            .table
            .next_in_rotation(prev, |state: PreemptState| state == PreemptState::ReadyInt);
        if matches!(
            self.table.state::<PreemptState>(prev),
            PreemptState::ReadyJmp | PreemptState::Preparing
        ) {
            self.table.set_state(prev, PreemptState::ReadyInt);
        }
        let next = next.unwrap_or(MAIN_TASK);

        if next != prev {
            trace!("Tick {=usize} -> {=usize}", prev, next);
            self.table.set_current(next);
            // SAFETY: `next` is either ReadyInt, so the timer path captured
            // it, or Main, which captured itself before leaving the rotation
            unsafe {
                P::switch(
                    self.table.tcb(prev).snapshot(),
                    self.table.tcb(next).snapshot(),
                )
            };
        }

        if !was_masked {
            P::unmask();
        }
    }

    /// Admit the task in `target`, which must be `ReadyJmp`
    ///
    /// The caller marks itself `Preparing` and opens the interrupt mask
    /// repeatedly until the timer has switched away from it (and so made it
    /// `ReadyInt`). Only then is it safe to jump into the new task, because
    /// the timer can resume the caller. If someone else admitted the target
    /// in the meantime, we just stop.
    ///
    /// Returns with interrupts masked.
    fn fork_task(&self, target: usize) {
        let me = self.table.current();
        if self.table.state::<PreemptState>(target) != PreemptState::ReadyJmp {
            return;
        }
        let _ = P::mask();
        if self.table.state::<PreemptState>(target) != PreemptState::ReadyJmp {
            return;
        }
        self.table.set_state(me, PreemptState::Preparing);
        loop {
            // the only place the timer can get in
            P::unmask();
            let _ = P::mask();
            if self.table.state::<PreemptState>(me) == PreemptState::ReadyInt {
                if self.table.state::<PreemptState>(target) == PreemptState::ReadyJmp {
                    info!("Admitting task {=usize}", target);
                    self.table.set_current(target);
                    // SAFETY: `target` was prepared on its own stack. We are
                    // ReadyInt, so once our snapshot is captured the timer may
                    // resume us.
                    unsafe {
                        P::switch(
                            self.table.tcb(me).snapshot(),
                            self.table.tcb(target).snapshot(),
                        )
                    };
                }
                break;
            }
        }
    }

    /// Admit every task which is waiting for it, in slot order
    fn fork_all(&self) {
        let me = self.table.current();
        for slot in (0..MAX_TASKS).filter(|&idx| idx != me) {
            if self.table.state::<PreemptState>(slot) == PreemptState::ReadyJmp {
                self.fork_task(slot);
                P::unmask();
            }
        }
    }

    /// Are any tasks still live?
    fn has_tasks(&self) -> bool {
        let _ = P::mask();
        let live = self.table.any(PreemptState::is_live);
        P::unmask();
        live
    }

    /// Our address, as handed to the trampoline and tick handler
    fn context(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// What the timer calls
    ///
    /// # Safety
    ///
    /// `context` must be a `Preemptive` of exactly this type.
    unsafe fn tick_handler(context: *const ()) {
        let this = unsafe { &*(context as *const Self) };
        this.on_tick();
    }

    /// Where every task starts
    ///
    /// Runs the entry function and frees the slot. The timer will switch away
    /// and never come back, so we just idle until it does.
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
        this.table.set_state(slot, PreemptState::Free);
        debug!("Task {=usize} finished", slot);
        P::unmask();
        loop {
            P::wait_for_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::host::{self, Host, HostTimer};
    use core::cell::Cell;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    const STACK: usize = 32 * 1024;
    const ARENA: usize = STACK * (MAX_TASKS - 1);

    type Pre<'a> = Preemptive<'a, Host, HostTimer, ARENA>;

    /// Steps of work each task does before it is done
    const WORK: u32 = 200;

    fn scheduler<'a>(period: u32) -> Pre<'a> {
        let sched = Pre::new(HostTimer::new());
        sched.begin_with(Config::new().stack_size(STACK).tick_period(period));
        sched
    }

    fn idle(_: &Pre<'_>) {}

    #[test]
    fn capacity_is_one_less_than_table() {
        let sched = scheduler(1);
        assert_eq!(sched.state(TaskId::MAIN), Some(PreemptState::Created));
        for expected in 1..MAX_TASKS {
            assert_eq!(sched.create_task(&idle), Ok(TaskId(expected)));
        }
        assert_eq!(sched.create_task(&idle), Err(Error::NoFreeSlot));
        for slot in 1..MAX_TASKS {
            assert_eq!(sched.state(TaskId(slot)), Some(PreemptState::Created));
        }
    }

    #[test]
    fn three_tasks_run_to_completion() {
        let done: [AtomicBool; 3] = core::array::from_fn(|_| AtomicBool::new(false));
        let started = AtomicU32::new(0);
        let saw_everyone = AtomicU32::new(0);
        let task = |sched: &Pre<'_>| {
            let me = sched.current_task().index() - 1;
            started.fetch_add(1, Ordering::Relaxed);
            let mut work = 0;
            while !done[me].load(Ordering::Relaxed) {
                host::step();
                work += 1;
                if work >= WORK {
                    done[me].store(true, Ordering::Relaxed);
                }
            }
            if started.load(Ordering::Relaxed) == 3 {
                saw_everyone.fetch_add(1, Ordering::Relaxed);
            }
        };
        let sched = scheduler(2);
        for _ in 0..3 {
            sched.create_task(&task).unwrap();
        }
        sched.run().unwrap();

        assert!(done.iter().all(|flag| flag.load(Ordering::Relaxed)));
        // they were interleaved, not run one after another
        assert_eq!(saw_everyone.load(Ordering::Relaxed), 3);
        for slot in 1..=3 {
            assert_eq!(sched.state(TaskId(slot)), Some(PreemptState::Free));
        }
        assert!(!sched.is_running());
        assert!(!host::timer_enabled());
        assert!(!Host::mask());
        Host::unmask();
    }

    #[test]
    fn tasks_enter_by_jump_then_join_rotation() {
        let entered_by_jump = AtomicU32::new(0);
        let joined_rotation = AtomicU32::new(0);
        let task = |sched: &Pre<'_>| {
            let me = sched.current_task();
            if sched.state(me) == Some(PreemptState::ReadyJmp) {
                entered_by_jump.fetch_add(1, Ordering::Relaxed);
            }
            for _ in 0..WORK {
                host::step();
            }
            if sched.state(me) == Some(PreemptState::ReadyInt) {
                joined_rotation.fetch_add(1, Ordering::Relaxed);
            }
        };
        let sched = scheduler(3);
        sched.create_task(&task).unwrap();
        sched.create_task(&task).unwrap();
        sched.run().unwrap();
        assert_eq!(entered_by_jump.load(Ordering::Relaxed), 2);
        assert_eq!(joined_rotation.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn running_task_admits_a_new_one() {
        static PARENT_AFTER: AtomicU32 = AtomicU32::new(0);
        static CHILD_WORK: AtomicU32 = AtomicU32::new(0);
        static CHILD_ID: AtomicUsize = AtomicUsize::new(0);

        fn child(_: &Pre<'_>) {
            for _ in 0..WORK {
                host::step();
                CHILD_WORK.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn parent(sched: &Pre<'_>) {
            for _ in 0..10 {
                host::step();
            }
            if let Ok(id) = sched.create_task(&child) {
                CHILD_ID.store(id.index(), Ordering::Relaxed);
            }
            // the handshake put us back in the rotation
            if sched.state(sched.current_task()) == Some(PreemptState::ReadyInt) {
                PARENT_AFTER.fetch_add(1, Ordering::Relaxed);
            }
            for _ in 0..WORK {
                host::step();
            }
        }

        let sched = scheduler(2);
        sched.create_task(&parent).unwrap();
        sched.run().unwrap();
        assert_eq!(CHILD_ID.load(Ordering::Relaxed), 2);
        assert_eq!(CHILD_WORK.load(Ordering::Relaxed), WORK);
        assert_eq!(PARENT_AFTER.load(Ordering::Relaxed), 1);
        assert_eq!(sched.state(TaskId(2)), Some(PreemptState::Free));
    }

    #[test]
    fn no_creation_mid_session_without_preallocation() {
        static REFUSED: AtomicBool = AtomicBool::new(false);

        fn parent(sched: &Pre<'_>) {
            REFUSED.store(
                sched.create_task(&idle) == Err(Error::SessionActive),
                Ordering::Relaxed,
            );
        }

        let sched = Pre::new(HostTimer::new());
        sched.begin_with(
            Config::new()
                .stack_size(STACK)
                .preallocate(false)
                .tick_period(2),
        );
        sched.create_task(&parent).unwrap();
        sched.run().unwrap();
        assert!(REFUSED.load(Ordering::Relaxed));
    }

    #[test]
    fn nested_run_is_refused() {
        let refused = AtomicBool::new(false);
        let task = |sched: &Pre<'_>| {
            refused.store(
                sched.run() == Err(Error::AlreadyRunning) && sched.is_running(),
                Ordering::Relaxed,
            );
        };
        let sched = scheduler(2);
        sched.create_task(&task).unwrap();
        sched.run().unwrap();
        assert!(refused.load(Ordering::Relaxed));
    }

    #[test]
    fn run_without_tasks_returns() {
        let sched = scheduler(1);
        assert_eq!(sched.run(), Ok(()));
        assert_eq!(sched.state(TaskId::MAIN), Some(PreemptState::Free));
        assert!(!host::timer_enabled());
    }

    #[test]
    fn undersized_arena_fails_fast() {
        let task = |_: &Preemptive<'_, Host, HostTimer, 4096>| {};
        let sched: Preemptive<'_, Host, HostTimer, 4096> = Preemptive::new(HostTimer::new());
        sched.begin_with_stack_size(STACK);
        let id = sched.create_task(&task).unwrap();
        assert_eq!(
            sched.run(),
            Err(Error::ArenaTooSmall {
                needed: STACK * (MAX_TASKS - 1),
                available: 4096,
            })
        );
        assert_eq!(sched.state(id), Some(PreemptState::Created));
        assert!(!host::timer_enabled());
    }

    #[test]
    fn tick_outside_session_does_nothing() {
        let sched = scheduler(1);
        sched.create_task(&idle).unwrap();
        sched.on_tick();
        assert_eq!(sched.current_task(), TaskId::MAIN);
        assert_eq!(sched.state(TaskId(1)), Some(PreemptState::Created));
    }

    #[test]
    fn defaults_give_a_working_session() {
        let ran = AtomicBool::new(false);
        let task = |_: &Preemptive<'_, Host, HostTimer>| {
            ran.store(true, Ordering::Relaxed);
        };
        let sched: Preemptive<'_, Host, HostTimer> = Preemptive::new(HostTimer::new());
        sched.begin();
        sched.create_task(&task).unwrap();
        assert_eq!(sched.run(), Ok(()));
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn zero_tick_period_still_rotates() {
        let done = AtomicU32::new(0);
        let task = |_: &Pre<'_>| {
            for _ in 0..WORK {
                host::step();
            }
            done.fetch_add(1, Ordering::Relaxed);
        };
        let sched = scheduler(0);
        sched.create_task(&task).unwrap();
        sched.create_task(&task).unwrap();
        assert_eq!(sched.run(), Ok(()));
        assert_eq!(done.load(Ordering::Relaxed), 2);
        assert!(host::expiries() > 0);
    }

    /// The host timer, with some test code run in the tick interrupt just
    /// before the scheduler's own handler
    struct HookedTimer(HostTimer);

    type Hooked = Preemptive<'static, Host, HookedTimer, ARENA>;

    std::thread_local! {
        static HOOKED: Cell<*const Hooked> = const { Cell::new(core::ptr::null()) };
        static SCHEDULER_TICK: Cell<Option<TickHandler>> = const { Cell::new(None) };
    }

    impl Timer for HookedTimer {
        fn configure(&mut self, period: u32) {
            self.0.configure(period)
        }

        fn attach(&mut self, handler: TickHandler) {
            SCHEDULER_TICK.with(|tick| tick.set(Some(handler)));
            self.0
                .attach(unsafe { TickHandler::new(spawning_tick, core::ptr::null()) });
        }

        fn enable(&mut self) {
            self.0.enable()
        }

        fn disable(&mut self) {
            self.0.disable()
        }
    }

    /// Which tick starts the late task
    const SPAWN_ON_TICK: u32 = 5;

    static TICKS: AtomicU32 = AtomicU32::new(0);
    static IN_TICK: AtomicBool = AtomicBool::new(false);
    static LATE_ID: AtomicUsize = AtomicUsize::new(0);
    static LATE_WAITING: AtomicBool = AtomicBool::new(false);
    static LATE_ENTERED_IN_TICK: AtomicBool = AtomicBool::new(true);
    static LATE_ENTRY_STATE: AtomicUsize = AtomicUsize::new(0);
    static LATE_DONE: AtomicBool = AtomicBool::new(false);
    static UNCAPTURED_RESUMES: AtomicU32 = AtomicU32::new(0);

    unsafe fn spawning_tick(_: *const ()) {
        let sched = HOOKED.with(Cell::get);
        if sched.is_null() {
            return;
        }
        let sched = unsafe { &*sched };
        if TICKS.fetch_add(1, Ordering::Relaxed) + 1 == SPAWN_ON_TICK {
            if let Ok(id) = sched.create_task(&late) {
                LATE_ID.store(id.index(), Ordering::Relaxed);
                // nobody can admit it from inside an interrupt
                LATE_WAITING.store(
                    sched.state(id) == Some(PreemptState::ReadyJmp),
                    Ordering::Relaxed,
                );
            }
        }
        IN_TICK.store(true, Ordering::Relaxed);
        if let Some(handler) = SCHEDULER_TICK.with(Cell::get) {
            unsafe { handler.call() };
        }
        IN_TICK.store(false, Ordering::Relaxed);
        // whoever the tick left running must be one the timer has captured
        let now = sched.current_task();
        if !now.is_main() && sched.state(now) != Some(PreemptState::ReadyInt) {
            UNCAPTURED_RESUMES.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn busy(_: &Hooked) {
        for _ in 0..WORK {
            host::step();
        }
    }

    fn late(sched: &Hooked) {
        LATE_ENTERED_IN_TICK.store(IN_TICK.load(Ordering::Relaxed), Ordering::Relaxed);
        let state = sched.state(sched.current_task());
        LATE_ENTRY_STATE.store(
            state.map_or(0, |state| state as usize),
            Ordering::Relaxed,
        );
        for _ in 0..WORK {
            host::step();
        }
        LATE_DONE.store(true, Ordering::Relaxed);
    }

    #[test]
    fn task_created_in_interrupt_waits_for_admission() {
        let sched: Hooked = Preemptive::new(HookedTimer(HostTimer::new()));
        sched.begin_with(Config::new().stack_size(STACK).tick_period(2));
        sched.create_task(&busy).unwrap();
        HOOKED.with(|hooked| hooked.set(&sched as *const Hooked));
        let result = sched.run();
        HOOKED.with(|hooked| hooked.set(core::ptr::null()));

        assert_eq!(result, Ok(()));
        assert_eq!(LATE_ID.load(Ordering::Relaxed), 2);
        assert!(LATE_WAITING.load(Ordering::Relaxed));
        // entered by the admission jump, not by a tick
        assert!(!LATE_ENTERED_IN_TICK.load(Ordering::Relaxed));
        assert_eq!(
            LATE_ENTRY_STATE.load(Ordering::Relaxed),
            PreemptState::ReadyJmp as usize
        );
        assert!(LATE_DONE.load(Ordering::Relaxed));
        assert_eq!(UNCAPTURED_RESUMES.load(Ordering::Relaxed), 0);
        assert_eq!(sched.state(TaskId(2)), Some(PreemptState::Free));
    }

    #[test]
    fn live_states() {
        assert!(!PreemptState::Free.is_live());
        assert!(!PreemptState::Created.is_live());
        assert!(PreemptState::Preparing.is_live());
        assert!(PreemptState::ReadyJmp.is_live());
        assert!(PreemptState::ReadyInt.is_live());
    }
}

// End of File
