//! A port for running the schedulers on a development machine
//!
//! Context switching is real: snapshots hold the callee-saved registers of
//! the host CPU, and each task runs on its own slice of the arena. The
//! interrupt controller and the timer are simulated, per thread.
//!
//! Simulated time only moves when somebody calls [`step`] (or unmasks, or
//! waits for an interrupt). Every step the timer is enabled and interrupts are
//! unmasked, the timer counts up by one. When it reaches its period, the
//! attached [`TickHandler`] runs right there on the current stack, just as a
//! real interrupt would.
//!
//! Supported on x86-64 (System V) and AArch64.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    cell::Cell,
    ptr::{addr_of, addr_of_mut},
};

use crate::{Port, StackPusher, TickHandler, Timer, port::EntryTrampoline};

#[cfg(not(any(
    all(target_arch = "x86_64", not(windows)),
    target_arch = "aarch64"
)))]
compile_error!("The host port supports x86-64 (System V) and AArch64 only");

/// The simulated CPU and timer
struct Sim {
    masked: Cell<bool>,
    in_interrupt: Cell<bool>,
    period: Cell<u32>,
    elapsed: Cell<u32>,
    enabled: Cell<bool>,
    handler: Cell<Option<TickHandler>>,
    expiries: Cell<u64>,
}

impl Sim {
    const fn new() -> Sim {
        Sim {
            masked: Cell::new(false),
            in_interrupt: Cell::new(false),
            period: Cell::new(1),
            elapsed: Cell::new(0),
            enabled: Cell::new(false),
            handler: Cell::new(None),
            expiries: Cell::new(0),
        }
    }
}

std::thread_local! {
    static SIM: Sim = const { Sim::new() };
}

/// Let one unit of simulated time pass
///
/// If the timer is enabled, interrupts are unmasked and we are not already in
/// an interrupt, the timer counts. When it expires, the attached handler is
/// called before this returns - and it may switch to another task, in which
/// case this returns when we are switched back.
pub fn step() {
    let fire = SIM.with(|sim| {
        if !sim.enabled.get() || sim.masked.get() || sim.in_interrupt.get() {
            return None;
        }
        let elapsed = sim.elapsed.get() + 1;
        if elapsed >= sim.period.get().max(1) {
            sim.elapsed.set(0);
            sim.expiries.set(sim.expiries.get() + 1);
            Some(sim.handler.get())
        } else {
            sim.elapsed.set(elapsed);
            None
        }
    });
    if let Some(Some(handler)) = fire {
        take_interrupt(handler);
    }
}

/// How many times has the timer expired, since it was created?
pub fn expiries() -> u64 {
    SIM.with(|sim| sim.expiries.get())
}

/// Is the timer enabled?
pub fn timer_enabled() -> bool {
    SIM.with(|sim| sim.enabled.get())
}

fn take_interrupt(handler: TickHandler) {
    SIM.with(|sim| sim.in_interrupt.set(true));
    // SAFETY: this is the timer interrupt the handler was attached to
    unsafe { handler.call() };
    SIM.with(|sim| sim.in_interrupt.set(false));
}

/// The parts of the simulated CPU that belong to a context
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct CpuState {
    masked: bool,
    in_interrupt: bool,
}

impl CpuState {
    fn current() -> CpuState {
        SIM.with(|sim| CpuState {
            masked: sim.masked.get(),
            in_interrupt: sim.in_interrupt.get(),
        })
    }

    fn adopt(self) {
        SIM.with(|sim| {
            sim.masked.set(self.masked);
            sim.in_interrupt.set(self.in_interrupt);
        })
    }
}

/// Saved register state for one task
#[repr(C)]
#[derive(Debug, Default)]
pub struct Snapshot {
    regs: Registers,
    cpu: CpuState,
}

/// The host port
pub struct Host;

const _: () = assert!(crate::DEFAULT_ARENA_SIZE >= (crate::MAX_TASKS - 1) * Host::DEFAULT_STACK_SIZE);

// SAFETY: the switch routines save every callee-saved register of the host
// ABI, plus the stack pointer (which points at the resume address), and the
// simulated interrupt mask travels with the snapshot.
unsafe impl Port for Host {
    type Snapshot = Snapshot;

    const STACK_ALIGN: usize = 16;

    // test code uses the standard library, which wants a lot more stack than
    // a microcontroller does
    const MIN_STACK_SIZE: usize = 16 * 1024;

    const DEFAULT_STACK_SIZE: usize = 32 * 1024;

    unsafe fn prepare(
        snapshot: *mut Snapshot,
        stack_top: *mut u8,
        entry: EntryTrampoline,
        arg: *const (),
    ) {
        // SAFETY: the caller promised us the space
        let mut stack_pusher = unsafe { StackPusher::new(stack_top) };
        let regs = Registers::fresh(&mut stack_pusher, entry, arg);
        let cpu = CpuState {
            masked: true,
            in_interrupt: false,
        };
        unsafe { snapshot.write(Snapshot { regs, cpu }) };
    }

    unsafe fn switch(save: *mut Snapshot, load: *const Snapshot) {
        // `save` and `load` may alias, so stick to raw pointers
        unsafe {
            addr_of_mut!((*save).cpu).write(CpuState::current());
            addr_of!((*load).cpu).read().adopt();
            switch_raw(addr_of_mut!((*save).regs), addr_of!((*load).regs));
        }
    }

    unsafe fn restore(load: *const Snapshot) -> ! {
        unsafe {
            addr_of!((*load).cpu).read().adopt();
            restore_raw(addr_of!((*load).regs))
        }
    }

    fn mask() -> bool {
        SIM.with(|sim| sim.masked.replace(true))
    }

    fn unmask() {
        SIM.with(|sim| sim.masked.set(false));
        // anything pending gets in now
        step();
    }

    fn in_interrupt() -> bool {
        SIM.with(|sim| sim.in_interrupt.get())
    }

    fn wait_for_interrupt() {
        let can_fire = SIM.with(|sim| {
            let ready = sim.enabled.get() && !sim.masked.get() && !sim.in_interrupt.get();
            if ready {
                sim.elapsed.set(sim.period.get().max(1) - 1);
            }
            ready
        });
        // with nothing to wake us, a real CPU would hang - we just return
        if can_fire {
            step();
        }
    }
}

/// The simulated periodic timer
///
/// There is one per thread. Creating a `HostTimer` resets it.
#[derive(Debug)]
pub struct HostTimer {
    _private: (),
}

impl HostTimer {
    /// Reset the simulated timer, and get a handle to it
    pub fn new() -> HostTimer {
        SIM.with(|sim| {
            sim.period.set(1);
            sim.elapsed.set(0);
            sim.enabled.set(false);
            sim.handler.set(None);
            sim.expiries.set(0);
        });
        HostTimer { _private: () }
    }
}

impl Default for HostTimer {
    fn default() -> Self {
        HostTimer::new()
    }
}

impl Timer for HostTimer {
    fn configure(&mut self, period: u32) {
        SIM.with(|sim| {
            sim.period.set(period);
            sim.elapsed.set(0);
        });
    }

    fn attach(&mut self, handler: TickHandler) {
        SIM.with(|sim| sim.handler.set(Some(handler)));
    }

    fn enable(&mut self) {
        SIM.with(|sim| sim.enabled.set(true));
    }

    fn disable(&mut self) {
        SIM.with(|sim| sim.enabled.set(false));
    }
}

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug)]
struct Registers {
    rsp: usize,
    rbp: usize,
    rbx: usize,
    r12: usize,
    r13: usize,
    r14: usize,
    r15: usize,
    mxcsr: u32,
    fpucw: u16,
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    /// Power-on value of MXCSR: all exceptions masked, round to nearest
    const DEFAULT_MXCSR: u32 = 0x1F80;
    /// Power-on value of the x87 control word
    const DEFAULT_FPUCW: u16 = 0x037F;

    /// Registers which start `entry(arg)`, via the shim
    ///
    /// The shim's address is the return address `switch_raw` pops.
    fn fresh(stack_pusher: &mut StackPusher, entry: EntryTrampoline, arg: *const ()) -> Registers {
        stack_pusher.push(task_shim as *const () as usize);
        Registers {
            rsp: stack_pusher.current() as usize,
            r12: entry as usize,
            r13: arg as usize,
            ..Registers::default()
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for Registers {
    fn default() -> Self {
        Registers {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: Self::DEFAULT_MXCSR,
            fpucw: Self::DEFAULT_FPUCW,
        }
    }
}

/// Save callee-saved registers into `save`, load them from `load`, and return
/// to wherever `load` was saved from.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "sysv64" fn switch_raw(save: *mut Registers, load: *const Registers) {
    core::arch::naked_asm!(
        r#"
        // rdi = save, rsi = load. [rsp] is our return address.
        mov     [rdi + 0], rsp
        mov     [rdi + 8], rbp
        mov     [rdi + 16], rbx
        mov     [rdi + 24], r12
        mov     [rdi + 32], r13
        mov     [rdi + 40], r14
        mov     [rdi + 48], r15
        stmxcsr dword ptr [rdi + 56]
        fnstcw  word ptr [rdi + 60]

        mov     rsp, [rsi + 0]
        mov     rbp, [rsi + 8]
        mov     rbx, [rsi + 16]
        mov     r12, [rsi + 24]
        mov     r13, [rsi + 32]
        mov     r14, [rsi + 40]
        mov     r15, [rsi + 48]
        ldmxcsr dword ptr [rsi + 56]
        fldcw   word ptr [rsi + 60]
        ret
        "#
    );
}

/// Load callee-saved registers from `load`, and return to wherever it was
/// saved from.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "sysv64" fn restore_raw(load: *const Registers) -> ! {
    core::arch::naked_asm!(
        r#"
        mov     rsp, [rdi + 0]
        mov     rbp, [rdi + 8]
        mov     rbx, [rdi + 16]
        mov     r12, [rdi + 24]
        mov     r13, [rdi + 32]
        mov     r14, [rdi + 40]
        mov     r15, [rdi + 48]
        ldmxcsr dword ptr [rdi + 56]
        fldcw   word ptr [rdi + 60]
        ret
        "#
    );
}

/// The first code a fresh task runs
///
/// r12 holds the entry function and r13 its argument. The stack is 16-byte
/// aligned here, so the call leaves it as the ABI expects on entry.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "sysv64" fn task_shim() -> ! {
    core::arch::naked_asm!(
        r#"
        mov     rdi, r13
        call    r12
        ud2
        "#
    );
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Default)]
struct Registers {
    /// x19 to x28
    x: [usize; 10],
    /// x29
    fp: usize,
    /// x30
    lr: usize,
    sp: usize,
    /// the low halves of v8 to v15
    d: [u64; 8],
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    /// Registers which start `entry(arg)`, via the shim
    ///
    /// We push an empty frame record, so backtraces stop at the shim.
    fn fresh(stack_pusher: &mut StackPusher, entry: EntryTrampoline, arg: *const ()) -> Registers {
        stack_pusher.push(0);
        stack_pusher.push(0);
        let sp = stack_pusher.current() as usize;
        let mut x = [0; 10];
        x[0] = entry as usize;
        x[1] = arg as usize;
        Registers {
            x,
            fp: sp,
            lr: task_shim as *const () as usize,
            sp,
            d: [0; 8],
        }
    }
}

/// Save callee-saved registers into `save`, load them from `load`, and return
/// to wherever `load` was saved from.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn switch_raw(save: *mut Registers, load: *const Registers) {
    core::arch::naked_asm!(
        r#"
        // x0 = save, x1 = load
        stp     x19, x20, [x0, #0]
        stp     x21, x22, [x0, #16]
        stp     x23, x24, [x0, #32]
        stp     x25, x26, [x0, #48]
        stp     x27, x28, [x0, #64]
        stp     x29, x30, [x0, #80]
        mov     x9, sp
        str     x9, [x0, #96]
        stp     d8, d9, [x0, #104]
        stp     d10, d11, [x0, #120]
        stp     d12, d13, [x0, #136]
        stp     d14, d15, [x0, #152]

        ldp     x19, x20, [x1, #0]
        ldp     x21, x22, [x1, #16]
        ldp     x23, x24, [x1, #32]
        ldp     x25, x26, [x1, #48]
        ldp     x27, x28, [x1, #64]
        ldp     x29, x30, [x1, #80]
        ldr     x9, [x1, #96]
        mov     sp, x9
        ldp     d8, d9, [x1, #104]
        ldp     d10, d11, [x1, #120]
        ldp     d12, d13, [x1, #136]
        ldp     d14, d15, [x1, #152]
        ret
        "#
    );
}

/// Load callee-saved registers from `load`, and return to wherever it was
/// saved from.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn restore_raw(load: *const Registers) -> ! {
    core::arch::naked_asm!(
        r#"
        ldp     x19, x20, [x0, #0]
        ldp     x21, x22, [x0, #16]
        ldp     x23, x24, [x0, #32]
        ldp     x25, x26, [x0, #48]
        ldp     x27, x28, [x0, #64]
        ldp     x29, x30, [x0, #80]
        ldr     x9, [x0, #96]
        mov     sp, x9
        ldp     d8, d9, [x0, #104]
        ldp     d10, d11, [x0, #120]
        ldp     d12, d13, [x0, #136]
        ldp     d14, d15, [x0, #152]
        ret
        "#
    );
}

/// The first code a fresh task runs
///
/// x19 holds the entry function and x20 its argument.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
unsafe extern "C" fn task_shim() -> ! {
    core::arch::naked_asm!(
        r#"
        mov     x0, x20
        blr     x19
        brk     #1
        "#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arena;
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct Pair {
        main: Snapshot,
        task: Snapshot,
        hits: u32,
        task_saw_masked: bool,
    }

    extern "C" fn bounce(arg: *const ()) -> ! {
        let pair = arg as *mut Pair;
        loop {
            unsafe {
                (*pair).hits += 1;
                (*pair).task_saw_masked = Host::mask();
                Host::switch(addr_of_mut!((*pair).task), addr_of!((*pair).main));
            }
        }
    }

    #[test]
    fn switch_round_trip() {
        let arena = Arena::<{ 64 * 1024 }>::new();
        let mut pair = Pair::default();
        let pair_ptr = &raw mut pair;
        unsafe {
            Host::prepare(
                addr_of_mut!((*pair_ptr).task),
                arena.base().add(arena.len()),
                bounce,
                pair_ptr as *const (),
            );
            for expected in 1..=3 {
                Host::switch(
                    addr_of_mut!((*pair_ptr).main),
                    addr_of!((*pair_ptr).task),
                );
                assert_eq!((*pair_ptr).hits, expected);
            }
        }
        // the task started masked, but we get our own mask state back
        assert!(pair.task_saw_masked);
        assert!(!Host::mask());
        Host::unmask();
    }

    #[test]
    fn switch_to_self_returns() {
        let mut snapshot = Snapshot::default();
        let ptr = &raw mut snapshot;
        unsafe { Host::switch(ptr, ptr) };
        assert!(!Host::in_interrupt());
    }

    struct Probe {
        ticks: AtomicU32,
        in_interrupt: AtomicBool,
    }

    unsafe fn probe(context: *const ()) {
        let probe = unsafe { &*(context as *const Probe) };
        probe.ticks.fetch_add(1, Ordering::Relaxed);
        probe
            .in_interrupt
            .store(Host::in_interrupt(), Ordering::Relaxed);
    }

    fn attached(probe_data: &Probe, period: u32) -> HostTimer {
        let mut timer = HostTimer::new();
        timer.configure(period);
        timer.attach(unsafe { TickHandler::new(probe, probe_data as *const Probe as *const ()) });
        timer
    }

    #[test]
    fn timer_fires_every_period() {
        let data = Probe {
            ticks: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
        };
        let mut timer = attached(&data, 3);
        for _ in 0..9 {
            step();
        }
        assert_eq!(data.ticks.load(Ordering::Relaxed), 0);

        timer.enable();
        assert!(timer_enabled());
        for _ in 0..9 {
            step();
        }
        assert_eq!(data.ticks.load(Ordering::Relaxed), 3);
        assert_eq!(expiries(), 3);
        assert!(data.in_interrupt.load(Ordering::Relaxed));
        assert!(!Host::in_interrupt());

        timer.disable();
        assert!(!timer_enabled());
    }

    #[test]
    fn masking_holds_off_the_timer() {
        let data = Probe {
            ticks: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
        };
        let mut timer = attached(&data, 2);
        timer.enable();
        assert!(!Host::mask());
        assert!(Host::mask());
        for _ in 0..10 {
            step();
        }
        assert_eq!(data.ticks.load(Ordering::Relaxed), 0);
        // unmasking lets a step through
        Host::unmask();
        step();
        assert_eq!(data.ticks.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn waiting_takes_the_next_interrupt() {
        let data = Probe {
            ticks: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
        };
        let mut timer = attached(&data, 50);
        Host::wait_for_interrupt();
        assert_eq!(data.ticks.load(Ordering::Relaxed), 0);
        timer.enable();
        Host::wait_for_interrupt();
        assert_eq!(data.ticks.load(Ordering::Relaxed), 1);
        assert_eq!(expiries(), 1);
    }
}

// End of File
