//! A port for Armv7-M and Armv7E-M microcontrollers
//!
//! Registers are switched in the PendSV exception (see the `asm` module),
//! so a switch requested from thread mode or from an interrupt handler both
//! end up in the same place. Pre-emption comes from SysTick.
//!
//! The task which called `run()` keeps using the Main Stack. Every other task
//! runs in Thread Mode on the Process Stack.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicPtr, Ordering, compiler_fence},
};

use cortex_m::peripheral::{
    SCB, SYST,
    scb::VectActive,
    syst::SystClkSource,
};

use crate::{Port, StackPusher, TickHandler, Timer, port::EntryTrampoline};

/// Saved register state for one task
///
/// All the registers live on the task's own stack. We only remember where.
#[repr(C)]
#[derive(Debug)]
pub struct Snapshot {
    sp: *mut usize,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            sp: core::ptr::null_mut(),
        }
    }
}

/// Tells the PendSV handler what to do
///
/// It is a free-standing function, so it needs a static to find this in.
#[repr(C)]
pub(crate) struct SwitchRequest {
    /// Where to save the interrupted context. Null means don't.
    save: AtomicPtr<Snapshot>,
    /// Which context to resume
    load: AtomicPtr<Snapshot>,
}

impl SwitchRequest {
    /// The offset, in bytes, to the `save` field
    pub(crate) const SAVE_OFFSET: usize = core::mem::offset_of!(SwitchRequest, save);

    /// The offset, in bytes, to the `load` field
    pub(crate) const LOAD_OFFSET: usize = core::mem::offset_of!(SwitchRequest, load);
}

/// The switch for PendSV to perform
pub(crate) static SWITCH_REQUEST: SwitchRequest = SwitchRequest {
    save: AtomicPtr::new(core::ptr::null_mut()),
    load: AtomicPtr::new(core::ptr::null_mut()),
};

/// The Armv7-M port
pub struct CortexM;

impl CortexM {
    /// The value of the Processor Status Register when a task starts
    ///
    /// The only bit we need to set is the T bit, to indicate that the
    /// task should run in Thumb mode (the only supported mode on Armv7-M)
    const DEFAULT_XPSR: usize = 1 << 24;

    /// The EXC_RETURN value for a new task
    ///
    /// Return to Thread Mode, on the Process Stack, with no FPU state.
    const NEW_TASK_EXC_RETURN: usize = 0xFFFF_FFFD;

    /// How many bytes the biggest frame we ever push takes
    ///
    /// Sixteen 32-bit registers plus EXC_RETURN.
    #[cfg(arm_abi = "eabi")]
    const FRAME_BYTES: usize = 4 * 17;

    /// How many bytes the biggest frame we ever push takes
    ///
    /// As for EABI, plus thirty-two 32-bit FPU registers, the FPU status
    /// register and the alignment word.
    #[cfg(arm_abi = "eabihf")]
    const FRAME_BYTES: usize = 4 * 51;
}

const _: () = assert!(CortexM::FRAME_BYTES < CortexM::MIN_STACK_SIZE);
const _: () =
    assert!(crate::DEFAULT_ARENA_SIZE >= (crate::MAX_TASKS - 1) * CortexM::DEFAULT_STACK_SIZE);

// SAFETY: PendSV saves r4-r11, EXC_RETURN (and s16-s31 if the task used the
// FPU) on top of the frame the hardware stacks. The interrupt mask is restored
// by `switch` after PendSV has run.
unsafe impl Port for CortexM {
    type Snapshot = Snapshot;

    const STACK_ALIGN: usize = 8;

    const MIN_STACK_SIZE: usize = 256;

    const DEFAULT_STACK_SIZE: usize = 2048;

    unsafe fn prepare(
        snapshot: *mut Snapshot,
        stack_top: *mut u8,
        entry: EntryTrampoline,
        arg: *const (),
    ) {
        // SAFETY: the caller promised MIN_STACK_SIZE bytes, which is more than
        // the frame we push
        let mut stack_pusher = unsafe { StackPusher::new(stack_top) };

        // Standard Arm exception frame

        // xPSR
        stack_pusher.push(Self::DEFAULT_XPSR);
        // PC, without the Thumb bit
        stack_pusher.push(entry as usize & !1);
        // LR - the trampoline never returns
        stack_pusher.push(0);
        // R12
        stack_pusher.push(0);
        // R3, R2, R1
        stack_pusher.push(0);
        stack_pusher.push(0);
        stack_pusher.push(0);
        // R0 is the argument
        stack_pusher.push(arg as usize);

        // Additional task state we persist

        // Extra copy of LR so we can check for FPU status. This copy does
        // not have the FPU bit set, so we don't need to push an Extended
        // Frame above, or the other 16 FPU registers, into the initial
        // state.
        stack_pusher.push(Self::NEW_TASK_EXC_RETURN);

        // R4 - R11
        for _ in 4..=11 {
            stack_pusher.push(0);
        }

        trace!(
            "Task frame ends @ 0x{=usize:08x}",
            stack_pusher.current() as usize
        );

        unsafe {
            (*snapshot).sp = stack_pusher.current().cast();
        }
    }

    unsafe fn switch(save: *mut Snapshot, load: *const Snapshot) {
        SWITCH_REQUEST.save.store(save, Ordering::Relaxed);
        SWITCH_REQUEST.load.store(load.cast_mut(), Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        SCB::set_pendsv();

        if Self::in_interrupt() {
            // PendSV runs when the handler returns
            return;
        }

        // PendSV cannot fire while we are masked, so open up for it. We
        // come back here when somebody switches to `save`.
        let was_masked = cortex_m::register::primask::read().is_active();
        unsafe { cortex_m::interrupt::enable() };
        // flush the pipeline to ensure the PendSV fires before we carry on
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
        if was_masked {
            cortex_m::interrupt::disable();
        }
    }

    unsafe fn restore(load: *const Snapshot) -> ! {
        unsafe { Self::switch(core::ptr::null_mut(), load) };
        // impossible to get here
        unreachable!();
    }

    fn mask() -> bool {
        let was_masked = cortex_m::register::primask::read().is_active();
        cortex_m::interrupt::disable();
        was_masked
    }

    fn unmask() {
        // SAFETY: the schedulers never unmask inside a critical section they
        // did not open
        unsafe { cortex_m::interrupt::enable() };
    }

    fn in_interrupt() -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    fn wait_for_interrupt() {
        cortex_m::asm::wfi();
    }
}

/// Holds the handler that SysTick calls
struct TickSlot(UnsafeCell<Option<TickHandler>>);

// SAFETY: only written with interrupts masked, only read from SysTick
unsafe impl Sync for TickSlot {}

static TICK_SLOT: TickSlot = TickSlot(UnsafeCell::new(None));

/// SysTick, as a pre-emption [`Timer`]
///
/// Periods are counted in core clock cycles.
pub struct SysTickTimer {
    syst: SYST,
}

impl SysTickTimer {
    /// The largest reload value SysTick supports
    const MAX_RELOAD: u32 = 0x00FF_FFFF;

    /// The shortest period we can ask for
    ///
    /// A reload value of zero stops SysTick firing at all.
    const MIN_PERIOD: u32 = 2;

    /// Work out the reload value for a period of `period` cycles
    ///
    /// SysTick counts from the reload value down to zero inclusive, so the
    /// period is one more than the reload value.
    const fn reload_for(period: u32) -> u32 {
        let period = if period < Self::MIN_PERIOD {
            Self::MIN_PERIOD
        } else if period > Self::MAX_RELOAD + 1 {
            Self::MAX_RELOAD + 1
        } else {
            period
        };
        period - 1
    }

    /// Take ownership of SysTick
    pub fn new(syst: SYST) -> SysTickTimer {
        SysTickTimer { syst }
    }

    /// Give SysTick back
    pub fn free(self) -> SYST {
        self.syst
    }
}

impl Timer for SysTickTimer {
    fn configure(&mut self, period: u32) {
        let reload = Self::reload_for(period);
        if reload + 1 != period {
            warn!("Tick period {=u32} clamped to {=u32}", period, reload + 1);
        }
        self.syst.set_reload(reload);
        self.syst.set_clock_source(SystClkSource::Core);
        self.syst.clear_current();
    }

    fn attach(&mut self, handler: TickHandler) {
        cortex_m::interrupt::free(|_| {
            // SAFETY: SysTick cannot read this while we are masked
            unsafe { *TICK_SLOT.0.get() = Some(handler) };
        });
    }

    fn enable(&mut self) {
        self.syst.enable_counter();
        self.syst.enable_interrupt();
    }

    fn disable(&mut self) {
        self.syst.disable_interrupt();
        self.syst.disable_counter();
    }
}

const _: () = {
    assert!(SysTickTimer::reload_for(0) == 1);
    assert!(SysTickTimer::reload_for(1) == 1);
    assert!(SysTickTimer::reload_for(100_000) == 99_999);
    assert!(SysTickTimer::reload_for(u32::MAX) == SysTickTimer::MAX_RELOAD);
};

/// SysTick Handler
#[unsafe(no_mangle)]
extern "C" fn SysTick() {
    if SCB::is_pendsv_pending() {
        // a switch is already in flight - the snapshots it names must not
        // change under it
        return;
    }
    // SAFETY: written with interrupts masked, so this is a stable read
    if let Some(handler) = unsafe { *TICK_SLOT.0.get() } {
        // SAFETY: we are the timer interrupt the handler was attached to
        unsafe { handler.call() };
    }
}

// End of File
