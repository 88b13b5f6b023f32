//! The platform seam
//!
//! The schedulers never touch registers, the interrupt mask or a timer
//! peripheral directly. They go through a [`Port`] (registers and interrupt
//! mask) and, for pre-emption, a [`Timer`].
//!
//! Backends:
//!
//! * [`armv7m`] - Armv7-M / Armv7E-M, switching in PendSV and pre-empting
//!   from SysTick. Only built for bare-metal Arm targets.
//! * [`host`] - a simulation for running the schedulers on a development
//!   machine. Only built for tests, or with the `host` feature.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod armv7m;

#[cfg(any(test, feature = "host"))]
pub mod host;

/// The signature of a task's first function
///
/// A freshly prepared snapshot resumes here, with the argument given to
/// [`Port::prepare`].
pub type EntryTrampoline = extern "C" fn(*const ()) -> !;

/// Register-level operations for one CPU architecture
///
/// # Capture and restore
///
/// [`Port::switch`] captures the calling context into one snapshot and
/// restores another. The call returns normally, but only once somebody
/// restores the snapshot it captured - at which point it "returns again"
/// from the resumption point. [`Port::restore`] is the one-way half: it
/// transfers control and never returns.
///
/// # Safety
///
/// Implementations must save and restore every register the platform ABI
/// requires a callee to preserve, plus the stack pointer and the resume
/// address, and must treat the interrupt mask as part of the state the
/// scheduler relies on.
pub unsafe trait Port {
    /// A captured (or manufactured) CPU register state
    type Snapshot: Default;

    /// Stacks must start on a multiple of this many bytes
    const STACK_ALIGN: usize;

    /// The smallest stack we can support, because of the state we need to push
    const MIN_STACK_SIZE: usize;

    /// Stack size used when none (or a too-small one) is configured
    const DEFAULT_STACK_SIZE: usize;

    /// Manufacture a snapshot for a task that has never run
    ///
    /// Restoring it begins executing `entry(arg)` on the stack whose
    /// (exclusive) top is `stack_top`, with interrupts masked.
    ///
    /// # Safety
    ///
    /// `stack_top` must be aligned to [`Port::STACK_ALIGN`] and have at least
    /// [`Port::MIN_STACK_SIZE`] writable bytes below it, which stay valid for
    /// as long as the snapshot might be restored.
    unsafe fn prepare(
        snapshot: *mut Self::Snapshot,
        stack_top: *mut u8,
        entry: EntryTrampoline,
        arg: *const (),
    );

    /// Capture the current context into `save`, then restore `load`
    ///
    /// In thread context, this returns once `save` has been restored. In
    /// interrupt context a port may defer the swap until the interrupt
    /// returns, in which case this returns straight away.
    ///
    /// # Safety
    ///
    /// `load` must hold a captured or prepared snapshot whose stack is still
    /// alive. Both pointers must stay valid until the swap has happened.
    /// `save` and `load` may be the same snapshot.
    unsafe fn switch(save: *mut Self::Snapshot, load: *const Self::Snapshot);

    /// Restore `load`, abandoning the current context
    ///
    /// # Safety
    ///
    /// As for [`Port::switch`]. Nothing on the current stack will ever run
    /// again, and nothing will be dropped.
    unsafe fn restore(load: *const Self::Snapshot) -> !;

    /// Mask interrupts, returning `true` if they were already masked
    fn mask() -> bool;

    /// Unmask interrupts
    ///
    /// A pending interrupt may be taken before this returns.
    fn unmask();

    /// Are we running in an interrupt or exception handler?
    fn in_interrupt() -> bool;

    /// Idle until an interrupt has been taken
    fn wait_for_interrupt();
}

/// Something to call when a [`Timer`] expires
///
/// A plain function and an opaque context pointer, so it can be stored by
/// interrupt handlers that know nothing about the scheduler's type.
#[derive(Copy, Clone, Debug)]
pub struct TickHandler {
    func: unsafe fn(*const ()),
    context: *const (),
}

impl TickHandler {
    /// Build a tick handler
    ///
    /// # Safety
    ///
    /// `func(context)` must be safe to call from the timer interrupt for as
    /// long as this handler is attached to a timer.
    pub const unsafe fn new(func: unsafe fn(*const ()), context: *const ()) -> TickHandler {
        TickHandler { func, context }
    }

    /// Call the handler
    ///
    /// # Safety
    ///
    /// Only call from the timer interrupt this handler was attached to.
    pub unsafe fn call(self) {
        unsafe { (self.func)(self.context) }
    }
}

/// A periodic timer, as used for pre-emption
pub trait Timer {
    /// Set how long between expiries, in the timer's own units
    fn configure(&mut self, period: u32);

    /// Arrange for `handler` to be called on every expiry
    ///
    /// Replaces any previously attached handler.
    fn attach(&mut self, handler: TickHandler);

    /// Start the timer and its interrupt
    fn enable(&mut self);

    /// Stop the timer and its interrupt
    fn disable(&mut self);
}

// End of File
