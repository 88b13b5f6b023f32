//! Holds the [`Arena`] type and stack sizing rules

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{cell::UnsafeCell, mem::MaybeUninit};

use crate::{MAX_TASKS, Port};

/// One contiguous block of memory, `LEN` bytes long, which is sliced into a
/// private stack for each task slot.
///
/// Slot `i` (for `i >= 1`) owns region `i - 1`, so its stack top sits at
/// `base + stack_size * i`. Main (slot 0) keeps using whatever stack it was
/// already on.
///
/// We align the arena on 16-byte boundaries, which satisfies both AAPCS and
/// the x86-64 System V ABI.
#[repr(align(16))]
pub struct Arena<const LEN: usize> {
    /// The memory reserved for the task stacks
    contents: UnsafeCell<MaybeUninit<[u8; LEN]>>,
}

impl<const LEN: usize> Arena<LEN> {
    /// Create a new arena
    ///
    /// The contents are left uninitialised; tasks write their own frames.
    pub const fn new() -> Self {
        Self {
            contents: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The size of the arena, in bytes
    pub const fn len(&self) -> usize {
        LEN
    }

    /// Is this a zero-sized arena?
    pub const fn is_empty(&self) -> bool {
        LEN == 0
    }

    /// Get the lowest address in the arena
    pub(crate) fn base(&self) -> *mut u8 {
        self.contents.get().cast()
    }
}

/// SAFETY: Our arena only exposes pointers to itself, so is thread-safe
/// despite containing an `UnsafeCell`.
unsafe impl<const LEN: usize> Sync for Arena<LEN> {}

impl<const LEN: usize> Default for Arena<LEN> {
    fn default() -> Self {
        Arena::new()
    }
}

/// Turn a requested per-task stack size into the one we will actually use
///
/// Zero, or anything below the port's minimum, selects the port default.
/// The result is rounded down to the port's stack alignment.
pub(crate) fn effective_stack_size<P: Port>(requested: usize) -> usize {
    let size = if requested < P::MIN_STACK_SIZE {
        P::DEFAULT_STACK_SIZE
    } else {
        requested
    };
    size & !(P::STACK_ALIGN - 1)
}

/// How many bytes of arena a session needs
///
/// With pre-allocated stacks every user slot gets a region, so tasks can be
/// created mid-session. Otherwise we only cover slots up to the highest one
/// in use.
pub(crate) fn arena_needed(stack_size: usize, preallocate: bool, highest_slot: usize) -> usize {
    let regions = if preallocate {
        MAX_TASKS - 1
    } else {
        highest_slot
    };
    stack_size * regions
}

/// Find the stack top for a slot, given the arena base
pub(crate) fn stack_top(base: *mut u8, stack_size: usize, slot: usize) -> *mut u8 {
    debug_assert!(slot != crate::MAIN_TASK);
    base.wrapping_add(stack_size * slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::host::Host;

    #[test]
    fn small_sizes_fall_back_to_default() {
        assert_eq!(effective_stack_size::<Host>(0), Host::DEFAULT_STACK_SIZE);
        assert_eq!(effective_stack_size::<Host>(256), Host::DEFAULT_STACK_SIZE);
    }

    #[test]
    fn sizes_round_down_to_alignment() {
        let odd = Host::MIN_STACK_SIZE + Host::STACK_ALIGN + 3;
        assert_eq!(
            effective_stack_size::<Host>(odd),
            Host::MIN_STACK_SIZE + Host::STACK_ALIGN
        );
    }

    #[test]
    fn arena_covers_all_slots_when_preallocated() {
        assert_eq!(arena_needed(1024, true, 2), 1024 * (MAX_TASKS - 1));
        assert_eq!(arena_needed(1024, false, 2), 2048);
        assert_eq!(arena_needed(1024, false, 0), 0);
    }

    #[test]
    fn stacks_do_not_overlap() {
        let arena = Arena::<4096>::new();
        assert_eq!(arena.len(), 4096);
        assert_eq!(arena.base() as usize % 16, 0);
        let base = arena.base();
        // slot 1 owns [base, base + 1024), slot 2 owns [base + 1024, base + 2048)
        assert_eq!(stack_top(base, 1024, 1), base.wrapping_add(1024));
        assert_eq!(stack_top(base, 1024, 2), base.wrapping_add(2048));
        assert_eq!(stack_top(base, 1024, 4), base.wrapping_add(arena.len()));
    }
}

// End of File
