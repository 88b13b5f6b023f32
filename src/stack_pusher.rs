//! Holds the [`StackPusher`] type and methods

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// A helper for pushing machine words into a full-descending stack
///
/// Ports use this to manufacture the initial frame of a task that has never
/// run.
pub(crate) struct StackPusher(*mut usize);

impl StackPusher {
    /// Make a new full-descending stack from the given pointer
    ///
    /// It will not write to the given pointer, but it will write immediately
    /// below it - because this is a Full Descending stack.
    ///
    /// # Safety
    ///
    /// There must be enough free space below the given pointer to accept all
    /// the items you are going to push, and the pointer must be word aligned.
    pub(crate) unsafe fn new(stack_top: *mut u8) -> StackPusher {
        StackPusher(stack_top.cast())
    }

    /// Push something onto the stack, decrementing the stack pointer
    pub(crate) fn push(&mut self, value: usize) {
        // SAFETY: the caller of `new` promised us the space
        unsafe {
            self.0 = self.0.offset(-1);
            self.0.write_volatile(value);
        }
    }

    /// Get the current stack pointer
    pub(crate) fn current(&self) -> *mut u8 {
        self.0.cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_downwards() {
        let mut words = [0usize; 4];
        let top = unsafe { words.as_mut_ptr().add(words.len()) };
        let mut pusher = unsafe { StackPusher::new(top.cast()) };
        pusher.push(0xAAAA);
        pusher.push(0xBBBB);
        assert_eq!(pusher.current(), unsafe { top.sub(2) }.cast::<u8>());
        assert_eq!(words, [0, 0, 0xBBBB, 0xAAAA]);
    }
}

// End of File
