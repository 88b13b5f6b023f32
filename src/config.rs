//! Holds the [`Config`] type

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// Session configuration, passed to `begin_with`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Bytes of stack per task. Zero selects the port default.
    pub(crate) stack_size: usize,
    /// Size the arena for every slot, so tasks can be created mid-session
    pub(crate) preallocate: bool,
    /// Timer reload value, in the timer's own units
    pub(crate) tick_period: u32,
}

impl Config {
    /// Default timer reload value
    ///
    /// On a 80 MHz Cortex-M4 SysTick this is a 100 Hz tick.
    pub const DEFAULT_TICK_PERIOD: u32 = 800_000;

    /// The default configuration: port default stack size, pre-allocated stacks
    pub const fn new() -> Config {
        Config {
            stack_size: 0,
            preallocate: true,
            tick_period: Self::DEFAULT_TICK_PERIOD,
        }
    }

    /// Set the stack size for each task, in bytes
    pub const fn stack_size(mut self, bytes: usize) -> Config {
        self.stack_size = bytes;
        self
    }

    /// Choose whether to pre-allocate a stack for every slot
    pub const fn preallocate(mut self, preallocate: bool) -> Config {
        self.preallocate = preallocate;
        self
    }

    /// Set the period of the pre-emption timer
    ///
    /// A timer with a period of zero would never fire, so zero is taken as
    /// the shortest period the timer offers.
    pub const fn tick_period(mut self, period: u32) -> Config {
        self.tick_period = if period == 0 { 1 } else { period };
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}


// End of File
