//! Holds the [`Error`] type

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// The ways scheduler operations can fail
///
/// All failures are reported synchronously. Nothing in the task table is
/// modified when one of these is returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum Error {
    /// Every non-reserved slot is occupied
    NoFreeSlot,
    /// The session is running and stacks were not pre-allocated, so there is
    /// no stack for a new task
    SessionActive,
    /// `run()` was called while a session is already running
    AlreadyRunning,
    /// The arena cannot hold the stacks this session needs
    ArenaTooSmall {
        /// Bytes required by the configured stack size and slot count
        needed: usize,
        /// Bytes the arena actually has
        available: usize,
    },
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoFreeSlot => write!(fmt, "no free task slot"),
            Error::SessionActive => {
                write!(fmt, "cannot create a task in a running session without pre-allocated stacks")
            }
            Error::AlreadyRunning => write!(fmt, "scheduler is already running"),
            Error::ArenaTooSmall { needed, available } => write!(
                fmt,
                "stack arena too small: need {needed} bytes, have {available}"
            ),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn arena_error_reports_sizes() {
        let err = Error::ArenaTooSmall {
            needed: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "stack arena too small: need 4096 bytes, have 1024"
        );
    }
}

// End of File
