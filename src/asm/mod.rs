//! Appropriate assembly language routines for the architecture

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#[cfg(any(arm_architecture = "v6-m", arm_architecture = "v8-m.base"))]
compile_error!("Armv6-M and Armv8-M Baseline are not supported - they cannot push r8-r11 directly");

#[cfg(all(
    arm_abi = "eabi",
    not(any(arm_architecture = "v6-m", arm_architecture = "v8-m.base"))
))]
mod eabi;

#[cfg(arm_abi = "eabihf")]
mod eabihf;

// End of File
