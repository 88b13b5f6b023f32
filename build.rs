//! Build script for multitask
//!
//! Emits the `arm_abi` and `arm_architecture` cfgs used to pick a PendSV
//! handler.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// Entry point to the build script
fn main() {
    arm_targets::process();
    println!("cargo::rerun-if-changed=build.rs");
}

// End of File
