//! Armv7-M EABIHF code

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::port::armv7m::{SWITCH_REQUEST, SwitchRequest};

/// PendSV Handler for Armv7-M or Armv8-M Mainline EABIHF
///
/// This is the task switch code. It is called by hardware when the PendSV bit
/// is set and all other interrupts have finished.
///
/// On entry, we will find that PC, LR, R12, R3, R2, R1 and R0 will have been
/// pushed onto whichever stack the interrupted code was using, along with
/// either the low FPU registers, or space for the low FPU registers. We thus
/// push the remaining registers (which are as the interrupted code left them)
/// and inspect LR to see if we also need to push the high FPU registers
/// (because LR is set by the hardware on exception entry to tell us the FPU
/// state of the code we interrupted). We record the stack pointer in the
/// snapshot the switch request says to save into. We then restore the
/// registers from the snapshot the request says to load (including the high
/// FPU registers if required). Exiting from this function will cause the
/// hardware to restore PC, LR, R12, R3, R2, R1, and R0 from the new stack
/// (along with the low FPU state, if required), and so the new context will
/// resume.
///
/// The caller of `run()` stays on the Main Stack, so we check bit 2 of LR
/// (EXC_RETURN) to see which stack to work on.
///
/// It is a naked function because we do not want the compiler pushing
/// anything else to the stack and re-using registers containing precious task
/// state.
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn PendSV() {
    // NOTE: This code must NOT touch r4-r11. It can ONLY touch r0-r3 and r12,
    // because those registers were stacked by the hardare on exception entry.

    core::arch::naked_asm!(r#"
    // Workaround https://github.com/rust-lang/rust/issues/127269
    .fpu vfpv3

    // r1 = the address of the switch request
    ldr      r1, ={request}

    cpsid    i

    // r2 = the snapshot to save into. If null, skip the stacking.
    ldr      r2, [r1, {save_offset}]
    cbz      r2, 3f

    //
    // Stack the current context
    //

    // r0 = the stack the interrupted code was using
    tst      lr, #4
    bne      1f
    mov      r0, sp
    b        2f
    1:
    mrs      r0, psp
    2:

    // Did the code we just interrupted use the FPU? (i.e. is bit 4 is clear in LR?)
    tst      lr, #0x10

    // If FPU was used, stack the high FPU registers. Armv7-M exception entry handled the low ones.
    it       eq
    vstmdbeq r0!, {{ s16 - s31 }}

    // Push the additional state into stack at r0
    stmdb    r0!, {{ r4 - r11, lr }}

    // save the stack pointer (in r0) to the snapshot
    str      r0, [r2]

    // on the Main Stack, keep our own stack below what we just pushed
    tst      lr, #4
    it       eq
    moveq    sp, r0

    //
    // Pop the next context
    //

    3:

    // r0 = the stack pointer from the snapshot to load
    ldr      r2, [r1, {load_offset}]
    ldr      r0, [r2]

    // Pop the additional state from it
    ldmia    r0!, {{ r4 - r11, lr }}

    // Did the code we just resumed use the FPU? (i.e. is bit 4 is clear in LR?)
    tst      lr, #0x10

    // If FPU was used, unstack the high FPU registers
    it       eq
    vldmiaeq r0!, {{ s16 - s31 }}

    // Set the stack pointer for whichever stack it uses
    tst      lr, #4
    bne      4f
    mov      sp, r0
    b        5f
    4:
    msr      psp, r0
    5:

    // The request is done
    movs     r2, #0
    str      r2, [r1, {save_offset}]
    str      r2, [r1, {load_offset}]

    cpsie    i

    //
    // return to the context
    //

    bx       lr
    "#,
    request = sym SWITCH_REQUEST,
    save_offset = const SwitchRequest::SAVE_OFFSET,
    load_offset = const SwitchRequest::LOAD_OFFSET,
    );
}

// End of File
