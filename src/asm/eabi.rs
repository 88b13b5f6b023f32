//! Armv7-M EABI code

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::port::armv7m::{SWITCH_REQUEST, SwitchRequest};

/// PendSV Handler for Armv7-M or Armv8-M Mainline EABI
///
/// This is the task switch code. It is called by hardware when the PendSV bit
/// is set and all other interrupts have finished.
///
/// On entry, we will find that PC, LR, R12, R3, R2, R1 and R0 will have been
/// pushed onto whichever stack the interrupted code was using. We push the
/// remaining registers (which are as the interrupted code left them) below
/// that, and record the stack pointer in the snapshot the switch request says
/// to save into. We then pop the registers of the snapshot the request says to
/// load. Exiting from this function will cause the hardware to restore PC,
/// LR, R12, R3, R2, R1, and R0 from the new stack, and so the new context will
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
    // r1 = the address of the switch request
    ldr     r1, ={request}

    cpsid   i

    // r2 = the snapshot to save into. If null, skip the stacking.
    ldr     r2, [r1, {save_offset}]
    cbz     r2, 3f

    //
    // Stack the current context
    //

    // r0 = the stack the interrupted code was using
    tst     lr, #4
    bne     1f
    mov     r0, sp
    b       2f
    1:
    mrs     r0, psp
    2:

    // Push the additional state into stack at r0
    stmdb   r0!, {{ r4 - r11, lr }}

    // save the stack pointer (in r0) to the snapshot
    str     r0, [r2]

    // on the Main Stack, keep our own stack below what we just pushed
    tst     lr, #4
    it      eq
    moveq   sp, r0

    //
    // Pop the next context
    //

    3:

    // r0 = the stack pointer from the snapshot to load
    ldr     r2, [r1, {load_offset}]
    ldr     r0, [r2]

    // Pop the additional state from it
    ldmia   r0!, {{ r4 - r11, lr }}

    // Set the stack pointer for whichever stack it uses
    tst     lr, #4
    bne     4f
    mov     sp, r0
    b       5f
    4:
    msr     psp, r0
    5:

    // The request is done
    movs    r2, #0
    str     r2, [r1, {save_offset}]
    str     r2, [r1, {load_offset}]

    cpsie   i

    //
    // return to the context
    //

    bx      lr
    "#,
    request = sym SWITCH_REQUEST,
    save_offset = const SwitchRequest::SAVE_OFFSET,
    load_offset = const SwitchRequest::LOAD_OFFSET,
    );
}

// End of File
