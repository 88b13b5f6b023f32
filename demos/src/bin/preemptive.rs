//! Three tasks sharing the CPU under the pre-emptive scheduler
//!
//! None of the tasks ever yield - SysTick takes the CPU away from them. Part
//! way through, the cat task starts a kitten task.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

use cortex_m::peripheral::scb::SystemHandler;
use multitask::{
    Config, Preemptive,
    port::armv7m::{CortexM, SysTickTimer},
};

use multitask_demos as _;

type Scheduler<'a> = Preemptive<'a, CortexM, SysTickTimer>;

const SYSTICKS_PER_SCHED_TICK: u32 = 100_000;

/// How long each task spins between log lines
const WORK_CYCLES: u32 = 250_000;

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().unwrap();
    defmt::info!("Hello!");

    // PendSV must never pre-empt another handler
    unsafe { cp.SCB.set_priority(SystemHandler::PendSV, 0xFF) };

    let scheduler = Scheduler::new(SysTickTimer::new(cp.SYST));
    scheduler.begin_with(Config::new().tick_period(SYSTICKS_PER_SCHED_TICK));
    scheduler.create_task(&rabbits).unwrap();
    scheduler.create_task(&hamsters).unwrap();
    scheduler.create_task(&cats).unwrap();
    scheduler.run().unwrap();

    defmt::info!("All tasks finished");
    semihosting::process::exit(0);
}

/// Spin, logging every so often
fn busy(sched: &Scheduler<'_>, name: &str, rounds: u32) {
    for round in 1..=rounds {
        cortex_m::asm::delay(WORK_CYCLES);
        defmt::info!("{=str} {} round {=u32}", name, sched.current_task(), round);
    }
}

/// Our 'rabbit' task
fn rabbits(sched: &Scheduler<'_>) {
    busy(sched, "Rabbit", 6);
}

/// Our 'hamster' task
fn hamsters(sched: &Scheduler<'_>) {
    busy(sched, "Hamster", 4);
}

/// Our 'cat' task
fn cats(sched: &Scheduler<'_>) {
    busy(sched, "Cat", 2);
    match sched.create_task(&kittens) {
        Ok(id) => defmt::info!("Cat had a kitten: {}", id),
        Err(e) => defmt::warn!("No room for a kitten: {}", e),
    }
    busy(sched, "Cat", 2);
}

/// Our 'kitten' task
fn kittens(sched: &Scheduler<'_>) {
    busy(sched, "Kitten", 3);
}

// End of File
