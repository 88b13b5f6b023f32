//! Two tasks taking turns to count, under the cooperative scheduler
//!
//! Each task logs its count and then yields. The counts interleave.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]

use multitask::{Cooperative, port::armv7m::CortexM};

use multitask_demos as _;

type Scheduler<'a> = Cooperative<'a, CortexM>;

#[cortex_m_rt::entry]
fn main() -> ! {
    defmt::info!("Hello!");

    let rabbits = |sched: &Scheduler<'_>| counter(sched, "Rabbit", 5);
    let hamsters = |sched: &Scheduler<'_>| counter(sched, "Hamster", 3);

    let scheduler = Scheduler::new();
    scheduler.begin();
    scheduler.create_task(&rabbits).unwrap();
    scheduler.create_task(&hamsters).unwrap();
    scheduler.run().unwrap();

    defmt::info!("All tasks finished");
    semihosting::process::exit(0);
}

/// Count up to `limit`, yielding after each step
fn counter(sched: &Scheduler<'_>, name: &str, limit: u32) {
    for count in 1..=limit {
        defmt::info!("{=str} {} says {=u32}", name, sched.current_task(), count);
        sched.yield_now();
    }
    defmt::info!("{=str} is done", name);
}

// End of File
