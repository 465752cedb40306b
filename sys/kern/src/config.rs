// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static kernel configuration.
//!
//! The system takes a single shape at compile time; these constants are that
//! shape. Ports that need different capacities change them here and rebuild.

/// Size of the thread table. Slot 0 is the nil thread and is never used;
/// slots 1..8 are the reserved threads.
pub const MAX_THREADS: usize = 32;

/// Size of the scheduling-context table.
pub const MAX_SCHED_CONTEXTS: usize = 32;

/// Size of the derivation-object arena.
pub const MAX_DOBJECTS: usize = 128;

/// Number of memory domains.
pub const MAX_MEM_DOMAINS: usize = 16;

/// Partitions per memory domain.
pub const MAX_PARTITIONS: usize = 8;

/// Installed fpage mappings per memory domain.
pub const MAX_MAPPINGS: usize = 16;

/// Number of IRQ lines the platform can deliver.
pub const MAX_IRQS: usize = 32;

/// Number of scheduling domains.
pub const NUM_DOMAINS: usize = 4;

/// Maximum slots in the cyclic domain schedule.
pub const MAX_SCHEDULE_SLOTS: usize = 8;

/// Refill ring capacity per scheduling context.
pub const MAX_REFILLS: usize = 8;

/// Worst-case kernel entry-and-exit time, in ticks. To do an operation in
/// the kernel, a thread must have at least [`MIN_BUDGET_TICKS`] -- enough to
/// get in and back out once.
pub const KERNEL_WCET_TICKS: u64 = 1;

/// Minimum budget: 2 * WCET.
pub const MIN_BUDGET_TICKS: u64 = 2 * KERNEL_WCET_TICKS;

/// Minimum refills for a round-robin thread.
pub const MIN_REFILLS_ROUND_ROBIN: usize = 2;

/// How many work units a long operation may complete before the preemption
/// point actually polls for pending interrupts. Checking on every unit is
/// too slow; callers tend to sit in tight loops.
pub const PREEMPTION_WORK_UNITS: u32 = 100;

/// How many bytes of untyped storage a retype reset pass zeroes between
/// preemption-point polls.
pub const RETYPE_RESET_CHUNK: usize = 256;

/// Magic value placed at the base of each thread's stack.
pub const STACK_SENTINEL: usize = 0xF0F0_F0F0;
