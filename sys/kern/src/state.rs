// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state, gathered into one value.
//!
//! There is deliberately no global: every entry point takes `&mut Kernel`
//! explicitly, and a port that wants a per-CPU pointer hides it on its own
//! side of the seam. Tests instantiate as many kernels in one process as
//! they need.

use abi::KernelInfoPage;
use zerocopy::FromZeros;

use crate::config::{MAX_MEM_DOMAINS, MAX_SCHED_CONTEXTS, MAX_THREADS};
use crate::irq::IrqTable;
use crate::mem::MemDomain;
use crate::obj::Registry;
use crate::sched::Sched;
use crate::sporadic::SchedContext;
use crate::task::Tcb;
use crate::time::Timekeeping;

/// The kernel singleton -- except it isn't one: initialized at boot by
/// `startup::build`, never destroyed, and passed by reference everywhere.
pub struct Kernel {
    pub threads: [Tcb; MAX_THREADS],
    pub scheds: [SchedContext; MAX_SCHED_CONTEXTS],
    pub mdomains: [MemDomain; MAX_MEM_DOMAINS],
    pub registry: Registry,
    pub irqs: IrqTable,
    pub sched: Sched,
    pub time: Timekeeping,
    pub kip: KernelInfoPage,
    /// Registry slot of the boot system untyped, which feeds kernel-side
    /// allocations (reserved thread endpoints, interrupt handlers).
    pub sysroot: usize,
    /// Registry slot of the interrupt-control object.
    pub irq_control: usize,
    /// Work-unit counter feeding the preemption point.
    pub work_units: u32,
}

impl Kernel {
    /// An empty kernel; `startup::build` fills in the roots, reserved
    /// threads, and schedule.
    pub fn new(timer_irq: u32) -> Self {
        Self {
            threads: core::array::from_fn(Tcb::new),
            scheds: core::array::from_fn(|_| SchedContext::default()),
            mdomains: core::array::from_fn(|_| MemDomain::new()),
            registry: Registry::new(),
            irqs: IrqTable::new(timer_irq),
            sched: Sched::new(),
            time: Timekeeping::new(),
            kip: KernelInfoPage::new_zeroed(),
            sysroot: 0,
            irq_control: 0,
            work_units: 0,
        }
    }

    /// Index of the thread currently on the CPU.
    pub fn current(&self) -> usize {
        self.sched.current
    }
}
