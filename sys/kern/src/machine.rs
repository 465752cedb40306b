// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine port seam.
//!
//! Everything the core needs from the architecture and platform is collected
//! into the [`Machine`] trait: the tick source, the one-shot timer, the IRQ
//! controller, the deferred context-switch request, and the printk byte
//! sink. A port implements this once; the test suite implements it with a
//! scripted fake.

use crate::time::Ticks;

pub trait Machine {
    /// Reads the free-running 32-bit cycle counter. Diagnostic use only.
    fn cycle_get_32(&mut self) -> u32;

    /// Returns ticks elapsed since the previous call to `elapsed`. The
    /// kernel calls this on every entry to advance its monotonic clock.
    fn elapsed(&mut self) -> Ticks;

    /// Arms the one-shot deadline timer `ticks` from now. `idle` is set when
    /// the CPU is about to sleep in the idle loop, so deep-sleep-capable
    /// timers can switch clock sources.
    fn set_timeout(&mut self, ticks: Ticks, idle: bool);

    /// Called when the idle loop is exited by an interrupt.
    fn idle_exit(&mut self);

    /// Masks one IRQ line at the interrupt controller.
    fn mask_irq(&mut self, irq: u32);

    /// Unmasks one IRQ line at the interrupt controller.
    fn unmask_irq(&mut self, irq: u32);

    /// True if any IRQ is pending delivery. Polled by the preemption point.
    fn irq_pending(&self) -> bool;

    /// Disables interrupt delivery entirely, returning an opaque restore
    /// key. Prefer [`crate::sync::IrqGuard`] over calling this directly, so
    /// the release cannot be missed on an early exit path.
    fn irq_lock(&mut self) -> usize;

    /// Restores the interrupt delivery state saved by `irq_lock`.
    fn irq_unlock(&mut self, key: usize);

    /// Requests a context switch at the next exception return, instead of
    /// switching in the middle of the current exception frame.
    fn pend_switch(&mut self);

    /// Emits one byte on the out-of-band diagnostic channel.
    fn printk_byte(&mut self, b: u8);
}

/// `core::fmt::Write` adapter over the printk byte channel, used by the
/// `klog!` macro.
pub struct Printk<'a, M: Machine>(pub &'a mut M);

impl<M: Machine> core::fmt::Write for Printk<'_, M> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            self.0.printk_byte(b);
        }
        Ok(())
    }
}

/// Scripted machine for kernel unit tests: time advances only when the test
/// says so, and IRQ controller traffic is recorded for inspection.
#[cfg(test)]
pub struct FakeMachine {
    /// Ticks handed out by the next `elapsed` call.
    pub pending_ticks: Ticks,
    pub irq_pending: bool,
    pub masked: [bool; crate::config::MAX_IRQS],
    pub last_timeout: Option<(Ticks, bool)>,
    pub switch_pended: bool,
    pub lock_depth: usize,
    pub log: std::vec::Vec<u8>,
}

#[cfg(test)]
impl FakeMachine {
    pub fn new() -> Self {
        Self {
            pending_ticks: 0,
            irq_pending: false,
            masked: [true; crate::config::MAX_IRQS],
            last_timeout: None,
            switch_pended: false,
            lock_depth: 0,
            log: std::vec::Vec::new(),
        }
    }

    /// Makes the next kernel entry observe `t` elapsed ticks.
    pub fn advance(&mut self, t: Ticks) {
        self.pending_ticks += t;
    }
}

#[cfg(test)]
impl Machine for FakeMachine {
    fn cycle_get_32(&mut self) -> u32 {
        0
    }

    fn elapsed(&mut self) -> Ticks {
        core::mem::take(&mut self.pending_ticks)
    }

    fn set_timeout(&mut self, ticks: Ticks, idle: bool) {
        self.last_timeout = Some((ticks, idle));
    }

    fn idle_exit(&mut self) {}

    fn mask_irq(&mut self, irq: u32) {
        self.masked[irq as usize] = true;
    }

    fn unmask_irq(&mut self, irq: u32) {
        self.masked[irq as usize] = false;
    }

    fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    fn irq_lock(&mut self) -> usize {
        self.lock_depth += 1;
        self.lock_depth
    }

    fn irq_unlock(&mut self, key: usize) {
        assert_eq!(self.lock_depth, key);
        self.lock_depth -= 1;
    }

    fn pend_switch(&mut self) {
        self.switch_pended = true;
    }

    fn printk_byte(&mut self, b: u8) {
        self.log.push(b);
    }
}
