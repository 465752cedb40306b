// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-entry serialization primitives.
//!
//! The core itself is single-threaded per CPU and non-preemptible outside
//! the explicit preemption point, so on one CPU none of this is load
//! bearing. A multi-CPU port serializes kernel entry through one
//! [`KernelLock`]; user mode on other CPUs keeps running.

use crate::machine::Machine;
use core::sync::atomic::{AtomicU32, Ordering};

/// The big kernel lock: a spinlock with a re-acquire count, so the context
/// swap path can release and re-take it the same number of times it was
/// held.
pub struct KernelLock {
    /// 0 when free; otherwise the current hold depth.
    depth: AtomicU32,
}

impl KernelLock {
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
        }
    }

    /// Acquires the lock, spinning while another CPU holds it.
    pub fn acquire(&self) -> KernelLockGuard<'_> {
        while self
            .depth
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        KernelLockGuard { lock: self }
    }

    /// Bumps the hold depth. May only be called on the CPU that already
    /// holds the lock.
    pub fn reenter(&self) {
        let prev = self.depth.fetch_add(1, Ordering::Relaxed);
        uassert!(prev != 0);
    }

    /// Drops the hold depth by one without a guard, pairing a `reenter`.
    pub fn leave(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::Release);
        uassert!(prev > 1);
    }

    /// Releases the lock completely for a context swap, returning the depth
    /// to re-establish afterwards.
    pub fn save_and_release(&self) -> u32 {
        self.depth.swap(0, Ordering::Release)
    }

    /// Re-takes the lock at a previously saved depth.
    pub fn restore(&self, saved: u32) {
        if saved == 0 {
            return;
        }
        while self
            .depth
            .compare_exchange_weak(
                0,
                saved,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Current hold depth.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KernelLockGuard<'a> {
    lock: &'a KernelLock,
}

impl Drop for KernelLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.depth.fetch_sub(1, Ordering::Release);
    }
}

/// Scoped interrupt-disabled critical section. Construction disables
/// interrupt delivery through the machine port; the restore happens in
/// `Drop`, so no exit path can leak the disabled state.
pub struct IrqGuard<'a, M: Machine> {
    machine: &'a mut M,
    key: usize,
}

impl<'a, M: Machine> IrqGuard<'a, M> {
    pub fn enter(machine: &'a mut M) -> Self {
        let key = machine.irq_lock();
        Self { machine, key }
    }

    /// Access to the port while interrupts are held off.
    pub fn machine(&mut self) -> &mut M {
        self.machine
    }
}

impl<M: Machine> Drop for IrqGuard<'_, M> {
    fn drop(&mut self) {
        self.machine.irq_unlock(self.key);
    }
}
