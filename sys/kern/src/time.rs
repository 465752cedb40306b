// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The time core: monotonic kernel time, budget charging, the timelist,
//! and the lazy timer-reprogramming flag.
//!
//! Time only advances through [`update_timestamp`], called on every kernel
//! entry; the elapsed ticks accumulate as the running thread's pending
//! charge until [`commit_time`] settles them against its scheduling
//! context. Deadline events (budget exhaustion, release-queue changes,
//! domain boundaries) raise `reprogram`; the kernel-exit path arms the
//! hardware timer exactly once, via [`commit_timer`].

use abi::{ThreadState, IDLE_THREAD};

use crate::config::KERNEL_WCET_TICKS;
use crate::machine::Machine;
use crate::sched::{self, Action};
use crate::state::Kernel;

/// Kernel time, in ticks of the platform tick source.
pub type Ticks = u64;

pub struct Timekeeping {
    /// Monotonic current time, updated at every kernel entry.
    pub now: Ticks,
    /// Ticks consumed by the current thread since its last settlement.
    pub consumed: Ticks,
    /// Set when a deadline event needs the hardware timer rearmed before
    /// returning to user mode.
    pub reprogram: bool,
}

impl Timekeeping {
    pub fn new() -> Self {
        Self {
            now: 0,
            consumed: 0,
            reprogram: false,
        }
    }
}

impl Default for Timekeeping {
    fn default() -> Self {
        Self::new()
    }
}

/// Advances kernel time by however much the clock source says has elapsed.
/// Also burns down the current domain's timeslice, rolling the cyclic
/// schedule forward when it expires.
pub fn update_timestamp(
    k: &mut Kernel,
    m: &mut impl Machine,
    force: bool,
) {
    let d = m.elapsed();
    if d == 0 && !force {
        return;
    }
    k.time.now += d;
    k.time.consumed += d;

    if k.sched.schedule_len > 1 {
        if k.sched.domain_time <= d {
            next_domain(k);
        } else {
            k.sched.domain_time -= d;
        }
    }
}

/// Moves the cyclic schedule to its next slot.
pub fn next_domain(k: &mut Kernel) {
    k.sched.schedule_idx = (k.sched.schedule_idx + 1) % k.sched.schedule_len;
    let slot = k.sched.schedule[k.sched.schedule_idx];
    k.sched.current_domain = slot.domain;
    k.sched.domain_time = slot.length;
    k.sched.action = k.sched.action.combine(Action::ChooseNew);
    k.time.reprogram = true;
}

/// Settles the pending charge against the current thread's scheduling
/// context. If the head refill survives, it is split; if it is depleted,
/// the budget check runs and the thread moves to the release queue until
/// its next refill matures.
pub fn commit_time(k: &mut Kernel) {
    let consumed = core::mem::take(&mut k.time.consumed);
    if consumed == 0 {
        return;
    }
    let cur = k.sched.current;
    if cur == IDLE_THREAD as usize {
        return;
    }
    let Some(sci) = k.threads[cur].sc else {
        return;
    };
    if !k.scheds[sci].is_active() {
        return;
    }

    if k.scheds[sci].sufficient(consumed) {
        k.scheds[sci].split_check(consumed);
        return;
    }

    k.scheds[sci].budget_check(consumed);
    k.time.reprogram = true;
    park_current_if_not_ready(k, sci);
}

/// Moves the current thread to the release queue when its head refill has
/// not matured. It re-enters the kernel from scratch when released.
fn park_current_if_not_ready(k: &mut Kernel, sci: usize) {
    let now = k.time.now;
    if k.scheds[sci].refill_ready(now) {
        return;
    }
    let cur = k.sched.current;
    if k.threads[cur].in_release {
        return;
    }
    let wake = k.scheds[sci].head().time;
    let Kernel { sched, threads, .. } = k;
    sched::ready_remove(sched, threads, cur);
    threads[cur].set_state(ThreadState::Restart);
    sched::release_enqueue(sched, threads, cur, wake);
    k.time.reprogram = true;
    k.sched.action = k.sched.action.combine(Action::ChooseNew);
}

/// True if the current thread can fund one kernel entry-and-exit on top of
/// its pending charge. On failure the charge is settled, which parks the
/// thread on the release queue.
pub fn check_budget(k: &mut Kernel) -> bool {
    let cur = k.sched.current;
    if cur == IDLE_THREAD as usize {
        k.time.consumed = 0;
        return true;
    }
    let Some(sci) = k.threads[cur].sc else {
        k.time.consumed = 0;
        return true;
    };
    if !k.scheds[sci].is_active() {
        k.time.consumed = 0;
        return true;
    }
    let now = k.time.now;
    if k.scheds[sci].refill_ready(now)
        && k.scheds[sci].sufficient(k.time.consumed)
    {
        return true;
    }
    commit_time(k);
    // Whatever the charge did, a thread whose head refill is immature
    // cannot stay in the ready structure.
    park_current_if_not_ready(k, sci);
    false
}

/// The syscall-prologue flavor: on insufficient budget the thread has been
/// moved to the release queue and the syscall returns `fault` without
/// running.
pub fn check_budget_restart(k: &mut Kernel) -> bool {
    check_budget(k)
}

/// The clock handler: drains the timelist and flags a reprogram. Called
/// from the timer interrupt.
pub fn clock_tick(k: &mut Kernel) {
    update_timelist(k);
    k.time.reprogram = true;
}

/// Drains every due release-queue entry: threads waiting out a refill go
/// back to the ready structure (after refill maintenance), and blocked
/// threads with expired timeouts unblock with `ipc-timeout`.
pub fn update_timelist(k: &mut Kernel) {
    let now = k.time.now;
    loop {
        let Some(h) = k.sched.release_head else {
            break;
        };
        if k.threads[h].wake_time > now + KERNEL_WCET_TICKS {
            break;
        }
        {
            let Kernel { sched, threads, .. } = k;
            sched::release_pop(sched, threads);
        }
        k.time.reprogram = true;

        let state = k.threads[h].state();
        match state {
            ThreadState::Restart
            | ThreadState::Queued
            | ThreadState::Ready => {
                if let Some(sci) = k.threads[h].sc {
                    k.scheds[sci].noblock_check(now);
                }
                let Kernel { sched, threads, .. } = k;
                sched::ready_enqueue(sched, threads, h);
                sched::possible_switch_to(sched, threads, h);
            }
            s if s.is_blocked() => {
                crate::ipc::timeout_unblock(k, h);
            }
            _ => {}
        }
    }
}

/// The next absolute deadline the hardware timer must fire at: the release
/// queue head, the domain boundary, or the current thread's budget running
/// dry -- whichever is first.
pub fn next_deadline(k: &Kernel) -> Option<Ticks> {
    let mut deadline: Option<Ticks> = None;
    let mut consider = |t: Ticks| {
        deadline = Some(match deadline {
            Some(d) if d <= t => d,
            _ => t,
        });
    };

    if let Some(h) = k.sched.release_head {
        consider(k.threads[h].wake_time);
    }
    if k.sched.schedule_len > 1 {
        consider(k.time.now + k.sched.domain_time);
    }
    let cur = k.sched.current;
    if cur != IDLE_THREAD as usize {
        if let Some(sci) = k.threads[cur].sc {
            let sc = &k.scheds[sci];
            if sc.is_active() {
                let remaining =
                    sc.head().amount.saturating_sub(k.time.consumed);
                consider(k.time.now + remaining);
            }
        }
    }
    deadline
}

/// Consumes the `reprogram` flag, arming the hardware timer for the next
/// deadline if one exists. Runs on the kernel-exit path.
pub fn commit_timer(k: &mut Kernel, m: &mut impl Machine, idle: bool) {
    if !k.time.reprogram {
        return;
    }
    k.time.reprogram = false;
    let Some(d) = next_deadline(k) else {
        return;
    };
    let ticks = d.saturating_sub(k.time.now).max(1);
    m.set_timeout(ticks, idle);
}
