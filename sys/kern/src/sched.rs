// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ready structure, domain schedule, and the scheduler proper.
//!
//! For each (domain, priority) pair there is a FIFO of runnable threads,
//! indexed by a two-level bitmap per domain so electing the most important
//! runnable thread is O(word size). A cyclic schedule of (domain, length)
//! slots decides which domain's threads may run at all; the scheduler never
//! migrates a thread between domains.
//!
//! Every kernel entry funnels into [`schedule`] on its way out, which
//! honors the pending [`Action`] and resets it to resume-current.

use abi::{Domain, Priority, ThreadState, IDLE_THREAD};
use kerncore::PriorityBitmap;

use crate::config::{
    MAX_SCHEDULE_SLOTS, MAX_THREADS, NUM_DOMAINS, PREEMPTION_WORK_UNITS,
};
use crate::err::UserError;
use crate::machine::Machine;
use crate::state::Kernel;
use crate::task::Tcb;
use crate::time::{self, Ticks};

pub const NUM_PRIORITIES: usize = 256;

/// What the scheduler should do at the next opportunity. Every kernel entry
/// ends by honoring this and resetting it to `ResumeCurrent`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Action {
    /// Keep running whatever thread we were just running.
    ResumeCurrent,
    /// Something changed; elect a new thread from the ready structure.
    ChooseNew,
    /// We already know who should run next. This is an optimization
    /// available in certain IPC cases; strict priority still gets the last
    /// word in [`schedule`].
    SwitchTo(usize),
}

impl Action {
    pub fn combine(self, other: Self) -> Self {
        use Action::*;

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Conflicting specific recommendations degrade to a full
            // election.
            (SwitchTo(_), SwitchTo(_)) => ChooseNew,
            // If only one is specific, it wins.
            (SwitchTo(x), _) | (_, SwitchTo(x)) => SwitchTo(x),
            // Otherwise, if either suggests switching, switch.
            (ChooseNew, _) | (_, ChooseNew) => ChooseNew,
            (ResumeCurrent, ResumeCurrent) => ResumeCurrent,
        }
    }
}

/// One slot of the fixed cyclic domain schedule.
#[derive(Copy, Clone, Debug)]
pub struct DomainSlot {
    pub domain: Domain,
    pub length: Ticks,
}

pub struct Sched {
    /// Index of the thread currently on the CPU.
    pub current: usize,
    pub action: Action,
    heads: [[Option<u16>; NUM_PRIORITIES]; NUM_DOMAINS],
    tails: [[Option<u16>; NUM_PRIORITIES]; NUM_DOMAINS],
    bitmaps: [PriorityBitmap; NUM_DOMAINS],
    /// Head of the release queue: threads whose head refill is not yet
    /// ready, and blocked threads with finite timeouts, ordered by
    /// (wake time, priority).
    pub release_head: Option<usize>,
    pub schedule: [DomainSlot; MAX_SCHEDULE_SLOTS],
    pub schedule_len: usize,
    pub schedule_idx: usize,
    pub current_domain: Domain,
    /// Ticks left in the current domain's slot.
    pub domain_time: Ticks,
}

impl Sched {
    pub fn new() -> Self {
        Self {
            current: IDLE_THREAD as usize,
            action: Action::ResumeCurrent,
            heads: [[None; NUM_PRIORITIES]; NUM_DOMAINS],
            tails: [[None; NUM_PRIORITIES]; NUM_DOMAINS],
            bitmaps: core::array::from_fn(|_| PriorityBitmap::new()),
            release_head: None,
            schedule: [DomainSlot { domain: 0, length: 0 }; MAX_SCHEDULE_SLOTS],
            schedule_len: 1,
            schedule_idx: 0,
            current_domain: 0,
            domain_time: Ticks::MAX,
        }
    }

    pub fn bitmap(&self, domain: Domain) -> &PriorityBitmap {
        &self.bitmaps[domain as usize]
    }
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

/// Appends `tid` to its (domain, priority) FIFO. The idle thread is never a
/// queue member; it is the fallback of [`choose_next`].
pub fn ready_enqueue(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    tid: usize,
) {
    if tid == IDLE_THREAD as usize {
        threads[tid].set_state(ThreadState::Queued);
        return;
    }
    if threads[tid].in_ready {
        return;
    }
    uassert!(threads[tid].is_schedulable());
    threads[tid].set_state(ThreadState::Queued);
    threads[tid].in_ready = true;
    threads[tid].ready_link = None;
    let dom = threads[tid].domain as usize;
    let prio = threads[tid].prio.0;
    let slot = usize::from(prio);
    match sched.tails[dom][slot] {
        Some(t) => threads[usize::from(t)].ready_link = Some(tid),
        None => sched.heads[dom][slot] = Some(tid as u16),
    }
    sched.tails[dom][slot] = Some(tid as u16);
    sched.bitmaps[dom].set(prio);
}

/// Unlinks `tid` from its FIFO, wherever it sits. Tolerates non-members.
pub fn ready_remove(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    tid: usize,
) -> bool {
    if !threads[tid].in_ready {
        return false;
    }
    let dom = threads[tid].domain as usize;
    let slot = usize::from(threads[tid].prio.0);
    let mut prev: Option<usize> = None;
    let mut cursor = sched.heads[dom][slot].map(usize::from);
    while let Some(c) = cursor {
        if c == tid {
            let next = threads[c].ready_link.take();
            match prev {
                Some(p) => threads[p].ready_link = next,
                None => sched.heads[dom][slot] = next.map(|n| n as u16),
            }
            if sched.tails[dom][slot] == Some(c as u16) {
                sched.tails[dom][slot] = prev.map(|p| p as u16);
            }
            threads[c].in_ready = false;
            if sched.heads[dom][slot].is_none() {
                sched.bitmaps[dom].clear(slot as u8);
            }
            return true;
        }
        prev = cursor;
        cursor = threads[c].ready_link;
    }
    // Membership flag said yes but the queue disagreed; that's a bug.
    panic!("ready queue corruption at ({dom}, {slot})");
}

fn ready_pop(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    domain: Domain,
    prio: u8,
) -> Option<usize> {
    let dom = domain as usize;
    let slot = usize::from(prio);
    let h = usize::from(sched.heads[dom][slot]?);
    sched.heads[dom][slot] = threads[h].ready_link.take().map(|n| n as u16);
    if sched.heads[dom][slot].is_none() {
        sched.tails[dom][slot] = None;
        sched.bitmaps[dom].clear(prio);
    }
    threads[h].in_ready = false;
    threads[h].set_state(ThreadState::Ready);
    Some(h)
}

/// Elects the most important runnable thread of the current domain,
/// falling back to the idle thread. Tie-break within a priority is strict
/// FIFO.
pub fn choose_next(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
) -> usize {
    let dom = sched.current_domain;
    if let Some(prio) = sched.bitmaps[dom as usize].lowest_set() {
        return ready_pop(sched, threads, dom, prio)
            .expect("bitmap bit set but queue empty");
    }
    let idle = IDLE_THREAD as usize;
    threads[idle].set_state(ThreadState::Ready);
    idle
}

/// Notes that `tid` became runnable and may deserve the CPU, without
/// forcing a full election when one isn't needed.
pub fn possible_switch_to(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    tid: usize,
) {
    if threads[tid].domain != sched.current_domain {
        ready_enqueue(sched, threads, tid);
    } else if sched.action == Action::ResumeCurrent {
        sched.action = Action::SwitchTo(tid);
    } else {
        if let Action::SwitchTo(other) = sched.action {
            ready_enqueue(sched, threads, other);
        }
        ready_enqueue(sched, threads, tid);
        sched.action = Action::ChooseNew;
    }
}

fn requeue_current(sched: &mut Sched, threads: &mut [Tcb; MAX_THREADS]) {
    let cur = sched.current;
    if matches!(
        threads[cur].state(),
        ThreadState::Running | ThreadState::Ready | ThreadState::Restart
    ) && threads[cur].is_schedulable()
        && !threads[cur].in_release
    {
        ready_enqueue(sched, threads, cur);
    }
}

/// Honors the scheduler action, commits the outgoing thread's time charge,
/// performs the election, and (lazily) reprograms the deadline timer. This
/// is the tail of every kernel entry.
pub fn schedule(k: &mut Kernel, m: &mut impl Machine) {
    time::commit_time(k);

    let action =
        core::mem::replace(&mut k.sched.action, Action::ResumeCurrent);
    let prev = k.sched.current;
    let idle = IDLE_THREAD as usize;

    let next = match action {
        Action::ResumeCurrent => prev,
        Action::ChooseNew => {
            let Kernel { sched, threads, .. } = k;
            requeue_current(sched, threads);
            choose_next(sched, threads)
        }
        Action::SwitchTo(t) => {
            let Kernel { sched, threads, .. } = k;
            requeue_current(sched, threads);
            if threads[t].is_schedulable()
                && threads[t].domain == sched.current_domain
            {
                // Strict priority keeps the last word: if someone more
                // important is waiting, the hint loses the election.
                ready_remove(sched, threads, t);
                let best = sched.bitmaps[sched.current_domain as usize]
                    .lowest_set();
                let hint_wins = best.map_or(true, |b| {
                    !Priority(b).is_more_important_than(threads[t].prio)
                });
                if hint_wins {
                    threads[t].set_state(ThreadState::Ready);
                    t
                } else {
                    ready_enqueue(sched, threads, t);
                    choose_next(sched, threads)
                }
            } else {
                choose_next(sched, threads)
            }
        }
    };

    if next != prev {
        k.time.reprogram = true;
        m.pend_switch();
    }
    if next == idle {
        // An empty domain runs idle until the next domain boundary; make
        // sure the timer is armed for it.
        k.time.reprogram = true;
    }
    k.threads[next].set_state(ThreadState::Running);
    k.sched.current = next;

    time::commit_timer(k, m, next == idle);
}

/// Inserts `tid` into the release queue ordered by (wake time, priority).
pub fn release_enqueue(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    tid: usize,
    wake: Ticks,
) {
    release_remove(sched, threads, tid);
    threads[tid].wake_time = wake;
    threads[tid].in_release = true;
    let mut prev: Option<usize> = None;
    let mut cursor = sched.release_head;
    while let Some(c) = cursor {
        let earlier = (threads[c].wake_time, threads[c].prio.0)
            <= (wake, threads[tid].prio.0);
        if !earlier {
            break;
        }
        prev = cursor;
        cursor = threads[c].release_link;
    }
    threads[tid].release_link = cursor;
    match prev {
        Some(p) => threads[p].release_link = Some(tid),
        None => sched.release_head = Some(tid),
    }
}

pub fn release_remove(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
    tid: usize,
) -> bool {
    if !threads[tid].in_release {
        return false;
    }
    let mut prev: Option<usize> = None;
    let mut cursor = sched.release_head;
    while let Some(c) = cursor {
        if c == tid {
            let next = threads[c].release_link.take();
            match prev {
                Some(p) => threads[p].release_link = next,
                None => sched.release_head = next,
            }
            threads[c].in_release = false;
            return true;
        }
        prev = cursor;
        cursor = threads[c].release_link;
    }
    panic!("release queue corruption");
}

/// Pops the release-queue head.
pub fn release_pop(
    sched: &mut Sched,
    threads: &mut [Tcb; MAX_THREADS],
) -> Option<usize> {
    let h = sched.release_head?;
    sched.release_head = threads[h].release_link.take();
    threads[h].in_release = false;
    Some(h)
}

/// The central preemption point. Long kernel operations call this
/// periodically; if interrupts are pending or the current thread ran out of
/// sufficient budget, the operation unwinds with `Preempted` and the
/// dispatcher re-enters the scheduler.
pub fn preemption_point(
    k: &mut Kernel,
    m: &mut impl Machine,
) -> Result<(), UserError> {
    // Record that we have performed some work, and only do the (slow)
    // pending-interrupt poll once enough has accumulated.
    k.work_units += 1;
    if k.work_units < PREEMPTION_WORK_UNITS {
        return Ok(());
    }
    k.work_units = 0;
    if m.irq_pending() {
        return Err(UserError::Preempted);
    }
    time::update_timestamp(k, m, false);
    if !time::check_budget(k) {
        return Err(UserError::Preempted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::FakeMachine;
    use crate::startup::test_kernel;

    #[test]
    fn strict_priority_and_fifo_tiebreak() {
        let mut k = test_kernel();
        let a = k.user_thread(100, 0);
        let b = k.user_thread(100, 0);
        let c = k.user_thread(40, 0);
        for t in [a, b, c] {
            crate::task::activate(&mut k, t).unwrap();
        }
        let Kernel { sched, threads, .. } = &mut k;
        assert_eq!(choose_next(sched, threads), c);
        // Same priority: FIFO order.
        assert_eq!(choose_next(sched, threads), a);
        assert_eq!(choose_next(sched, threads), b);
        // Structure empty: idle.
        assert_eq!(choose_next(sched, threads), IDLE_THREAD as usize);
    }

    #[test]
    fn ready_bitmap_tracks_queues() {
        let mut k = test_kernel();
        let t = k.user_thread(7, 0);
        crate::task::activate(&mut k, t).unwrap();
        assert!(k.sched.bitmap(0).is_set(7));
        let Kernel { sched, threads, .. } = &mut k;
        assert!(ready_remove(sched, threads, t));
        assert!(!sched.bitmap(0).is_set(7));
    }

    #[test]
    fn empty_domain_runs_idle_and_arms_timer() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        k.sched.action = Action::ChooseNew;
        schedule(&mut k, &mut m);
        assert_eq!(k.sched.current, IDLE_THREAD as usize);
        // Timer armed with the idle flag for the next domain boundary.
        let (_, idle) = m.last_timeout.expect("timer not armed");
        assert!(idle);
        assert_eq!(k.sched.action, Action::ResumeCurrent);
    }

    #[test]
    fn switch_hint_loses_to_higher_priority() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let hi = k.user_thread(10, 0);
        let lo = k.user_thread(200, 0);
        crate::task::activate(&mut k, hi).unwrap();
        crate::task::activate(&mut k, lo).unwrap();
        k.sched.action = Action::SwitchTo(lo);
        schedule(&mut k, &mut m);
        assert_eq!(k.sched.current, hi);
        // The loser is back in its queue, not lost.
        assert!(k.threads[lo].in_ready);
    }

    #[test]
    fn release_queue_orders_by_wake_then_priority() {
        let mut k = test_kernel();
        let a = k.user_thread(100, 0);
        let b = k.user_thread(50, 0);
        let c = k.user_thread(10, 0);
        let Kernel { sched, threads, .. } = &mut k;
        release_enqueue(sched, threads, a, 300);
        release_enqueue(sched, threads, b, 100);
        release_enqueue(sched, threads, c, 300);
        assert_eq!(release_pop(sched, threads), Some(b));
        // Same wake time: more important first.
        assert_eq!(release_pop(sched, threads), Some(c));
        assert_eq!(release_pop(sched, threads), Some(a));
        assert_eq!(release_pop(sched, threads), None);
    }

    #[test]
    fn domain_partitioning_hides_other_domains() {
        let mut k = test_kernel();
        let other = k.user_thread(5, 1);
        crate::task::activate(&mut k, other).unwrap();
        // Current domain is 0; the domain-1 thread must not be elected.
        let Kernel { sched, threads, .. } = &mut k;
        assert_eq!(choose_next(sched, threads), IDLE_THREAD as usize);
        sched.current_domain = 1;
        assert_eq!(choose_next(sched, threads), other);
    }
}
