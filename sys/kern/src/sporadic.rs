// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sporadic-server scheduling contexts.
//!
//! A scheduling context is a bandwidth contract: `budget` ticks of CPU out
//! of every `period`, tracked as a ring of (time, amount) refills. The sum
//! of refill amounts never exceeds the declared budget, and refill times are
//! non-decreasing from head to tail. The head refill is what the running
//! thread is currently spending; charging operations keep the thread's
//! future entitlement by re-inserting consumed amounts one period later.

use crate::config::{
    KERNEL_WCET_TICKS, MAX_REFILLS, MIN_BUDGET_TICKS,
};
use crate::time::Ticks;

/// One slot of budget: `amount` ticks usable from `time` on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Refill {
    pub time: Ticks,
    pub amount: Ticks,
}

/// A scheduling context. Inactive until `refill_new` installs a contract.
#[derive(Clone, Debug)]
pub struct SchedContext {
    pub period: Ticks,
    pub budget: Ticks,
    /// Ring capacity in use; at most [`MAX_REFILLS`].
    pub refill_max: usize,
    /// Whether this table slot is backed by a live kernel object.
    pub in_use: bool,
    refills: [Refill; MAX_REFILLS],
    head: usize,
    len: usize,
}

impl Default for SchedContext {
    fn default() -> Self {
        Self {
            period: 0,
            budget: 0,
            refill_max: MAX_REFILLS,
            in_use: false,
            refills: [Refill::default(); MAX_REFILLS],
            head: 0,
            len: 0,
        }
    }
}

impl SchedContext {
    fn idx(&self, i: usize) -> usize {
        (self.head + i) % self.refill_max
    }

    /// An SC with no refills is inactive: its thread has no bandwidth
    /// contract and is scheduled (or not) without budget accounting.
    pub fn is_active(&self) -> bool {
        self.len > 0
    }

    pub fn refill_count(&self) -> usize {
        self.len
    }

    /// Index of the head refill within the ring storage.
    pub fn head_index(&self) -> usize {
        self.head
    }

    /// Index of the tail refill within the ring storage.
    pub fn tail_index(&self) -> usize {
        uassert!(self.len > 0);
        self.idx(self.len - 1)
    }

    pub fn head(&self) -> Refill {
        uassert!(self.len > 0);
        self.refills[self.head]
    }

    fn head_mut(&mut self) -> &mut Refill {
        uassert!(self.len > 0);
        &mut self.refills[self.head]
    }

    /// Refills in order from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = Refill> + '_ {
        (0..self.len).map(|i| self.refills[self.idx(i)])
    }

    /// Sum of all refill amounts; bounded by `budget`.
    pub fn total(&self) -> Ticks {
        self.iter().map(|r| r.amount).sum()
    }

    fn pop_head(&mut self) -> Refill {
        uassert!(self.len > 0);
        let r = self.refills[self.head];
        self.head = self.idx(1);
        self.len -= 1;
        r
    }

    fn push_front(&mut self, r: Refill) {
        uassert!(self.len < self.refill_max);
        self.head = (self.head + self.refill_max - 1) % self.refill_max;
        self.refills[self.head] = r;
        self.len += 1;
    }

    /// Appends a refill, merging into the tail when the ring is full or the
    /// new refill would overlap the tail's span.
    fn push_tail(&mut self, r: Refill) {
        if r.amount == 0 {
            return;
        }
        if self.len > 0 {
            let tail = self.refills[self.tail_index()];
            if self.len == self.refill_max
                || r.time <= tail.time + tail.amount
            {
                let t = self.tail_index();
                self.refills[t].amount += r.amount;
                return;
            }
        }
        let slot = self.idx(self.len);
        self.refills[slot] = r;
        self.len += 1;
    }

    /// True if the head refill is eligible to be used: a thread whose head
    /// refill is not ready waits on the release queue instead of the ready
    /// structure.
    pub fn refill_ready(&self, now: Ticks) -> bool {
        self.head().time <= now + KERNEL_WCET_TICKS
    }

    /// Budget left in the head refill after charging `usage`.
    pub fn capacity(&self, usage: Ticks) -> Ticks {
        self.head().amount.saturating_sub(usage)
    }

    /// True if the head refill can absorb `usage` and still fund one kernel
    /// entry-and-exit.
    pub fn sufficient(&self, usage: Ticks) -> bool {
        self.capacity(usage) >= MIN_BUDGET_TICKS
    }

    /// Installs a contract on an inactive SC.
    pub fn refill_new(
        &mut self,
        max_refills: usize,
        budget: Ticks,
        period: Ticks,
        now: Ticks,
    ) {
        uassert!(max_refills >= 1 && max_refills <= MAX_REFILLS);
        uassert!(budget >= MIN_BUDGET_TICKS);
        self.period = period;
        self.budget = budget;
        self.refill_max = max_refills;
        self.head = 0;
        self.len = 1;
        self.refills[0] = Refill {
            time: now,
            amount: budget,
        };
    }

    /// Updates the contract on an active SC without violating bandwidth
    /// constraints: entitlement collapses to a single refill no earlier
    /// than the old head.
    pub fn refill_update(
        &mut self,
        period: Ticks,
        budget: Ticks,
        max_refills: usize,
        now: Ticks,
    ) {
        uassert!(max_refills >= 1 && max_refills <= MAX_REFILLS);
        let time = if self.is_active() {
            self.head().time.max(now)
        } else {
            now
        };
        self.period = period;
        self.budget = budget;
        self.refill_max = max_refills;
        self.head = 0;
        self.len = 1;
        self.refills[0] = Refill {
            time,
            amount: budget,
        };
    }

    /// Charges `used` ticks when the head refill stays sufficient: the
    /// consumed span is re-scheduled one period out, and the remainder keeps
    /// the thread runnable.
    pub fn split_check(&mut self, used: Ticks) {
        if used == 0 {
            return;
        }
        uassert!(self.sufficient(used));
        let period = self.period;
        let head_time = self.head().time;
        {
            let h = self.head_mut();
            h.amount -= used;
            h.time += used;
        }
        self.push_tail(Refill {
            time: head_time + period,
            amount: used,
        });
    }

    /// Charges `used` ticks when doing so depletes the head. Consumed
    /// refills are pushed one period out and consecutive leftovers are
    /// merged until the new head is sufficient. The caller decides, from
    /// `refill_ready`, whether the thread now belongs on the release queue.
    pub fn budget_check(&mut self, mut used: Ticks) {
        let period = self.period;
        while self.is_active() && self.head().amount <= used {
            let r = self.pop_head();
            used -= r.amount;
            self.push_tail(Refill {
                time: r.time + period,
                amount: r.amount,
            });
        }
        if used > 0 && self.is_active() {
            let head_time = self.head().time;
            {
                let h = self.head_mut();
                h.amount -= used;
                h.time += used;
            }
            self.push_tail(Refill {
                time: head_time + period,
                amount: used,
            });
        }
        // Merge forward until the head alone can fund a kernel entry.
        while self.len > 1 && self.head().amount < MIN_BUDGET_TICKS {
            let r = self.pop_head();
            let h = self.head_mut();
            h.amount += r.amount;
        }
    }

    /// Called when a thread becomes eligible to run after a sleep: merges
    /// any refills whose spans overlap, and drags a stale head up to `now`.
    pub fn noblock_check(&mut self, now: Ticks) {
        if !self.is_active() {
            return;
        }
        if self.head().time < now {
            self.head_mut().time = now;
        }
        loop {
            if self.len < 2 {
                break;
            }
            let h = self.refills[self.head];
            let n = self.refills[self.idx(1)];
            if h.time + h.amount >= n.time {
                self.pop_head();
                self.pop_head();
                self.push_front(Refill {
                    time: h.time,
                    amount: h.amount + n.amount,
                });
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_sc(budget: Ticks, period: Ticks, max: usize) -> SchedContext {
        let mut sc = SchedContext::default();
        sc.refill_new(max, budget, period, 0);
        sc
    }

    fn check_invariants(sc: &SchedContext) {
        assert!(sc.total() <= sc.budget, "sum exceeds budget");
        let mut last = 0;
        for r in sc.iter() {
            assert!(r.time >= last, "refill times not ordered");
            assert!(r.amount > 0);
            last = r.time;
        }
        assert!(sc.head_index() < sc.refill_max);
        if sc.is_active() {
            assert!(sc.tail_index() < sc.refill_max);
        }
    }

    #[test]
    fn new_contract_is_one_full_refill() {
        let sc = active_sc(10, 100, 4);
        assert!(sc.is_active());
        assert_eq!(sc.head(), Refill { time: 0, amount: 10 });
        assert!(sc.refill_ready(0));
        assert!(sc.sufficient(0));
        check_invariants(&sc);
    }

    #[test]
    fn split_preserves_total_and_order() {
        let mut sc = active_sc(10, 100, 4);
        sc.split_check(4);
        assert_eq!(sc.refill_count(), 2);
        assert_eq!(sc.head(), Refill { time: 4, amount: 6 });
        let tail: Vec<_> = sc.iter().collect();
        assert_eq!(tail[1], Refill { time: 100, amount: 4 });
        assert_eq!(sc.total(), 10);
        check_invariants(&sc);
    }

    #[test]
    fn budget_check_moves_entitlement_one_period_out() {
        // Budget of 2 out of every 10, and the thread ran its full 2
        // ticks without blocking.
        let mut sc = active_sc(2, 10, 2);
        sc.budget_check(2);
        assert!(sc.is_active());
        assert_eq!(sc.head(), Refill { time: 10, amount: 2 });
        assert!(!sc.refill_ready(2));
        check_invariants(&sc);
    }

    #[test]
    fn budget_check_partial_depletion_merges_to_sufficient() {
        let mut sc = active_sc(10, 100, 4);
        sc.split_check(4); // head {4,6}, tail {100,4}
        sc.budget_check(5); // depletes head to 1 < MIN_BUDGET
        assert!(sc.head().amount >= MIN_BUDGET_TICKS);
        assert_eq!(sc.total(), 10);
        check_invariants(&sc);
    }

    #[test]
    fn overfull_ring_merges_into_tail() {
        let mut sc = active_sc(8, 50, 2);
        sc.split_check(2);
        sc.split_check(2);
        sc.split_check(2);
        assert!(sc.refill_count() <= 2);
        assert_eq!(sc.total(), 8);
        check_invariants(&sc);
    }

    #[test]
    fn noblock_check_merges_overlaps_and_advances_head() {
        let mut sc = active_sc(10, 6, 4);
        sc.split_check(4); // head {4,6}, next {6,4} -- spans overlap
        sc.noblock_check(20);
        assert_eq!(sc.refill_count(), 1);
        assert_eq!(sc.head(), Refill { time: 20, amount: 10 });
        check_invariants(&sc);
    }

    #[test]
    fn update_collapses_to_declared_budget() {
        let mut sc = active_sc(10, 100, 4);
        sc.split_check(3);
        sc.refill_update(50, 6, 3, 5);
        assert_eq!(sc.refill_count(), 1);
        assert_eq!(sc.budget, 6);
        assert_eq!(sc.period, 50);
        assert_eq!(sc.head().amount, 6);
        check_invariants(&sc);
    }
}
