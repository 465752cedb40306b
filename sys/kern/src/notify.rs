// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Notification objects: asynchronous one-shot signalling.
//!
//! A notification carries a word of bits and a FIFO of waiters. Signals OR
//! bits in; a receive consumes the whole set atomically. Multiple signals
//! before a receive are observable only as their union. The interrupt layer
//! reuses this machinery to turn IRQs into signals.

use abi::{MessageTag, ThreadState, Word, IPC_FLAG_SUCCESS};

use crate::sched;
use crate::state::Kernel;
use crate::task::WaitQueue;

/// Notification object payload.
#[derive(Copy, Clone, Debug, Default)]
pub struct Notification {
    pub bits: Word,
    pub queue: WaitQueue,
}

/// Delivers a consumed bit-set into a thread's registers: MR0 gets a
/// kernel tag, MR1 the set.
fn deliver_set(t: &mut crate::task::Tcb, set: Word) {
    t.set_mr(0, MessageTag::new(1, 0, IPC_FLAG_SUCCESS, 0).0);
    t.set_mr(1, set);
    t.save.set_ret(0, 0);
}

/// ORs `bits` into the notification and, if a waiter exists, hands it the
/// whole current set (zeroing it) and wakes it. Returns true if a thread
/// was woken.
pub fn send_signal(k: &mut Kernel, slot: usize, bits: Word) -> bool {
    let Kernel { registry, threads, sched, .. } = k;
    let n = registry.notification_mut(slot);
    n.bits |= bits;
    if n.bits == 0 {
        return false;
    }
    let Some(waiter) = n.queue.pop(threads) else {
        return false;
    };
    let set = core::mem::take(&mut n.bits);
    let t = &mut threads[waiter];
    uassert!(t.state() == ThreadState::NotifyBlocked);
    t.waiting_on = None;
    deliver_set(t, set);
    t.set_state(ThreadState::Queued);
    sched::release_remove(sched, threads, waiter);
    sched::ready_enqueue(sched, threads, waiter);
    sched::possible_switch_to(sched, threads, waiter);
    true
}

/// Outcome of a receive attempt against a notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecvOutcome {
    /// The set was non-zero and has been consumed into the caller's MRs.
    Consumed(Word),
    /// The caller is now notify-blocked.
    Blocked,
    /// Non-blocking receive found nothing.
    WouldBlock,
}

/// Atomically consumes the set if non-zero; otherwise blocks the caller (if
/// asked) or reports `WouldBlock`.
pub fn recv_signal(
    k: &mut Kernel,
    caller: usize,
    slot: usize,
    blocking: bool,
) -> RecvOutcome {
    let Kernel { registry, threads, sched, .. } = k;
    let n = registry.notification_mut(slot);
    if n.bits != 0 {
        let set = core::mem::take(&mut n.bits);
        deliver_set(&mut threads[caller], set);
        return RecvOutcome::Consumed(set);
    }
    if !blocking {
        return RecvOutcome::WouldBlock;
    }
    threads[caller].set_state(ThreadState::NotifyBlocked);
    threads[caller].waiting_on = Some(slot);
    n.queue.push(threads, caller);
    sched.action = sched.action.combine(sched::Action::ChooseNew);
    RecvOutcome::Blocked
}

/// Removes `tid` from the notification's waiter queue, if queued there.
pub fn cancel_signal(k: &mut Kernel, tid: usize) -> bool {
    let Some(slot) = k.threads[tid].waiting_on else {
        return false;
    };
    let Kernel { registry, threads, .. } = k;
    let n = registry.notification_mut(slot);
    let removed = n.queue.remove(threads, tid);
    if removed {
        threads[tid].waiting_on = None;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::test_kernel;

    #[test]
    fn signals_accumulate_and_consume_once() {
        let mut k = test_kernel();
        let t = k.user_thread(100, 0);
        let note = k.threads[t].notification.unwrap();

        // No waiter: bits just accumulate.
        assert!(!send_signal(&mut k, note, 0b01));
        assert!(!send_signal(&mut k, note, 0b10));

        match recv_signal(&mut k, t, note, true) {
            RecvOutcome::Consumed(set) => assert_eq!(set, 0b11),
            other => panic!("unexpected {other:?}"),
        }
        // Set is now zero again.
        assert_eq!(recv_signal(&mut k, t, note, false), RecvOutcome::WouldBlock);
    }

    #[test]
    fn blocked_waiter_gets_whole_set() {
        let mut k = test_kernel();
        let t = k.user_thread(100, 0);
        let note = k.threads[t].notification.unwrap();

        assert_eq!(recv_signal(&mut k, t, note, true), RecvOutcome::Blocked);
        assert_eq!(k.threads[t].state(), ThreadState::NotifyBlocked);

        assert!(send_signal(&mut k, note, 0b101));
        assert_eq!(k.threads[t].state(), ThreadState::Queued);
        assert_eq!(k.threads[t].mr(1), 0b101);
        // Bit-set cleared by the handoff.
        assert_eq!(k.registry.notification_mut(note).bits, 0);
    }

    #[test]
    fn cancel_removes_waiter() {
        let mut k = test_kernel();
        let t = k.user_thread(100, 0);
        let note = k.threads[t].notification.unwrap();
        let _ = recv_signal(&mut k, t, note, true);
        assert!(cancel_signal(&mut k, t));
        // A later signal accumulates instead of waking anyone.
        assert!(!send_signal(&mut k, note, 1));
    }
}
