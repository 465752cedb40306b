// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous IPC: the endpoint rendezvous engine.
//!
//! An IPC has an optional send phase and an optional receive phase, both
//! governed by one timeout word. Messages are a tag, untyped words copied
//! register to register, and typed items (map, grant, string, control)
//! processed during the rendezvous. A sender whose partner is not ready
//! parks on the partner's endpoint; a receiver parks on its own.
//!
//! Error discharge follows the partner-before-failure rule: before a
//! partner is involved, errors go to the invoker alone; once the transfer
//! has paired the two, both sides hear about it, each with its own phase
//! bit. The exception is `ipc-timeout`, which is only ever reported to the
//! thread whose timeout expired.

use abi::{
    Errno, IpcTimeout, MessageTag, ThreadId, ThreadState, TimeoutDeadline,
    TypedItem, Word, IPC_FLAG_SUCCESS, IRQ_ACK_THREAD, IRQ_REQUEST_THREAD,
    NUM_BUFFER_REGISTERS, NUM_MESSAGE_REGISTERS,
};

use crate::config::{MAX_MEM_DOMAINS, MAX_THREADS};
use crate::err::UserError;
use crate::machine::Machine;
use crate::mem::{self, MemDomain};
use crate::obj::Payload;
use crate::sched;
use crate::state::Kernel;
use crate::task::{self, Tcb, WaitQueue};
use crate::umem::{self, USlice};
use crate::util::index2_distinct;

/// What kind of threads an endpoint queue currently holds. Senders and
/// receivers are never queued together; with thread-bound endpoints the
/// receiver side blocks out-of-queue, so in practice the queue holds
/// senders.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum QueueKind {
    #[default]
    Empty,
    Senders,
    Receivers,
}

/// Endpoint object payload.
#[derive(Copy, Clone, Debug, Default)]
pub struct Endpoint {
    pub queue: WaitQueue,
    pub kind: QueueKind,
}

/// How a transfer failed after the partners were paired.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum XferError {
    /// Receive string too short, buffer items exhausted, or no page-table
    /// space for a map/grant.
    Overflow,
    /// Page fault in the sender's address space.
    SrcFault,
    /// Page fault in the receiver's address space.
    DstFault,
}

impl XferError {
    /// Errno bits as seen by the sending side.
    fn sender_bits(self) -> Errno {
        Errno::SEND_PHASE
            | match self {
                Self::Overflow => Errno::IPC_MSG_OVERFLOW,
                Self::SrcFault => Errno::XFER_TIMEOUT_INVOKER,
                Self::DstFault => Errno::XFER_TIMEOUT_PARTNER,
            }
    }

    /// Errno bits as seen by the receiving side.
    fn receiver_bits(self) -> Errno {
        Errno::RECV_PHASE
            | match self {
                Self::Overflow => Errno::IPC_MSG_OVERFLOW,
                Self::SrcFault => Errno::XFER_TIMEOUT_PARTNER,
                Self::DstFault => Errno::XFER_TIMEOUT_INVOKER,
            }
    }
}

/// Outcome of a send phase.
enum SendOutcome {
    /// Message handed over (or absorbed by a kernel thread); the caller may
    /// continue into its receive phase.
    Done,
    /// The caller is now send-blocked.
    Blocked,
}

/// The exchange-ipc operation: optional send phase to `dest`, then optional
/// receive phase from `from_spec`. `donate` lends the caller's scheduling
/// context to the receiver of the send phase.
pub fn exchange_ipc(
    k: &mut Kernel,
    m: &mut impl Machine,
    dest: ThreadId,
    from_spec: ThreadId,
    timeout: IpcTimeout,
    donate: bool,
) -> Result<(), UserError> {
    let caller = k.sched.current;

    if !dest.is_nil() {
        match send_phase(k, m, caller, dest, timeout, donate)? {
            SendOutcome::Blocked => {
                if !from_spec.is_nil() {
                    k.threads[caller].recv_after_send =
                        Some((from_spec, timeout.0));
                }
                return Ok(());
            }
            SendOutcome::Done => {}
        }
    }

    if !from_spec.is_nil() {
        recv_phase(k, caller, from_spec, timeout)?;
    }
    Ok(())
}

fn send_phase(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
    dest: ThreadId,
    timeout: IpcTimeout,
    donate: bool,
) -> Result<SendOutcome, UserError> {
    if dest.is_any() {
        // Anythread as a destination is illegal.
        return Err(UserError::Recoverable(
            Errno::IPC_NOT_EXIST | Errno::SEND_PHASE,
        ));
    }

    // Messages to the reserved interrupt threads are consumed by the
    // interrupt layer rather than a real partner.
    match dest.number() {
        IRQ_REQUEST_THREAD => {
            crate::irq::interrupt_request(k, m, caller)?;
            return Ok(SendOutcome::Done);
        }
        IRQ_ACK_THREAD => {
            crate::irq::interrupt_respond(k, m, caller);
            return Ok(SendOutcome::Done);
        }
        _ => {}
    }

    let dst = task::lookup_gid(&k.threads, dest).map_err(|_| {
        UserError::Recoverable(Errno::IPC_NOT_EXIST | Errno::SEND_PHASE)
    })?;
    let ep_slot = k.threads[dst].endpoint.ok_or(UserError::Recoverable(
        Errno::IPC_NOT_EXIST | Errno::SEND_PHASE,
    ))?;

    let caller_gid = task::current_gid(&k.threads, caller);
    let receiver_ready = k.threads[dst].state() == ThreadState::RecvBlocked
        && k.threads[dst].waiting_on == Some(ep_slot)
        && (k.threads[dst].partner.is_any()
            || k.threads[dst].partner == caller_gid);

    if receiver_ready {
        k.threads[caller].donating = donate;
        complete_rendezvous(k, caller, dst)?;
        return Ok(SendOutcome::Done);
    }

    // Partner not ready: block or bail, per the timeout.
    match timeout.deadline(k.time.now) {
        TimeoutDeadline::Immediate => Err(UserError::Recoverable(
            Errno::IPC_TIMEOUT | Errno::SEND_PHASE,
        )),
        deadline => {
            let Kernel { registry, threads, sched, .. } = k;
            let ep = registry.endpoint_mut(ep_slot);
            uassert!(ep.kind != QueueKind::Receivers);
            ep.queue.push(threads, caller);
            ep.kind = QueueKind::Senders;
            let t = &mut threads[caller];
            t.set_state(ThreadState::SendBlocked);
            t.waiting_on = Some(ep_slot);
            t.partner = dest;
            t.donating = donate;
            sched::ready_remove(sched, threads, caller);
            if let TimeoutDeadline::At(when) = deadline {
                sched::release_enqueue(sched, threads, caller, when);
                k.time.reprogram = true;
            }
            k.sched.action =
                k.sched.action.combine(sched::Action::ChooseNew);
            Ok(SendOutcome::Blocked)
        }
    }
}

fn recv_phase(
    k: &mut Kernel,
    caller: usize,
    from_spec: ThreadId,
    timeout: IpcTimeout,
) -> Result<(), UserError> {
    // Pending notification bits win over queued senders, like a message
    // from the kernel.
    if let Some(ns) = k.threads[caller].notification {
        let bits = {
            let Payload::Notification(n) = k.registry.slot(ns).payload
            else {
                unreachable!()
            };
            n.bits
        };
        if bits != 0 {
            let outcome =
                crate::notify::recv_signal(k, caller, ns, false);
            uassert!(matches!(
                outcome,
                crate::notify::RecvOutcome::Consumed(_)
            ));
            return Ok(());
        }
    }

    let ep_slot = k.threads[caller].endpoint.ok_or(UserError::Recoverable(
        Errno::IPC_NOT_EXIST | Errno::RECV_PHASE,
    ))?;

    let sender = if from_spec.is_any() {
        // Open receive: first queued sender, strict FIFO.
        let Kernel { registry, .. } = k;
        registry.endpoint_mut(ep_slot).queue.head()
    } else {
        // Closed receive.
        let s = task::lookup_gid(&k.threads, from_spec).map_err(|_| {
            UserError::Recoverable(Errno::IPC_NOT_EXIST | Errno::RECV_PHASE)
        })?;
        let is_sending = k.threads[s].state() == ThreadState::SendBlocked
            && k.threads[s].waiting_on == Some(ep_slot);
        if is_sending {
            Some(s)
        } else {
            None
        }
    };

    if let Some(s) = sender {
        complete_rendezvous(k, s, caller)?;
        return Ok(());
    }

    match timeout.deadline(k.time.now) {
        TimeoutDeadline::Immediate => Err(UserError::Recoverable(
            Errno::IPC_TIMEOUT | Errno::RECV_PHASE,
        )),
        deadline => {
            let t = &mut k.threads[caller];
            t.set_state(ThreadState::RecvBlocked);
            t.waiting_on = Some(ep_slot);
            t.partner = from_spec;
            let Kernel { sched, threads, .. } = k;
            sched::ready_remove(sched, threads, caller);
            if let TimeoutDeadline::At(when) = deadline {
                sched::release_enqueue(sched, threads, caller, when);
                k.time.reprogram = true;
            }
            k.sched.action =
                k.sched.action.combine(sched::Action::ChooseNew);
            Ok(())
        }
    }
}

/// Pairs `sender` and `receiver` and performs the transfer, handling
/// unblocking, SC donation and return, and paired-error discharge. On
/// return, errors have already been applied to the *partner*; the `Err`
/// carries only the invoker-side bits.
fn complete_rendezvous(
    k: &mut Kernel,
    sender: usize,
    receiver: usize,
) -> Result<(), UserError> {
    // Pull both parties out of whatever queues hold them; they are paired
    // from here on.
    unqueue_blocked(k, sender);
    unqueue_blocked(k, receiver);
    {
        let Kernel { sched, threads, .. } = k;
        sched::release_remove(sched, threads, sender);
        sched::release_remove(sched, threads, receiver);
    }

    let sender_gid = task::current_gid(&k.threads, sender);
    let result = {
        let Kernel { threads, mdomains, .. } = k;
        transfer(threads, mdomains, sender, receiver, sender_gid)
    };

    match result {
        Ok(()) => {
            // Scheduling-context donation and its return leg.
            if k.threads[sender].donor == Some(receiver) {
                let sc = k.threads[sender].sc.take();
                k.threads[receiver].sc = sc;
                k.threads[sender].donor = None;
            } else if k.threads[sender].donating
                && k.threads[receiver].sc.is_none()
            {
                let sc = k.threads[sender].sc.take();
                if sc.is_some() {
                    k.threads[receiver].sc = sc;
                    k.threads[receiver].donor = Some(sender);
                }
            }
            k.threads[sender].donating = false;

            wake_ok(k, receiver);
            // A parked sender resumes, possibly straight into its pending
            // receive phase.
            if k.sched.current != sender {
                finish_sender(k, sender)?;
            }
            Ok(())
        }
        Err(e) => {
            // Both partners are involved; each hears its own side.
            if k.sched.current == sender {
                wake_err(k, receiver, e.receiver_bits());
                Err(UserError::Recoverable(e.sender_bits()))
            } else {
                wake_err(k, sender, e.sender_bits());
                wake_err(k, receiver, e.receiver_bits());
                // The invoker was the receiver; complete_rendezvous was
                // entered from its receive phase.
                if k.sched.current == receiver {
                    Err(UserError::Recoverable(e.receiver_bits()))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Makes a thread runnable again after a successful rendezvous.
fn wake_ok(k: &mut Kernel, tid: usize) {
    if k.sched.current == tid {
        return;
    }
    let Kernel { sched, threads, .. } = k;
    threads[tid].save.set_ret(0, 0);
    threads[tid].set_state(ThreadState::Queued);
    sched::ready_enqueue(sched, threads, tid);
    sched::possible_switch_to(sched, threads, tid);
}

/// Makes a thread runnable with an IPC error.
fn wake_err(k: &mut Kernel, tid: usize, bits: Errno) {
    k.threads[tid].errno |= bits;
    k.threads[tid].recv_after_send = None;
    if k.sched.current == tid {
        return;
    }
    let Kernel { sched, threads, .. } = k;
    threads[tid].save.set_ret(0, abi::Exception::SyscallError as Word);
    threads[tid].set_state(ThreadState::Queued);
    sched::ready_enqueue(sched, threads, tid);
    sched::possible_switch_to(sched, threads, tid);
}

/// Completes a parked sender after its message was consumed: either it
/// proceeds into its stored receive phase or it becomes runnable.
fn finish_sender(k: &mut Kernel, sender: usize) -> Result<(), UserError> {
    if let Some((spec, tw)) = k.threads[sender].recv_after_send.take() {
        // Enter the receive phase on the sender's behalf. Failures land in
        // the sender's errno, not the current thread's.
        let saved_current = k.sched.current;
        k.sched.current = sender;
        k.threads[sender].set_state(ThreadState::Running);
        let r = recv_phase(k, sender, spec, IpcTimeout(tw));
        k.sched.current = saved_current;
        match r {
            Ok(()) => {
                if k.threads[sender].state() == ThreadState::Running {
                    wake_ok_now(k, sender);
                }
            }
            Err(UserError::Recoverable(bits)) => {
                k.threads[sender].set_state(ThreadState::Queued);
                wake_err(k, sender, bits);
            }
            Err(other) => return Err(other),
        }
        Ok(())
    } else {
        wake_ok(k, sender);
        Ok(())
    }
}

/// Like [`wake_ok`] but for a thread that was temporarily treated as
/// current.
fn wake_ok_now(k: &mut Kernel, tid: usize) {
    let Kernel { sched, threads, .. } = k;
    threads[tid].save.set_ret(0, 0);
    threads[tid].set_state(ThreadState::Queued);
    sched::ready_enqueue(sched, threads, tid);
    sched::possible_switch_to(sched, threads, tid);
}

/// Transfers the message from `sender` to `receiver`: tag, untyped words,
/// then each typed item.
fn transfer(
    threads: &mut [Tcb; MAX_THREADS],
    mdomains: &mut [MemDomain; MAX_MEM_DOMAINS],
    sender: usize,
    receiver: usize,
    sender_gid: ThreadId,
) -> Result<(), XferError> {
    let (s, r) = index2_distinct(&mut threads[..], sender, receiver);

    let tag = MessageTag(s.mr(0));
    let u = tag.untyped();
    let t = tag.typed();
    if 1 + u + t > NUM_MESSAGE_REGISTERS {
        return Err(XferError::Overflow);
    }

    for i in 1..=u {
        r.set_mr(i, s.mr(i));
    }

    let mut idx = 1 + u;
    let mut string_no = 0;
    while idx + 1 <= u + t {
        let w0 = s.mr(idx);
        let w1 = s.mr(idx + 1);
        let item =
            TypedItem::decode(w0, w1).map_err(|_| XferError::Overflow)?;
        match item {
            TypedItem::Map { fpage_word, rights, dest_page }
            | TypedItem::Grant { fpage_word, rights, dest_page } => {
                let grant =
                    matches!(item, TypedItem::Grant { .. });
                let (Some(sd), Some(dd)) = (s.mdomain, r.mdomain) else {
                    return Err(XferError::Overflow);
                };
                let fpage = abi::Fpage::from_word(fpage_word, rights);
                mem::map_page(
                    &mut mdomains[..],
                    sd,
                    dd,
                    fpage,
                    dest_page,
                    grant,
                )
                .map_err(|_| XferError::Overflow)?;
                r.set_mr(idx, w0);
                r.set_mr(idx + 1, w1);
            }
            TypedItem::String { length, ptr } => {
                // Pair the j-th sent string with the j-th buffer item.
                if (string_no + 1) * 2 > NUM_BUFFER_REGISTERS {
                    return Err(XferError::Overflow);
                }
                let b0 = r.br(string_no * 2);
                let b1 = r.br(string_no * 2 + 1);
                let Ok(TypedItem::String { length: cap, ptr: rptr }) =
                    TypedItem::decode(b0, b1)
                else {
                    return Err(XferError::Overflow);
                };
                if cap == 0 || ptr == 0 || rptr == 0 {
                    return Err(XferError::Overflow);
                }
                if cap < length {
                    // Receiving buffer string too short.
                    return Err(XferError::Overflow);
                }
                let src = USlice::<u8>::from_raw(ptr, length)
                    .map_err(|_| XferError::SrcFault)?;
                let dst = USlice::<u8>::from_raw(rptr, length)
                    .map_err(|_| XferError::DstFault)?;
                umem::copy_between(&mut mdomains[..], s, src, r, dst)
                    .map_err(|f| {
                        if f.src {
                            XferError::SrcFault
                        } else {
                            XferError::DstFault
                        }
                    })?;
                let [o0, o1] =
                    TypedItem::String { length, ptr: rptr }.encode();
                r.set_mr(idx, o0);
                r.set_mr(idx + 1, o1);
                string_no += 1;
            }
            TypedItem::Control { id, mask, value } => {
                r.save.write_window(id, mask, value);
                r.set_mr(idx, w0);
                r.set_mr(idx + 1, w1);
            }
        }
        idx += 2;
    }

    r.set_mr(0, tag.with_flags(IPC_FLAG_SUCCESS).0);
    r.save.set_ret(0, 0);
    r.save.set_ret(1, sender_gid.0 as Word);
    Ok(())
}

/// Removes a blocked thread from the endpoint or notification queue it
/// waits on. Harmless on threads that are not queued anywhere.
pub fn unqueue_blocked(k: &mut Kernel, tid: usize) {
    let Some(slot) = k.threads[tid].waiting_on.take() else {
        return;
    };
    let Kernel { registry, threads, .. } = k;
    match &mut registry.slot_mut(slot).payload {
        Payload::Endpoint(ep) => {
            ep.queue.remove(threads, tid);
            if ep.queue.is_empty() {
                ep.kind = QueueKind::Empty;
            }
        }
        Payload::Notification(n) => {
            n.queue.remove(threads, tid);
        }
        _ => {}
    }
}

/// Cancels whatever IPC `tid` is blocked in, reporting `bits` (plus the
/// phase bit) to it alone, and makes it runnable.
pub fn cancel_ipc_with(k: &mut Kernel, tid: usize, bits: Errno) {
    let state = k.threads[tid].state();
    if !state.is_blocked() {
        return;
    }
    let phase = match state {
        ThreadState::SendBlocked => Errno::SEND_PHASE,
        _ => Errno::RECV_PHASE,
    };
    unqueue_blocked(k, tid);
    {
        let Kernel { sched, threads, .. } = k;
        sched::release_remove(sched, threads, tid);
    }
    wake_err(k, tid, bits | phase);
}

/// `cancel-ipc`: used by exchange-registers and the interrupt layer.
pub fn cancel_ipc(k: &mut Kernel, tid: usize) {
    cancel_ipc_with(k, tid, Errno::IPC_CANCELLED);
}

/// Timeout expiry from the timelist. Per the L4 reference reading, the
/// timeout is signalled only to the thread that was waiting, even when a
/// partner exists somewhere.
pub fn timeout_unblock(k: &mut Kernel, tid: usize) {
    cancel_ipc_with(k, tid, Errno::IPC_TIMEOUT);
}

/// Wakes every waiter of a dying endpoint with `ipc-not-exist`.
pub fn cancel_endpoint_waiters(k: &mut Kernel, slot: usize) {
    loop {
        let waiter = {
            let Kernel { registry, threads, .. } = k;
            let Payload::Endpoint(ep) =
                &mut registry.slot_mut(slot).payload
            else {
                return;
            };
            ep.queue.pop(threads)
        };
        let Some(w) = waiter else {
            break;
        };
        k.threads[w].waiting_on = None;
        {
            let Kernel { sched, threads, .. } = k;
            sched::release_remove(sched, threads, w);
        }
        wake_err(k, w, Errno::IPC_NOT_EXIST);
    }
    let Kernel { registry, .. } = k;
    if let Payload::Endpoint(ep) = &mut registry.slot_mut(slot).payload {
        ep.kind = QueueKind::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::FakeMachine;
    use crate::mem::{MapStatus, Mapping};
    use crate::startup::test_kernel;
    use abi::{Priority, Rights};

    fn send_tag(k: &mut Kernel, tid: usize, untyped: &[Word]) {
        k.threads[tid]
            .set_mr(0, MessageTag::new(untyped.len(), 0, 0, 0x11).0);
        for (i, w) in untyped.iter().enumerate() {
            k.threads[tid].set_mr(1 + i, *w);
        }
    }

    fn run_as(k: &mut Kernel, tid: usize) {
        k.sched.current = tid;
        k.threads[tid].set_state(ThreadState::Running);
    }

    #[test]
    fn basic_rendezvous() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(100, 0);
        let b = k.user_thread(99, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();

        // B blocks in open receive.
        run_as(&mut k, b);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, b);
        }
        exchange_ipc(
            &mut k,
            &mut m,
            ThreadId::NIL,
            ThreadId::ANY,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        assert_eq!(k.threads[b].state(), ThreadState::RecvBlocked);

        // A sends MR1 = 0xDEAD.
        run_as(&mut k, a);
        k.sched.action = sched::Action::ResumeCurrent;
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, a);
        }
        send_tag(&mut k, a, &[0xDEAD]);
        let bgid = crate::task::current_gid(&k.threads, b);
        exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();

        // B got the payload and is runnable; B (more important) runs next.
        assert_eq!(k.threads[b].mr(1), 0xDEAD);
        assert_eq!(k.threads[b].state(), ThreadState::Queued);
        sched::schedule(&mut k, &mut m);
        assert_eq!(k.sched.current, b);
        assert_eq!(k.threads[a].state(), ThreadState::Queued);
    }

    #[test]
    fn donation_moves_sc_and_returns() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(200, 0);
        let b = k.user_thread(50, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();
        // Give A a scheduling context; B has none.
        k.scheds[0].in_use = true;
        k.scheds[0].refill_new(2, 10, 100, 0);
        k.threads[a].sc = Some(0);

        // B waits, A calls with donation (send + recv phases).
        run_as(&mut k, b);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, b);
        }
        exchange_ipc(
            &mut k,
            &mut m,
            ThreadId::NIL,
            ThreadId::ANY,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();

        run_as(&mut k, a);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, a);
        }
        send_tag(&mut k, a, &[1]);
        let bgid = crate::task::current_gid(&k.threads, b);
        let agid = crate::task::current_gid(&k.threads, a);
        exchange_ipc(&mut k, &mut m, bgid, bgid, IpcTimeout::NEVER, true)
            .unwrap();

        // B now runs on A's SC; A is recv-blocked waiting for the reply.
        assert_eq!(k.threads[b].sc, Some(0));
        assert_eq!(k.threads[b].donor, Some(a));
        assert_eq!(k.threads[a].sc, None);
        assert_eq!(k.threads[a].state(), ThreadState::RecvBlocked);

        // B replies: the SC comes home.
        sched::schedule(&mut k, &mut m);
        assert_eq!(k.sched.current, b);
        send_tag(&mut k, b, &[2]);
        exchange_ipc(
            &mut k,
            &mut m,
            agid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        assert_eq!(k.threads[a].sc, Some(0));
        assert_eq!(k.threads[b].sc, None);
        assert_eq!(k.threads[b].donor, None);
    }

    #[test]
    fn zero_timeout_never_blocks() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();
        run_as(&mut k, a);
        send_tag(&mut k, a, &[]);
        let bgid = crate::task::current_gid(&k.threads, b);
        let e = exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::ZERO,
            false,
        )
        .unwrap_err();
        assert_eq!(
            e,
            UserError::Recoverable(Errno::IPC_TIMEOUT | Errno::SEND_PHASE)
        );
        assert_eq!(k.threads[a].state(), ThreadState::Running);
    }

    #[test]
    fn finite_timeout_expires_to_invoker_only() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();
        run_as(&mut k, a);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, a);
        }
        send_tag(&mut k, a, &[]);
        let bgid = crate::task::current_gid(&k.threads, b);
        // m=8, e=0: 8 ticks.
        exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout(8),
            false,
        )
        .unwrap();
        assert_eq!(k.threads[a].state(), ThreadState::SendBlocked);

        // Let the deadline pass.
        k.sched.current = b;
        k.threads[b].set_state(ThreadState::Running);
        m.advance(10);
        crate::time::update_timestamp(&mut k, &mut m, false);
        crate::time::update_timelist(&mut k);

        assert_eq!(k.threads[a].state(), ThreadState::Queued);
        assert!(k.threads[a].errno.contains(Errno::IPC_TIMEOUT));
        assert!(k.threads[a].errno.contains(Errno::SEND_PHASE));
        // The would-be partner hears nothing.
        assert!(k.threads[b].errno.is_empty());
    }

    #[test]
    fn string_item_copies_between_spaces() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();

        let src_buf = vec![0x55u8; 128];
        let mut dst_buf = vec![0u8; 128];
        let mk_domain = |buf: &[u8]| {
            let mut d = MemDomain::new();
            let log2 =
                buf.len().next_power_of_two().trailing_zeros() as u8;
            d.in_use = true;
            d.install_mapping(Mapping {
                fpage: abi::Fpage::new(
                    buf.as_ptr() as usize,
                    log2,
                    Rights::READ | Rights::WRITE,
                ),
                status: MapStatus::empty(),
                src_domain: None,
                granted: false,
            })
            .unwrap();
            d
        };
        k.mdomains[0] = mk_domain(&src_buf);
        k.mdomains[1] = mk_domain(&dst_buf);
        k.threads[a].mdomain = Some(0);
        k.threads[b].mdomain = Some(1);

        // B: open receive with one buffer string item.
        let [b0, b1] = TypedItem::String {
            length: 128,
            ptr: dst_buf.as_mut_ptr() as Word,
        }
        .encode();
        k.threads[b].set_br(0, b0);
        k.threads[b].set_br(1, b1);
        run_as(&mut k, b);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, b);
        }
        exchange_ipc(
            &mut k,
            &mut m,
            ThreadId::NIL,
            ThreadId::ANY,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();

        // A: one string item of 64 bytes.
        run_as(&mut k, a);
        let [w0, w1] = TypedItem::String {
            length: 64,
            ptr: src_buf.as_ptr() as Word,
        }
        .encode();
        k.threads[a].set_mr(0, MessageTag::new(0, 2, 0, 0).0);
        k.threads[a].set_mr(1, w0);
        k.threads[a].set_mr(2, w1);
        let bgid = crate::task::current_gid(&k.threads, b);
        exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();

        assert_eq!(&dst_buf[..64], &[0x55u8; 64][..]);
        assert_eq!(&dst_buf[64..], &[0u8; 64][..]);
        // Receiver sees the item rewritten to its own buffer address.
        let got = TypedItem::decode(k.threads[b].mr(1), k.threads[b].mr(2))
            .unwrap();
        assert_eq!(
            got,
            TypedItem::String { length: 64, ptr: dst_buf.as_ptr() as Word }
        );
    }

    #[test]
    fn string_overflow_reports_both_sides() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();

        // B waits with NO buffer items.
        run_as(&mut k, b);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, b);
        }
        exchange_ipc(
            &mut k,
            &mut m,
            ThreadId::NIL,
            ThreadId::ANY,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();

        run_as(&mut k, a);
        let [w0, w1] =
            TypedItem::String { length: 16, ptr: 0x4000 }.encode();
        k.threads[a].set_mr(0, MessageTag::new(0, 2, 0, 0).0);
        k.threads[a].set_mr(1, w0);
        k.threads[a].set_mr(2, w1);
        let bgid = crate::task::current_gid(&k.threads, b);
        let e = exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap_err();
        // Sender: overflow in the send phase.
        assert_eq!(
            e,
            UserError::Recoverable(
                Errno::IPC_MSG_OVERFLOW | Errno::SEND_PHASE
            )
        );
        // Receiver was paired, so it hears the receive-phase side.
        assert!(k.threads[b].errno.contains(Errno::IPC_MSG_OVERFLOW));
        assert!(k.threads[b].errno.contains(Errno::RECV_PHASE));
    }

    #[test]
    fn cancel_ipc_unblocks_with_cancelled() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();
        run_as(&mut k, a);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, a);
        }
        send_tag(&mut k, a, &[]);
        let bgid = crate::task::current_gid(&k.threads, b);
        exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        assert_eq!(k.threads[a].state(), ThreadState::SendBlocked);

        k.sched.current = b;
        k.threads[b].set_state(ThreadState::Running);
        cancel_ipc(&mut k, a);
        assert_eq!(k.threads[a].state(), ThreadState::Queued);
        assert!(k.threads[a].errno.contains(Errno::IPC_CANCELLED));
        // The endpoint queue no longer holds it.
        let ep = k.threads[b].endpoint.unwrap();
        assert!(k.registry.endpoint_mut(ep).queue.is_empty());
    }

    #[test]
    fn wait_list_members_are_blocked_one_way_only() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        let c = k.user_thread(12, 0);
        for t in [a, b, c] {
            crate::task::activate(&mut k, t).unwrap();
        }
        let cgid = crate::task::current_gid(&k.threads, c);
        for t in [a, b] {
            run_as(&mut k, t);
            {
                let Kernel { sched, threads, .. } = &mut k;
                sched::ready_remove(sched, threads, t);
            }
            send_tag(&mut k, t, &[]);
            exchange_ipc(
                &mut k,
                &mut m,
                cgid,
                ThreadId::NIL,
                IpcTimeout::NEVER,
                false,
            )
            .unwrap();
        }
        let ep = k.threads[c].endpoint.unwrap();
        let members: Vec<usize> = {
            let Kernel { registry, threads, .. } = &mut k;
            registry.endpoint_mut(ep).queue.iter(threads).collect()
        };
        assert_eq!(members, vec![a, b]);
        for t in members {
            assert_eq!(k.threads[t].state(), ThreadState::SendBlocked);
        }
    }

    #[test]
    fn priority_inversion_scenario_reschedules_receiver() {
        // The rendezvous end-to-end through schedule(): the more important
        // receiver runs next, the sender requeues.
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(100, 0);
        let b = k.user_thread(99, 0);
        crate::task::activate(&mut k, a).unwrap();
        crate::task::activate(&mut k, b).unwrap();
        run_as(&mut k, b);
        {
            let Kernel { sched, threads, .. } = &mut k;
            sched::ready_remove(sched, threads, b);
        }
        exchange_ipc(
            &mut k,
            &mut m,
            ThreadId::NIL,
            ThreadId::ANY,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        sched::schedule(&mut k, &mut m);
        // Only A is runnable now.
        assert_eq!(k.sched.current, a);
        send_tag(&mut k, a, &[0xDEAD]);
        let bgid = crate::task::current_gid(&k.threads, b);
        exchange_ipc(
            &mut k,
            &mut m,
            bgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        sched::schedule(&mut k, &mut m);
        assert_eq!(k.sched.current, b);
        assert_eq!(k.threads[b].prio, Priority(99));
        assert_eq!(k.threads[a].state(), ThreadState::Queued);
    }
}
