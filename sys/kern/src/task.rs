// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks and lifecycle.
//!
//! The fields of [`Tcb`] that carry scheduling state are private to this
//! module so the lifecycle invariants hold: a thread's state only changes
//! through the transition functions at the bottom of this file, which keep
//! the ready structure, release queue, and wait queues consistent.

use abi::{
    Domain, Errno, Priority, ThreadId, ThreadOptions, ThreadState, Word,
    IDLE_THREAD, NUM_BANKED_REGISTERS, NUM_BUFFER_REGISTERS,
    NUM_MESSAGE_REGISTERS,
};

use crate::config::{MAX_THREADS, STACK_SENTINEL};
use crate::err::Fault;
use crate::fail;
use crate::machine::Machine;
use crate::sched;
use crate::state::Kernel;
use crate::time::Ticks;

/// Architecture-independent view of a thread's saved register frame. The
/// port saves the real frame; these are the pieces the core reads and
/// writes: syscall arguments and results, the stack and instruction
/// pointers, the flags word, and the user-defined handle.
#[derive(Copy, Clone, Debug, Default)]
pub struct SavedState {
    pub args: [Word; 8],
    pub sp: Word,
    pub ip: Word,
    pub flags: Word,
    pub user_handle: Word,
}

impl SavedState {
    pub fn arg(&self, n: usize) -> Word {
        self.args[n]
    }

    pub fn set_ret(&mut self, n: usize, v: Word) {
        self.args[n] = v;
    }

    /// The per-thread register window, addressed by control-item id: ids
    /// 0..8 are the argument registers, then sp, ip, flags, and the user
    /// handle.
    pub fn read_window(&self, id: Word) -> Option<Word> {
        match id {
            0..=7 => Some(self.args[id]),
            8 => Some(self.sp),
            9 => Some(self.ip),
            10 => Some(self.flags),
            11 => Some(self.user_handle),
            _ => None,
        }
    }

    /// Writes `value` under `mask` into window entry `id`. Unknown ids are
    /// ignored, matching the original's tolerance of sparse windows.
    pub fn write_window(&mut self, id: Word, mask: Word, value: Word) {
        let Some(old) = self.read_window(id) else {
            return;
        };
        let new = (old & !mask) | (value & mask);
        match id {
            0..=7 => self.args[id] = new,
            8 => self.sp = new,
            9 => self.ip = new,
            10 => self.flags = new,
            11 => self.user_handle = new,
            _ => {}
        }
    }
}

/// The user TCB page: the unbanked message registers and the buffer
/// registers that hold typed-item receive descriptors.
#[derive(Copy, Clone, Debug)]
pub struct UserTcb {
    pub mr: [Word; NUM_MESSAGE_REGISTERS - NUM_BANKED_REGISTERS],
    pub br: [Word; NUM_BUFFER_REGISTERS],
}

impl Default for UserTcb {
    fn default() -> Self {
        Self {
            mr: [0; NUM_MESSAGE_REGISTERS - NUM_BANKED_REGISTERS],
            br: [0; NUM_BUFFER_REGISTERS],
        }
    }
}

/// FIFO of threads waiting on an endpoint or notification, linked through
/// `Tcb::wait_link`. All manipulation happens under the kernel lock.
#[derive(Copy, Clone, Debug, Default)]
pub struct WaitQueue {
    head: Option<usize>,
    tail: Option<usize>,
}

impl WaitQueue {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn push(&mut self, threads: &mut [Tcb], tid: usize) {
        uassert!(threads[tid].wait_link.is_none());
        match self.tail {
            Some(t) => threads[t].wait_link = Some(tid),
            None => self.head = Some(tid),
        }
        self.tail = Some(tid);
    }

    pub fn pop(&mut self, threads: &mut [Tcb]) -> Option<usize> {
        let h = self.head?;
        self.head = threads[h].wait_link.take();
        if self.head.is_none() {
            self.tail = None;
        }
        Some(h)
    }

    /// Unlinks `tid` wherever it sits in the queue. Returns whether it was
    /// a member.
    pub fn remove(&mut self, threads: &mut [Tcb], tid: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            if c == tid {
                let next = threads[c].wait_link.take();
                match prev {
                    Some(p) => threads[p].wait_link = next,
                    None => self.head = next,
                }
                if self.tail == Some(c) {
                    self.tail = prev;
                }
                return true;
            }
            prev = cursor;
            cursor = threads[c].wait_link;
        }
        false
    }

    /// Iterates the members without unlinking; used by the consistency
    /// checks in tests.
    pub fn iter<'a>(
        &'a self,
        threads: &'a [Tcb],
    ) -> impl Iterator<Item = usize> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let c = cursor?;
            cursor = threads[c].wait_link;
            Some(c)
        })
    }
}

/// A thread control block.
#[derive(Clone, Debug)]
pub struct Tcb {
    /// Saved machine state of the user program.
    pub save: SavedState,
    /// Current global id; the version field counts reincarnations of this
    /// table slot.
    pub gid: ThreadId,
    state: ThreadState,
    pub prio: Priority,
    pub domain: Domain,
    pub options: ThreadOptions,
    /// Whether this table slot holds a live thread object.
    pub allocated: bool,
    /// Scheduling context, if any. Donation moves this between threads.
    pub sc: Option<usize>,
    /// If our current SC was donated, the thread it must return to.
    pub donor: Option<usize>,
    /// Memory domain this thread runs in.
    pub mdomain: Option<usize>,
    pub pager: ThreadId,
    /// The thread entitled to change this thread's scheduling parameters.
    pub scheduler: ThreadId,
    /// Error bit-set for the last failing syscall.
    pub errno: Errno,
    banked_mr: [Word; NUM_BANKED_REGISTERS],
    pub utcb: UserTcb,
    /// Registry slot of this thread's endpoint object.
    pub endpoint: Option<usize>,
    /// Registry slot of this thread's notification object.
    pub notification: Option<usize>,
    /// For a blocked thread: the registry slot it is queued against.
    pub waiting_on: Option<usize>,
    /// For a blocked thread: the acceptable partner (or ANY).
    pub partner: ThreadId,
    /// Pending receive phase to enter once a blocked send completes:
    /// (from-specifier, timeout word).
    pub recv_after_send: Option<(ThreadId, u16)>,
    /// Whether the thread asked to donate its SC in the current send.
    pub donating: bool,
    // Intrusive queue links; all protected by the kernel lock.
    pub(crate) ready_link: Option<usize>,
    pub(crate) wait_link: Option<usize>,
    pub(crate) release_link: Option<usize>,
    /// Ready-structure membership, kept in lockstep with the links.
    pub(crate) in_ready: bool,
    /// Release-queue membership.
    pub(crate) in_release: bool,
    /// Wake deadline while on the release queue.
    pub wake_time: Ticks,
    /// Magic word mirrored from the base of the thread's stack.
    pub stack_sentinel: Word,
}

impl Tcb {
    pub fn new(number: usize) -> Self {
        Self {
            save: SavedState::default(),
            gid: ThreadId::new(number as u32, 0),
            state: ThreadState::Dummy,
            prio: Priority(255),
            domain: 0,
            options: ThreadOptions::empty(),
            allocated: false,
            sc: None,
            donor: None,
            mdomain: None,
            pager: ThreadId::NIL,
            scheduler: ThreadId::NIL,
            errno: Errno::empty(),
            banked_mr: [0; NUM_BANKED_REGISTERS],
            utcb: UserTcb::default(),
            endpoint: None,
            notification: None,
            waiting_on: None,
            partner: ThreadId::NIL,
            recv_after_send: None,
            donating: false,
            ready_link: None,
            wait_link: None,
            release_link: None,
            in_ready: false,
            in_release: false,
            wake_time: 0,
            stack_sentinel: STACK_SENTINEL,
        }
    }

    /// Loads message register `n`; the first few live in the banked
    /// callee-saved slots, the rest in the user TCB page.
    pub fn mr(&self, n: usize) -> Word {
        uassert!(n < NUM_MESSAGE_REGISTERS);
        if n < NUM_BANKED_REGISTERS {
            self.banked_mr[n]
        } else {
            self.utcb.mr[n - NUM_BANKED_REGISTERS]
        }
    }

    pub fn set_mr(&mut self, n: usize, v: Word) {
        uassert!(n < NUM_MESSAGE_REGISTERS);
        if n < NUM_BANKED_REGISTERS {
            self.banked_mr[n] = v;
        } else {
            self.utcb.mr[n - NUM_BANKED_REGISTERS] = v;
        }
    }

    pub fn br(&self, n: usize) -> Word {
        self.utcb.br[n]
    }

    pub fn set_br(&mut self, n: usize, v: Word) {
        self.utcb.br[n] = v;
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, s: ThreadState) {
        self.state = s;
    }

    pub fn is_schedulable(&self) -> bool {
        self.allocated && self.state.is_schedulable()
    }

    /// Checks the stack sentinel; called on kernel entries from ISR paths.
    pub fn sentinel_intact(&self) -> bool {
        self.stack_sentinel == STACK_SENTINEL
    }
}

/// Produces the current, correctly versioned id for `threads[index]`.
pub fn current_gid(threads: &[Tcb], index: usize) -> ThreadId {
    ThreadId::new(index as u32, threads[index].gid.version())
}

/// Resolves a user-provided global id against the thread table.
pub fn lookup_gid(threads: &[Tcb], gid: ThreadId) -> Result<usize, Errno> {
    let number = gid.number() as usize;
    if number == 0 || number >= MAX_THREADS {
        return Err(Errno::INVALID_THREAD);
    }
    let t = &threads[number];
    if !t.allocated || t.gid.version() != gid.version() {
        return Err(Errno::INVALID_THREAD);
    }
    Ok(number)
}

/// Moves a freshly created thread from `dummy` to `queued`.
pub fn activate(k: &mut Kernel, tid: usize) -> Result<(), Errno> {
    let t = &mut k.threads[tid];
    if !t.allocated || t.state() != ThreadState::Dummy {
        return Err(Errno::THREAD_INACTIVE);
    }
    t.set_state(ThreadState::Queued);
    let Kernel { sched, threads, .. } = k;
    sched::ready_enqueue(sched, threads, tid);
    sched::possible_switch_to(sched, threads, tid);
    Ok(())
}

/// Suspends a queued thread.
pub fn suspend(k: &mut Kernel, tid: usize) -> Result<(), Errno> {
    let state = k.threads[tid].state();
    match state {
        ThreadState::Queued | ThreadState::Ready | ThreadState::Running => {
            let Kernel { sched, threads, .. } = k;
            sched::ready_remove(sched, threads, tid);
            threads[tid].set_state(ThreadState::Suspended);
            if sched.current == tid {
                sched.action = sched.action.combine(sched::Action::ChooseNew);
            }
            Ok(())
        }
        ThreadState::Suspended => Ok(()),
        _ => Err(Errno::THREAD_INACTIVE),
    }
}

/// Returns a suspended thread to the ready structure.
pub fn resume(k: &mut Kernel, tid: usize) -> Result<(), Errno> {
    if k.threads[tid].state() != ThreadState::Suspended {
        return Err(Errno::THREAD_INACTIVE);
    }
    k.threads[tid].set_state(ThreadState::Queued);
    let Kernel { sched, threads, .. } = k;
    sched::ready_enqueue(sched, threads, tid);
    sched::possible_switch_to(sched, threads, tid);
    Ok(())
}

/// Restarts a thread at a fresh SP/IP: `queued -> restart -> queued`.
pub fn restart(
    k: &mut Kernel,
    tid: usize,
    sp: Word,
    ip: Word,
) -> Result<(), Errno> {
    if !k.threads[tid].state().is_schedulable() {
        return Err(Errno::THREAD_INACTIVE);
    }
    let t = &mut k.threads[tid];
    t.set_state(ThreadState::Restart);
    t.save.sp = sp;
    t.save.ip = ip;
    t.errno = Errno::empty();
    t.set_state(ThreadState::Queued);
    Ok(())
}

/// Tears a thread down: `any -> aborting -> dead`.
///
/// Dequeues the thread from the ready structure, the release queue, and any
/// endpoint or notification wait list; detaches its memory domain; returns
/// a donated SC to its owner and releases its own. If the victim is the
/// current thread and we are not nested inside an exception, the port is
/// asked to pend a switch rather than switching mid-exception.
pub fn abort(k: &mut Kernel, m: &mut impl Machine, tid: usize) {
    if k.threads[tid].options.contains(ThreadOptions::ESSENTIAL) {
        fail::die(
            abi::HaltReason::Oops,
            &format_args!("abort of essential thread {tid}"),
        );
    }
    k.threads[tid].set_state(ThreadState::Aborting);

    // Drop out of every queue we might be a member of.
    {
        let Kernel { sched, threads, .. } = k;
        sched::ready_remove(sched, threads, tid);
        sched::release_remove(sched, threads, tid);
    }
    if k.threads[tid].waiting_on.is_some() {
        crate::ipc::unqueue_blocked(k, tid);
    }

    // A borrowed SC goes home; our own SC is simply dropped. The SC object
    // itself lives on in the registry.
    if let Some(donor) = k.threads[tid].donor.take() {
        let sc = k.threads[tid].sc.take();
        k.threads[donor].sc = sc;
    }
    k.threads[tid].sc = None;

    if let Some(md) = k.threads[tid].mdomain.take() {
        k.mdomains[md].threads &= !(1 << tid);
    }

    // No object stays granted to a dead thread.
    k.registry.revoke_all_for_thread(tid);

    let t = &mut k.threads[tid];
    t.set_state(ThreadState::Dead);
    t.allocated = false;
    t.gid = ThreadId::new(t.gid.number(), t.gid.version().wrapping_add(1));
    t.errno = Errno::empty();
    t.waiting_on = None;
    t.partner = ThreadId::NIL;
    t.recv_after_send = None;

    if k.sched.current == tid {
        k.sched.action = k.sched.action.combine(sched::Action::ChooseNew);
        m.pend_switch();
    }
}

/// The k-oops path: kills the offending thread, or halts the kernel if the
/// offender is essential or the idle thread.
pub fn k_oops(k: &mut Kernel, m: &mut impl Machine, tid: usize, fault: Fault) {
    klog!(m, "k_oops: thread {} {:?}", tid, fault);
    if tid == IDLE_THREAD as usize {
        fail::die(abi::HaltReason::Oops, &format_args!("{fault:?}"));
    }
    abort(k, m, tid);
}
