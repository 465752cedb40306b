// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-object registry and derivation tree.
//!
//! Every kernel object lives inside a derivation object: a slot in a fixed
//! arena carrying the typed record itself, the storage span it was carved
//! from, parent/child/sibling links, and the per-type payload. Retyping an
//! untyped object creates children of it; revocation walks the subtree in
//! post-order; only a *final* object (no children) may be deleted.
//!
//! Lookup by storage address goes through a sorted index of live slots,
//! binary searched, standing in for the original's red-black tree with the
//! same O(log N) contract. With nested derivations several objects can
//! contain an address; the most-derived one wins.

use abi::{Errno, Fpage, ObjectFlags, ObjectTag, Rights, ThreadState, Word};

use crate::config::{
    MAX_DOBJECTS, MAX_MEM_DOMAINS, MAX_SCHED_CONTEXTS, MAX_THREADS,
    RETYPE_RESET_CHUNK,
};
use crate::err::UserError;
use crate::ipc::{self, Endpoint};
use crate::machine::Machine;
use crate::notify::Notification;
use crate::sched;
use crate::state::Kernel;

/// The typed kernel-object record.
#[derive(Copy, Clone, Debug)]
pub struct KObject {
    /// Identity: the object's own storage address. Validation rejects any
    /// record whose name is not self-referential.
    pub name: Word,
    pub tag: ObjectTag,
    pub flags: ObjectFlags,
    /// Access-right mask.
    pub rights: Rights,
    /// Owning-thread discriminator: bit *i* set means thread *i* holds the
    /// grant.
    pub data: Word,
}

impl KObject {
    pub const NULL: Self = Self {
        name: 0,
        tag: ObjectTag::Null,
        flags: ObjectFlags::INIT,
        rights: Rights::empty(),
        data: 0,
    };
}

/// Per-type payload stored inline in the derivation object.
#[derive(Copy, Clone, Debug)]
pub enum Payload {
    None,
    Untyped(UntypedState),
    /// Index into the thread table.
    Thread(usize),
    /// Index into the scheduling-context table.
    SchedContext(usize),
    Endpoint(Endpoint),
    Notification(Notification),
    InterruptControl,
    /// Bound IRQ line.
    InterruptHandler(u32),
    CNode,
    /// Index into the memory-domain table.
    DomainRef(usize),
    MemoryRegion(Fpage),
    Reply,
}

/// Allocation state of an untyped object.
#[derive(Copy, Clone, Debug, Default)]
pub struct UntypedState {
    /// Offset of the first unallocated byte of the storage span.
    pub watermark: Word,
    /// Progress of an interrupted reset pass, so a preempted retype resumes
    /// zeroing where it left off instead of starting over.
    pub reset_progress: Word,
    /// Children still owed by an interrupted retype call.
    pub retype_remaining: u32,
}

/// A derivation object: a kernel object plus its place in the tree.
#[derive(Copy, Clone, Debug)]
pub struct DObject {
    pub ko: KObject,
    /// Base address of the inline self-storage area.
    pub base: Word,
    /// Size of the self-storage area.
    pub size: Word,
    pub payload: Payload,
    parent: Option<u16>,
    first_child: Option<u16>,
    next_sibling: Option<u16>,
    prev_sibling: Option<u16>,
    live: bool,
}

impl DObject {
    const EMPTY: Self = Self {
        ko: KObject::NULL,
        base: 0,
        size: 0,
        payload: Payload::None,
        parent: None,
        first_child: None,
        next_sibling: None,
        prev_sibling: None,
        live: false,
    };

    pub fn parent(&self) -> Option<usize> {
        self.parent.map(usize::from)
    }

    pub fn first_child(&self) -> Option<usize> {
        self.first_child.map(usize::from)
    }

    pub fn next_sibling(&self) -> Option<usize> {
        self.next_sibling.map(usize::from)
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// A final object has an empty subtree and may be deleted.
    pub fn is_final(&self) -> bool {
        self.first_child.is_none()
    }
}

/// Storage footprint of each object type. Untyped and CNode sizes are
/// caller-specified.
pub fn object_size(tag: ObjectTag, user_size: Word) -> Word {
    match tag {
        ObjectTag::Null => 0,
        ObjectTag::Untyped | ObjectTag::CNode => user_size,
        ObjectTag::Thread => 512,
        ObjectTag::SchedContext => 64,
        ObjectTag::Endpoint => 64,
        ObjectTag::Notification => 64,
        ObjectTag::InterruptControl => 32,
        ObjectTag::InterruptHandler => 32,
        ObjectTag::Domain => 64,
        ObjectTag::MemoryRegion => 32,
        ObjectTag::Reply => 32,
    }
}

/// Result of [`Registry::access_validate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessError {
    /// Null, mismatched, or non-self-referential object.
    BadHandle,
    /// Caller holds no grant, or the object is multiply owned.
    Perm,
    /// Object not yet usable (init / unallocated / ungranted).
    Inval,
}

impl From<AccessError> for UserError {
    fn from(e: AccessError) -> Self {
        let bits = match e {
            AccessError::BadHandle => Errno::INVALID_PARAM,
            AccessError::Perm => Errno::NO_PRIVILEGE,
            AccessError::Inval => Errno::INVALID_PARAM | Errno::TCR_ERROR,
        };
        UserError::Recoverable(bits)
    }
}

pub struct Registry {
    slots: [DObject; MAX_DOBJECTS],
    /// Live slots, sorted by storage base address.
    index: [u16; MAX_DOBJECTS],
    index_len: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: [DObject::EMPTY; MAX_DOBJECTS],
            index: [0; MAX_DOBJECTS],
            index_len: 0,
        }
    }

    pub fn slot(&self, i: usize) -> &DObject {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut DObject {
        &mut self.slots[i]
    }

    /// Projects the endpoint payload of `slot`; panics on a type confusion,
    /// which would be a kernel bug.
    pub fn endpoint_mut(&mut self, slot: usize) -> &mut Endpoint {
        match &mut self.slots[slot].payload {
            Payload::Endpoint(e) => e,
            other => panic!("slot {slot} is not an endpoint: {other:?}"),
        }
    }

    pub fn notification_mut(&mut self, slot: usize) -> &mut Notification {
        match &mut self.slots[slot].payload {
            Payload::Notification(n) => n,
            other => panic!("slot {slot} is not a notification: {other:?}"),
        }
    }

    fn index_position(&self, base: Word) -> usize {
        self.index[..self.index_len]
            .partition_point(|&i| self.slots[usize::from(i)].base <= base)
    }

    fn index_insert(&mut self, slot: usize) {
        uassert!(self.index_len < MAX_DOBJECTS);
        let pos = self.index_position(self.slots[slot].base);
        self.index
            .copy_within(pos..self.index_len, pos + 1);
        self.index[pos] = slot as u16;
        self.index_len += 1;
    }

    fn index_remove(&mut self, slot: usize) {
        let len = self.index_len;
        if let Some(pos) =
            self.index[..len].iter().position(|&i| usize::from(i) == slot)
        {
            self.index.copy_within(pos + 1..len, pos);
            self.index_len -= 1;
        }
    }

    /// Locates the object whose storage contains `addr`, preferring the
    /// most-derived one. O(log N) to find the neighborhood, then a short
    /// walk left across overlapping ancestors.
    pub fn find(&self, addr: Word) -> Option<usize> {
        let mut pos = self.index_position(addr);
        while pos > 0 {
            pos -= 1;
            let slot = usize::from(self.index[pos]);
            let d = &self.slots[slot];
            if d.base <= addr && addr < d.base + d.size {
                return Some(slot);
            }
            // Once candidates end before addr and cannot contain it, no
            // earlier-starting object can either unless it is an ancestor
            // spanning this far; keep scanning only while spans could reach.
            if d.base + d.size <= addr && d.parent.is_none() {
                return None;
            }
        }
        None
    }

    /// Allocates a fresh derivation object. `parent == None` only for the
    /// boot roots.
    pub fn alloc(
        &mut self,
        parent: Option<usize>,
        tag: ObjectTag,
        base: Word,
        size: Word,
        payload: Payload,
    ) -> Option<usize> {
        let slot = self.slots.iter().position(|d| !d.live)?;
        self.slots[slot] = DObject {
            ko: KObject {
                name: base,
                tag,
                flags: ObjectFlags::ALLOCATED,
                rights: Rights::FULL,
                data: 0,
            },
            base,
            size,
            payload,
            parent: parent.map(|p| p as u16),
            first_child: None,
            next_sibling: None,
            prev_sibling: None,
            live: true,
        };
        if let Some(p) = parent {
            let old_head = self.slots[p].first_child;
            self.slots[slot].next_sibling = old_head;
            if let Some(h) = old_head {
                self.slots[usize::from(h)].prev_sibling = Some(slot as u16);
            }
            self.slots[p].first_child = Some(slot as u16);
        }
        self.index_insert(slot);
        Some(slot)
    }

    /// Unlinks a final object from the tree and frees its slot. Payload
    /// teardown is the caller's job.
    pub fn free(&mut self, slot: usize) {
        uassert!(self.slots[slot].live);
        uassert!(self.slots[slot].is_final());
        let (parent, prev, next) = {
            let d = &self.slots[slot];
            (d.parent, d.prev_sibling, d.next_sibling)
        };
        match prev {
            Some(p) => self.slots[usize::from(p)].next_sibling = next,
            None => {
                if let Some(p) = parent {
                    self.slots[usize::from(p)].first_child = next;
                }
            }
        }
        if let Some(n) = next {
            self.slots[usize::from(n)].prev_sibling = prev;
        }
        self.index_remove(slot);
        self.slots[slot] = DObject::EMPTY;
    }

    /// No-child predicate used by retype to decide whether a reset pass is
    /// required.
    pub fn no_child(&self, slot: usize) -> bool {
        self.slots[slot].first_child.is_none()
    }

    /// Validates a user-supplied object reference for use by `thread_idx`.
    pub fn access_validate(
        &self,
        slot: usize,
        thread_idx: usize,
        expected: ObjectTag,
    ) -> Result<(), AccessError> {
        let d = &self.slots[slot];
        if !d.live || d.ko.tag == ObjectTag::Null || d.ko.name != d.base {
            return Err(AccessError::BadHandle);
        }
        if d.ko.tag != expected {
            return Err(AccessError::BadHandle);
        }
        if d.ko.flags.contains(ObjectFlags::INIT)
            || !d.ko.flags.contains(ObjectFlags::ALLOCATED)
        {
            return Err(AccessError::Inval);
        }
        let bit = 1 << thread_idx;
        if d.ko.data & bit == 0 {
            return Err(AccessError::Perm);
        }
        if d.ko.data.count_ones() > 1 {
            // Multi-owner objects are not user-manipulable.
            return Err(AccessError::Perm);
        }
        if d.ko.tag != ObjectTag::Thread
            && !d.ko.flags.contains(ObjectFlags::GRANTED)
        {
            return Err(AccessError::Inval);
        }
        Ok(())
    }

    /// Grants `thread_idx` access. Single-owner: a no-op if anyone already
    /// holds the grant.
    pub fn grant(&mut self, slot: usize, thread_idx: usize) {
        let d = &mut self.slots[slot];
        if d.ko.data != 0 {
            return;
        }
        d.ko.data = 1 << thread_idx;
        d.ko.flags |= ObjectFlags::GRANTED;
    }

    /// Clears `thread_idx`'s grant; the object becomes ungranted when the
    /// last bit goes.
    pub fn revoke(&mut self, slot: usize, thread_idx: usize) {
        let d = &mut self.slots[slot];
        d.ko.data &= !(1 << thread_idx);
        if d.ko.data == 0 {
            d.ko.flags -= ObjectFlags::GRANTED;
        }
    }

    /// Applies `f` to every live object; used to implement
    /// revoke-all-by-right and revoke-all-by-data.
    pub fn for_each_live_mut(&mut self, mut f: impl FnMut(usize, &mut DObject)) {
        for i in 0..MAX_DOBJECTS {
            if self.slots[i].live {
                f(i, &mut self.slots[i]);
            }
        }
    }

    /// Revoke-all-by-data: strips every grant a dying thread holds.
    pub fn revoke_all_for_thread(&mut self, thread_idx: usize) {
        let bit = 1 << thread_idx;
        self.for_each_live_mut(|_, d| {
            if d.ko.data & bit != 0 {
                d.ko.data &= !bit;
                if d.ko.data == 0 {
                    d.ko.flags -= ObjectFlags::GRANTED;
                }
            }
        });
    }

    pub fn live_count(&self) -> usize {
        self.index_len
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates one object of `tag` from the untyped at `src_slot`, including
/// per-type side allocations (thread slots, scheduling contexts, memory
/// domains). Returns the new object's registry slot.
pub(crate) fn create_child(
    k: &mut Kernel,
    src_slot: usize,
    tag: ObjectTag,
    user_size: Word,
) -> Result<usize, UserError> {
    let Kernel { registry, threads, scheds, mdomains, .. } = k;

    let size = object_size(tag, user_size);
    let (base, parent_size) = {
        let src = registry.slot(src_slot);
        let Payload::Untyped(u) = src.payload else {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        };
        let aligned = (u.watermark + 15) & !15;
        (src.base + aligned, src.size)
    };
    let offset = base - registry.slot(src_slot).base;
    if offset + size > parent_size {
        return Err(UserError::Recoverable(Errno::OUT_OF_MEMORY));
    }

    let payload = match tag {
        ObjectTag::Untyped => Payload::Untyped(UntypedState::default()),
        ObjectTag::Endpoint => Payload::Endpoint(Endpoint::default()),
        ObjectTag::Notification => Payload::Notification(Notification::default()),
        ObjectTag::InterruptControl => Payload::InterruptControl,
        ObjectTag::CNode => Payload::CNode,
        ObjectTag::Reply => Payload::Reply,
        ObjectTag::MemoryRegion => Payload::MemoryRegion(Fpage::new(
            base,
            size.trailing_zeros() as u8,
            Rights::FULL,
        )),
        ObjectTag::Thread => {
            let tid = (abi::FIRST_USER_THREAD as usize..MAX_THREADS)
                .find(|&i| !threads[i].allocated)
                .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
            threads[tid].allocated = true;
            threads[tid].set_state(ThreadState::Dummy);
            threads[tid].options |= abi::ThreadOptions::USER;
            Payload::Thread(tid)
        }
        ObjectTag::SchedContext => {
            let sci = (0..MAX_SCHED_CONTEXTS)
                .find(|&i| !scheds[i].in_use)
                .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
            scheds[sci] = crate::sporadic::SchedContext::default();
            scheds[sci].in_use = true;
            Payload::SchedContext(sci)
        }
        ObjectTag::Domain => {
            let di = (0..MAX_MEM_DOMAINS)
                .find(|&i| !mdomains[i].in_use)
                .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
            mdomains[di] = crate::mem::MemDomain::new();
            mdomains[di].in_use = true;
            Payload::DomainRef(di)
        }
        ObjectTag::Null | ObjectTag::InterruptHandler => {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        }
    };

    let slot = registry
        .alloc(Some(src_slot), tag, base, size, payload)
        .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;

    // Commit the watermark only once allocation has succeeded.
    if let Payload::Untyped(u) = &mut registry.slot_mut(src_slot).payload {
        u.watermark = offset + size;
    }

    // A thread object brings its endpoint and notification with it, as
    // children of the thread in the derivation tree.
    if let Payload::Thread(tid) = registry.slot(slot).payload {
        let ep_size = object_size(ObjectTag::Endpoint, 0);
        let no_size = object_size(ObjectTag::Notification, 0);
        let src = registry.slot(src_slot);
        let Payload::Untyped(u) = src.payload else { unreachable!() };
        if u.watermark + ep_size + no_size > src.size {
            return Err(UserError::Recoverable(Errno::OUT_OF_MEMORY));
        }
        let ep_base = src.base + u.watermark;
        let ep = registry
            .alloc(
                Some(slot),
                ObjectTag::Endpoint,
                ep_base,
                ep_size,
                Payload::Endpoint(Endpoint::default()),
            )
            .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
        let no = registry
            .alloc(
                Some(slot),
                ObjectTag::Notification,
                ep_base + ep_size,
                no_size,
                Payload::Notification(Notification::default()),
            )
            .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
        if let Payload::Untyped(u) =
            &mut registry.slot_mut(src_slot).payload
        {
            u.watermark += ep_size + no_size;
        }
        threads[tid].endpoint = Some(ep);
        threads[tid].notification = Some(no);
    }

    Ok(slot)
}

/// Locates the derivation object backing thread `tid`, if it was created
/// by retype (the reserved threads have none).
pub fn find_thread_object(reg: &Registry, tid: usize) -> Option<usize> {
    for i in 0..MAX_DOBJECTS {
        let d = reg.slot(i);
        if d.is_live() {
            if let Payload::Thread(t) = d.payload {
                if t == tid {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Allocates a kernel-internal object with an explicit payload out of the
/// boot system untyped. Used for the reserved threads' endpoints and for
/// interrupt-handler objects, which are not user-retypable.
pub(crate) fn alloc_system_object(
    k: &mut Kernel,
    tag: ObjectTag,
    payload: Payload,
) -> Result<usize, UserError> {
    let root = k.sysroot;
    let Kernel { registry, .. } = k;
    let size = object_size(tag, 0);
    let (base, fits) = {
        let src = registry.slot(root);
        let Payload::Untyped(u) = src.payload else {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        };
        let aligned = (u.watermark + 15) & !15;
        (src.base + aligned, aligned + size <= src.size)
    };
    if !fits {
        return Err(UserError::Recoverable(Errno::OUT_OF_MEMORY));
    }
    let root_base = registry.slot(root).base;
    let slot = registry
        .alloc(Some(root), tag, base, size, payload)
        .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
    if let Payload::Untyped(u) = &mut registry.slot_mut(root).payload {
        u.watermark = (base + size) - root_base;
    }
    Ok(slot)
}

/// Retypes `count` objects of `tag` out of the untyped at `src_slot`.
///
/// Long retypes stay responsive by visiting the preemption point between
/// objects (and between reset chunks); on preemption the call unwinds with
/// [`UserError::Preempted`] and a later invocation picks up exactly where
/// it stopped, thanks to the progress fields in [`UntypedState`].
pub fn retype(
    k: &mut Kernel,
    m: &mut impl Machine,
    src_slot: usize,
    tag: ObjectTag,
    user_size: Word,
    count: u32,
) -> Result<Word, UserError> {
    if tag == ObjectTag::Null || count == 0 {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    }

    // A reset pass is required unless the untyped has never been carved.
    let needs_reset = !k.registry.no_child(src_slot);

    // Pick up (or start) the pending-work counter.
    {
        let Payload::Untyped(u) =
            &mut k.registry.slot_mut(src_slot).payload
        else {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        };
        if u.retype_remaining == 0 {
            u.retype_remaining = count;
        }
    }

    if needs_reset {
        reset_untyped(k, m, src_slot)?;
    }

    let mut first = None;
    loop {
        let remaining = {
            let Payload::Untyped(u) = k.registry.slot(src_slot).payload
            else {
                unreachable!()
            };
            u.retype_remaining
        };
        if remaining == 0 {
            break;
        }

        let slot = create_child(k, src_slot, tag, user_size)?;
        if first.is_none() {
            first = Some(k.registry.slot(slot).base);
        }
        if let Payload::Untyped(u) =
            &mut k.registry.slot_mut(src_slot).payload
        {
            u.retype_remaining -= 1;
        }

        sched::preemption_point(k, m)?;
    }
    Ok(first.unwrap_or(0))
}

/// The reset pass over an untyped's unallocated storage, chunked so the
/// preemption point fires between chunks. Progress persists across a
/// preempted call.
fn reset_untyped(
    k: &mut Kernel,
    m: &mut impl Machine,
    src_slot: usize,
) -> Result<(), UserError> {
    loop {
        let done = {
            let size = k.registry.slot(src_slot).size;
            let Payload::Untyped(u) =
                &mut k.registry.slot_mut(src_slot).payload
            else {
                unreachable!()
            };
            if u.reset_progress >= size {
                u.reset_progress = 0;
                true
            } else {
                // The port's memory zeroing happens here on real hardware;
                // the core only accounts for the time it takes.
                u.reset_progress =
                    (u.reset_progress + RETYPE_RESET_CHUNK).min(size);
                false
            }
        };
        if done {
            return Ok(());
        }
        sched::preemption_point(k, m)?;
    }
}

/// Deletes the whole subtree under `slot`, children first, `slot` included.
/// Each delete tears down the payload (aborting threads, cancelling
/// waiters, releasing side-table entries) before the slot is freed.
pub fn revoke_subtree(
    k: &mut Kernel,
    m: &mut impl Machine,
    slot: usize,
) -> Result<(), UserError> {
    loop {
        // Descend to the deepest leftmost leaf.
        let mut leaf = slot;
        while let Some(c) = k.registry.slot(leaf).first_child() {
            leaf = c;
        }
        destroy(k, m, leaf);
        if leaf == slot {
            return Ok(());
        }
        sched::preemption_point(k, m)?;
    }
}

/// Deletes a single, final object.
pub fn delete(
    k: &mut Kernel,
    m: &mut impl Machine,
    slot: usize,
) -> Result<(), UserError> {
    if !k.registry.slot(slot).is_final() {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    }
    destroy(k, m, slot);
    Ok(())
}

/// Payload teardown plus slot free. Callers guarantee finality.
fn destroy(k: &mut Kernel, m: &mut impl Machine, slot: usize) {
    let payload = k.registry.slot(slot).payload;
    match payload {
        Payload::Thread(tid) => {
            if k.threads[tid].allocated {
                crate::task::abort(k, m, tid);
            }
        }
        Payload::SchedContext(sci) => {
            for t in k.threads.iter_mut() {
                if t.sc == Some(sci) {
                    t.sc = None;
                }
            }
            k.scheds[sci] = crate::sporadic::SchedContext::default();
        }
        Payload::Endpoint(_) => {
            ipc::cancel_endpoint_waiters(k, slot);
        }
        Payload::Notification(_) => {
            let Kernel { registry, threads, sched, .. } = k;
            let n = registry.notification_mut(slot);
            while let Some(w) = n.queue.pop(threads) {
                threads[w].waiting_on = None;
                threads[w].errno |= Errno::IPC_NOT_EXIST;
                threads[w].set_state(ThreadState::Queued);
                sched::ready_enqueue(sched, threads, w);
            }
        }
        Payload::InterruptHandler(irq) => {
            crate::irq::unbind(k, m, irq);
        }
        Payload::DomainRef(di) => {
            for t in k.threads.iter_mut() {
                if t.mdomain == Some(di) {
                    t.mdomain = None;
                }
            }
            k.mdomains[di] = crate::mem::MemDomain::new();
        }
        _ => {}
    }
    k.registry.free(slot);
}
