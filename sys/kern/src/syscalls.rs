// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The port's syscall entry sequence saves the caller's registers and calls
//! [`syscall_entry`] with the syscall number. Each handler has the shape
//!
//! ```ignore
//! fn handler(k: &mut Kernel, m: &mut impl Machine, caller: usize)
//!     -> Result<(), UserError>;
//! ```
//!
//! A common discharge site turns the error into errno bits, a dead thread,
//! or an unwound preempted call; every entry then funnels through
//! `schedule` on its way out. The dispatch table is dense and fixed: an
//! opcode outside it, or in a reserved slot, kills the invoker.

use abi::{
    ControlWord, DeviceBinding, Errno, Exception, Fpage, IpcTimeout,
    ObjectTag, Rights, SyscallNum, ThreadId, ThreadState, Word,
};

use crate::config::{MAX_REFILLS, MIN_BUDGET_TICKS};
use crate::err::{UsageError, UserError};
use crate::ipc;
use crate::irq;
use crate::machine::Machine;
use crate::mem;
use crate::obj::{self, Payload};
use crate::sched;
use crate::state::Kernel;
use crate::task;
use crate::time;
use crate::umem::{self, USlice};

/// Entry point accessed by the port's syscall entry sequence, after the
/// caller's volatile state has been saved into its TCB.
pub fn syscall_entry(
    k: &mut Kernel,
    m: &mut impl Machine,
    nr: u32,
) -> Exception {
    let caller = k.sched.current;

    time::update_timestamp(k, m, false);
    if !time::check_budget_restart(k) {
        // No budget to run the call; the thread has been parked on the
        // release queue and will re-enter from scratch.
        sched::schedule(k, m);
        return Exception::Fault;
    }

    // Default result; handlers overwrite as needed.
    k.threads[caller].save.set_ret(0, 0);

    let res = dispatch(k, m, nr, caller);

    let exc = match res {
        Ok(()) => Exception::None,
        Err(UserError::Recoverable(bits)) => {
            let t = &mut k.threads[caller];
            t.errno |= bits;
            t.save.set_ret(0, Exception::SyscallError as Word);
            Exception::SyscallError
        }
        Err(UserError::Lookup) => {
            k.threads[caller]
                .save
                .set_ret(0, Exception::LookupFault as Word);
            Exception::LookupFault
        }
        Err(UserError::Preempted) => {
            // Unwind: the thread re-executes the call after the interrupt
            // (and possibly a reschedule) has been serviced.
            k.threads[caller].set_state(ThreadState::Restart);
            k.sched.action =
                k.sched.action.combine(sched::Action::ChooseNew);
            Exception::Preempted
        }
        Err(UserError::Unrecoverable(fault)) => {
            task::k_oops(k, m, caller, fault);
            Exception::Fault
        }
    };

    sched::schedule(k, m);
    exc
}

fn dispatch(
    k: &mut Kernel,
    m: &mut impl Machine,
    nr: u32,
    caller: usize,
) -> Result<(), UserError> {
    match SyscallNum::try_from(nr) {
        Ok(SyscallNum::KernelInterface) => kernel_interface(k, caller),
        Ok(SyscallNum::ExchangeIpc) => exchange_ipc(k, m, caller),
        Ok(SyscallNum::ExchangeRegisters) => exchange_registers(k, caller),
        Ok(SyscallNum::ThreadControl) => thread_control(k, m, caller),
        Ok(SyscallNum::ScheduleControl) => schedule_control(k, caller),
        Ok(SyscallNum::SwitchThread) => switch_thread(k, caller),
        Ok(SyscallNum::SpaceControl) => space_control(k, caller),
        Ok(SyscallNum::ProcessorControl) => processor_control(k, caller),
        Ok(SyscallNum::MemoryControl) => memory_control(k, caller),
        Ok(SyscallNum::UnmapPage) => unmap_page(k, m, caller),
        Ok(SyscallNum::SystemClock) => system_clock(k, caller),
        Ok(SyscallNum::DeviceBinding) => device_binding(k, m, caller),
        Ok(SyscallNum::KobjectAccessGrant) => {
            kobject_access(k, caller, true)
        }
        Ok(SyscallNum::KobjectAccessRevoke) => {
            kobject_access(k, caller, false)
        }
        Ok(SyscallNum::RetypeUntyped) => retype_untyped(k, m, caller),
        Ok(SyscallNum::DobjectAlloc) => dobject_alloc(k, caller),
        Ok(SyscallNum::DobjectFree) => dobject_free(k, m, caller),
        Ok(SyscallNum::UprintkStringOut) => uprintk_string_out(k, m, caller),
        Err(()) => {
            // Bogus or reserved opcode. The table is built at link time and
            // holes are never valid; this is a k-oops, not an errno.
            Err(UsageError::BadSyscallNumber.into())
        }
    }
}

/// True for the threads allowed to perform management operations: the
/// reserved threads, and any thread that never dropped to user mode.
fn is_privileged(k: &Kernel, caller: usize) -> bool {
    caller < abi::FIRST_USER_THREAD as usize
        || !k.threads[caller]
            .options
            .contains(abi::ThreadOptions::USER)
}

/// Decodes a request record out of a raw byte buffer previously fetched
/// through the user-copy shim.
fn deserialize_record<T>(buf: &[u8]) -> Result<T, UserError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let (v, _) = ssmarshal::deserialize(buf)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
    Ok(v)
}

fn arg(k: &Kernel, caller: usize, n: usize) -> Word {
    k.threads[caller].save.arg(n)
}

// --- Handlers -------------------------------------------------------------

fn kernel_interface(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let base = k.threads[caller]
        .mdomain
        .and_then(|d| k.mdomains[d].kip_area)
        .map(|(b, _)| b)
        .unwrap_or(0);
    let (ver, flags, id) =
        (k.kip.api_version, k.kip.api_flags, k.kip.kernel_id);
    let t = &mut k.threads[caller];
    t.save.set_ret(0, base);
    t.save.set_ret(1, ver as Word);
    t.save.set_ret(2, flags as Word);
    t.save.set_ret(3, id as Word);
    Ok(())
}

fn exchange_ipc(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let dest = ThreadId(arg(k, caller, 0) as u32);
    let from = ThreadId(arg(k, caller, 1) as u32);
    let timeout = IpcTimeout(arg(k, caller, 2) as u16);
    let donate = arg(k, caller, 3) & 1 != 0;
    ipc::exchange_ipc(k, m, dest, from, timeout, donate)
}

fn exchange_registers(
    k: &mut Kernel,
    caller: usize,
) -> Result<(), UserError> {
    let dest = ThreadId(arg(k, caller, 0) as u32);
    let control = ControlWord::from_bits_truncate(arg(k, caller, 1) as u32);
    let (sp, ip, flags) =
        (arg(k, caller, 2), arg(k, caller, 3), arg(k, caller, 4));

    let dst = task::lookup_gid(&k.threads, dest)
        .map_err(UserError::Recoverable)?;

    let old = {
        let s = &k.threads[dst].save;
        (s.sp, s.ip, s.flags)
    };

    // Asynchronous cancellation: abort-then-cancel the target's IPC before
    // touching its registers. (The ordering versus an in-flight transfer
    // timeout is debatable; revisit if a port grows visible xfer windows.)
    if control.contains(ControlWord::RESUME)
        && k.threads[dst].state().is_blocked()
    {
        ipc::cancel_ipc_with(k, dst, Errno::IPC_ABORTED);
    }

    {
        let s = &mut k.threads[dst].save;
        if control.contains(ControlWord::SP) {
            s.sp = sp;
        }
        if control.contains(ControlWord::IP) {
            s.ip = ip;
        }
        if control.contains(ControlWord::FLAGS) {
            s.flags = flags;
        }
    }

    if control.contains(ControlWord::SUSPEND)
        || control.contains(ControlWord::HALT)
    {
        task::suspend(k, dst).map_err(UserError::Recoverable)?;
    }
    if control.contains(ControlWord::ACTIVATE) {
        // Only meaningful for a freshly created thread; otherwise resume.
        if k.threads[dst].state() == ThreadState::Dummy {
            task::activate(k, dst).map_err(UserError::Recoverable)?;
        } else if k.threads[dst].state() == ThreadState::Suspended {
            task::resume(k, dst).map_err(UserError::Recoverable)?;
        }
    }

    if control.contains(ControlWord::DELIVER) {
        let t = &mut k.threads[caller];
        t.save.set_ret(1, old.0);
        t.save.set_ret(2, old.1);
        t.save.set_ret(3, old.2);
    }
    Ok(())
}

fn thread_control(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    if !is_privileged(k, caller) {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    let dest = ThreadId(arg(k, caller, 0) as u32);
    let space = ThreadId(arg(k, caller, 1) as u32);
    let scheduler = ThreadId(arg(k, caller, 2) as u32);
    let pager = ThreadId(arg(k, caller, 3) as u32);
    let control = ControlWord::from_bits_truncate(arg(k, caller, 4) as u32);
    let utcb = arg(k, caller, 5);

    let dtid = task::lookup_gid(&k.threads, dest)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_THREAD))?;
    if dtid < abi::FIRST_USER_THREAD as usize {
        // The reserved threads are not thread-control material.
        return Err(UserError::Recoverable(Errno::INVALID_THREAD));
    }

    // Space = nil deletes the thread, together with its derivation
    // subtree (endpoint and notification objects included).
    if space.is_nil() {
        match obj::find_thread_object(&k.registry, dtid) {
            Some(slot) => obj::revoke_subtree(k, m, slot)?,
            None => task::abort(k, m, dtid),
        }
        return Ok(());
    }

    // Share the address space of the space-specifier thread.
    let stid = task::lookup_gid(&k.threads, space)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_SPACE))?;
    let md = k.threads[stid].mdomain;
    if let Some(old) = k.threads[dtid].mdomain.take() {
        k.mdomains[old].threads &= !(1 << dtid);
    }
    if let Some(new) = md {
        k.mdomains[new].threads |= 1 << dtid;
        k.threads[dtid].mdomain = Some(new);
    }

    if !scheduler.is_nil() {
        task::lookup_gid(&k.threads, scheduler)
            .map_err(|_| UserError::Recoverable(Errno::INVALID_SCHEDULER))?;
        k.threads[dtid].scheduler = scheduler;
    }
    if control.contains(ControlWord::PAGER) || !pager.is_nil() {
        k.threads[dtid].pager = pager;
    }

    if utcb != 0 {
        let ok = k.threads[dtid]
            .mdomain
            .and_then(|d| k.mdomains[d].utcb_area)
            .is_some_and(|(base, size)| {
                utcb >= base && utcb < base + size
            });
        if !ok {
            return Err(UserError::Recoverable(Errno::INVALID_UTCB));
        }
    }

    if control.contains(ControlWord::ACTIVATE) {
        task::activate(k, dtid).map_err(UserError::Recoverable)?;
    }
    Ok(())
}

fn schedule_control(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let dest = ThreadId(arg(k, caller, 0) as u32);
    let period = arg(k, caller, 1) as u64;
    let budget = arg(k, caller, 2) as u64;
    let prio = arg(k, caller, 3);
    let domain = arg(k, caller, 4);
    let max_refills = arg(k, caller, 5);

    let dtid = task::lookup_gid(&k.threads, dest).map_err(|_| {
        UserError::Recoverable(Errno::THREAD_NOT_EXIST | Errno::TCR_ERROR)
    })?;

    let caller_gid = task::current_gid(&k.threads, caller);
    if !is_privileged(k, caller)
        && k.threads[dtid].scheduler != caller_gid
    {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }

    // Report the old priority back.
    let old_prio = k.threads[dtid].prio.0 as Word;

    if prio < 256 {
        let Kernel { sched, threads, .. } = k;
        let was_queued = sched::ready_remove(sched, threads, dtid);
        threads[dtid].prio = abi::Priority(prio as u8);
        if was_queued {
            sched::ready_enqueue(sched, threads, dtid);
        }
    }

    if domain < crate::config::NUM_DOMAINS as Word
        && domain as u8 != k.threads[dtid].domain
    {
        // The scheduler never migrates a runnable thread between domains.
        if k.threads[dtid].in_ready
            || k.sched.current == dtid
        {
            return Err(UserError::Recoverable(Errno::THREAD_RUNNING));
        }
        k.threads[dtid].domain = domain as u8;
    }

    if budget != 0 {
        if budget < MIN_BUDGET_TICKS
            || period < budget
            || max_refills == 0
            || max_refills > MAX_REFILLS
        {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        }
        // Round-robin contracts (period == budget) need a second refill to
        // rotate through.
        if period == budget
            && max_refills < crate::config::MIN_REFILLS_ROUND_ROBIN
        {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        }
        let now = k.time.now;
        match k.threads[dtid].sc {
            Some(sci) => {
                if k.scheds[sci].is_active() {
                    k.scheds[sci]
                        .refill_update(period, budget, max_refills, now);
                } else {
                    k.scheds[sci]
                        .refill_new(max_refills, budget, period, now);
                }
            }
            None => {
                let sci = (0..crate::config::MAX_SCHED_CONTEXTS)
                    .find(|&i| !k.scheds[i].in_use)
                    .ok_or(UserError::Recoverable(Errno::OUT_OF_MEMORY))?;
                obj::alloc_system_object(
                    k,
                    ObjectTag::SchedContext,
                    Payload::SchedContext(sci),
                )?;
                k.scheds[sci].in_use = true;
                k.scheds[sci].refill_new(max_refills, budget, period, now);
                k.threads[dtid].sc = Some(sci);
            }
        }
        k.time.reprogram = true;
    }

    k.threads[caller].save.set_ret(1, old_prio);
    Ok(())
}

fn switch_thread(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let dest = ThreadId(arg(k, caller, 0) as u32);
    if dest.is_nil() {
        // Plain yield: go to the back of our FIFO.
        k.sched.action = k.sched.action.combine(sched::Action::ChooseNew);
        return Ok(());
    }
    let dtid = task::lookup_gid(&k.threads, dest)
        .map_err(UserError::Recoverable)?;
    if k.threads[dtid].is_schedulable() {
        k.sched.action =
            k.sched.action.combine(sched::Action::SwitchTo(dtid));
    }
    Ok(())
}

fn space_control(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    if !is_privileged(k, caller) {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    let space = ThreadId(arg(k, caller, 0) as u32);
    let kip_base = arg(k, caller, 2);
    let utcb_base = arg(k, caller, 3);
    let utcb_size = arg(k, caller, 4);

    let stid = task::lookup_gid(&k.threads, space)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_SPACE))?;
    let Some(d) = k.threads[stid].mdomain else {
        return Err(UserError::Recoverable(Errno::INVALID_SPACE));
    };

    let kip_size = 1 << k.kip.kip_area_info;
    if utcb_size != 0 {
        let overlap = kip_base < utcb_base + utcb_size
            && utcb_base < kip_base + kip_size;
        if overlap {
            return Err(UserError::Recoverable(Errno::INVALID_UTCB));
        }
    }
    k.mdomains[d].kip_area = Some((kip_base, kip_size));
    if utcb_size != 0 {
        k.mdomains[d].utcb_area = Some((utcb_base, utcb_size));
    }
    Ok(())
}

fn processor_control(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    if !is_privileged(k, caller) {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    // Uniprocessor: the only valid descriptor is number zero; report the
    // count back.
    if arg(k, caller, 0) != 0 {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    }
    k.threads[caller].save.set_ret(1, 1);
    Ok(())
}

fn memory_control(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let count = arg(k, caller, 0) & 0x3f;
    let Some(d) = k.threads[caller].mdomain else {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    };
    // Attribute words are taken as-is; enforcing cache policy is the MPU
    // port's business. Here we only check the named fpages are really
    // mapped in the caller's domain.
    for i in 1..=count as usize {
        let w = k.threads[caller].mr(i);
        let fpage = Fpage::from_word(w, Rights::empty());
        if k.mdomains[d].mapping_at(fpage.base).is_none() {
            return Err(UserError::Recoverable(Errno::INVALID_PARAM));
        }
    }
    Ok(())
}

fn unmap_page(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let control = arg(k, caller, 0);
    let count = (control & 0x3f) as usize;
    let flush = control & (1 << 6) != 0;

    let Some(d) = k.threads[caller].mdomain else {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    };

    for i in 1..=count {
        let w = k.threads[caller].mr(i);
        let fpage = Fpage::from_word(w, Rights::empty());
        let status = mem::unmap_page(&mut k.mdomains, d, fpage, flush)
            .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
        // Status bits ride back in place, in the item's low bits.
        k.threads[caller]
            .set_mr(i, fpage.to_word() | status.bits() as Word);
        sched::preemption_point(k, m)?;
    }
    Ok(())
}

fn system_clock(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let now = k.time.now;
    let t = &mut k.threads[caller];
    t.save.set_ret(1, now as Word);
    t.save.set_ret(2, (now >> 32) as Word);
    Ok(())
}

fn device_binding(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let ptr = arg(k, caller, 0);
    let len = arg(k, caller, 1);

    let mut buf = [0u8; 32];
    let slice = USlice::<u8>::from_raw(ptr, len.min(buf.len()))
        .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
    let n = {
        let Kernel { threads, mdomains, .. } = k;
        umem::read_user_bytes(mdomains, &threads[caller], slice, &mut buf)
            .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?
    };
    let req: DeviceBinding = deserialize_record(&buf[..n])?;
    irq::apply_binding(k, m, caller, req)
}

fn kobject_access(
    k: &mut Kernel,
    caller: usize,
    grant: bool,
) -> Result<(), UserError> {
    let addr = arg(k, caller, 0);
    let target = ThreadId(arg(k, caller, 1) as u32);
    let ttid = task::lookup_gid(&k.threads, target)
        .map_err(UserError::Recoverable)?;

    let slot = k.registry.find(addr).ok_or(UserError::Lookup)?;
    let owner_bit = 1usize << caller;
    let owns = k.registry.slot(slot).ko.data == owner_bit;
    if !is_privileged(k, caller) && !owns {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    if grant {
        k.registry.grant(slot, ttid);
    } else {
        k.registry.revoke(slot, ttid);
    }
    Ok(())
}

fn retype_untyped(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let addr = arg(k, caller, 0);
    let tag = ObjectTag::try_from(arg(k, caller, 1) as u32)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
    let size = arg(k, caller, 2);
    let count = arg(k, caller, 3) as u32;

    let slot = k.registry.find(addr).ok_or(UserError::Lookup)?;
    if !is_privileged(k, caller) {
        k.registry
            .access_validate(slot, caller, ObjectTag::Untyped)
            .map_err(UserError::from)?;
    }
    let first = obj::retype(k, m, slot, tag, size, count)?;
    k.threads[caller].save.set_ret(1, first);
    Ok(())
}

fn dobject_alloc(k: &mut Kernel, caller: usize) -> Result<(), UserError> {
    let tag = ObjectTag::try_from(arg(k, caller, 0) as u32)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
    let size = arg(k, caller, 1);
    if !is_privileged(k, caller) {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    let root = k.sysroot;
    let slot = obj::create_child(k, root, tag, size)?;
    k.registry.grant(slot, caller);
    let base = k.registry.slot(slot).base;
    k.threads[caller].save.set_ret(1, base);
    Ok(())
}

fn dobject_free(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let addr = arg(k, caller, 0);
    let slot = k.registry.find(addr).ok_or(UserError::Lookup)?;
    let owns = k.registry.slot(slot).ko.data == 1usize << caller;
    if !is_privileged(k, caller) && !owns {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }
    obj::delete(k, m, slot)
}

fn uprintk_string_out(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let ptr = arg(k, caller, 0);
    let len = arg(k, caller, 1).min(256);

    let mut remaining = len;
    let mut cursor = ptr;
    let mut chunk = [0u8; 64];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        let slice = USlice::<u8>::from_raw(cursor, take)
            .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;
        let n = {
            let Kernel { threads, mdomains, .. } = k;
            umem::read_user_bytes(
                mdomains,
                &threads[caller],
                slice,
                &mut chunk[..take],
            )
            .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?
        };
        for &b in &chunk[..n] {
            if b == 0 {
                return Ok(());
            }
            m.printk_byte(b);
        }
        cursor += take;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::FakeMachine;
    use crate::mem::{MapStatus, Mapping, MemDomain};
    use crate::startup::test_kernel;
    use abi::{IDLE_THREAD, PRIVILEGE_THREAD};

    fn run_as(k: &mut Kernel, tid: usize) {
        {
            let Kernel { sched, threads, .. } = k;
            sched::ready_remove(sched, threads, tid);
        }
        k.threads[tid].set_state(ThreadState::Running);
        k.sched.current = tid;
        k.sched.action = sched::Action::ResumeCurrent;
    }

    fn set_args(k: &mut Kernel, tid: usize, args: &[Word]) {
        for (i, a) in args.iter().enumerate() {
            k.threads[tid].save.args[i] = *a;
        }
    }

    #[test]
    fn system_clock_reads_monotonic_time() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        run_as(&mut k, t);
        m.advance(1234);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::SystemClock as u32);
        assert_eq!(exc, Exception::None);
        assert_eq!(k.threads[t].save.arg(1), 1234);
    }

    #[test]
    fn invalid_opcode_kills_the_invoker() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        run_as(&mut k, t);
        let exc = syscall_entry(&mut k, &mut m, 99);
        assert_eq!(exc, Exception::Fault);
        assert_eq!(k.threads[t].state(), ThreadState::Dead);
        assert!(!k.threads[t].allocated);
        // Someone else is running now.
        assert_ne!(k.sched.current, t);
    }

    #[test]
    fn reserved_slot_also_kills() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        run_as(&mut k, t);
        // In-table reserved hole: 18..SYSCALL_TABLE_SIZE.
        let exc = syscall_entry(&mut k, &mut m, 20);
        assert_eq!(exc, Exception::Fault);
        assert_eq!(k.threads[t].state(), ThreadState::Dead);
    }

    #[test]
    fn prologue_parks_thread_without_budget() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        k.scheds[0].in_use = true;
        k.scheds[0].refill_new(2, 2, 100, 0);
        k.threads[t].sc = Some(0);
        run_as(&mut k, t);

        // Burn through the whole budget before the call.
        m.advance(5);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::SystemClock as u32);
        assert_eq!(exc, Exception::Fault);
        assert!(k.threads[t].in_release);
        assert_eq!(k.sched.current, IDLE_THREAD as usize);
    }

    #[test]
    fn unmap_of_unmapped_fpage_is_invalid_param() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        k.mdomains[0] = MemDomain::new();
        k.mdomains[0].in_use = true;
        k.threads[t].mdomain = Some(0);
        run_as(&mut k, t);

        let fpage = Fpage::new(0x4_0000, 12, Rights::FULL);
        k.threads[t].set_mr(1, fpage.to_word());
        set_args(&mut k, t, &[1]);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::UnmapPage as u32);
        assert_eq!(exc, Exception::SyscallError);
        assert!(k.threads[t].errno.contains(Errno::INVALID_PARAM));
        // Domain unchanged, thread rescheduled normally.
        assert_eq!(k.mdomains[0].mappings().count(), 0);
        assert_eq!(k.sched.current, t);
        assert_eq!(k.threads[t].state(), ThreadState::Running);
    }

    #[test]
    fn unmap_returns_status_bits_in_place() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        let mut d = MemDomain::new();
        d.in_use = true;
        let fpage = Fpage::new(0x4_0000, 12, Rights::FULL);
        d.install_mapping(Mapping {
            fpage,
            status: MapStatus::empty(),
            src_domain: None,
            granted: false,
        })
        .unwrap();
        d.mark_access(0x4_0000, 8, true);
        k.mdomains[0] = d;
        k.threads[t].mdomain = Some(0);
        run_as(&mut k, t);

        k.threads[t].set_mr(1, fpage.to_word());
        set_args(&mut k, t, &[1]);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::UnmapPage as u32);
        assert_eq!(exc, Exception::None);
        let got = k.threads[t].mr(1);
        let status = MapStatus::from_bits_truncate((got & 0xf) as u32);
        assert!(status.contains(MapStatus::WAS_WRITTEN));
        assert!(status.contains(MapStatus::WAS_REFERENCED));
    }

    #[test]
    fn retype_syscall_respects_grants() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        run_as(&mut k, t);

        // Name the untyped by an interior address: its base is shadowed by
        // the first object carved out of it.
        let root_addr = k.registry.slot(k.sysroot).base + 0xf000;
        set_args(
            &mut k,
            t,
            &[root_addr, ObjectTag::Endpoint as u32 as Word, 0, 1],
        );
        // Ungranted: no privilege.
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::RetypeUntyped as u32);
        assert_eq!(exc, Exception::SyscallError);

        // Grant the untyped to the thread and retry.
        let root = k.sysroot;
        k.registry.grant(root, t);
        k.threads[t].errno = Errno::empty();
        run_as(&mut k, t);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::RetypeUntyped as u32);
        assert_eq!(exc, Exception::None);
        let child = k.threads[t].save.arg(1);
        let slot = k.registry.find(child).unwrap();
        assert_eq!(k.registry.slot(slot).ko.tag, ObjectTag::Endpoint);
    }

    #[test]
    fn device_binding_round_trips_through_user_memory() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let h = k.user_thread(10, 0);
        crate::task::activate(&mut k, h).unwrap();

        // Serialize a binding request into "user" memory owned by the
        // privilege thread.
        let req = DeviceBinding {
            irq: 13,
            thread: crate::task::current_gid(&k.threads, h),
            action: abi::IrqAction::SignalEnable as u32,
        };
        let mut buf = [0u8; 32];
        let n = ssmarshal::serialize(&mut buf, &req).unwrap();

        let mut d = MemDomain::new();
        d.in_use = true;
        let log2 = buf.len().next_power_of_two().trailing_zeros() as u8;
        d.install_mapping(Mapping {
            fpage: Fpage::new(buf.as_ptr() as usize, log2, Rights::FULL),
            status: MapStatus::empty(),
            src_domain: None,
            granted: false,
        })
        .unwrap();
        k.mdomains[0] = d;
        let pt = PRIVILEGE_THREAD as usize;
        k.threads[pt].mdomain = Some(0);
        crate::task::activate(&mut k, pt).unwrap();
        run_as(&mut k, pt);

        set_args(&mut k, pt, &[buf.as_ptr() as usize, n]);
        let exc =
            syscall_entry(&mut k, &mut m, SyscallNum::DeviceBinding as u32);
        assert_eq!(exc, Exception::None);
        assert!(crate::irq::line_is_active(&k, 13));
        assert!(!m.masked[13]);
    }

    #[test]
    fn exchange_registers_delivers_and_aborts_ipc() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let a = k.user_thread(10, 0);
        let b = k.user_thread(11, 0);
        let c = k.user_thread(12, 0);
        for t in [a, b, c] {
            crate::task::activate(&mut k, t).unwrap();
        }
        // a parks in a send to c.
        run_as(&mut k, a);
        k.threads[a].save.sp = 0x1000;
        k.threads[a].save.ip = 0x2000;
        k.threads[a].set_mr(0, 0);
        let cgid = crate::task::current_gid(&k.threads, c);
        ipc::exchange_ipc(
            &mut k,
            &mut m,
            cgid,
            ThreadId::NIL,
            IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        assert_eq!(k.threads[a].state(), ThreadState::SendBlocked);

        // b cancels it and reads the old registers.
        run_as(&mut k, b);
        let agid = crate::task::current_gid(&k.threads, a);
        set_args(
            &mut k,
            b,
            &[
                agid.0 as Word,
                (ControlWord::RESUME | ControlWord::DELIVER).bits() as Word,
                0,
                0,
                0,
            ],
        );
        let exc = syscall_entry(
            &mut k,
            &mut m,
            SyscallNum::ExchangeRegisters as u32,
        );
        assert_eq!(exc, Exception::None);
        assert_eq!(k.threads[a].state(), ThreadState::Queued);
        assert!(k.threads[a].errno.contains(Errno::IPC_ABORTED));
        assert_eq!(k.threads[b].save.arg(1), 0x1000);
        assert_eq!(k.threads[b].save.arg(2), 0x2000);
    }

    #[test]
    fn schedule_control_installs_contract() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        let pt = PRIVILEGE_THREAD as usize;
        crate::task::activate(&mut k, pt).unwrap();
        run_as(&mut k, pt);

        let tgid = crate::task::current_gid(&k.threads, t);
        // period 100, budget 10, prio 42, domain unchanged, 4 refills.
        set_args(&mut k, pt, &[tgid.0 as Word, 100, 10, 42, 0, 4]);
        let exc = syscall_entry(
            &mut k,
            &mut m,
            SyscallNum::ScheduleControl as u32,
        );
        assert_eq!(exc, Exception::None);
        assert_eq!(k.threads[t].prio, abi::Priority(42));
        let sci = k.threads[t].sc.unwrap();
        assert!(k.scheds[sci].is_active());
        assert_eq!(k.scheds[sci].budget, 10);
        assert_eq!(k.scheds[sci].period, 100);

        // Insufficient budget is rejected.
        set_args(&mut k, pt, &[tgid.0 as Word, 100, 1, 42, 0, 4]);
        run_as(&mut k, pt);
        let exc = syscall_entry(
            &mut k,
            &mut m,
            SyscallNum::ScheduleControl as u32,
        );
        assert_eq!(exc, Exception::SyscallError);
    }

    #[test]
    fn thread_control_delete_revokes_subtree() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        let live_before = k.registry.live_count();

        let pt = PRIVILEGE_THREAD as usize;
        crate::task::activate(&mut k, pt).unwrap();
        run_as(&mut k, pt);
        let tgid = crate::task::current_gid(&k.threads, t);
        set_args(&mut k, pt, &[tgid.0 as Word, ThreadId::NIL.0 as Word]);
        let exc = syscall_entry(
            &mut k,
            &mut m,
            SyscallNum::ThreadControl as u32,
        );
        assert_eq!(exc, Exception::None);
        assert!(!k.threads[t].allocated);
        // Thread object plus its endpoint and notification are gone.
        assert_eq!(k.registry.live_count(), live_before - 3);
    }

    #[test]
    fn uprintk_emits_bounded_string() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let buf = *b"hello, kernel\0junk";
        let mut d = MemDomain::new();
        d.in_use = true;
        d.install_mapping(Mapping {
            fpage: Fpage::new(buf.as_ptr() as usize, 6, Rights::READ),
            status: MapStatus::empty(),
            src_domain: None,
            granted: false,
        })
        .unwrap();
        k.mdomains[0] = d;
        let t = k.user_thread(10, 0);
        crate::task::activate(&mut k, t).unwrap();
        k.threads[t].mdomain = Some(0);
        run_as(&mut k, t);

        set_args(&mut k, t, &[buf.as_ptr() as usize, buf.len()]);
        let exc = syscall_entry(
            &mut k,
            &mut m,
            SyscallNum::UprintkStringOut as u32,
        );
        assert_eq!(exc, Exception::None);
        assert_eq!(&m.log, b"hello, kernel");
    }
}
