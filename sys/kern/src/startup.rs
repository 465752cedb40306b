// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The port's `main`-equivalent does basic hardware setup, fills in a
//! [`Blueprint`] (typically from link-time constants), and calls [`build`]
//! exactly once per boot. The result is a fully formed [`Kernel`]: roots in
//! the derivation tree, the reserved threads, the domain schedule, and the
//! KIP. The port then enters the first elected thread.

use abi::{
    ObjectTag, Priority, ThreadId, ThreadOptions, ThreadState, Word,
    FIRST_USER_THREAD, IDLE_THREAD, MAIN_THREAD, PRIVILEGE_THREAD,
};

use crate::config::MAX_SCHEDULE_SLOTS;
use crate::fail;
use crate::kip;
use crate::obj::{self, Payload, UntypedState};
use crate::sched::DomainSlot;
use crate::state::Kernel;
use crate::time::Ticks;

/// Static description of the system shape, provided by the port.
#[derive(Clone, Debug)]
pub struct Blueprint {
    /// The system RAM window that user partitions must fall inside.
    pub ram: (usize, usize),
    /// Spans holding kernel-private structures; partitions may not overlap
    /// these.
    pub kernel_regions: [Option<(usize, usize)>; 4],
    /// Storage window of the boot system untyped, feeding kernel-side
    /// object allocations.
    pub system_untyped: (Word, Word),
    /// Additional untyped roots handed to user-level resource managers.
    pub extra_untyped: [Option<(Word, Word)>; 4],
    /// The cyclic domain schedule. An empty schedule degenerates to domain
    /// 0 forever.
    pub schedule: [Option<DomainSlot>; MAX_SCHEDULE_SLOTS],
    /// IRQ line of the platform tick source.
    pub timer_irq: u32,
    /// Whether the main thread starts runnable.
    pub start_main: bool,
    /// Clock read/schedule precision, in ticks, for the KIP.
    pub tick_precision: u32,
}

impl Blueprint {
    /// The shape the in-process test suite uses.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            ram: (0x2000_0000, 0x10_0000),
            kernel_regions: [None; 4],
            system_untyped: (0x8000_0000, 0x1_0000),
            extra_untyped: [None; 4],
            schedule: {
                let mut s = [None; MAX_SCHEDULE_SLOTS];
                s[0] = Some(DomainSlot { domain: 0, length: 1000 });
                s[1] = Some(DomainSlot { domain: 1, length: 1000 });
                s
            },
            timer_irq: 1,
            start_main: false,
            tick_precision: 1,
        }
    }
}

/// Priorities of the reserved threads: idle at the very bottom, the rest at
/// the top.
fn reserved_priority(number: usize) -> Priority {
    if number == IDLE_THREAD as usize {
        Priority(255)
    } else {
        Priority(0)
    }
}

/// Builds a kernel from the blueprint. Called once per boot; configuration
/// violations halt rather than limp.
pub fn build(bp: &Blueprint) -> Kernel {
    let mut k = Kernel::new(bp.timer_irq);

    k.kip = kip::build(bp);
    kip::assert_endianness(&k.kip);

    // Domain schedule.
    let mut n = 0;
    for s in bp.schedule.iter().flatten() {
        k.sched.schedule[n] = *s;
        n += 1;
    }
    if n == 0 {
        k.sched.schedule[0] = DomainSlot { domain: 0, length: Ticks::MAX };
        n = 1;
    }
    k.sched.schedule_len = n;
    k.sched.schedule_idx = 0;
    k.sched.current_domain = k.sched.schedule[0].domain;
    k.sched.domain_time = k.sched.schedule[0].length;

    // Derivation-tree roots.
    let sysroot = k
        .registry
        .alloc(
            None,
            ObjectTag::Untyped,
            bp.system_untyped.0,
            bp.system_untyped.1,
            Payload::Untyped(UntypedState::default()),
        )
        .unwrap_or_else(|| {
            fail::die(abi::HaltReason::Panic, &"no slot for system untyped")
        });
    k.sysroot = sysroot;
    for (base, size) in bp.extra_untyped.iter().flatten() {
        if k.registry
            .alloc(
                None,
                ObjectTag::Untyped,
                *base,
                *size,
                Payload::Untyped(UntypedState::default()),
            )
            .is_none()
        {
            fail::die(abi::HaltReason::Panic, &"no slot for untyped root");
        }
    }

    k.irq_control = obj::alloc_system_object(
        &mut k,
        ObjectTag::InterruptControl,
        Payload::InterruptControl,
    )
    .unwrap_or_else(|_| {
        fail::die(abi::HaltReason::Panic, &"no interrupt-control object")
    });

    // The reserved threads. They exist from boot with version 0 and are
    // never created or destroyed by thread-control.
    for number in 1..FIRST_USER_THREAD as usize {
        let ep = obj::alloc_system_object(
            &mut k,
            ObjectTag::Endpoint,
            Payload::Endpoint(crate::ipc::Endpoint::default()),
        )
        .unwrap_or_else(|_| {
            fail::die(abi::HaltReason::Panic, &"reserved thread endpoint")
        });
        let no = obj::alloc_system_object(
            &mut k,
            ObjectTag::Notification,
            Payload::Notification(crate::notify::Notification::default()),
        )
        .unwrap_or_else(|_| {
            fail::die(abi::HaltReason::Panic, &"reserved thread notification")
        });
        let t = &mut k.threads[number];
        t.allocated = true;
        t.prio = reserved_priority(number);
        t.domain = 0;
        t.endpoint = Some(ep);
        t.notification = Some(no);
        if matches!(
            number,
            n if n == IDLE_THREAD as usize
                || n == MAIN_THREAD as usize
                || n == PRIVILEGE_THREAD as usize
        ) {
            t.options |= ThreadOptions::ESSENTIAL;
        }
        t.set_state(ThreadState::Dummy);
        t.gid = ThreadId::new(number as u32, 0);
    }

    // Elect the first thread: main if the application wants it running,
    // the idle loop otherwise.
    let first = if bp.start_main {
        MAIN_THREAD as usize
    } else {
        IDLE_THREAD as usize
    };
    k.threads[first].set_state(ThreadState::Running);
    k.sched.current = first;
    k.time.reprogram = true;

    k
}

/// Builds the standard test kernel.
#[cfg(test)]
pub fn test_kernel() -> Kernel {
    build(&Blueprint::for_tests())
}

#[cfg(test)]
impl Kernel {
    /// Creates (but does not activate) a user thread with the given
    /// priority and domain, through the real retype path.
    pub fn user_thread(&mut self, prio: u8, domain: abi::Domain) -> usize {
        let root = self.sysroot;
        let slot = obj::create_child(self, root, ObjectTag::Thread, 0)
            .expect("test kernel out of object space");
        let Payload::Thread(tid) = self.registry.slot(slot).payload else {
            unreachable!();
        };
        self.threads[tid].prio = Priority(prio);
        self.threads[tid].domain = domain;
        tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_THREADS;

    #[test]
    fn reserved_threads_exist_with_objects() {
        let k = test_kernel();
        for number in 1..FIRST_USER_THREAD as usize {
            let t = &k.threads[number];
            assert!(t.allocated, "thread {number} missing");
            assert!(t.endpoint.is_some());
            assert!(t.notification.is_some());
            assert_eq!(t.gid.version(), 0);
        }
        // Unused slots are not allocated.
        assert!(!k.threads[FIRST_USER_THREAD as usize].allocated);
        assert!(!k.threads[MAX_THREADS - 1].allocated);
    }

    #[test]
    fn idle_is_current_and_essential() {
        let k = test_kernel();
        assert_eq!(k.sched.current, IDLE_THREAD as usize);
        assert_eq!(
            k.threads[IDLE_THREAD as usize].state(),
            ThreadState::Running
        );
        assert!(k.threads[IDLE_THREAD as usize]
            .options
            .contains(ThreadOptions::ESSENTIAL));
    }

    #[test]
    fn domain_schedule_installed() {
        let k = test_kernel();
        assert_eq!(k.sched.schedule_len, 2);
        assert_eq!(k.sched.current_domain, 0);
        assert_eq!(k.sched.domain_time, 1000);
    }

    #[test]
    fn multiple_kernels_in_one_process() {
        let a = test_kernel();
        let b = test_kernel();
        assert_eq!(a.sched.current, b.sched.current);
        assert_eq!(a.registry.live_count(), b.registry.live_count());
    }
}
