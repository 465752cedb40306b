// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt object layer.
//!
//! Each IRQ line up to the platform maximum has at most one
//! interrupt-handler object binding it to a thread and an action. Binding
//! requests arrive either through the `device-binding` syscall or as IPC to
//! the reserved irq-request thread; both funnel into [`apply_binding`],
//! which mutates the table inside an IRQ-disabled critical section.
//!
//! The ISR path classifies the line (timer, signal, spurious), charges the
//! clock, and turns signal interrupts into notification signals -- masking
//! the line until the handler thread acknowledges through the irq-ack path,
//! to avoid reentry storms.

use abi::{
    DeviceBinding, Errno, IrqAction, MessageTag, ThreadId, Word,
    IRQ_CONTROL_LABEL, PRIVILEGE_THREAD, WORD_BITS,
};

use crate::config::MAX_IRQS;
use crate::err::{Fault, UsageError, UserError};
use crate::machine::Machine;
use crate::notify;
use crate::obj::{self, Payload};
use crate::state::Kernel;
use crate::sync::IrqGuard;
use crate::task;
use crate::time;

/// Per-IRQ delivery state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IrqState {
    #[default]
    Inactive,
    Signal,
    Timer,
    Reserved,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct IrqSlot {
    pub state: IrqState,
    /// Bound handler thread, for signal delivery.
    pub thread: Option<usize>,
    /// Registry slot of the interrupt-handler object.
    pub handler: Option<usize>,
}

pub struct IrqTable {
    pub slots: [IrqSlot; MAX_IRQS],
    /// The line the platform's tick source interrupts on.
    pub timer_irq: u32,
}

impl IrqTable {
    pub fn new(timer_irq: u32) -> Self {
        let mut t = Self {
            slots: [IrqSlot::default(); MAX_IRQS],
            timer_irq,
        };
        t.slots[timer_irq as usize].state = IrqState::Timer;
        t
    }
}

/// A line is inactive exactly when it has no handler or its handler was
/// disabled.
pub fn line_is_active(k: &Kernel, irq: u32) -> bool {
    k.irqs.slots[irq as usize].state != IrqState::Inactive
}

/// Applies a validated binding request. Runs under the IRQ-disabled
/// critical section; the line is masked across the change and unmasked only
/// for the enable actions.
pub fn apply_binding(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
    req: DeviceBinding,
) -> Result<(), UserError> {
    let irqn = req.irq as usize;
    if irqn == 0 || irqn >= MAX_IRQS || req.irq == k.irqs.timer_irq {
        return Err(UserError::Recoverable(Errno::INVALID_PARAM));
    }
    let action = IrqAction::try_from(req.action)
        .map_err(|_| UserError::Recoverable(Errno::INVALID_PARAM))?;

    // Only the privilege thread, or a holder of a grant on the
    // interrupt-control object, may rebind lines.
    let privileged = caller == PRIVILEGE_THREAD as usize
        || k
            .registry
            .access_validate(
                k.irq_control,
                caller,
                abi::ObjectTag::InterruptControl,
            )
            .is_ok();
    if !privileged {
        return Err(UserError::Recoverable(Errno::NO_PRIVILEGE));
    }

    let mut guard = IrqGuard::enter(m);
    guard.machine().mask_irq(req.irq);

    match action {
        IrqAction::SignalEnable | IrqAction::TimerEnable => {
            let tid = task::lookup_gid(&k.threads, req.thread)
                .map_err(UserError::Recoverable)?;
            if k.irqs.slots[irqn].state != IrqState::Inactive {
                // Rebinding an active line must go through disable first.
                return Err(UserError::Recoverable(Errno::INVALID_PARAM));
            }
            if k.irqs.slots[irqn].handler.is_none() {
                drop(guard);
                let h = obj::alloc_system_object(
                    k,
                    abi::ObjectTag::InterruptHandler,
                    Payload::InterruptHandler(req.irq),
                )?;
                k.irqs.slots[irqn].handler = Some(h);
                guard = IrqGuard::enter(m);
            }
            k.irqs.slots[irqn].thread = Some(tid);
            k.irqs.slots[irqn].state = match action {
                IrqAction::SignalEnable => IrqState::Signal,
                _ => IrqState::Timer,
            };
            guard.machine().unmask_irq(req.irq);
        }
        IrqAction::Disable => {
            k.irqs.slots[irqn].state = IrqState::Inactive;
        }
        IrqAction::Free => {
            k.irqs.slots[irqn].state = IrqState::Inactive;
            k.irqs.slots[irqn].thread = None;
            if let Some(h) = k.irqs.slots[irqn].handler.take() {
                drop(guard);
                obj::delete(k, m, h)?;
                return Ok(());
            }
        }
    }
    drop(guard);
    Ok(())
}

/// Handles an IPC-form binding request sent to the reserved irq-request
/// thread: label, then (irq, thread gid, action) in MR1..MR3.
pub fn interrupt_request(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) -> Result<(), UserError> {
    let tag = MessageTag(k.threads[caller].mr(0));
    if tag.label() != IRQ_CONTROL_LABEL {
        return Err(UserError::Unrecoverable(Fault::SyscallUsage(
            UsageError::BadKernelMessage,
        )));
    }
    let req = DeviceBinding {
        irq: k.threads[caller].mr(1) as u32,
        thread: ThreadId(k.threads[caller].mr(2) as u32),
        action: k.threads[caller].mr(3) as u32,
    };
    apply_binding(k, m, caller, req)
}

/// The irq-ack path: re-enables every line whose handler thread is the
/// caller and whose delivery completed (the ISR masked it).
pub fn interrupt_respond(
    k: &mut Kernel,
    m: &mut impl Machine,
    caller: usize,
) {
    let mut guard = IrqGuard::enter(m);
    for irq in 1..MAX_IRQS {
        let slot = &k.irqs.slots[irq];
        if slot.thread == Some(caller)
            && matches!(slot.state, IrqState::Signal | IrqState::Timer)
        {
            guard.machine().unmask_irq(irq as u32);
        }
    }
}

/// Clears a line's binding entirely; used when its handler object dies.
pub fn unbind(k: &mut Kernel, m: &mut impl Machine, irq: u32) {
    let mut guard = IrqGuard::enter(m);
    guard.machine().mask_irq(irq);
    drop(guard);
    k.irqs.slots[irq as usize] = IrqSlot::default();
}

/// The ISR entry: classify and dispatch IRQ `n`. Returns whether a
/// reschedule may be needed.
pub fn do_interrupt_service(
    k: &mut Kernel,
    m: &mut impl Machine,
    n: u32,
) -> bool {
    let idx = n as usize;
    if idx == 0 || idx >= MAX_IRQS {
        klog!(m, "irq {} above platform max, masking", n);
        m.mask_irq(n);
        return false;
    }
    match k.irqs.slots[idx].state {
        IrqState::Reserved => {
            klog!(m, "unhandled reserved irq {}", n);
            return false;
        }
        IrqState::Inactive => {
            klog!(m, "disabled irq {}, masking", n);
            m.mask_irq(n);
            return false;
        }
        _ => {}
    }

    // An ISR-path entry validates the interrupted thread's stack sentinel;
    // corruption aborts the thread, not the kernel.
    let cur = k.sched.current;
    if !k.threads[cur].sentinel_intact() {
        task::k_oops(k, m, cur, Fault::StackCheck);
    }
    if cur == abi::IDLE_THREAD as usize {
        m.idle_exit();
    }

    time::update_timestamp(k, m, true);

    if k.irqs.slots[idx].state == IrqState::Timer
        && n == k.irqs.timer_irq
    {
        // The clock handler acknowledges deadline events and leaves the
        // line enabled; reprogramming happens on the way out.
        time::clock_tick(k);
        return true;
    }

    if time::check_budget(k) {
        // Mask until the handler thread acknowledges, then deliver the
        // signal.
        m.mask_irq(n);
        let tid = k.irqs.slots[idx].thread;
        if let Some(tid) = tid {
            if k.threads[tid].state().is_ipc_blocked() {
                crate::ipc::cancel_ipc(k, tid);
            }
            if let Some(ns) = k.threads[tid].notification {
                let bit = 1usize << (idx as u32 % WORD_BITS);
                notify::send_signal(k, ns, bit as Word);
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::FakeMachine;
    use crate::startup::test_kernel;
    use abi::ThreadState;

    fn bind(k: &mut Kernel, m: &mut FakeMachine, irq: u32, tid: usize) {
        let gid = task::current_gid(&k.threads, tid);
        let req = DeviceBinding {
            irq,
            thread: gid,
            action: IrqAction::SignalEnable as u32,
        };
        apply_binding(k, m, PRIVILEGE_THREAD as usize, req).unwrap();
    }

    #[test]
    fn binding_state_machine() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let h = k.user_thread(20, 0);
        crate::task::activate(&mut k, h).unwrap();

        assert!(!line_is_active(&k, 17));
        bind(&mut k, &mut m, 17, h);
        assert!(line_is_active(&k, 17));
        assert!(!m.masked[17]);
        // Handler object exists exactly when the line is non-free.
        assert!(k.irqs.slots[17].handler.is_some());

        // Disable keeps the handler, frees the delivery.
        let gid = task::current_gid(&k.threads, h);
        apply_binding(
            &mut k,
            &mut m,
            PRIVILEGE_THREAD as usize,
            DeviceBinding {
                irq: 17,
                thread: gid,
                action: IrqAction::Disable as u32,
            },
        )
        .unwrap();
        assert!(!line_is_active(&k, 17));
        assert!(k.irqs.slots[17].handler.is_some());

        // Free destroys the handler object.
        apply_binding(
            &mut k,
            &mut m,
            PRIVILEGE_THREAD as usize,
            DeviceBinding {
                irq: 17,
                thread: gid,
                action: IrqAction::Free as u32,
            },
        )
        .unwrap();
        assert!(k.irqs.slots[17].handler.is_none());
    }

    #[test]
    fn unprivileged_binding_is_rejected() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let h = k.user_thread(20, 0);
        crate::task::activate(&mut k, h).unwrap();
        let gid = task::current_gid(&k.threads, h);
        let e = apply_binding(
            &mut k,
            &mut m,
            h,
            DeviceBinding {
                irq: 17,
                thread: gid,
                action: IrqAction::SignalEnable as u32,
            },
        )
        .unwrap_err();
        assert_eq!(e, UserError::Recoverable(Errno::NO_PRIVILEGE));
    }

    #[test]
    fn spurious_irqs_are_masked() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        m.masked[5] = false;
        assert!(!do_interrupt_service(&mut k, &mut m, 5));
        assert!(m.masked[5]);
    }

    #[test]
    fn irq_as_signal_scenario() {
        // IRQ 17 bound to H; H is notify-blocked; after the ISR the line
        // is masked, H is queued, and the set was handed into H's
        // registers.
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let h = k.user_thread(20, 0);
        crate::task::activate(&mut k, h).unwrap();
        bind(&mut k, &mut m, 17, h);

        let note = k.threads[h].notification.unwrap();
        {
            let Kernel { sched, threads, .. } = &mut k;
            crate::sched::ready_remove(sched, threads, h);
        }
        let out = notify::recv_signal(&mut k, h, note, true);
        assert_eq!(out, notify::RecvOutcome::Blocked);

        assert!(do_interrupt_service(&mut k, &mut m, 17));
        assert!(m.masked[17]);
        assert_eq!(k.threads[h].state(), ThreadState::Queued);
        assert_eq!(k.threads[h].mr(1), 1 << 17);
        assert_eq!(k.registry.notification_mut(note).bits, 0);

        // The ack path unmasks the line again.
        interrupt_respond(&mut k, &mut m, h);
        assert!(!m.masked[17]);
    }

    #[test]
    fn signal_to_ipc_blocked_thread_cancels_first() {
        let mut k = test_kernel();
        let mut m = FakeMachine::new();
        let h = k.user_thread(20, 0);
        let peer = k.user_thread(21, 0);
        crate::task::activate(&mut k, h).unwrap();
        crate::task::activate(&mut k, peer).unwrap();
        bind(&mut k, &mut m, 9, h);

        // H parks in a send to peer.
        k.sched.current = h;
        k.threads[h].set_state(ThreadState::Running);
        {
            let Kernel { sched, threads, .. } = &mut k;
            crate::sched::ready_remove(sched, threads, h);
        }
        k.threads[h].set_mr(0, MessageTag::new(0, 0, 0, 0).0);
        let peer_gid = task::current_gid(&k.threads, peer);
        crate::ipc::exchange_ipc(
            &mut k,
            &mut m,
            peer_gid,
            ThreadId::NIL,
            abi::IpcTimeout::NEVER,
            false,
        )
        .unwrap();
        assert_eq!(k.threads[h].state(), ThreadState::SendBlocked);
        k.sched.current = peer;
        k.threads[peer].set_state(ThreadState::Running);

        assert!(do_interrupt_service(&mut k, &mut m, 9));
        assert_eq!(k.threads[h].state(), ThreadState::Queued);
        assert!(k.threads[h].errno.contains(Errno::IPC_CANCELLED));
        // The signal is latched for H's next receive.
        let note = k.threads[h].notification.unwrap();
        assert_eq!(k.registry.notification_mut(note).bits, 1 << 9);
    }
}
