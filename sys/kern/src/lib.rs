// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! tern kernel.
//!
//! This is the architecture-independent core of the kernel: kernel-object
//! registry and derivation tree, memory domains, thread lifecycle, the
//! sporadic-server scheduler, synchronous IPC, notifications, the interrupt
//! object layer, timekeeping, and syscall dispatch.
//!
//! # Design principles
//!
//! 1. Static configuration. The system takes a single shape specified at
//!    compile time (`config`), instantiated from a [`startup::Blueprint`].
//! 2. No hidden globals. All kernel state lives in [`state::Kernel`], and
//!    every entry point takes it explicitly, together with the machine port.
//!    An architecture layer may stash the kernel behind a per-CPU pointer,
//!    but nothing in here relies on that, which is what lets the test suite
//!    run several kernels in one process.
//! 3. A strong preference for safe code. The remaining `unsafe` is confined
//!    to the user-memory shim, where it is fenced by domain access checks.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.
//!
//! The hardware side of the world -- context frames, vector tables, the MPU,
//! the tick source -- lives behind the [`machine::Machine`] trait and is
//! provided by a port crate.

#![cfg_attr(target_os = "none", no_std)]

/// Kernel-internal assertion, used where a failure indicates a kernel bug
/// rather than bad user input.
macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Diagnostic output through the machine port's printk byte channel. Not an
/// IPC channel; strictly out-of-band.
macro_rules! klog {
    ($m:expr, $($args:tt)*) => {{
        use core::fmt::Write;
        let mut w = $crate::machine::Printk(&mut *$m);
        writeln!(w, $($args)*).ok();
    }};
}

pub mod config;
pub mod err;
pub mod fail;
pub mod ipc;
pub mod irq;
pub mod kip;
pub mod machine;
pub mod mem;
pub mod notify;
pub mod obj;
pub mod sched;
pub mod sporadic;
pub mod startup;
pub mod state;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod umem;
pub mod util;
