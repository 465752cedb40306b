// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel code spends too much time handling and recording errors; this
//! module separates that concern using `Result`. Syscall implementations
//! return [`UserError`], and a single discharge site in the dispatcher turns
//! that into errno bits, a dead thread, or an unwound preempted call.

use abi::{Errno, Word};

/// An offense serious enough to kill the offending thread (the "k-oops"
/// path). Memory faults during user *copies* are not in this set -- those
/// surface as errno bits per the error design. The first two variants are
/// raised by the port's catch-exception hook when user code traps.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fault {
    /// User code tripped the MPU or took a bus error.
    MemoryAccess { address: Option<Word> },
    /// The thread misused the syscall interface in a way that has no errno.
    SyscallUsage(UsageError),
    /// The thread's stack sentinel was corrupted.
    StackCheck,
    /// Another thread injected the fault.
    Injected,
}

/// Unrecoverable interface misuse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UsageError {
    /// Undefined or reserved opcode; the dispatch table has no holes that
    /// are ever valid.
    BadSyscallNumber,
    /// A message to a reserved kernel thread didn't parse.
    BadKernelMessage,
}

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// Recoverable: the bits are ORed into the caller's errno and the call
    /// returns `syscall-error`.
    Recoverable(Errno),
    /// Unrecoverable: the caller is killed.
    Unrecoverable(Fault),
    /// A kernel-object lookup failed structurally; the call returns
    /// `lookup-fault` without touching errno.
    Lookup,
    /// A long operation yielded at the preemption point; the call unwinds
    /// to the dispatcher, which re-enters the scheduler.
    Preempted,
}

impl From<Fault> for UserError {
    fn from(f: Fault) -> Self {
        Self::Unrecoverable(f)
    }
}

impl From<UsageError> for UserError {
    fn from(e: UsageError) -> Self {
        Self::Unrecoverable(Fault::SyscallUsage(e))
    }
}

impl From<Errno> for UserError {
    fn from(e: Errno) -> Self {
        Self::Recoverable(e)
    }
}

