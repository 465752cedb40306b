// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and user programs.
//!
//! Everything in here is part of the system's stable surface: thread ids,
//! message register layouts, typed-item and timeout encodings, error bits,
//! syscall numbers, and the kernel info page. The kernel crate builds on
//! these; user-level runtimes are expected to vendor this crate rather than
//! re-deriving the bit positions.

#![no_std]

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Machine word, as seen in message registers and typed items.
///
/// The ABI is written for 32-bit machines with a "plus 32" widening rule
/// for 64-bit ports; using `usize` here implements that rule directly.
/// Fixed-width fields (thread ids, timeouts, KIP words) stay fixed-width
/// below.
pub type Word = usize;

/// Number of bits in a [`Word`].
pub const WORD_BITS: u32 = usize::BITS;

/// Number of logical message registers per thread. MR0 is the message tag.
pub const NUM_MESSAGE_REGISTERS: usize = 16;

/// Number of message registers banked in the TCB's callee-saved area; the
/// rest live in the user TCB page.
pub const NUM_BANKED_REGISTERS: usize = 3;

/// Number of buffer registers (typed-item receive descriptors).
pub const NUM_BUFFER_REGISTERS: usize = 8;

// --- Thread identity ------------------------------------------------------

/// Global thread id: thread number in the top 18 bits, version in the low 14.
///
/// The version counts reincarnations of a thread number, so a stale id held
/// across a partner's destruction fails validation instead of naming the
/// wrong thread.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const VERSION_BITS: u32 = 14;
    pub const NUMBER_BITS: u32 = 18;

    /// The nil thread: never valid as a partner.
    pub const NIL: Self = Self(0);
    /// Wildcard: any partner is acceptable.
    pub const ANY: Self = Self(!0);

    pub const fn new(number: u32, version: u32) -> Self {
        Self(
            (number << Self::VERSION_BITS)
                | (version & ((1 << Self::VERSION_BITS) - 1)),
        )
    }

    /// Extracts the thread number.
    pub const fn number(self) -> u32 {
        self.0 >> Self::VERSION_BITS
    }

    /// Extracts the version.
    pub const fn version(self) -> u32 {
        self.0 & ((1 << Self::VERSION_BITS) - 1)
    }

    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }

    pub const fn is_any(self) -> bool {
        self.0 == Self::ANY.0
    }
}

const_assert!(ThreadId::VERSION_BITS + ThreadId::NUMBER_BITS == 32);

/// Reserved thread numbers. User threads start at [`FIRST_USER_THREAD`].
pub const IDLE_THREAD: u32 = 1;
pub const MAIN_THREAD: u32 = 2;
pub const PRIVILEGE_THREAD: u32 = 3;
pub const SCHEDULER_THREAD: u32 = 4;
pub const SPACER_THREAD: u32 = 5;
pub const IRQ_REQUEST_THREAD: u32 = 6;
pub const IRQ_ACK_THREAD: u32 = 7;
pub const FIRST_USER_THREAD: u32 = 8;

/// Indicates priority of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Scheduling partition id. Threads run only while their domain is current.
pub type Domain = u8;

// --- Thread state ---------------------------------------------------------

bitflags::bitflags! {
    /// Boolean per-thread options.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ThreadOptions: u32 {
        /// System thread that must not abort; an abort attempt is a kernel
        /// panic instead.
        const ESSENTIAL = 1 << 0;
        /// Thread uses floating point registers.
        const FP = 1 << 1;
        /// Thread has dropped to user mode and carries the corresponding
        /// restrictions.
        const USER = 1 << 2;
    }
}

/// Lifecycle state of a thread.
///
/// `Dummy` is the initial state of a freshly retyped TCB; `activate` moves it
/// to `Queued`. The three blocked states correspond to the IPC and signal
/// rendezvous; `Restart` and `Suspended` are reachable only from `Queued`;
/// `Aborting` and `Dead` are the teardown path.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum ThreadState {
    #[default]
    Dummy,
    /// Runnable and enqueued at its (domain, priority) slot.
    Queued,
    /// Runnable and elected, but not yet running (dispatch in progress).
    Ready,
    /// The current thread on this CPU.
    Running,
    /// Blocked in the send phase of an IPC.
    SendBlocked,
    /// Blocked in the receive phase of an IPC.
    RecvBlocked,
    /// Blocked waiting on a notification.
    NotifyBlocked,
    /// Being reset to its initial SP/IP; runnable once the reset lands.
    Restart,
    Suspended,
    /// Teardown in progress.
    Aborting,
    Dead,
}

impl ThreadState {
    /// True if the scheduler may elect this thread.
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Ready | Self::Running | Self::Restart
        )
    }

    /// True for the states parked on an endpoint queue.
    pub fn is_ipc_blocked(self) -> bool {
        matches!(self, Self::SendBlocked | Self::RecvBlocked)
    }

    /// True for every state that can be cancelled back to `Queued`.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::SendBlocked | Self::RecvBlocked | Self::NotifyBlocked
        )
    }
}

// --- Kernel objects -------------------------------------------------------

/// The closed set of kernel object types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[repr(u32)]
pub enum ObjectTag {
    #[default]
    Null = 0,
    Untyped = 1,
    Thread = 2,
    SchedContext = 3,
    Endpoint = 4,
    Notification = 5,
    InterruptControl = 6,
    InterruptHandler = 7,
    CNode = 8,
    Domain = 9,
    MemoryRegion = 10,
    Reply = 11,
}

impl TryFrom<u32> for ObjectTag {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Null),
            1 => Ok(Self::Untyped),
            2 => Ok(Self::Thread),
            3 => Ok(Self::SchedContext),
            4 => Ok(Self::Endpoint),
            5 => Ok(Self::Notification),
            6 => Ok(Self::InterruptControl),
            7 => Ok(Self::InterruptHandler),
            8 => Ok(Self::CNode),
            9 => Ok(Self::Domain),
            10 => Ok(Self::MemoryRegion),
            11 => Ok(Self::Reply),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Kernel object lifecycle flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ObjectFlags: u32 {
        /// Freshly created, not yet usable.
        const INIT = 1 << 0;
        /// Storage assigned and initialized.
        const ALLOCATED = 1 << 1;
        /// Access granted to at least one thread.
        const GRANTED = 1 << 2;
        /// Owned by a kernel subsystem; not user-manipulable.
        const SUBSYSTEM = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Access rights on memory and kernel objects, `rwx` in the low bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct Rights: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        const FULL = 0b111;
    }
}

// --- Fpages ---------------------------------------------------------------

/// Base-2 logarithm of the architecture page size; the smallest fpage.
pub const PAGE_SIZE_LOG2: u8 = 10;
/// The architecture page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG2;

/// A flexible page: a naturally sized and aligned span of address space with
/// access rights, exchanged as a typed IPC item to map, grant, or unmap
/// memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fpage {
    /// Base address. Must be aligned to `1 << size_log2`.
    pub base: Word,
    /// log2 of the size in bytes.
    pub size_log2: u8,
    /// rwx access.
    pub rights: Rights,
}

impl Fpage {
    pub fn new(base: Word, size_log2: u8, rights: Rights) -> Self {
        Self {
            base,
            size_log2,
            rights,
        }
    }

    pub fn size(&self) -> Word {
        1 << self.size_log2
    }

    pub fn end(&self) -> Word {
        self.base.wrapping_add(self.size())
    }

    pub fn contains(&self, addr: Word) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Packs base and size into a single fpage word: base page number in the
    /// high bits, size-log2 in bits 4..10. The low four bits are left clear
    /// for the item encoding.
    pub fn to_word(&self) -> Word {
        (self.base & !((1 << PAGE_SIZE_LOG2) - 1))
            | ((self.size_log2 as Word) << 4)
    }

    /// Inverse of [`Self::to_word`]. Rights come from elsewhere (the second
    /// item word, or the unmap control word).
    pub fn from_word(w: Word, rights: Rights) -> Self {
        let mut size_log2 = ((w >> 4) & 0x3f) as u8;
        if size_log2 == 0 {
            size_log2 = PAGE_SIZE_LOG2;
        }
        Self {
            base: w & !((1 << PAGE_SIZE_LOG2) - 1),
            size_log2,
            rights,
        }
    }
}

// --- Message tag and typed items ------------------------------------------

/// Message flag: set by the kernel on successful delivery.
pub const IPC_FLAG_SUCCESS: Word = 0x8;
/// Message flag: sender asked for propagation.
pub const IPC_FLAG_PROPAGATE: Word = 0x1;
/// Message flag: message was redirected.
pub const IPC_FLAG_REDIRECT: Word = 0x2;
/// Message flag: message crossed CPUs.
pub const IPC_FLAG_XCPU: Word = 0x4;

/// The message tag, living in MR0: `{u:6, t:6, flags:4, label:16+}`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct MessageTag(pub Word);

impl MessageTag {
    pub fn new(untyped: usize, typed: usize, flags: Word, label: Word) -> Self {
        Self(
            (untyped as Word & 0x3f)
                | ((typed as Word & 0x3f) << 6)
                | ((flags & 0xf) << 12)
                | (label << 16),
        )
    }

    /// Number of untyped words, MR1..=u.
    pub fn untyped(self) -> usize {
        self.0 & 0x3f
    }

    /// Number of typed-item words, following the untyped words.
    pub fn typed(self) -> usize {
        (self.0 >> 6) & 0x3f
    }

    pub fn flags(self) -> Word {
        (self.0 >> 12) & 0xf
    }

    pub fn label(self) -> Word {
        self.0 >> 16
    }

    pub fn with_flags(self, flags: Word) -> Self {
        Self(self.0 | ((flags & 0xf) << 12))
    }
}

/// Typed-item encodings, in bits 0..4 of the item's first word.
///
/// String items are recognized by bit 3 being clear; the remaining encodings
/// have bit 3 set.
pub const ITEM_ENCODE_MAP: Word = 0b1000;
pub const ITEM_ENCODE_GRANT: Word = 0b1010;
pub const ITEM_ENCODE_CONTROL: Word = 0b1100;
pub const ITEM_ENCODE_RESERVED: Word = 0b1110;

/// A decoded typed item. Each item occupies two message registers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypedItem {
    /// Map the fpage into the receiver's domain at `dest_page`.
    Map { fpage_word: Word, rights: Rights, dest_page: Word },
    /// Like map, but the sender relinquishes the fpage.
    Grant { fpage_word: Word, rights: Rights, dest_page: Word },
    /// Copy `length` bytes from `ptr` in the sender's space into the
    /// receiver's matching buffer item.
    String { length: Word, ptr: Word },
    /// Write `value` under `mask` into the receiver's register window entry
    /// `id`.
    Control { id: Word, mask: Word, value: Word },
}

impl TypedItem {
    /// Decodes an item from its two words. Reserved encodings are an error.
    pub fn decode(w0: Word, w1: Word) -> Result<Self, ()> {
        if w0 & 0b1000 == 0 {
            // String items keep bit 3 clear.
            return Ok(Self::String {
                length: w0 >> 10,
                ptr: w1,
            });
        }
        match w0 & 0xf {
            ITEM_ENCODE_MAP => Ok(Self::Map {
                fpage_word: w0 & !0xf,
                rights: Rights::from_bits_truncate((w1 & 0xf) as u32),
                dest_page: w1 & !0xf,
            }),
            ITEM_ENCODE_GRANT => Ok(Self::Grant {
                fpage_word: w0 & !0xf,
                rights: Rights::from_bits_truncate((w1 & 0xf) as u32),
                dest_page: w1 & !0xf,
            }),
            ITEM_ENCODE_CONTROL => Ok(Self::Control {
                id: (w0 >> 4) & 0xff,
                mask: w0 >> 12,
                value: w1,
            }),
            _ => Err(()),
        }
    }

    /// Encodes the item back into its two words.
    pub fn encode(self) -> [Word; 2] {
        match self {
            Self::Map { fpage_word, rights, dest_page } => [
                (fpage_word & !0xf) | ITEM_ENCODE_MAP,
                (dest_page & !0xf) | rights.bits() as Word,
            ],
            Self::Grant { fpage_word, rights, dest_page } => [
                (fpage_word & !0xf) | ITEM_ENCODE_GRANT,
                (dest_page & !0xf) | rights.bits() as Word,
            ],
            Self::String { length, ptr } => [length << 10, ptr],
            Self::Control { id, mask, value } => [
                ITEM_ENCODE_CONTROL | ((id & 0xff) << 4) | (mask << 12),
                value,
            ],
        }
    }
}

// --- Timeouts -------------------------------------------------------------

/// What a decoded timeout means for a particular `now`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeoutDeadline {
    /// Block until the partner arrives or the IPC is cancelled.
    Never,
    /// Do not block at all.
    Immediate,
    /// Block until the given absolute tick.
    At(u64),
}

/// L4-style 16-bit timeout: the top bit selects relative period
/// (`2^e · m`) versus absolute point encodings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct IpcTimeout(pub u16);

impl IpcTimeout {
    /// The all-zero word: block forever.
    pub const NEVER: Self = Self(0);
    /// `period{m=0, e=1}`: do not block.
    pub const ZERO: Self = Self(1 << 10);

    pub fn is_never(self) -> bool {
        self.0 == 0
    }

    /// Resolves the encoding against the current time.
    pub fn deadline(self, now: u64) -> TimeoutDeadline {
        if self.is_never() {
            return TimeoutDeadline::Never;
        }
        let m = u64::from(self.0 & 0x3ff);
        if self.0 & (1 << 15) == 0 {
            // Relative period, e in bits 10..15.
            let e = u32::from((self.0 >> 10) & 0x1f);
            let ticks = m << e;
            if ticks == 0 {
                TimeoutDeadline::Immediate
            } else {
                TimeoutDeadline::At(now + ticks)
            }
        } else {
            // Absolute point, e in bits 11..15, carry bit at 10. The point
            // names the next instant whose clock bits [e+10 .. e+20] equal m,
            // with c disambiguating the wrap.
            let e = u32::from((self.0 >> 11) & 0xf);
            let c = u64::from((self.0 >> 10) & 1);
            let window = 1u64 << (e + 10);
            let mut at = (now & !(window - 1)) | (m << e);
            if ((now >> (e + 10)) & 1) != c {
                at = at.wrapping_add(window);
            }
            if at <= now {
                TimeoutDeadline::Immediate
            } else {
                TimeoutDeadline::At(at)
            }
        }
    }
}

// --- Errors ---------------------------------------------------------------

bitflags::bitflags! {
    /// The per-thread errno bit-set, grouped by phase: thread-control
    /// errors, scheduling errors, and IPC errors.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct Errno: u32 {
        // Thread-control family.
        const NO_PRIVILEGE = 1 << 0;
        const INVALID_THREAD = 1 << 1;
        const INVALID_SPACE = 1 << 2;
        const INVALID_SCHEDULER = 1 << 3;
        const INVALID_PARAM = 1 << 4;
        const INVALID_UTCB = 1 << 5;
        const INVALID_KIP = 1 << 6;
        const OUT_OF_MEMORY = 1 << 7;

        // Scheduling family.
        const TCR_ERROR = 1 << 8;
        const THREAD_NOT_EXIST = 1 << 9;
        const THREAD_INACTIVE = 1 << 10;
        const THREAD_RUNNING = 1 << 11;
        const THREAD_SEND_BLOCKED = 1 << 12;
        const THREAD_SENDING = 1 << 13;
        const THREAD_RECV_BLOCKED = 1 << 14;
        const THREAD_RECEIVING = 1 << 15;
        const THREAD_NOTIFY_BLOCKED = 1 << 16;

        // IPC family. SEND_PHASE/RECV_PHASE qualify the others.
        const SEND_PHASE = 1 << 17;
        const RECV_PHASE = 1 << 18;
        const IPC_TIMEOUT = 1 << 19;
        const IPC_NOT_EXIST = 1 << 20;
        const IPC_CANCELLED = 1 << 21;
        const IPC_MSG_OVERFLOW = 1 << 22;
        const XFER_TIMEOUT_INVOKER = 1 << 23;
        const XFER_TIMEOUT_PARTNER = 1 << 24;
        const IPC_ABORTED = 1 << 25;
    }
}

/// Result classification of a kernel entry, as seen by the dispatcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Exception {
    /// Completed; any results are in the caller's registers.
    None,
    /// The caller had insufficient budget or faulted; nothing ran.
    Fault,
    /// A kernel-object lookup failed structurally.
    LookupFault,
    /// The operation failed; the reason is in the caller's errno.
    SyscallError,
    /// A long operation yielded at the preemption point; the call unwound.
    Preempted,
}

/// Reasons the kernel stops the machine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HaltReason {
    CpuException,
    SpuriousIrq,
    StackCheck,
    Oops,
    Panic,
}

// --- Syscalls -------------------------------------------------------------

/// Enumeration of syscall numbers. The table is dense; holes between here
/// and [`SYSCALL_TABLE_SIZE`] are reserved and never valid.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SyscallNum {
    KernelInterface = 0,
    ExchangeIpc = 1,
    ExchangeRegisters = 2,
    ThreadControl = 3,
    ScheduleControl = 4,
    SwitchThread = 5,
    SpaceControl = 6,
    ProcessorControl = 7,
    MemoryControl = 8,
    UnmapPage = 9,
    SystemClock = 10,
    DeviceBinding = 11,
    KobjectAccessGrant = 12,
    KobjectAccessRevoke = 13,
    RetypeUntyped = 14,
    DobjectAlloc = 15,
    DobjectFree = 16,
    UprintkStringOut = 17,
}

/// Size of the dispatch table, including reserved slots.
pub const SYSCALL_TABLE_SIZE: u32 = 24;

impl TryFrom<u32> for SyscallNum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::KernelInterface),
            1 => Ok(Self::ExchangeIpc),
            2 => Ok(Self::ExchangeRegisters),
            3 => Ok(Self::ThreadControl),
            4 => Ok(Self::ScheduleControl),
            5 => Ok(Self::SwitchThread),
            6 => Ok(Self::SpaceControl),
            7 => Ok(Self::ProcessorControl),
            8 => Ok(Self::MemoryControl),
            9 => Ok(Self::UnmapPage),
            10 => Ok(Self::SystemClock),
            11 => Ok(Self::DeviceBinding),
            12 => Ok(Self::KobjectAccessGrant),
            13 => Ok(Self::KobjectAccessRevoke),
            14 => Ok(Self::RetypeUntyped),
            15 => Ok(Self::DobjectAlloc),
            16 => Ok(Self::DobjectFree),
            17 => Ok(Self::UprintkStringOut),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Control bits for `thread-control` and `exchange-registers`, selecting
    /// which fields the call sets and whether the target is
    /// activated/halted on return.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct ControlWord: u32 {
        /// H: activate the thread on return.
        const ACTIVATE = 1 << 0;
        /// R: resume (cancel an ongoing IPC).
        const RESUME = 1 << 1;
        /// S: suspend the thread.
        const SUSPEND = 1 << 2;
        /// s: set the stack pointer.
        const SP = 1 << 3;
        /// i: set the instruction pointer.
        const IP = 1 << 4;
        /// f: set the flags word.
        const FLAGS = 1 << 5;
        /// u: set the user-defined handle.
        const USER_HANDLE = 1 << 6;
        /// p: set the pager.
        const PAGER = 1 << 7;
        /// h: halt the thread.
        const HALT = 1 << 8;
        /// d: deliver old register values back to the caller.
        const DELIVER = 1 << 9;
    }
}

// --- Interrupt binding ----------------------------------------------------

/// Actions a handler binding may request for an IRQ line.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum IrqAction {
    SignalEnable = 0,
    TimerEnable = 1,
    Disable = 2,
    Free = 3,
}

impl TryFrom<u32> for IrqAction {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::SignalEnable),
            1 => Ok(Self::TimerEnable),
            2 => Ok(Self::Disable),
            3 => Ok(Self::Free),
            _ => Err(()),
        }
    }
}

/// Message label used by IPC to the irq-request thread.
pub const IRQ_CONTROL_LABEL: Word = 0x01f0;

/// Request record carried by the `device-binding` syscall and by IPC to the
/// irq-request thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// IRQ line to (re)bind.
    pub irq: u32,
    /// Global id of the handler thread.
    pub thread: ThreadId,
    /// Requested action, one of [`IrqAction`] as a raw word.
    pub action: u32,
}

// --- Kernel info page -----------------------------------------------------

/// Number of memory descriptors carried in the KIP.
pub const KIP_MEMORY_DESCS: usize = 8;
/// Number of entries in the KIP syscall jump table.
pub const KIP_SYSCALL_SLOTS: usize = 12;

/// Magic placed in `kernel_id` so a reader can tell the page is live.
pub const KERNEL_ID: u32 = 0x7e12_4e01;

/// One KIP memory descriptor; the low 6 bits of each word carry a tag.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct KipMemDesc {
    pub base: u32,
    pub size: u32,
}

/// The kernel info page, mapped read-only at a fixed user address.
///
/// All fields are fixed-width words so the page has one layout regardless of
/// the kernel's own word size.
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct KernelInfoPage {
    pub kernel_id: u32,
    /// `version:8 | subversion:8` in the low half.
    pub api_version: u32,
    /// `ww:2 | ee:2` in the top nibble: word width and endianness claims.
    pub api_flags: u32,
    /// `mem_ptr:16 | mem_num:16`: offset and count of memory descriptors.
    pub memory_info: u32,
    /// `size:6 | align:6 | mult:10` describing the UTCB area.
    pub utcb_info: u32,
    /// log2 size of the KIP area itself.
    pub kip_area_info: u32,
    /// `read_precision:16 | schedule_precision:16` in ticks.
    pub clock_info: u32,
    /// `user_base:12 | system_base:12 | thread_bits:8`.
    pub thread_info: u32,
    /// `page_size_mask:22 | rwx:3`.
    pub page_info: u32,
    /// `processors:16 | desc_size:4`.
    pub processor_info: u32,
    /// Syscall jump table.
    pub syscalls: [u32; KIP_SYSCALL_SLOTS],
    pub memory_descs: [KipMemDesc; KIP_MEMORY_DESCS],
}

impl KernelInfoPage {
    pub const API_VERSION: u32 = 0x0007_0001;

    /// Packed `api_flags` for a little-endian machine of this word size.
    pub fn native_api_flags() -> u32 {
        let ww = if WORD_BITS == 64 { 0b01 } else { 0b00 };
        let ee = if cfg!(target_endian = "big") { 0b01 } else { 0b00 };
        (ee << 30) | (ww << 28)
    }

    pub fn endianness_claim_is_big(&self) -> bool {
        (self.api_flags >> 30) & 0b11 == 0b01
    }

    pub fn pack_thread_info(
        user_base: u32,
        system_base: u32,
        thread_bits: u32,
    ) -> u32 {
        (user_base & 0xfff)
            | ((system_base & 0xfff) << 12)
            | ((thread_bits & 0xff) << 24)
    }

    pub fn pack_page_info(page_size_mask: u32, rwx: Rights) -> u32 {
        (page_size_mask & 0x3f_ffff) | (rwx.bits() << 29)
    }

    pub fn pack_memory_info(offset: u32, count: u32) -> u32 {
        (offset & 0xffff) | ((count & 0xffff) << 16)
    }

    pub fn pack_clock_info(read: u32, schedule: u32) -> u32 {
        (read & 0xffff) | ((schedule & 0xffff) << 16)
    }

    pub fn pack_processor_info(processors: u32, desc_size: u32) -> u32 {
        (processors & 0xffff) | ((desc_size & 0xf) << 16)
    }
}
