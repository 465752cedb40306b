// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel info page assembly.
//!
//! The KIP is a read-only page mapped at a fixed address in every user
//! space, describing the kernel's ABI: versions, word size and endianness,
//! thread-number layout, page sizes, the syscall jump table, and the memory
//! descriptors. The page itself is a wire-safe struct (`abi`); this module
//! fills it in from the blueprint and sanity-checks the claims at boot.

use abi::{
    HaltReason, KernelInfoPage, KipMemDesc, Rights, ThreadId,
    FIRST_USER_THREAD, KERNEL_ID, KIP_SYSCALL_SLOTS, PAGE_SIZE_LOG2,
};
use byteorder::{ByteOrder, LittleEndian};

use crate::fail;
use crate::startup::Blueprint;

/// Memory-descriptor tag bits, carried in the low bits of each word.
pub const MEMDESC_CONVENTIONAL: u32 = 0x1;
pub const MEMDESC_RESERVED: u32 = 0x2;

pub fn build(bp: &Blueprint) -> KernelInfoPage {
    let mut kip = KernelInfoPage {
        kernel_id: KERNEL_ID,
        api_version: KernelInfoPage::API_VERSION,
        api_flags: KernelInfoPage::native_api_flags(),
        memory_info: 0,
        // UTCB: 512-byte records, 512-byte aligned, one per thread.
        utcb_info: (9 << 10) | (9 << 4) | 1,
        // The KIP area itself is one 4 KiB page.
        kip_area_info: 12,
        clock_info: KernelInfoPage::pack_clock_info(
            bp.tick_precision,
            bp.tick_precision,
        ),
        thread_info: KernelInfoPage::pack_thread_info(
            FIRST_USER_THREAD,
            1,
            ThreadId::NUMBER_BITS,
        ),
        // Pages from the base size up through 1 MiB.
        page_info: KernelInfoPage::pack_page_info(
            0x7ff << (PAGE_SIZE_LOG2 - 10),
            Rights::FULL,
        ),
        processor_info: KernelInfoPage::pack_processor_info(1, 4),
        syscalls: [0; KIP_SYSCALL_SLOTS],
        memory_descs: [KipMemDesc::default(); abi::KIP_MEMORY_DESCS],
    };

    // The jump table is patched with real stub addresses by the port at
    // link time; the slot index doubles as the opcode until then.
    for (i, slot) in kip.syscalls.iter_mut().enumerate() {
        *slot = i as u32;
    }

    let mut n = 0;
    kip.memory_descs[n] = KipMemDesc {
        base: bp.ram.0 as u32 | MEMDESC_CONVENTIONAL,
        size: bp.ram.1 as u32,
    };
    n += 1;
    for (base, size) in bp.kernel_regions.iter().flatten() {
        if n == kip.memory_descs.len() {
            break;
        }
        kip.memory_descs[n] = KipMemDesc {
            base: *base as u32 | MEMDESC_RESERVED,
            size: *size as u32,
        };
        n += 1;
    }
    kip.memory_info = KernelInfoPage::pack_memory_info(
        core::mem::offset_of!(KernelInfoPage, memory_descs) as u32,
        n as u32,
    );
    kip
}

/// The tag and typed-item bitfields are specified little-endian-first; the
/// KIP claims an endianness, but nothing at runtime ever re-checked it in
/// the original. Do it once at boot: a port that lies about endianness
/// would corrupt every message tag.
pub fn assert_endianness(kip: &KernelInfoPage) {
    let bytes = kip.api_flags.to_ne_bytes();
    let machine_is_big = LittleEndian::read_u32(&bytes) != kip.api_flags;
    if machine_is_big != kip.endianness_claim_is_big() {
        fail::die(
            HaltReason::Panic,
            &"kip endianness claim does not match the machine",
        );
    }
}
