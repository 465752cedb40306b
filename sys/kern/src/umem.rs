// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for safely interacting with untrusted/unprivileged/user memory.
//!
//! The only `unsafe` in the kernel proper lives here, fenced by memory
//! domain access checks: no raw access happens until the owning thread's
//! domain has vouched for the span and the requested rights.

use core::marker::PhantomData;
use zerocopy::FromBytes;

use abi::Rights;

use crate::mem::MemDomain;
use crate::task::Tcb;

/// A (user, untrusted, unprivileged) slice.
///
/// A `USlice` is passed into the kernel by a thread and is intended to refer
/// to memory that thread controls. The type itself represents only an
/// _allegation_ that a span of address space is suitable: it proves
/// alignment and non-wrapping, nothing about access. To touch the memory
/// you must go through [`copy_between`] or [`read_user_bytes`], which check
/// the thread's memory domain first.
pub struct USlice<T> {
    base_address: usize,
    /// Number of `T` elements.
    length: usize,
    _marker: PhantomData<*mut [T]>,
}

impl<T> USlice<T> {
    /// Constructs a `USlice` from untrusted base/length words.
    ///
    /// Fails if the span would wrap (or touch the top of) the address
    /// space, or if `base_address` is misaligned for `T`. Zero-sized `T` is
    /// categorically rejected.
    pub fn from_raw(
        base_address: usize,
        length: usize,
    ) -> Result<Self, ()> {
        // NOTE: the properties checked here are critical for the
        // correctness of this type. Think before loosening them.
        uassert!(core::mem::size_of::<T>() != 0);

        if base_address % core::mem::align_of::<T>() != 0 {
            return Err(());
        }
        let size_in_bytes = length
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(())?;
        // This subtraction cannot underflow: you can subtract any usize
        // from usize::MAX.
        let highest_possible_base = usize::MAX - size_in_bytes;
        if base_address <= highest_possible_base {
            Ok(Self {
                base_address,
                length,
                _marker: PhantomData,
            })
        } else {
            Err(())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn base_addr(&self) -> usize {
        self.base_address
    }

    /// Address one past the final byte; equals the base for empty slices.
    pub fn end_addr(&self) -> usize {
        // Unchecked multiply is fine: checked at construction.
        self.base_address
            .wrapping_add(self.length.wrapping_mul(core::mem::size_of::<T>()))
    }

    /// Size of the span in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.length.wrapping_mul(core::mem::size_of::<T>())
    }

    /// Checks whether this slice overlaps `other`. Empty slices alias
    /// nothing, including themselves.
    pub fn aliases(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.base_address < other.end_addr()
            && other.base_address < self.end_addr()
    }

    /// Adjusts `a` and `b` to the shorter of the two lengths, so a transfer
    /// can copy exactly the common prefix. Returns the common length.
    pub fn shorten_to_match(a: &mut Self, b: &mut Self) -> usize {
        let n = usize::min(a.length, b.length);
        a.length = n;
        b.length = n;
        n
    }
}

impl<T> Clone for USlice<T> {
    fn clone(&self) -> Self {
        Self {
            base_address: self.base_address,
            length: self.length,
            _marker: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for USlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("USlice")
            .field("base_address", &self.base_address)
            .field("length", &self.length)
            .finish()
    }
}

impl<T> kerncore::UserSlice for USlice<T> {
    fn is_empty(&self) -> bool {
        self.is_empty()
    }

    fn base_addr(&self) -> usize {
        self.base_addr()
    }

    fn end_addr(&self) -> usize {
        self.end_addr()
    }
}

/// Which side of a two-party copy faulted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CopyFault {
    pub src: bool,
    pub dst: bool,
}

/// Copies bytes between two threads' memory, checking both memory domains
/// before touching anything.
///
/// Copies `min(src.len, dst.len)` bytes and returns the count. On a domain
/// check failure nothing is copied and the offending side(s) are named in
/// the `CopyFault`. Aliasing slices are blamed on the destination, which
/// should not have designated a receive buffer in shared memory.
pub fn copy_between(
    mdomains: &mut [MemDomain],
    src_thread: &Tcb,
    mut src: USlice<u8>,
    dst_thread: &Tcb,
    mut dst: USlice<u8>,
) -> Result<usize, CopyFault> {
    let n = USlice::shorten_to_match(&mut src, &mut dst);
    if n == 0 {
        return Ok(0);
    }

    let src_ok = src_thread.mdomain.is_some_and(|d| {
        mdomains[d].can_access(src.base_addr(), n, Rights::READ)
    });
    let dst_ok = !src.aliases(&dst)
        && dst_thread.mdomain.is_some_and(|d| {
            mdomains[d].can_access(dst.base_addr(), n, Rights::WRITE)
        });

    if !src_ok || !dst_ok {
        return Err(CopyFault {
            src: !src_ok,
            dst: !dst_ok,
        });
    }

    // Safety: both domains vouched for these spans with the required
    // rights, the spans do not alias, and USlice construction ruled out
    // wrapping. The spans are plain bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.base_addr() as *const u8,
            dst.base_addr() as *mut u8,
            n,
        );
    }

    if let Some(d) = src_thread.mdomain {
        mdomains[d].mark_access(src.base_addr(), n, false);
    }
    if let Some(d) = dst_thread.mdomain {
        mdomains[d].mark_access(dst.base_addr(), n, true);
    }
    Ok(n)
}

/// Reads `dst.len()` bytes (or fewer, if the slice is shorter) out of a
/// thread's memory into a kernel buffer, after the domain check. Used for
/// argument records and the printk string path.
pub fn read_user_bytes(
    mdomains: &mut [MemDomain],
    thread: &Tcb,
    src: USlice<u8>,
    dst: &mut [u8],
) -> Result<usize, ()> {
    let n = src.len().min(dst.len());
    if n == 0 {
        return Ok(0);
    }
    let ok = thread.mdomain.is_some_and(|d| {
        mdomains[d].can_access(src.base_addr(), n, Rights::READ)
    });
    if !ok {
        return Err(());
    }
    // Safety: the domain vouched for the span; plain bytes; kernel buffer
    // is distinct by construction.
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.base_addr() as *const u8,
            dst.as_mut_ptr(),
            n,
        );
    }
    if let Some(d) = thread.mdomain {
        mdomains[d].mark_access(src.base_addr(), n, false);
    }
    Ok(n)
}

/// Reads a typed record out of user memory. The record type promises, via
/// `FromBytes`, that any byte pattern is a valid value.
pub fn read_user_struct<T: FromBytes>(
    mdomains: &mut [MemDomain],
    thread: &Tcb,
    addr: usize,
    buf: &mut [u8],
) -> Result<usize, ()> {
    let want = core::mem::size_of::<T>().min(buf.len());
    let slice = USlice::<u8>::from_raw(addr, want)?;
    read_user_bytes(mdomains, thread, slice, &mut buf[..want])
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::Fpage;
    use crate::mem::{MapStatus, Mapping};
    use crate::task::Tcb;

    fn domain_over(buf: &[u8]) -> MemDomain {
        let mut d = MemDomain::new();
        // A mapping big enough to cover the buffer wherever the allocator
        // put it.
        let log2 = (buf.len().next_power_of_two().trailing_zeros() as u8)
            .max(4);
        d.install_mapping(Mapping {
            fpage: Fpage::new(
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
    }

    #[test]
    fn uslice_rejects_wrapping() {
        assert!(USlice::<u8>::from_raw(usize::MAX - 2, 8).is_err());
        assert!(USlice::<u8>::from_raw(0x1000, 8).is_ok());
    }

    #[test]
    fn copy_checks_both_sides() {
        let src_buf = vec![7u8; 64];
        let mut dst_buf = vec![0u8; 64];
        let mut mdomains = vec![domain_over(&src_buf), domain_over(&dst_buf)];

        let mut src_t = Tcb::new(8);
        src_t.mdomain = Some(0);
        let mut dst_t = Tcb::new(9);
        dst_t.mdomain = Some(1);

        let src = USlice::from_raw(src_buf.as_ptr() as usize, 64).unwrap();
        let dst =
            USlice::from_raw(dst_buf.as_mut_ptr() as usize, 64).unwrap();
        let n =
            copy_between(&mut mdomains, &src_t, src, &dst_t, dst).unwrap();
        assert_eq!(n, 64);
        assert_eq!(dst_buf, vec![7u8; 64]);

        // A thread with no domain faults on its own side.
        let lost = Tcb::new(10);
        let src = USlice::from_raw(src_buf.as_ptr() as usize, 64).unwrap();
        let dst =
            USlice::from_raw(dst_buf.as_mut_ptr() as usize, 64).unwrap();
        let e = copy_between(&mut mdomains, &lost, src, &dst_t, dst)
            .unwrap_err();
        assert!(e.src && !e.dst);
    }

    #[test]
    fn copy_sets_status_bits() {
        let src_buf = vec![1u8; 32];
        let mut dst_buf = vec![0u8; 32];
        let mut mdomains = vec![domain_over(&src_buf), domain_over(&dst_buf)];
        let mut src_t = Tcb::new(8);
        src_t.mdomain = Some(0);
        let mut dst_t = Tcb::new(9);
        dst_t.mdomain = Some(1);

        let src = USlice::from_raw(src_buf.as_ptr() as usize, 32).unwrap();
        let dst =
            USlice::from_raw(dst_buf.as_mut_ptr() as usize, 32).unwrap();
        copy_between(&mut mdomains, &src_t, src, &dst_t, dst).unwrap();

        let s_status = mdomains[0].mappings().next().unwrap().status;
        let d_status = mdomains[1].mappings().next().unwrap().status;
        assert_eq!(s_status, MapStatus::WAS_REFERENCED);
        assert!(d_status.contains(MapStatus::WAS_WRITTEN));
    }
}
