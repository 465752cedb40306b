// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel halts such that they can be found by
//! tooling.
//!
//! Binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`, cleared before kernel main
//!   and set if the kernel reaches `die` (explicitly or via `panic!`).
//! - `kern::fail::KERNEL_EPITAPH` is a NUL-padded byte array; `die` writes
//!   as much of the halt reason and message into it as fits.
//!
//! On the host (tests), `die` simply panics so `#[should_panic]` works.

use abi::HaltReason;
use core::fmt::Display;

/// Halts the kernel, recording `reason` and `msg`.
///
/// The default behavior locks out interrupts and spins; a port may override
/// the terminal spin by powering the system down instead, but the record
/// must be written first.
#[inline(never)]
pub fn die(reason: HaltReason, msg: &dyn Display) -> ! {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "none")] {
            use core::fmt::Write;
            let buf = begin_epitaph();
            let mut w = Eulogist { dest: buf };
            write!(w, "{reason:?}: {msg}").ok();
            loop {
                // Platform-independent NOP.
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }
        } else {
            panic!("kernel halt ({reason:?}): {msg}");
        }
    }
}

#[cfg(target_os = "none")]
mod epitaph {
    use core::sync::atomic::Ordering;

    /// Flag that gets set by all failure reporting functions, giving tools a
    /// one-stop shop for doing kernel triage.
    #[used]
    static mut KERNEL_HAS_FAILED: bool = false;

    pub const EPITAPH_LEN: usize = 128;

    #[used]
    static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

    pub fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
        // Safety: this is only reachable on the single-threaded halt path,
        // and the flag guards against reentry below.
        let previous_fail = unsafe {
            core::ptr::replace(
                core::ptr::addr_of_mut!(KERNEL_HAS_FAILED),
                true,
            )
        };
        if previous_fail {
            // A recursive halt; writing a second epitaph would only destroy
            // the first. Spin here instead.
            loop {
                core::sync::atomic::fence(Ordering::SeqCst);
            }
        }
        // Safety: only one execution gets past the flag above.
        unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
    }
}

#[cfg(target_os = "none")]
use epitaph::begin_epitaph;

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl core::fmt::Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(HaltReason::Panic, info)
}
