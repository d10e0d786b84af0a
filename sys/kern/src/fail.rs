// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording kernel failures where tooling can find them.
//!
//! Binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`, false until the kernel reaches `die`
//!   (directly or through a panic). Any other value means the kernel hasn't
//!   booted, or trashed memory on the way down.
//!
//! - `KERNEL_EPITAPH` is a byte array holding as much of the failure reason
//!   as fits, as UTF-8, padded with NULs.
//!
//! On a host build there is nobody to read the epitaph, so `die` panics
//! instead, which lets tests observe fatal paths.

use core::fmt::{Display, Write};

#[cfg(target_os = "none")]
use core::sync::atomic::Ordering;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: interrupts are effectively dead by the time we get here, and
    // the flag below makes sure only one caller ever gets the buffer.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Recursive failure. Panicking again would only make it worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only the first caller gets past the flag above.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Stops the kernel, recording `msg` for debuggers.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[cfg(target_os = "none")]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    write_epitaph(begin_epitaph(), msg);

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

#[cfg(not(target_os = "none"))]
#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let mut buf = [0; EPITAPH_LEN];
    let n = write_epitaph(&mut buf, msg);
    panic!(
        "kernel died: {}",
        core::str::from_utf8(&buf[..n]).unwrap_or("<garbled>")
    );
}

/// Writes as much of `msg` into `dest` as fits, returning the byte count.
fn write_epitaph(dest: &mut [u8], msg: &dyn Display) -> usize {
    let total = dest.len();
    let mut writer = Eulogist { dest };
    write!(writer, "{msg}").ok();
    total - writer.dest.len()
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
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
    die(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epitaph_truncates() {
        let mut buf = [0u8; 8];
        let n = write_epitaph(&mut buf, &"scheduler fault 4");
        assert_eq!(n, 8);
        assert_eq!(&buf, b"schedule");
    }

    #[test]
    fn epitaph_leaves_padding() {
        let mut buf = [0u8; 8];
        let n = write_epitaph(&mut buf, &"tski");
        assert_eq!(n, 4);
        assert_eq!(&buf, b"tski\0\0\0\0");
    }

    #[test]
    #[should_panic(expected = "kernel died: isolation setup failed")]
    fn die_panics_on_host() {
        die(crate::err::KernError::Isolation)
    }
}
