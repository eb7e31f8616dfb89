//! Register and raw-memory access the frame walker needs. Only x86_64 and
//! aarch64 are supported; everything here is compiled out elsewhere.

use std::arch::asm;

/// Read the current frame pointer (`rbp` / `x29`). Only meaningful if the
/// crate is built with frame pointers kept.
#[inline(always)]
pub fn frame_pointer() -> usize {
    let fp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        asm! {
            "mov {fp}, rbp",
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        }
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm! {
            "mov {fp}, x29",
            fp = out(reg) fp,
            options(nomem, nostack, preserves_flags),
        }
    }
    fp
}

/// Read the current stack pointer.
#[inline(always)]
pub fn stack_pointer() -> usize {
    let sp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        asm! {
            "mov {sp}, rsp",
            sp = out(reg) sp,
            options(nomem, nostack, preserves_flags),
        }
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm! {
            "mov {sp}, sp",
            sp = out(reg) sp,
            options(nomem, nostack, preserves_flags),
        }
    }
    sp
}

/// Read a single `usize` from `src`. `src` can have **no provenance**, which
/// is the whole point: frame slots are addresses we dug out of registers.
///
/// # Safety
/// - `src` must be mapped and readable. The frame walker only calls this on
///   addresses it has bounds-checked against the live stack.
///
/// # Panics
/// - In debug mode if `src` is `NULL`
/// - In debug mode if `src` is misaligned
#[inline(always)]
pub unsafe fn usize_load_acq(src: *const usize) -> usize {
    debug_assert!(!src.is_null());
    debug_assert!(src as usize % std::mem::align_of::<usize>() == 0);

    let dst: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        // x86 loads are already acquire
        asm! {
            "mov {dst}, [{src}]",
            src = in(reg) src,
            dst = out(reg) dst,
            options(nostack, preserves_flags, readonly),
        }
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm! {
            "ldar {dst}, [{src}]",
            src = in(reg) src,
            dst = out(reg) dst,
            options(nostack, preserves_flags, readonly),
        }
    }
    dst
}
