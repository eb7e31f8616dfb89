//! Frame-pointer stack walking. Every frame starts with the caller's frame
//! pointer, and the return address sits one word above it:
//!
//! ```plaintext
//! higher addresses
//! |  ...               |
//! | return address     | <- fp + 8
//! | caller's fp        | <- fp
//! |  locals ...        |
//! lower addresses
//! ```
//!
//! That holds for both x86_64 (`rbp`) and aarch64 (`x29`/`x30` pair). The
//! walk is only as good as the frame pointers are, so the crate is built with
//! `-C force-frame-pointers=yes`. Whatever garbage we meet, we never read
//! outside the live part of the current thread's stack.

use std::{cell::Cell, mem};

use super::{CallFrames, StackCapture};
use crate::{
    arch::mem::{frame_pointer, stack_pointer, usize_load_acq},
    util::assert::{aligned_to, within},
};

const WORD: usize = mem::size_of::<usize>();

thread_local! {
    static STACK_BOUNDS: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

#[cfg(target_os = "linux")]
fn query_stack_bounds() -> Option<(usize, usize)> {
    use std::ptr;

    // SAFETY: `attr` is initialized by `pthread_getattr_np()` before any use,
    // and destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        let lo = addr as usize;
        Some((lo, lo + size))
    }
}

#[cfg(target_os = "macos")]
fn query_stack_bounds() -> Option<(usize, usize)> {
    // SAFETY: both calls only inspect the calling thread
    unsafe {
        let thread = libc::pthread_self();
        let hi = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some((hi.checked_sub(size)?, hi))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn query_stack_bounds() -> Option<(usize, usize)> {
    None
}

/// `[lo, hi)` of the current thread's stack, looked up once per thread.
pub fn current_stack_bounds() -> Option<(usize, usize)> {
    STACK_BOUNDS
        .try_with(|bounds| {
            if let Some(cached) = bounds.get() {
                return Some(cached);
            }
            let fresh = query_stack_bounds()?;
            bounds.set(Some(fresh));
            Some(fresh)
        })
        .ok()
        .flatten()
}

/// Follow the frame chain starting at `fp`, innermost frame first, storing
/// into `frames` oldest caller first.
///
/// Stops when the next frame pointer is null, misaligned, not strictly
/// above the current one, or would put the frame record outside
/// `[lo, hi)`.
///
/// # Safety
///
/// Every word in `[lo, hi)` must be readable.
pub unsafe fn walk(mut fp: usize, lo: usize, hi: usize, frames: &mut CallFrames) {
    while fp != 0 && aligned_to(fp, WORD) && within(fp, 2 * WORD, lo, hi) {
        // SAFETY: both slots are inside `[lo, hi)`, checked just above
        let return_address = unsafe { usize_load_acq((fp + WORD) as *const usize) };
        if return_address == 0 || !frames.push(return_address) {
            break;
        }
        let next = unsafe { usize_load_acq(fp as *const usize) };
        if next <= fp {
            break;
        }
        fp = next;
    }
    frames.reverse();
}

/// Walks `rbp`/`x29` from the allocation site outwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct FramePointerCapture;

impl StackCapture for FramePointerCapture {
    #[inline(never)]
    fn capture(&self, frames: &mut CallFrames) {
        let Some((stack_lo, stack_hi)) = current_stack_bounds() else {
            return;
        };
        let fp = frame_pointer();
        // Everything below the stack pointer may be stale or unmapped
        let lo = stack_pointer().max(stack_lo);
        // SAFETY: `[sp, stack top)` is the live, mapped part of our stack
        unsafe { walk(fp, lo, stack_hi, frames) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{
        symbol::{BacktraceResolver, SymbolResolver},
        MAX_STACK_DEPTH,
    };

    struct FakeStack {
        words: Box<[usize; 16]>,
    }

    impl FakeStack {
        fn new() -> Self {
            Self {
                words: Box::new([0; 16]),
            }
        }

        fn addr(&self, index: usize) -> usize {
            &self.words[index] as *const usize as usize
        }

        fn bounds(&self) -> (usize, usize) {
            (self.addr(0), self.addr(0) + 16 * WORD)
        }

        /// A frame record at `at` pointing to `next` with return address `ret`
        fn frame(&mut self, at: usize, next: usize, ret: usize) {
            self.words[at] = next;
            self.words[at + 1] = ret;
        }
    }

    fn walk_fake(stack: &FakeStack, start: usize) -> CallFrames {
        let (lo, hi) = stack.bounds();
        let mut frames = CallFrames::new();
        unsafe { walk(stack.addr(start), lo, hi, &mut frames) };
        frames
    }

    #[test]
    fn walk_follows_chain_until_null() {
        let mut stack = FakeStack::new();
        let (b, c) = (stack.addr(6), stack.addr(10));
        stack.frame(2, b, 0x1111);
        stack.frame(6, c, 0x2222);
        stack.frame(10, 0, 0x3333);
        let frames = walk_fake(&stack, 2);
        assert_eq!(frames.as_slice(), &[0x3333, 0x2222, 0x1111]);
    }

    #[test]
    fn walk_stops_when_chain_leaves_the_stack() {
        let mut stack = FakeStack::new();
        let b = stack.addr(6);
        stack.frame(2, b, 0x1111);
        stack.frame(6, usize::MAX & !(WORD - 1), 0x2222);
        let frames = walk_fake(&stack, 2);
        assert_eq!(frames.as_slice(), &[0x2222, 0x1111]);
    }

    #[test]
    fn walk_stops_when_chain_goes_backwards() {
        let mut stack = FakeStack::new();
        let (a, b) = (stack.addr(2), stack.addr(6));
        stack.frame(2, b, 0x1111);
        stack.frame(6, a, 0x2222);
        let frames = walk_fake(&stack, 2);
        assert_eq!(frames.as_slice(), &[0x2222, 0x1111]);
    }

    #[test]
    fn walk_rejects_misaligned_and_out_of_bounds_starts() {
        let mut stack = FakeStack::new();
        stack.frame(2, 0, 0x1111);
        let (lo, hi) = stack.bounds();
        let mut frames = CallFrames::new();
        unsafe { walk(stack.addr(2) + 1, lo, hi, &mut frames) };
        assert!(frames.is_empty());
        // the record at the very last word would straddle `hi`
        unsafe { walk(stack.addr(15), lo, hi, &mut frames) };
        assert!(frames.is_empty());
    }

    #[test]
    fn real_capture_is_bounded_and_null_free() {
        #[inline(never)]
        fn nested(depth: usize, frames: &mut CallFrames) {
            if depth == 0 {
                FramePointerCapture.capture(frames);
            } else {
                nested(depth - 1, frames);
            }
        }

        let mut frames = CallFrames::new();
        nested(4, &mut frames);
        assert!(!frames.is_empty());
        assert!(frames.len() <= MAX_STACK_DEPTH);
        assert!(frames.as_slice().iter().all(|&a| a != 0));
        assert!(frames.raw()[frames.len()..].iter().all(|&a| a == 0));

        // the innermost frame returns into `nested`, which called `capture()`
        let innermost = *frames.as_slice().last().unwrap();
        let symbol = BacktraceResolver.resolve(innermost).unwrap();
        assert!(symbol.name.contains("nested"), "{}", symbol.name);
    }

    #[test]
    fn stack_bounds_contain_a_local() {
        let local = 0usize;
        if let Some((lo, hi)) = current_stack_bounds() {
            let addr = &local as *const usize as usize;
            assert!(lo <= addr && addr < hi);
        }
    }
}
