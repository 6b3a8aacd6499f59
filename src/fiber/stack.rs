//! Guarded, mmap-backed fiber stacks.

use std::io;
use std::ptr;

use crate::error::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// A fiber's execution stack.
///
/// Backed by an anonymous `mmap` with one `PROT_NONE` guard page at the low
/// end (the direction a stack growing down will overflow into), so a
/// runaway fiber overflows into a `SIGSEGV` instead of corrupting whatever
/// heap allocation happened to sit below it.
pub struct Stack {
    base: *mut libc::c_void,
    mapped_len: usize,
    usable_len: usize,
}

// The raw pointer is never aliased outside this type and the memory it
// points to isn't touched except through `top()`/`Drop`.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a stack with at least `size` usable bytes, rounded up to a
    /// whole number of pages, with one unmapped guard page below it.
    pub fn new(size: usize) -> Result<Self> {
        let usable_len = round_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let mapped_len = usable_len + PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::other(io::Error::last_os_error()));
        }
        let usable_base = unsafe { base.add(PAGE_SIZE) };
        let rc =
            unsafe { libc::mprotect(usable_base, usable_len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(base, mapped_len);
            }
            return Err(Error::other(err));
        }
        Ok(Self {
            base,
            mapped_len,
            usable_len,
        })
    }

    /// The high address of the usable region, i.e. where execution should
    /// start for a stack that grows down. Always 16-byte aligned, since
    /// `mmap` hands back page-aligned memory and `usable_len` is a multiple
    /// of the page size.
    pub fn top(&self) -> *mut u8 {
        unsafe { (self.base as *mut u8).add(self.mapped_len) }
    }

    pub fn usable_len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.mapped_len);
        }
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_frees() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.usable_len() >= 64 * 1024);
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn rounds_up_to_page_size() {
        let stack = Stack::new(1).unwrap();
        assert_eq!(stack.usable_len(), PAGE_SIZE);
    }
}
