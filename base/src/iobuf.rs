// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`IoBuf`], an `iovec` that may point into guest memory.

use std::fmt;
use std::fmt::Debug;
use std::ptr;

/// A pointer/length pair that is ABI-compatible with `libc::iovec`.
///
/// It deliberately does not deref to a slice: the memory usually belongs to the guest, which may
/// change it at any time, so forming a Rust reference to it would be unsound. Copies go through
/// the `unsafe` helpers below instead.
#[derive(Copy, Clone)]
#[repr(transparent)]
pub struct IoBuf {
    iov: libc::iovec,
}

// SAFETY:
// Same reasoning as `std::io::IoSliceMut`: a pointer and a length may cross threads, and
// dereferencing requires `unsafe` anyway.
unsafe impl Send for IoBuf {}
// SAFETY:
// See above.
unsafe impl Sync for IoBuf {}

impl IoBuf {
    pub fn new(ptr: *mut u8, len: usize) -> IoBuf {
        IoBuf {
            iov: libc::iovec {
                iov_base: ptr as *mut libc::c_void,
                iov_len: len,
            },
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.iov.iov_base as *mut u8
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.iov.iov_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies up to `self.len()` bytes from `src` into the buffer, returning the count copied.
    ///
    /// # Safety
    ///
    /// The buffer must still point at live memory valid for writes of `self.len()` bytes.
    pub unsafe fn write_from(&self, src: &[u8]) -> usize {
        let count = src.len().min(self.len());
        ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr(), count);
        count
    }

    /// Copies up to `self.len()` bytes from the buffer into `dst`, returning the count copied.
    ///
    /// # Safety
    ///
    /// The buffer must still point at live memory valid for reads of `self.len()` bytes.
    pub unsafe fn read_into(&self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len());
        ptr::copy_nonoverlapping(self.as_ptr(), dst.as_mut_ptr(), count);
        count
    }

    /// Returns the raw `iovec`, for handing to syscalls such as `preadv`.
    pub fn as_iovec(&self) -> &libc::iovec {
        &self.iov
    }
}

impl Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
