// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::fd::AsRawFd;
use std::ptr::null_mut;

use remain::sorted;
use thiserror::Error as ThisError;

use crate::pagesize;

#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid argument provided when creating mapping")]
    InvalidArgument,
    #[error("requested offset is out of range of off_t")]
    InvalidOffset,
    #[error("requested offset {0:#x} is not page aligned")]
    NotPageAligned(u64),
    #[error("mmap related system call failed: {0}")]
    SystemCallFailed(#[source] crate::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// A shared, read/write mapping of memory that is unmapped on drop.
///
/// Guest RAM arrives as file descriptors in the vhost-user memory table; each region is mapped
/// with [`MemoryMapping::from_fd`]. Anonymous mappings back tests and scratch memory.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY:
// The mapping is plain memory owned by this object until drop; concurrent access through the raw
// pointer is governed by the users of `as_ptr`, just as with any shared guest memory.
unsafe impl Send for MemoryMapping {}
// SAFETY:
// See above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Creates an anonymous shared mapping of `size` bytes, zero filled.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        Self::map(size, libc::MAP_ANONYMOUS | libc::MAP_SHARED, -1, 0)
    }

    /// Maps `size` bytes of `fd` starting at `offset` with shared read/write access.
    pub fn from_fd(fd: &dyn AsRawFd, size: usize, offset: u64) -> Result<MemoryMapping> {
        if offset % pagesize() as u64 != 0 {
            return Err(Error::NotPageAligned(offset));
        }
        let offset = libc::off_t::try_from(offset).map_err(|_| Error::InvalidOffset)?;
        Self::map(size, libc::MAP_SHARED, fd.as_raw_fd(), offset)
    }

    fn map(size: usize, flags: libc::c_int, fd: libc::c_int, offset: libc::off_t) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        // SAFETY:
        // A null hint lets the kernel choose a fresh range, so no existing memory is touched; the
        // result is checked before use.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_NORESERVE,
                fd,
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::SystemCallFailed(crate::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Returns the start of the mapping in this process.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Returns the size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY:
        // `addr`/`size` describe a mapping created in `map` that nothing else unmaps.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn anonymous_is_zeroed() {
        let m = MemoryMapping::new(0x1000).unwrap();
        assert_eq!(m.size(), 0x1000);
        // SAFETY: the mapping is 0x1000 bytes long.
        let byte = unsafe { *m.as_ptr().add(0xfff) };
        assert_eq!(byte, 0);
    }

    #[test]
    fn zero_size_rejected() {
        assert!(matches!(
            MemoryMapping::new(0),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn file_backed() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0xa5; 0x2000]).unwrap();
        let m = MemoryMapping::from_fd(&file, 0x1000, pagesize() as u64).unwrap();
        // SAFETY: the mapping is 0x1000 bytes long.
        let byte = unsafe { *m.as_ptr() };
        assert_eq!(byte, 0xa5);
        assert!(matches!(
            MemoryMapping::from_fd(&file, 0x1000, 3),
            Err(Error::NotPageAligned(3))
        ));
    }
}
