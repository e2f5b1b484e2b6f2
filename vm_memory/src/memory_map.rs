// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The guest memory table of a vhost-user connection.
//!
//! The guest hands the backend a list of regions, each a guest physical range backed by a file
//! descriptor. [`MemoryMap`] keeps those regions sorted and mapped, and translates guest
//! addresses carried in descriptors into pointers in this process.

use std::mem::size_of;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use base::IoBuf;
use base::MemoryMapping;
use base::MmapError;
use remain::sorted;
use thiserror::Error as ThisError;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::guest_address::GuestAddress;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),
    #[error("failed to map region: {0}")]
    Mapping(#[source] MmapError),
    #[error("guest range {addr}+{len:#x} is not inside a single region")]
    OutOfRange { addr: GuestAddress, len: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// One contiguous range of guest physical memory and the mapping backing it.
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    guest_base: GuestAddress,
    size: u64,
    mapping: Arc<MemoryMapping>,
    mapping_offset: usize,
}

impl MemoryRegion {
    /// Creates a region of `size` bytes at `guest_base`, backed by `mapping` starting
    /// `mapping_offset` bytes in.
    pub fn new(
        guest_base: GuestAddress,
        size: u64,
        mapping: Arc<MemoryMapping>,
        mapping_offset: usize,
    ) -> Result<MemoryRegion> {
        if size == 0 {
            return Err(Error::InvalidLayout(format!(
                "region at {} has zero size",
                guest_base
            )));
        }
        if guest_base.checked_add(size).is_none() {
            return Err(Error::InvalidLayout(format!(
                "region at {} with size {:#x} overflows",
                guest_base, size
            )));
        }
        let fits = usize::try_from(size)
            .ok()
            .and_then(|s| s.checked_add(mapping_offset))
            .map_or(false, |end| end <= mapping.size());
        if !fits {
            return Err(Error::InvalidLayout(format!(
                "region at {} with size {:#x} exceeds its {:#x} byte mapping",
                guest_base,
                size,
                mapping.size()
            )));
        }
        Ok(MemoryRegion {
            guest_base,
            size,
            mapping,
            mapping_offset,
        })
    }

    /// Creates a region backed by fresh anonymous memory.
    pub fn anonymous(guest_base: GuestAddress, size: u64) -> Result<MemoryRegion> {
        let len = usize::try_from(size).map_err(|_| {
            Error::InvalidLayout(format!("region size {:#x} exceeds address space", size))
        })?;
        let mapping = MemoryMapping::new(len).map_err(Error::Mapping)?;
        MemoryRegion::new(guest_base, size, Arc::new(mapping), 0)
    }

    /// Maps `size` bytes of `fd` at `fd_offset` as guest memory starting at `guest_base`. This is
    /// how the entries of a `SET_MEM_TABLE` message become regions.
    pub fn from_fd(
        guest_base: GuestAddress,
        size: u64,
        fd: &dyn AsRawFd,
        fd_offset: u64,
    ) -> Result<MemoryRegion> {
        let len = usize::try_from(size).map_err(|_| {
            Error::InvalidLayout(format!("region size {:#x} exceeds address space", size))
        })?;
        let mapping = MemoryMapping::from_fd(fd, len, fd_offset).map_err(Error::Mapping)?;
        MemoryRegion::new(guest_base, size, Arc::new(mapping), 0)
    }

    pub fn guest_base(&self) -> GuestAddress {
        self.guest_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// First guest address past the end of the region.
    pub fn end(&self) -> GuestAddress {
        // Overflow is rejected in `new`.
        self.guest_base.unchecked_add(self.size)
    }

    fn contains(&self, addr: GuestAddress) -> bool {
        addr >= self.guest_base && addr < self.end()
    }

    fn host_ptr(&self, addr: GuestAddress) -> *mut u8 {
        let offset = addr.offset_from(self.guest_base) as usize + self.mapping_offset;
        // SAFETY:
        // `addr` is inside the region, and `new` checked that the region fits in the mapping.
        unsafe { self.mapping.as_ptr().add(offset) }
    }
}

/// A sorted, non-overlapping set of guest memory regions.
///
/// Cloning is cheap and clones share the mappings, so in-flight requests may keep a snapshot
/// alive while the connection swaps in a new table.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    regions: Arc<[MemoryRegion]>,
}

impl MemoryMap {
    /// Builds a map from `regions`, which may be given in any order.
    pub fn new(regions: Vec<MemoryRegion>) -> Result<MemoryMap> {
        let mut map = MemoryMap::default();
        map.register(regions)?;
        Ok(map)
    }

    /// Replaces the region table. On error the previous table is left untouched.
    pub fn register(&mut self, mut regions: Vec<MemoryRegion>) -> Result<()> {
        regions.sort_by_key(|r| r.guest_base);
        for pair in regions.windows(2) {
            if pair[1].guest_base < pair[0].end() {
                return Err(Error::InvalidLayout(format!(
                    "region at {} overlaps region at {}",
                    pair[1].guest_base, pair[0].guest_base
                )));
            }
        }
        self.regions = Arc::from(regions);
        Ok(())
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Total bytes of guest memory described by the table.
    pub fn memory_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    fn find_region(&self, addr: GuestAddress) -> Option<&MemoryRegion> {
        let idx = match self.regions.binary_search_by_key(&addr, |r| r.guest_base) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let region = &self.regions[idx];
        region.contains(addr).then_some(region)
    }

    /// Translates `[addr, addr + len)` to a host pointer. The whole span must lie inside one
    /// region; a zero length only requires `addr` itself to be mapped.
    pub fn translate(&self, addr: GuestAddress, len: u64) -> Result<*mut u8> {
        let out_of_range = || Error::OutOfRange { addr, len };
        let region = self.find_region(addr).ok_or_else(out_of_range)?;
        let end = addr.checked_add(len).ok_or_else(out_of_range)?;
        if end > region.end() {
            return Err(out_of_range());
        }
        Ok(region.host_ptr(addr))
    }

    /// Returns true if `[addr, addr + len)` translates.
    pub fn is_valid_range(&self, addr: GuestAddress, len: u64) -> bool {
        self.translate(addr, len).is_ok()
    }

    /// Returns an [`IoBuf`] covering `[addr, addr + len)`.
    pub fn get_iobuf(&self, addr: GuestAddress, len: u32) -> Result<IoBuf> {
        let ptr = self.translate(addr, len as u64)?;
        Ok(IoBuf::new(ptr, len as usize))
    }

    /// Reads an object from guest memory at `addr`.
    ///
    /// Naturally aligned objects are read with a single volatile access so that ring indices are
    /// never torn.
    pub fn read_obj_from_addr<T: FromBytes>(&self, addr: GuestAddress) -> Result<T> {
        let ptr = self.translate(addr, size_of::<T>() as u64)? as *const T;
        // SAFETY:
        // `translate` guarantees `size_of::<T>()` mapped bytes at `ptr`, and `T: FromBytes`
        // accepts any bit pattern.
        let val = unsafe {
            if ptr.is_aligned() {
                std::ptr::read_volatile(ptr)
            } else {
                std::ptr::read_unaligned(ptr)
            }
        };
        Ok(val)
    }

    /// Writes `val` to guest memory at `addr`.
    pub fn write_obj_at_addr<T: IntoBytes + Immutable>(
        &self,
        val: T,
        addr: GuestAddress,
    ) -> Result<()> {
        let ptr = self.translate(addr, size_of::<T>() as u64)? as *mut T;
        // SAFETY:
        // `translate` guarantees `size_of::<T>()` mapped bytes at `ptr`.
        unsafe {
            if ptr.is_aligned() {
                std::ptr::write_volatile(ptr, val);
            } else {
                std::ptr::write_unaligned(ptr, val);
            }
        }
        Ok(())
    }

    /// Fills `buf` from guest memory at `addr`.
    pub fn read_exact_at_addr(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        let ptr = self.translate(addr, buf.len() as u64)?;
        // SAFETY:
        // `translate` guarantees `buf.len()` mapped bytes at `ptr`.
        unsafe { std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copies all of `buf` into guest memory at `addr`.
    pub fn write_all_at_addr(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        let ptr = self.translate(addr, buf.len() as u64)?;
        // SAFETY:
        // `translate` guarantees `buf.len()` mapped bytes at `ptr`.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
        Ok(())
    }
}
