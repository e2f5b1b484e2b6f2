// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtqueue descriptor chain abstraction

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use base::trace;
use base::IoBuf;
use smallvec::SmallVec;
use vm_memory::GuestAddress;
use vm_memory::MemoryMap;

/// Virtio flag indicating there is a next descriptor in descriptor chain
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// Virtio flag indicating descriptor is write-only
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// Virtio flag indicating the descriptor points at an indirect table
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// Type of access allowed for a single virtio descriptor within a descriptor chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorAccess {
    /// Descriptor is readable by the device (written by the driver before putting the descriptor
    /// chain on the available queue).
    DeviceRead,
    /// Descriptor is writable by the device (read by the driver after the device puts the
    /// descriptor chain on the used queue).
    DeviceWrite,
}

/// A single descriptor as read from the descriptor table, before translation.
pub struct Descriptor {
    pub address: u64,
    pub len: u32,
    pub access: DescriptorAccess,
}

/// Source of descriptors for [`DescriptorChain::new`].
pub trait DescriptorChainIter {
    /// Returns the next descriptor, `Ok(None)` at the end of the chain, or an error if the chain
    /// is invalid.
    fn next(&mut self) -> Result<Option<Descriptor>>;

    /// Number of descriptors returned so far.
    fn count(&self) -> u16;
}

/// One translated buffer of a descriptor chain.
#[derive(Clone, Copy, Debug)]
pub struct ChainBuffer {
    pub addr: GuestAddress,
    pub buf: IoBuf,
    pub access: DescriptorAccess,
}

/// A validated descriptor chain with every buffer translated into this process.
///
/// The chain holds a clone of the memory table it was walked with, which keeps the mappings
/// behind its buffers alive until the request is completed.
pub struct DescriptorChain {
    mem: MemoryMap,
    index: u16,
    count: u16,
    buffers: SmallVec<[ChainBuffer; 4]>,
}

impl DescriptorChain {
    /// Reads every descriptor of `chain` and translates its buffers through `mem`.
    ///
    /// Zero-length descriptors are skipped. The chain fails if any buffer is not contained in a
    /// single memory region or if the total length does not fit in a `u32`.
    pub fn new(
        mut chain: impl DescriptorChainIter,
        mem: &MemoryMap,
        index: u16,
    ) -> Result<DescriptorChain> {
        let mut buffers = SmallVec::new();
        let mut total_len: u32 = 0;

        while let Some(desc) = chain.next()? {
            if desc.len == 0 {
                trace!("skipping zero-length descriptor in chain {index}");
                continue;
            }
            total_len = total_len
                .checked_add(desc.len)
                .context("descriptor chain length overflow")?;

            let addr = GuestAddress(desc.address);
            let buf = mem.get_iobuf(addr, desc.len).with_context(|| {
                format!(
                    "descriptor address range out of bounds: addr={:#x} len={:#x}",
                    desc.address, desc.len
                )
            })?;
            buffers.push(ChainBuffer {
                addr,
                buf,
                access: desc.access,
            });
        }

        let count = chain.count();
        if count == 0 {
            bail!("empty descriptor chain");
        }

        trace!(
            "descriptor chain created, index:{index}, count:{count}, buffers:{}",
            buffers.len()
        );

        Ok(DescriptorChain {
            mem: mem.clone(),
            index,
            count,
            buffers,
        })
    }

    /// Returns the index of the first descriptor in the chain.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of descriptors walked, including skipped zero-length ones.
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn mem(&self) -> &MemoryMap {
        &self.mem
    }

    /// All buffers in the order the guest chained them.
    pub fn buffers(&self) -> &[ChainBuffer] {
        &self.buffers
    }

    pub fn readable(&self) -> impl Iterator<Item = &ChainBuffer> {
        self.buffers
            .iter()
            .filter(|b| b.access == DescriptorAccess::DeviceRead)
    }

    pub fn writable(&self) -> impl Iterator<Item = &ChainBuffer> {
        self.buffers
            .iter()
            .filter(|b| b.access == DescriptorAccess::DeviceWrite)
    }

    pub fn readable_len(&self) -> usize {
        self.readable().map(|b| b.buf.len()).sum()
    }

    pub fn writable_len(&self) -> usize {
        self.writable().map(|b| b.buf.len()).sum()
    }

    /// Copies readable bytes starting `offset` bytes into the readable area into `dst`. Returns
    /// the number of bytes copied, which is short if the readable area ends first.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for buf in slice_bufs(self.readable(), offset, dst.len()) {
            // SAFETY:
            // `self.mem` keeps the mapping behind `buf` alive.
            copied += unsafe { buf.read_into(&mut dst[copied..]) };
        }
        copied
    }

    /// Copies `src` into the writable area starting `offset` bytes in. Returns the number of
    /// bytes copied.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut copied = 0;
        for buf in slice_bufs(self.writable(), offset, src.len()) {
            // SAFETY:
            // `self.mem` keeps the mapping behind `buf` alive.
            copied += unsafe { buf.write_from(&src[copied..]) };
        }
        copied
    }

    /// Returns `len` bytes of the readable area starting at `offset` as a scatter-gather list.
    pub fn readable_iobufs(&self, offset: usize, len: usize) -> SmallVec<[IoBuf; 4]> {
        slice_bufs(self.readable(), offset, len)
    }

    /// Returns `len` bytes of the writable area starting at `offset` as a scatter-gather list.
    pub fn writable_iobufs(&self, offset: usize, len: usize) -> SmallVec<[IoBuf; 4]> {
        slice_bufs(self.writable(), offset, len)
    }
}

// Cuts the byte range `[skip, skip + take)` out of a run of buffers.
fn slice_bufs<'a>(
    bufs: impl Iterator<Item = &'a ChainBuffer>,
    mut skip: usize,
    mut take: usize,
) -> SmallVec<[IoBuf; 4]> {
    let mut out = SmallVec::new();
    for b in bufs {
        if take == 0 {
            break;
        }
        let len = b.buf.len();
        if skip >= len {
            skip -= len;
            continue;
        }
        let count = (len - skip).min(take);
        // SAFETY:
        // `skip < len`, so the new pointer stays inside the buffer.
        let ptr = unsafe { b.buf.as_ptr().add(skip) };
        out.push(IoBuf::new(ptr, count));
        take -= count;
        skip = 0;
    }
    out
}
