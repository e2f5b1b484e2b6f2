// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test fixtures: a guest-side virtqueue driver and an in-memory block device.

use std::collections::VecDeque;
use std::num::Wrapping;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::IoBuf;
use sync::Mutex;
use vm_memory::GuestAddress;
use vm_memory::MemoryMap;
use vm_memory::MemoryRegion;

use crate::bdev::BdevIo;
use crate::bdev::BlockDevice;
use crate::bdev::IoChannel;
use crate::bdev::IoCompletion;
use crate::bdev::IoRequest;
use crate::bdev::IoStat;
use crate::bdev::IoStatus;
use crate::bdev::IoType;
use crate::bdev::RemoveCallback;
use crate::bdev::SubmitError;
use crate::virtio::Desc;
use crate::virtio::QueueConfig;
use crate::virtio::VIRTQ_DESC_F_NEXT;
use crate::virtio::VIRTQ_DESC_F_WRITE;

const GUEST_MEMORY_SIZE: u64 = 0x10_0000;
const DESC_OFFSET: u64 = 0x0;
const AVAIL_OFFSET: u64 = 0x4000;
const USED_OFFSET: u64 = 0x5000;
const DATA_OFFSET: u64 = 0x10000;

/// Plays the guest side of one split virtqueue in a private 1 MiB guest memory.
pub struct GuestDriver {
    pub mem: MemoryMap,
    pub size: u16,
    pub desc_table: GuestAddress,
    pub avail_ring: GuestAddress,
    pub used_ring: GuestAddress,
    avail_idx: Wrapping<u16>,
    next_desc: u16,
    next_data: u64,
}

impl GuestDriver {
    pub fn new(size: u16) -> GuestDriver {
        assert!(size <= 1024);
        let mem = MemoryMap::new(vec![
            MemoryRegion::anonymous(GuestAddress(0), GUEST_MEMORY_SIZE).unwrap()
        ])
        .unwrap();
        GuestDriver::with_memory(mem, GuestAddress(0), size)
    }

    /// Lays the rings out at `base` inside an existing memory map, so several queues can share
    /// one guest.
    pub fn with_memory(mem: MemoryMap, base: GuestAddress, size: u16) -> GuestDriver {
        GuestDriver {
            mem,
            size,
            desc_table: base.unchecked_add(DESC_OFFSET),
            avail_ring: base.unchecked_add(AVAIL_OFFSET),
            used_ring: base.unchecked_add(USED_OFFSET),
            avail_idx: Wrapping(0),
            next_desc: 0,
            next_data: base.offset() + DATA_OFFSET,
        }
    }

    /// A queue configuration matching this driver's layout.
    pub fn queue_config(&self, features: u64) -> QueueConfig {
        let mut cfg = QueueConfig::new(self.size);
        cfg.set_size(self.size);
        cfg.set_desc_table(self.desc_table);
        cfg.set_avail_ring(self.avail_ring);
        cfg.set_used_ring(self.used_ring);
        cfg.ack_features(features);
        cfg
    }

    /// Hands out `len` bytes of zeroed guest memory.
    pub fn alloc(&mut self, len: u64) -> GuestAddress {
        let addr = GuestAddress(self.next_data);
        self.next_data = (self.next_data + len + 7) & !7;
        addr
    }

    pub fn write_desc(&mut self, index: u16, addr: GuestAddress, len: u32, flags: u16, next: u16) {
        let desc = Desc {
            addr: addr.offset().to_le(),
            len: len.to_le(),
            flags: flags.to_le(),
            next: next.to_le(),
        };
        self.mem
            .write_obj_at_addr(desc, self.desc_table.unchecked_add(u64::from(index) * 16))
            .unwrap();
    }

    /// Writes a chain of `(addr, len, device_writable)` buffers into consecutive descriptor slots
    /// and returns its head. The chain is not published.
    pub fn add_chain(&mut self, bufs: &[(GuestAddress, u32, bool)]) -> u16 {
        let head = self.next_desc;
        for (i, &(addr, len, writable)) in bufs.iter().enumerate() {
            let index = self.next_desc;
            self.next_desc = (self.next_desc + 1) % self.size;
            let mut flags = if writable {
                VIRTQ_DESC_F_WRITE
            } else {
                0
            };
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_desc(index, addr, len, flags, self.next_desc);
        }
        head
    }

    /// Places `head` in the available ring and bumps the available index.
    pub fn publish(&mut self, head: u16) {
        let slot = u64::from(self.avail_idx.0 & (self.size - 1));
        self.mem
            .write_obj_at_addr(head.to_le(), self.avail_ring.unchecked_add(4 + slot * 2))
            .unwrap();
        fence(Ordering::Release);
        self.avail_idx += Wrapping(1);
        self.set_avail_idx(self.avail_idx.0);
    }

    pub fn set_avail_idx(&mut self, idx: u16) {
        self.avail_idx = Wrapping(idx);
        self.mem
            .write_obj_at_addr(idx.to_le(), self.avail_ring.unchecked_add(2))
            .unwrap();
    }

    pub fn set_avail_flags(&mut self, flags: u16) {
        self.mem
            .write_obj_at_addr(flags.to_le(), self.avail_ring)
            .unwrap();
    }

    pub fn set_used_event(&mut self, idx: u16) {
        let addr = self.avail_ring.unchecked_add(4 + 2 * u64::from(self.size));
        self.mem.write_obj_at_addr(idx.to_le(), addr).unwrap();
    }

    pub fn used_flags(&self) -> u16 {
        u16::from_le(self.mem.read_obj_from_addr(self.used_ring).unwrap())
    }

    pub fn used_idx(&self) -> u16 {
        let idx: u16 = self
            .mem
            .read_obj_from_addr(self.used_ring.unchecked_add(2))
            .unwrap();
        fence(Ordering::Acquire);
        u16::from_le(idx)
    }

    /// Returns `(id, len)` of used ring entry `n` (not wrapped).
    pub fn used_elem(&self, n: u16) -> (u32, u32) {
        let slot = u64::from(n & (self.size - 1));
        let base = self.used_ring.unchecked_add(4 + slot * 8);
        let id: u32 = self.mem.read_obj_from_addr(base).unwrap();
        let len: u32 = self.mem.read_obj_from_addr(base.unchecked_add(4)).unwrap();
        (u32::from_le(id), u32::from_le(len))
    }

    pub fn avail_event(&self) -> u16 {
        let addr = self.used_ring.unchecked_add(4 + 8 * u64::from(self.size));
        u16::from_le(self.mem.read_obj_from_addr(addr).unwrap())
    }
}

/// Shared switches and counters of a [`MemBdev`].
#[derive(Default)]
pub struct MemBdevState {
    /// While set, completions are queued but not delivered by `poll`.
    pub hold: AtomicBool,
    /// Forces every submission to fail with `-ENOMEM`.
    pub reject: AtomicBool,
    /// Completes every request with a failure status.
    pub fail: AtomicBool,
    pub claimed: AtomicBool,
    remove_cb: Mutex<Option<RemoveCallback>>,
    stat: Mutex<IoStat>,
}

/// A RAM-backed block device whose completions are delivered from `IoChannel::poll`.
pub struct MemBdev {
    name: String,
    block_size: u32,
    data: Arc<Mutex<Vec<u8>>>,
    pub state: Arc<MemBdevState>,
}

impl MemBdev {
    pub fn new(name: &str, block_size: u32, num_blocks: u64) -> Arc<MemBdev> {
        Arc::new(MemBdev {
            name: name.to_string(),
            block_size,
            data: Arc::new(Mutex::new(vec![0; (block_size as u64 * num_blocks) as usize])),
            state: Arc::new(MemBdevState::default()),
        })
    }

    pub fn contents(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    pub fn fill(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Simulates hot removal of the underlying device.
    pub fn hot_remove(&self) {
        if let Some(cb) = self.state.remove_cb.lock().take() {
            cb();
        }
    }
}

impl BlockDevice for MemBdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Memory Disk"
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.data.lock().len() as u64 / u64::from(self.block_size)
    }

    fn max_unmap_descriptors(&self) -> u32 {
        8
    }

    fn has_write_cache(&self) -> bool {
        true
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        !matches!(io_type, IoType::NvmeAdmin | IoType::NvmeIo)
    }

    fn claim(&self, remove_cb: Option<RemoveCallback>) -> bool {
        if self.state.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.remove_cb.lock() = remove_cb;
        true
    }

    fn unclaim(&self) {
        self.state.remove_cb.lock().take();
        self.state.claimed.store(false, Ordering::Release);
    }

    fn io_channel(&self) -> anyhow::Result<Box<dyn IoChannel>> {
        Ok(Box::new(MemChannel {
            data: self.data.clone(),
            state: self.state.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct MemChannel {
    data: Arc<Mutex<Vec<u8>>>,
    state: Arc<MemBdevState>,
    pending: VecDeque<(BdevIo, IoCompletion)>,
}

impl MemChannel {
    fn execute(&self, req: &IoRequest) -> bool {
        let mut data = self.data.lock();
        let size = data.len() as u64;
        let in_range = |offset: u64, len: u64| {
            offset
                .checked_add(len)
                .map_or(false, |end| end <= size)
        };
        match req {
            IoRequest::Read { offset, iovs } => {
                let len = iovs.iter().map(IoBuf::len).sum::<usize>() as u64;
                if !in_range(*offset, len) {
                    return false;
                }
                let mut pos = *offset as usize;
                for iov in iovs {
                    // SAFETY: test guest memory outlives the request.
                    pos += unsafe { iov.write_from(&data[pos..]) };
                }
                true
            }
            IoRequest::Write { offset, iovs } => {
                let len = iovs.iter().map(IoBuf::len).sum::<usize>() as u64;
                if !in_range(*offset, len) {
                    return false;
                }
                let mut pos = *offset as usize;
                for iov in iovs {
                    let end = pos + iov.len();
                    // SAFETY: test guest memory outlives the request.
                    pos += unsafe { iov.read_into(&mut data[pos..end]) };
                }
                true
            }
            IoRequest::Unmap { ranges } => {
                for r in ranges {
                    if !in_range(r.offset, r.len) {
                        return false;
                    }
                    data[r.offset as usize..(r.offset + r.len) as usize].fill(0);
                }
                true
            }
            IoRequest::Flush { offset, len } => in_range(*offset, *len),
            IoRequest::Reset => true,
            IoRequest::NvmeAdmin { .. } | IoRequest::NvmeIo { .. } => false,
        }
    }
}

impl IoChannel for MemChannel {
    fn submit(&mut self, req: IoRequest, cb: IoCompletion) -> Result<(), SubmitError> {
        if self.state.reject.load(Ordering::Acquire) {
            return Err(SubmitError(-libc::ENOMEM));
        }
        let io_type = req.io_type();
        let ok = !self.state.fail.load(Ordering::Acquire) && self.execute(&req);
        {
            let mut stat = self.state.stat.lock();
            match &req {
                IoRequest::Read { iovs, .. } => {
                    stat.bytes_read += iovs.iter().map(IoBuf::len).sum::<usize>() as u64;
                    stat.num_read_ops += 1;
                }
                IoRequest::Write { iovs, .. } => {
                    stat.bytes_written += iovs.iter().map(IoBuf::len).sum::<usize>() as u64;
                    stat.num_write_ops += 1;
                }
                _ => {}
            }
        }
        let status = if ok {
            IoStatus::Success
        } else {
            IoStatus::Failed
        };
        self.pending.push_back((BdevIo::new(io_type, status), cb));
        Ok(())
    }

    fn poll(&mut self) -> usize {
        if self.state.hold.load(Ordering::Acquire) {
            return 0;
        }
        let mut n = 0;
        while let Some((io, cb)) = self.pending.pop_front() {
            let success = io.status().is_success();
            cb(io, success);
            n += 1;
        }
        n
    }

    fn io_stat(&mut self) -> IoStat {
        std::mem::take(&mut *self.state.stat.lock())
    }
}
