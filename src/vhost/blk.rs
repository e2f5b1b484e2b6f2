// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! virtio-blk on top of a [`BlockDevice`].

use std::mem::size_of;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::error;
use base::warn;
use remain::sorted;
use thiserror::Error as ThisError;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::bdev::check_range;
use crate::bdev::BlockDevice;
use crate::bdev::IoChannel;
use crate::bdev::IoRequest;
use crate::bdev::IoType;
use crate::bdev::SubmitError;
use crate::bdev::UnmapRange;
use crate::reactor::CoreId;
use crate::vhost::submit_io;
use crate::vhost::DeviceBackend;
use crate::vhost::DeviceType;
use crate::vhost::Error;
use crate::vhost::PendingRequest;
use crate::vhost::QueueHandler;
use crate::vhost::Rejected;
use crate::vhost::Result;
use crate::virtio::DescriptorChain;

pub const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;
const MAX_DISCARD_SECTORS: u32 = u32::MAX;
/// Data segments per request the guest may use, leaving room for header and status.
const SEG_MAX: u32 = 126;

pub const ID_LEN: usize = 20;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
pub const VIRTIO_BLK_T_DISCARD: u32 = 11;
pub const VIRTIO_BLK_T_WRITE_ZEROES: u32 = 13;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_F_SIZE_MAX: u32 = 1;
pub const VIRTIO_BLK_F_SEG_MAX: u32 = 2;
pub const VIRTIO_BLK_F_GEOMETRY: u32 = 4;
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_FLUSH: u32 = 9;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;
pub const VIRTIO_BLK_F_CONFIG_WCE: u32 = 11;
pub const VIRTIO_BLK_F_MQ: u32 = 12;
pub const VIRTIO_BLK_F_DISCARD: u32 = 13;
pub const VIRTIO_BLK_F_WRITE_ZEROES: u32 = 14;

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C, packed)]
pub struct virtio_blk_config {
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
    pub blk_size: u32,
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
    pub writeback: u8,
    pub unused0: u8,
    pub num_queues: u16,
    pub max_discard_sectors: u32,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_write_zeroes_seg: u32,
    pub write_zeroes_may_unmap: u8,
    pub unused1: [u8; 3],
}

static_assertions::assert_eq_size!(virtio_blk_config, [u8; 60]);

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_blk_req_header {
    pub req_type: u32,
    pub reserved: u32,
    pub sector: u64,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_blk_discard_write_zeroes {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}

const HEADER_LEN: usize = size_of::<virtio_blk_req_header>();
const SEGMENT_LEN: usize = size_of::<virtio_blk_discard_write_zeroes>();

#[sorted]
#[derive(ThisError, Debug)]
enum ExecuteError {
    #[error("discard segment has unsupported flags {0:#x}")]
    DiscardFlags(u32),
    #[error("{count} discard segments, at most {max} allowed")]
    DiscardSegments { count: usize, max: u32 },
    #[error("request {0} has no status byte")]
    MissingStatus(u16),
    #[error("out of range: sector {sector}, {len} bytes")]
    OutOfRange { sector: u64, len: u64 },
    #[error("device was hot-removed")]
    Removed,
    #[error("request header is {0} bytes")]
    ShortHeader(usize),
    #[error("failed to submit: {0}")]
    Submit(SubmitError),
    #[error("length {0} is not a multiple of the sector size")]
    Unaligned(u64),
    #[error("unsupported request type {0}")]
    Unsupported(u32),
}

impl ExecuteError {
    fn status(&self) -> u8 {
        match self {
            ExecuteError::Unsupported(_) => VIRTIO_BLK_S_UNSUPP,
            _ => VIRTIO_BLK_S_IOERR,
        }
    }
}

/// What a parsed request asks for.
enum BlkOp {
    /// Nothing to do; report success.
    Nop,
    GetId,
    Io(IoRequest),
}

/// virtio-blk backed by one claimed block device.
pub struct BlkBackend {
    bdev: Arc<dyn BlockDevice>,
    num_queues: usize,
    removed: Arc<AtomicBool>,
}

impl BlkBackend {
    /// Claims `bdev` and serves it over up to `num_queues` request queues.
    pub fn new(bdev: Arc<dyn BlockDevice>, num_queues: usize) -> Result<Arc<BlkBackend>> {
        let removed = Arc::new(AtomicBool::new(false));
        let flag = removed.clone();
        let name = bdev.name().to_string();
        let remove_cb = Box::new(move || {
            warn!("block device {} was hot-removed", name);
            flag.store(true, Ordering::Release);
        });
        if !bdev.claim(Some(remove_cb)) {
            return Err(Error::ClaimFailed(bdev.name().to_string()));
        }
        Ok(Arc::new(BlkBackend {
            bdev,
            num_queues: num_queues.max(1),
            removed,
        }))
    }

    pub fn bdev(&self) -> &Arc<dyn BlockDevice> {
        &self.bdev
    }

    fn build_config_space(&self) -> virtio_blk_config {
        let block_size = self.bdev.block_size();
        virtio_blk_config {
            // A tail smaller than a sector is not exposed.
            capacity: (self.bdev.size_bytes() >> SECTOR_SHIFT).to_le(),
            seg_max: SEG_MAX.to_le(),
            blk_size: block_size.to_le(),
            num_queues: (self.num_queues as u16).to_le(),
            max_discard_sectors: MAX_DISCARD_SECTORS.to_le(),
            max_discard_seg: self.bdev.max_unmap_descriptors().to_le(),
            discard_sector_alignment: (block_size >> SECTOR_SHIFT).max(1).to_le(),
            ..Default::default()
        }
    }
}

impl DeviceBackend for BlkBackend {
    fn device_type(&self) -> DeviceType {
        DeviceType::Blk
    }

    fn virtio_features(&self) -> u64 {
        1 << VIRTIO_BLK_F_SIZE_MAX
            | 1 << VIRTIO_BLK_F_SEG_MAX
            | 1 << VIRTIO_BLK_F_GEOMETRY
            | 1 << VIRTIO_BLK_F_BLK_SIZE
            | 1 << VIRTIO_BLK_F_FLUSH
            | 1 << VIRTIO_BLK_F_TOPOLOGY
            | 1 << VIRTIO_BLK_F_CONFIG_WCE
            | 1 << VIRTIO_BLK_F_MQ
            | 1 << VIRTIO_BLK_F_DISCARD
            | 1 << VIRTIO_BLK_F_WRITE_ZEROES
    }

    fn disabled_features(&self) -> u64 {
        let mut disabled = 1 << VIRTIO_BLK_F_SIZE_MAX
            | 1 << VIRTIO_BLK_F_GEOMETRY
            | 1 << VIRTIO_BLK_F_TOPOLOGY
            | 1 << VIRTIO_BLK_F_CONFIG_WCE
            | 1 << VIRTIO_BLK_F_WRITE_ZEROES;
        if !self.bdev.has_write_cache() || !self.bdev.io_type_supported(IoType::Flush) {
            disabled |= 1 << VIRTIO_BLK_F_FLUSH;
        }
        if self.bdev.max_unmap_descriptors() == 0 || !self.bdev.io_type_supported(IoType::Unmap) {
            disabled |= 1 << VIRTIO_BLK_F_DISCARD;
        }
        disabled
    }

    fn max_queues(&self) -> usize {
        self.num_queues
    }

    fn config_space(&self) -> Vec<u8> {
        self.build_config_space().as_bytes().to_vec()
    }

    fn start(&self, core: CoreId) -> anyhow::Result<Box<dyn QueueHandler>> {
        debug!("opening {} on core {}", self.bdev.name(), core);
        Ok(Box::new(BlkHandler {
            bdev: self.bdev.clone(),
            channel: self.bdev.io_channel()?,
            removed: self.removed.clone(),
        }))
    }

    fn on_remove(&self) {
        self.bdev.unclaim();
    }
}

struct BlkHandler {
    bdev: Arc<dyn BlockDevice>,
    channel: Box<dyn IoChannel>,
    removed: Arc<AtomicBool>,
}

fn complete_with_status(req: PendingRequest, status_offset: usize, status: u8, data_len: u32) {
    req.chain().write_at(status_offset, &[status]);
    req.complete(data_len + 1);
}

impl BlkHandler {
    /// Byte offset of `sector`, checking that `[offset, offset + len)` is inside the device.
    fn byte_range(&self, sector: u64, len: u64) -> std::result::Result<u64, ExecuteError> {
        if len % SECTOR_SIZE != 0 {
            return Err(ExecuteError::Unaligned(len));
        }
        let offset = sector
            .checked_mul(SECTOR_SIZE)
            .ok_or(ExecuteError::OutOfRange { sector, len })?;
        check_range(&*self.bdev, offset, len)
            .map_err(|_| ExecuteError::OutOfRange { sector, len })?;
        Ok(offset)
    }

    fn parse(
        &self,
        chain: &DescriptorChain,
        status_offset: usize,
    ) -> std::result::Result<BlkOp, ExecuteError> {
        let mut header = virtio_blk_req_header::new_zeroed();
        let n = chain.read_at(0, header.as_mut_bytes());
        if n < HEADER_LEN {
            return Err(ExecuteError::ShortHeader(n));
        }
        if self.removed.load(Ordering::Acquire) {
            return Err(ExecuteError::Removed);
        }
        let req_type = u32::from_le(header.req_type);
        let sector = u64::from_le(header.sector);

        match req_type {
            VIRTIO_BLK_T_IN => {
                let len = status_offset as u64;
                if len == 0 {
                    return Ok(BlkOp::Nop);
                }
                let offset = self.byte_range(sector, len)?;
                Ok(BlkOp::Io(IoRequest::Read {
                    offset,
                    iovs: chain.writable_iobufs(0, status_offset),
                }))
            }
            VIRTIO_BLK_T_OUT => {
                let len = chain.readable_len().saturating_sub(HEADER_LEN);
                if len == 0 {
                    return Ok(BlkOp::Nop);
                }
                let offset = self.byte_range(sector, len as u64)?;
                Ok(BlkOp::Io(IoRequest::Write {
                    offset,
                    iovs: chain.readable_iobufs(HEADER_LEN, len),
                }))
            }
            VIRTIO_BLK_T_FLUSH => Ok(BlkOp::Io(IoRequest::Flush {
                offset: 0,
                len: self.bdev.size_bytes(),
            })),
            VIRTIO_BLK_T_GET_ID => Ok(BlkOp::GetId),
            VIRTIO_BLK_T_DISCARD => {
                let count = chain.readable_len().saturating_sub(HEADER_LEN) / SEGMENT_LEN;
                let max = self.bdev.max_unmap_descriptors();
                if max == 0 {
                    return Err(ExecuteError::Unsupported(req_type));
                }
                if count > max as usize {
                    return Err(ExecuteError::DiscardSegments { count, max });
                }
                let mut ranges = Vec::with_capacity(count);
                for i in 0..count {
                    let mut seg = virtio_blk_discard_write_zeroes::new_zeroed();
                    chain.read_at(HEADER_LEN + i * SEGMENT_LEN, seg.as_mut_bytes());
                    let flags = u32::from_le(seg.flags);
                    if flags != 0 {
                        return Err(ExecuteError::DiscardFlags(flags));
                    }
                    let sector = u64::from_le(seg.sector);
                    let len = u64::from(u32::from_le(seg.num_sectors)) * SECTOR_SIZE;
                    let offset = self.byte_range(sector, len)?;
                    ranges.push(UnmapRange { offset, len });
                }
                if ranges.is_empty() {
                    return Ok(BlkOp::Nop);
                }
                Ok(BlkOp::Io(IoRequest::Unmap { ranges }))
            }
            t => Err(ExecuteError::Unsupported(t)),
        }
    }

    fn get_id(&self, chain: &DescriptorChain, status_offset: usize) -> u32 {
        let mut id = [0u8; ID_LEN];
        let name = self.bdev.name().as_bytes();
        let n = name.len().min(ID_LEN);
        id[..n].copy_from_slice(&name[..n]);
        chain.write_at(0, &id[..status_offset.min(ID_LEN)]) as u32
    }
}

impl QueueHandler for BlkHandler {
    fn handle_request(&mut self, _queue: usize, req: PendingRequest) {
        let status_offset = match req.chain().writable_len().checked_sub(1) {
            Some(offset) => offset,
            None => {
                error!("{}", ExecuteError::MissingStatus(req.chain().index()));
                req.complete(0);
                return;
            }
        };

        let op = match self.parse(req.chain(), status_offset) {
            Ok(op) => op,
            Err(e) => {
                match e {
                    ExecuteError::Unsupported(_) => debug!("{}: {}", self.bdev.name(), e),
                    _ => error!("{}: {}", self.bdev.name(), e),
                }
                complete_with_status(req, status_offset, e.status(), 0);
                return;
            }
        };

        match op {
            BlkOp::Nop => complete_with_status(req, status_offset, VIRTIO_BLK_S_OK, 0),
            BlkOp::GetId => {
                let n = self.get_id(req.chain(), status_offset);
                complete_with_status(req, status_offset, VIRTIO_BLK_S_OK, n);
            }
            BlkOp::Io(io) => {
                let data_in = match io {
                    IoRequest::Read { .. } => status_offset as u32,
                    _ => 0,
                };
                let res = submit_io(&mut *self.channel, io, req, move |req, bdev_io, ok| {
                    let (status, len) = if ok {
                        (VIRTIO_BLK_S_OK, data_in)
                    } else {
                        error!(
                            "request {} failed: {:?}",
                            req.chain().index(),
                            bdev_io.status()
                        );
                        (VIRTIO_BLK_S_IOERR, 0)
                    };
                    req.chain().write_at(status_offset, &[status]);
                    len + 1
                });
                if let Err(Rejected { error, req }) = res {
                    error!("{}: {}", self.bdev.name(), ExecuteError::Submit(error));
                    complete_with_status(req, status_offset, VIRTIO_BLK_S_IOERR, 0);
                }
            }
        }
    }

    fn poll(&mut self) -> usize {
        self.channel.poll()
    }
}
