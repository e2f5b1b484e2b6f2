// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The block-device interface that vhost devices submit guest I/O to.
//!
//! A [`BlockDevice`] is shared by every core; an [`IoChannel`] belongs to the core that opened it
//! and is only used there. Submission either fails synchronously, in which case the completion is
//! never called, or succeeds and the completion runs exactly once from a later
//! [`IoChannel::poll`] on the same core.

mod io;

use base::IoBuf;
use smallvec::SmallVec;
use thiserror::Error as ThisError;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub use self::io::BdevIo;
pub use self::io::IoStatus;
pub use self::io::ScsiStatus;
pub use self::io::NVME_SCT_GENERIC;
pub use self::io::NVME_SC_INTERNAL_DEVICE_ERROR;
pub use self::io::NVME_SC_SUCCESS;
pub use self::io::SCSI_ASC_NO_ADDITIONAL_SENSE;
pub use self::io::SCSI_SENSE_ABORTED_COMMAND;
pub use self::io::SCSI_SENSE_ILLEGAL_REQUEST;
pub use self::io::SCSI_SENSE_NO_SENSE;
pub use self::io::SCSI_STATUS_CHECK_CONDITION;
pub use self::io::SCSI_STATUS_GOOD;

/// Called once if a claimed device goes away underneath its claimant.
pub type RemoveCallback = Box<dyn FnOnce() + Send>;

/// Completion of a submitted request: the I/O handle and whether it succeeded.
pub type IoCompletion = Box<dyn FnOnce(BdevIo, bool)>;

/// Synchronous submission failure carrying a negative errno. The completion was dropped without
/// being called.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("submission failed with status {0}")]
pub struct SubmitError(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoType {
    Read,
    Write,
    Unmap,
    Flush,
    Reset,
    NvmeAdmin,
    NvmeIo,
}

/// A byte range to deallocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnmapRange {
    pub offset: u64,
    pub len: u64,
}

/// An NVMe submission queue entry passed through unmodified.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NvmeCmd {
    pub opc: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub rsvd: [u32; 2],
    pub mptr: u64,
    pub dptr: [u64; 2],
    pub cdw: [u32; 6],
}

static_assertions::assert_eq_size!(NvmeCmd, [u8; 64]);

/// A request for a block device. Offsets and lengths are in bytes and must be multiples of the
/// device's block size.
#[derive(Debug)]
pub enum IoRequest {
    Read {
        offset: u64,
        iovs: SmallVec<[IoBuf; 4]>,
    },
    Write {
        offset: u64,
        iovs: SmallVec<[IoBuf; 4]>,
    },
    Unmap {
        ranges: Vec<UnmapRange>,
    },
    Flush {
        offset: u64,
        len: u64,
    },
    Reset,
    NvmeAdmin {
        cmd: NvmeCmd,
        buf: Option<IoBuf>,
    },
    NvmeIo {
        cmd: NvmeCmd,
        buf: Option<IoBuf>,
    },
}

impl IoRequest {
    pub fn io_type(&self) -> IoType {
        match self {
            IoRequest::Read { .. } => IoType::Read,
            IoRequest::Write { .. } => IoType::Write,
            IoRequest::Unmap { .. } => IoType::Unmap,
            IoRequest::Flush { .. } => IoType::Flush,
            IoRequest::Reset => IoType::Reset,
            IoRequest::NvmeAdmin { .. } => IoType::NvmeAdmin,
            IoRequest::NvmeIo { .. } => IoType::NvmeIo,
        }
    }

    /// Number of data bytes the request moves.
    pub fn num_bytes(&self) -> u64 {
        match self {
            IoRequest::Read { iovs, .. } | IoRequest::Write { iovs, .. } => {
                iovs.iter().map(|b| b.len() as u64).sum()
            }
            IoRequest::Unmap { ranges } => ranges.iter().map(|r| r.len).sum(),
            IoRequest::Flush { len, .. } => *len,
            IoRequest::NvmeAdmin { buf, .. } | IoRequest::NvmeIo { buf, .. } => {
                buf.map_or(0, |b| b.len() as u64)
            }
            IoRequest::Reset => 0,
        }
    }
}

/// Byte and operation counters of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStat {
    pub bytes_read: u64,
    pub num_read_ops: u64,
    pub bytes_written: u64,
    pub num_write_ops: u64,
}

/// A block device that can be opened from any core.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;
    fn product_name(&self) -> &str;
    fn block_size(&self) -> u32;
    fn num_blocks(&self) -> u64;

    /// Most ranges a single unmap request may carry. Zero means unmap is unsupported.
    fn max_unmap_descriptors(&self) -> u32 {
        0
    }

    /// Required alignment of data buffers, in bytes.
    fn buf_align(&self) -> usize {
        1
    }

    fn has_write_cache(&self) -> bool;
    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Takes exclusive ownership. Returns false if somebody else holds it. `remove_cb` runs if
    /// the device is hot-removed while claimed.
    fn claim(&self, remove_cb: Option<RemoveCallback>) -> bool;

    /// Gives up a claim taken with [`BlockDevice::claim`].
    fn unclaim(&self);

    /// Opens a channel for the calling core.
    fn io_channel(&self) -> anyhow::Result<Box<dyn IoChannel>>;

    fn size_bytes(&self) -> u64 {
        self.num_blocks() * u64::from(self.block_size())
    }
}

/// A per-core submission path to a [`BlockDevice`].
pub trait IoChannel {
    /// Starts `req`. On `Ok` the completion will be called exactly once from a later
    /// [`IoChannel::poll`]; on `Err` it is dropped without being called.
    fn submit(&mut self, req: IoRequest, cb: IoCompletion) -> Result<(), SubmitError>;

    /// Delivers finished completions. Returns how many ran.
    fn poll(&mut self) -> usize;

    /// Returns the counters accumulated since the previous call and resets them.
    fn io_stat(&mut self) -> IoStat;

    fn readv(
        &mut self,
        iovs: SmallVec<[IoBuf; 4]>,
        offset: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(IoRequest::Read { offset, iovs }, cb)
    }

    fn writev(
        &mut self,
        iovs: SmallVec<[IoBuf; 4]>,
        offset: u64,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(IoRequest::Write { offset, iovs }, cb)
    }

    fn unmap(&mut self, ranges: Vec<UnmapRange>, cb: IoCompletion) -> Result<(), SubmitError> {
        self.submit(IoRequest::Unmap { ranges }, cb)
    }

    fn flush(&mut self, offset: u64, len: u64, cb: IoCompletion) -> Result<(), SubmitError> {
        self.submit(IoRequest::Flush { offset, len }, cb)
    }

    fn reset(&mut self, cb: IoCompletion) -> Result<(), SubmitError> {
        self.submit(IoRequest::Reset, cb)
    }

    fn nvme_admin_passthru(
        &mut self,
        cmd: NvmeCmd,
        buf: Option<IoBuf>,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(IoRequest::NvmeAdmin { cmd, buf }, cb)
    }

    fn nvme_io_passthru(
        &mut self,
        cmd: NvmeCmd,
        buf: Option<IoBuf>,
        cb: IoCompletion,
    ) -> Result<(), SubmitError> {
        self.submit(IoRequest::NvmeIo { cmd, buf }, cb)
    }
}

/// Checks that `[offset, offset + len)` is block aligned and inside `bdev`.
pub fn check_range(bdev: &dyn BlockDevice, offset: u64, len: u64) -> Result<(), SubmitError> {
    let block = u64::from(bdev.block_size());
    if block == 0 || offset % block != 0 || len % block != 0 {
        return Err(SubmitError(-libc::EINVAL));
    }
    match offset.checked_add(len) {
        Some(end) if end <= bdev.size_bytes() => Ok(()),
        _ => Err(SubmitError(-libc::EINVAL)),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::testing::MemBdev;

    #[test]
    fn completion_fires_once_from_poll() {
        let bdev = MemBdev::new("mem0", 512, 8);
        let mut ch = bdev.io_channel().unwrap();
        let mut data = vec![0xabu8; 1024];
        let iovs = [IoBuf::new(data.as_mut_ptr(), data.len())].into_iter().collect();
        let done = Rc::new(Cell::new(0));
        let d = done.clone();
        ch.writev(
            iovs,
            512,
            Box::new(move |io, ok| {
                assert!(ok);
                assert_eq!(io.io_type(), IoType::Write);
                io.free();
                d.set(d.get() + 1);
            }),
        )
        .unwrap();
        assert_eq!(done.get(), 0);
        assert_eq!(ch.poll(), 1);
        assert_eq!(ch.poll(), 0);
        assert_eq!(done.get(), 1);
        assert_eq!(bdev.contents(512, 1024), vec![0xab; 1024]);
    }

    #[test]
    fn rejected_submission_never_completes() {
        let bdev = MemBdev::new("mem0", 512, 8);
        bdev.state.reject.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut ch = bdev.io_channel().unwrap();
        let called = Rc::new(Cell::new(false));
        let c = called.clone();
        assert_eq!(
            ch.reset(Box::new(move |_, _| c.set(true))),
            Err(SubmitError(-libc::ENOMEM))
        );
        ch.poll();
        assert!(!called.get());
    }

    #[test]
    fn io_stat_resets_on_read() {
        let bdev = MemBdev::new("mem0", 512, 8);
        let mut ch = bdev.io_channel().unwrap();
        let mut data = vec![0u8; 512];
        for _ in 0..2 {
            let iovs = [IoBuf::new(data.as_mut_ptr(), data.len())].into_iter().collect();
            ch.readv(iovs, 0, Box::new(|io, _| io.free())).unwrap();
        }
        ch.poll();
        assert_eq!(
            ch.io_stat(),
            IoStat {
                bytes_read: 1024,
                num_read_ops: 2,
                ..Default::default()
            }
        );
        assert_eq!(ch.io_stat(), IoStat::default());
    }

    #[test]
    fn claim_is_exclusive() {
        let bdev = MemBdev::new("mem0", 512, 8);
        assert!(bdev.claim(None));
        assert!(!bdev.claim(None));
        bdev.unclaim();
        assert!(bdev.claim(None));
    }

    #[test]
    fn unsupported_passthru_fails_in_completion() {
        let bdev = MemBdev::new("mem0", 512, 8);
        assert!(!bdev.io_type_supported(IoType::NvmeIo));
        let mut ch = bdev.io_channel().unwrap();
        let status = Rc::new(Cell::new(None));
        let s = status.clone();
        ch.nvme_io_passthru(
            NvmeCmd::default(),
            None,
            Box::new(move |io, ok| {
                assert!(!ok);
                s.set(Some(io.nvme_status()));
            }),
        )
        .unwrap();
        ch.poll();
        assert_eq!(
            status.get(),
            Some((NVME_SCT_GENERIC, NVME_SC_INTERNAL_DEVICE_ERROR))
        );
    }

    #[test]
    fn range_checks() {
        let bdev = MemBdev::new("mem0", 512, 8);
        assert!(check_range(&*bdev, 0, 4096).is_ok());
        assert!(check_range(&*bdev, 512, 4096).is_err());
        assert!(check_range(&*bdev, 1, 512).is_err());
        assert!(check_range(&*bdev, u64::MAX - 511, 512).is_err());
    }

    #[test]
    fn request_sizes() {
        let req = IoRequest::Unmap {
            ranges: vec![
                UnmapRange {
                    offset: 0,
                    len: 512,
                },
                UnmapRange {
                    offset: 4096,
                    len: 1024,
                },
            ],
        };
        assert_eq!(req.io_type(), IoType::Unmap);
        assert_eq!(req.num_bytes(), 1536);
        assert_eq!(IoRequest::Reset.num_bytes(), 0);
    }
}
