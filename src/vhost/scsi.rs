// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! virtio-scsi controller with up to [`SCSI_CTRLR_MAX_DEVS`] targets.
//!
//! The controller parses virtio-scsi framing and addresses targets. What a CDB means is up to the
//! [`ScsiTarget`] attached to the slot; it either answers right away or names a block request to
//! run against the target's block device.

use std::cell::Cell;
use std::mem::size_of;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use base::debug;
use base::error;
use base::info;
use base::warn;
use remain::sorted;
use sync::Mutex;
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
use crate::bdev::ScsiStatus;
use crate::bdev::UnmapRange;
use crate::bdev::SCSI_SENSE_ABORTED_COMMAND;
use crate::bdev::SCSI_SENSE_ILLEGAL_REQUEST;
use crate::bdev::SCSI_STATUS_CHECK_CONDITION;
use crate::reactor::CoreId;
use crate::vhost::submit_io;
use crate::vhost::DeviceBackend;
use crate::vhost::DeviceType;
use crate::vhost::Error;
use crate::vhost::PendingRequest;
use crate::vhost::QueueHandler;
use crate::vhost::Rejected;
use crate::vhost::Result;

/// Targets per controller.
pub const SCSI_CTRLR_MAX_DEVS: usize = 8;

pub const CONTROL_QUEUE: usize = 0;
pub const EVENT_QUEUE: usize = 1;
// One controlq, one eventq and at least one request queue.
const MINIMUM_NUM_QUEUES: usize = 3;

const MAX_CMD_PER_LUN: u32 = 128;
const MAX_SECTORS: u32 = 0xffff;
const SEG_MAX: u32 = 126;
const MAX_LUN: u32 = 16383;

pub const VIRTIO_SCSI_CDB_DEFAULT_SIZE: usize = 32;
pub const VIRTIO_SCSI_SENSE_DEFAULT_SIZE: usize = 96;

pub const VIRTIO_SCSI_F_INOUT: u32 = 0;
pub const VIRTIO_SCSI_F_HOTPLUG: u32 = 1;
pub const VIRTIO_SCSI_F_CHANGE: u32 = 2;
pub const VIRTIO_SCSI_F_T10_PI: u32 = 3;

pub const VIRTIO_SCSI_T_TMF: u32 = 0;
pub const VIRTIO_SCSI_T_AN_QUERY: u32 = 1;
pub const VIRTIO_SCSI_T_AN_SUBSCRIBE: u32 = 2;

pub const VIRTIO_SCSI_S_OK: u8 = 0;
pub const VIRTIO_SCSI_S_BAD_TARGET: u8 = 3;
pub const VIRTIO_SCSI_S_FAILURE: u8 = 9;
pub const VIRTIO_SCSI_S_FUNCTION_REJECTED: u8 = 11;

#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_scsi_cmd_req {
    pub lun: [u8; 8],
    pub tag: [u8; 8],
    pub task_attr: u8,
    pub prio: u8,
    pub crn: u8,
    pub cdb: [u8; VIRTIO_SCSI_CDB_DEFAULT_SIZE],
}

#[derive(Copy, Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_scsi_cmd_resp {
    pub sense_len: u32,
    pub resid: u32,
    pub status_qualifier: u16,
    pub status: u8,
    pub response: u8,
    pub sense: [u8; VIRTIO_SCSI_SENSE_DEFAULT_SIZE],
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C, packed)]
pub struct virtio_scsi_ctrl_an_resp {
    pub event_actual: u32,
    pub response: u8,
}

#[derive(Copy, Clone, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct virtio_scsi_config {
    pub num_queues: u32,
    pub seg_max: u32,
    pub max_sectors: u32,
    pub cmd_per_lun: u32,
    pub event_info_size: u32,
    pub sense_size: u32,
    pub cdb_size: u32,
    pub max_channel: u16,
    pub max_target: u16,
    pub max_lun: u32,
}

static_assertions::assert_eq_size!(virtio_scsi_cmd_req, [u8; 51]);
static_assertions::assert_eq_size!(virtio_scsi_cmd_resp, [u8; 108]);
static_assertions::assert_eq_size!(virtio_scsi_config, [u8; 36]);

const REQ_LEN: usize = size_of::<virtio_scsi_cmd_req>();
const RESP_LEN: usize = size_of::<virtio_scsi_cmd_resp>();
// virtio_scsi_event: event, lun[8], reason.
const EVENT_INFO_SIZE: u32 = 16;

/// How a target disposes of one command.
#[derive(Debug)]
pub enum ScsiDisposition {
    /// Finished without touching the block device. `data` goes to the initiator's data-in
    /// buffers, truncated to their size.
    Complete { status: ScsiStatus, data: Vec<u8> },
    /// Read `len` bytes at `offset` into the data-in buffers.
    Read { offset: u64, len: u64 },
    /// Write `len` bytes from the data-out buffers at `offset`.
    Write { offset: u64, len: u64 },
    Unmap { ranges: Vec<UnmapRange> },
    Flush,
}

/// Interprets the SCSI commands sent to one target.
pub trait ScsiTarget: Send + Sync {
    /// Decides what to do with `cdb`, addressed to `lun` of a target backed by `bdev`.
    fn execute(&self, lun: u16, cdb: &[u8], bdev: &dyn BlockDevice) -> ScsiDisposition;
}

#[sorted]
#[derive(ThisError, Debug)]
enum ExecuteError {
    #[error("data transfer of {len} bytes exceeds the {avail} byte buffer")]
    BufferTooSmall { len: u64, avail: usize },
    #[error("{0}")]
    OutOfRange(crate::bdev::SubmitError),
    #[error("failed to submit: {0}")]
    Submit(crate::bdev::SubmitError),
}

impl ExecuteError {
    // asc/ascq values follow SPC-3.
    fn as_status(&self) -> ScsiStatus {
        match self {
            // INVALID FIELD IN CDB
            ExecuteError::BufferTooSmall { .. } => {
                ScsiStatus::check_condition(SCSI_SENSE_ILLEGAL_REQUEST, 0x24, 0x00)
            }
            // LOGICAL BLOCK ADDRESS OUT OF RANGE
            ExecuteError::OutOfRange(_) => {
                ScsiStatus::check_condition(SCSI_SENSE_ILLEGAL_REQUEST, 0x21, 0x00)
            }
            ExecuteError::Submit(_) => {
                ScsiStatus::check_condition(SCSI_SENSE_ABORTED_COMMAND, 0x00, 0x00)
            }
        }
    }
}

/// Fixed format sense data: 0x70 response code, sense key, additional length 10, asc, ascq.
fn fixed_sense(status: &ScsiStatus) -> ([u8; VIRTIO_SCSI_SENSE_DEFAULT_SIZE], u32) {
    let mut sense = [0u8; VIRTIO_SCSI_SENSE_DEFAULT_SIZE];
    sense[0] = 0x70;
    sense[2] = status.sk;
    sense[7] = 10;
    sense[12] = status.asc;
    sense[13] = status.ascq;
    (sense, 18)
}

fn build_resp(response: u8, status: &ScsiStatus, resid: u32) -> virtio_scsi_cmd_resp {
    let mut resp = virtio_scsi_cmd_resp::new_zeroed();
    resp.response = response;
    resp.status = status.sc;
    resp.resid = resid.to_le();
    if status.sc == SCSI_STATUS_CHECK_CONDITION {
        let (sense, len) = fixed_sense(status);
        resp.sense = sense;
        resp.sense_len = len.to_le();
    }
    resp
}

/// Writes a response for `req` and completes it with `data_len` bytes of data-in.
fn respond(req: PendingRequest, response: u8, status: &ScsiStatus, resid: u32, data_len: usize) {
    let resp = build_resp(response, status, resid);
    let n = req.chain().write_at(0, resp.as_bytes());
    req.complete((n + data_len) as u32);
}

struct TargetSlot {
    target: Arc<dyn ScsiTarget>,
    bdev: Arc<dyn BlockDevice>,
    removed: Arc<AtomicBool>,
}

type TargetTable = [Option<Arc<TargetSlot>>; SCSI_CTRLR_MAX_DEVS];

/// A virtio-scsi controller.
pub struct ScsiController {
    num_request_queues: usize,
    targets: Arc<Mutex<TargetTable>>,
}

impl ScsiController {
    pub fn new(num_request_queues: usize) -> Arc<ScsiController> {
        Arc::new(ScsiController {
            num_request_queues: num_request_queues.max(1),
            targets: Arc::new(Mutex::new(Default::default())),
        })
    }

    /// Attaches `target`, backed by `bdev`, as target number `index`. The block device is
    /// claimed until the target is removed.
    pub fn add_target(
        &self,
        index: usize,
        target: Arc<dyn ScsiTarget>,
        bdev: Arc<dyn BlockDevice>,
    ) -> Result<()> {
        if index >= SCSI_CTRLR_MAX_DEVS {
            return Err(Error::CapacityExceeded {
                what: "scsi targets",
                max: SCSI_CTRLR_MAX_DEVS,
            });
        }
        let mut targets = self.targets.lock();
        if targets[index].is_some() {
            return Err(Error::NameConflict(format!("scsi target {}", index)));
        }
        let removed = Arc::new(AtomicBool::new(false));
        let flag = removed.clone();
        let name = bdev.name().to_string();
        let remove_cb = Box::new(move || {
            warn!("block device {} of scsi target {} was hot-removed", name, index);
            flag.store(true, Ordering::Release);
        });
        if !bdev.claim(Some(remove_cb)) {
            return Err(Error::ClaimFailed(bdev.name().to_string()));
        }
        info!("scsi target {} attached to {}", index, bdev.name());
        targets[index] = Some(Arc::new(TargetSlot {
            target,
            bdev,
            removed,
        }));
        Ok(())
    }

    /// Detaches target `index` and releases its block device. Requests already submitted to it
    /// still complete.
    pub fn remove_target(&self, index: usize) -> Result<()> {
        let slot = self
            .targets
            .lock()
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| Error::NotFound(format!("scsi target {}", index)))?;
        slot.bdev.unclaim();
        info!("scsi target {} detached", index);
        Ok(())
    }

    /// The block device behind target `index`.
    pub fn target_bdev(&self, index: usize) -> Option<Arc<dyn BlockDevice>> {
        self.targets
            .lock()
            .get(index)?
            .as_ref()
            .map(|slot| slot.bdev.clone())
    }

    fn build_config_space(&self) -> virtio_scsi_config {
        virtio_scsi_config {
            num_queues: (self.num_request_queues as u32).to_le(),
            seg_max: SEG_MAX.to_le(),
            max_sectors: MAX_SECTORS.to_le(),
            cmd_per_lun: MAX_CMD_PER_LUN.to_le(),
            event_info_size: EVENT_INFO_SIZE.to_le(),
            sense_size: (VIRTIO_SCSI_SENSE_DEFAULT_SIZE as u32).to_le(),
            cdb_size: (VIRTIO_SCSI_CDB_DEFAULT_SIZE as u32).to_le(),
            max_channel: 0,
            max_target: ((SCSI_CTRLR_MAX_DEVS - 1) as u16).to_le(),
            max_lun: MAX_LUN.to_le(),
        }
    }
}

impl DeviceBackend for ScsiController {
    fn device_type(&self) -> DeviceType {
        DeviceType::Scsi
    }

    fn virtio_features(&self) -> u64 {
        1 << VIRTIO_SCSI_F_INOUT
            | 1 << VIRTIO_SCSI_F_HOTPLUG
            | 1 << VIRTIO_SCSI_F_CHANGE
            | 1 << VIRTIO_SCSI_F_T10_PI
    }

    fn disabled_features(&self) -> u64 {
        // Bidirectional commands are refused and the event queue is never filled.
        1 << VIRTIO_SCSI_F_INOUT
            | 1 << VIRTIO_SCSI_F_HOTPLUG
            | 1 << VIRTIO_SCSI_F_CHANGE
            | 1 << VIRTIO_SCSI_F_T10_PI
    }

    fn max_queues(&self) -> usize {
        2 + self.num_request_queues
    }

    fn min_queues(&self) -> usize {
        MINIMUM_NUM_QUEUES
    }

    fn config_space(&self) -> Vec<u8> {
        self.build_config_space().as_bytes().to_vec()
    }

    fn start(&self, core: CoreId) -> anyhow::Result<Box<dyn QueueHandler>> {
        debug!("starting scsi controller on core {}", core);
        Ok(Box::new(ScsiHandler {
            targets: self.targets.clone(),
            open: Default::default(),
            retired: Vec::new(),
        }))
    }

    fn on_remove(&self) {
        for slot in self.targets.lock().iter_mut() {
            if let Some(slot) = slot.take() {
                slot.bdev.unclaim();
            }
        }
    }
}

/// A channel to one target's block device on this core.
struct OpenChannel {
    slot: Arc<TargetSlot>,
    channel: Box<dyn IoChannel>,
    inflight: Rc<Cell<usize>>,
}

struct ScsiHandler {
    targets: Arc<Mutex<TargetTable>>,
    open: [Option<OpenChannel>; SCSI_CTRLR_MAX_DEVS],
    /// Channels of detached or replaced targets, kept until their requests complete.
    retired: Vec<OpenChannel>,
}

impl ScsiHandler {
    /// The live slot a LUN field addresses: `lun[0] == 1`, target number in `lun[1]`.
    fn lookup(&self, lun: &[u8; 8]) -> Option<(usize, Arc<TargetSlot>)> {
        if lun[0] != 1 {
            return None;
        }
        let index = usize::from(lun[1]);
        let slot = self.targets.lock().get(index)?.clone()?;
        if slot.removed.load(Ordering::Acquire) {
            return None;
        }
        Some((index, slot))
    }

    fn channel(
        &mut self,
        index: usize,
        slot: &Arc<TargetSlot>,
    ) -> anyhow::Result<&mut OpenChannel> {
        let stale = match &self.open[index] {
            Some(open) => !Arc::ptr_eq(&open.slot, slot),
            None => true,
        };
        if stale {
            if let Some(old) = self.open[index].take() {
                self.retired.push(old);
            }
            self.open[index] = Some(OpenChannel {
                slot: slot.clone(),
                channel: slot.bdev.io_channel()?,
                inflight: Rc::new(Cell::new(0)),
            });
        }
        match self.open[index].as_mut() {
            Some(open) => Ok(open),
            None => anyhow::bail!("no channel for target {}", index),
        }
    }

    fn handle_control(&mut self, req: PendingRequest) {
        let mut req_type = [0u8; 4];
        if req.chain().read_at(0, &mut req_type) < req_type.len() {
            error!("control request {} too short", req.chain().index());
            req.complete(0);
            return;
        }
        match u32::from_le_bytes(req_type) {
            VIRTIO_SCSI_T_TMF => {
                debug!("rejecting task management request {}", req.chain().index());
                let n = req.chain().write_at(0, &[VIRTIO_SCSI_S_FUNCTION_REJECTED]);
                req.complete(n as u32);
            }
            VIRTIO_SCSI_T_AN_QUERY | VIRTIO_SCSI_T_AN_SUBSCRIBE => {
                let resp = virtio_scsi_ctrl_an_resp {
                    event_actual: 0,
                    response: VIRTIO_SCSI_S_OK,
                };
                let n = req.chain().write_at(0, resp.as_bytes());
                req.complete(n as u32);
            }
            t => {
                error!("unknown control request type {}", t);
                req.complete(0);
            }
        }
    }

    fn handle_command(&mut self, req: PendingRequest) {
        let chain = req.chain();
        let mut header = virtio_scsi_cmd_req::new_zeroed();
        if chain.read_at(0, header.as_mut_bytes()) < REQ_LEN || chain.writable_len() < RESP_LEN {
            error!(
                "scsi request {} too short for its header or response",
                chain.index()
            );
            req.complete(0);
            return;
        }
        let data_out = chain.readable_len() - REQ_LEN;
        let data_in = chain.writable_len() - RESP_LEN;
        if data_out > 0 && data_in > 0 {
            debug!("bidirectional scsi request {} refused", chain.index());
            return respond(req, VIRTIO_SCSI_S_FAILURE, &ScsiStatus::GOOD, 0, 0);
        }

        let (index, slot) = match self.lookup(&header.lun) {
            Some(found) => found,
            None => return respond(req, VIRTIO_SCSI_S_BAD_TARGET, &ScsiStatus::GOOD, 0, 0),
        };
        let lun = (u16::from(header.lun[2]) << 8 | u16::from(header.lun[3])) & 0x3fff;

        let (io, xfer_len, is_read) = match slot.target.execute(lun, &header.cdb, &*slot.bdev) {
            ScsiDisposition::Complete { status, data } => {
                let n = chain.write_at(RESP_LEN, &data[..data.len().min(data_in)]);
                return respond(req, VIRTIO_SCSI_S_OK, &status, (data_in - n) as u32, n);
            }
            ScsiDisposition::Read { offset, len } => {
                if len > data_in as u64 {
                    let e = ExecuteError::BufferTooSmall { len, avail: data_in };
                    return self.fail(req, e, data_in);
                }
                if let Err(e) = check_range(&*slot.bdev, offset, len) {
                    return self.fail(req, ExecuteError::OutOfRange(e), data_in);
                }
                let iovs = chain.writable_iobufs(RESP_LEN, len as usize);
                (IoRequest::Read { offset, iovs }, len as usize, true)
            }
            ScsiDisposition::Write { offset, len } => {
                if len > data_out as u64 {
                    let e = ExecuteError::BufferTooSmall {
                        len,
                        avail: data_out,
                    };
                    return self.fail(req, e, data_out);
                }
                if let Err(e) = check_range(&*slot.bdev, offset, len) {
                    return self.fail(req, ExecuteError::OutOfRange(e), data_out);
                }
                let iovs = chain.readable_iobufs(REQ_LEN, len as usize);
                (IoRequest::Write { offset, iovs }, len as usize, false)
            }
            ScsiDisposition::Unmap { ranges } => (IoRequest::Unmap { ranges }, 0, false),
            ScsiDisposition::Flush => (
                IoRequest::Flush {
                    offset: 0,
                    len: slot.bdev.size_bytes(),
                },
                0,
                false,
            ),
        };
        let expected = if is_read { data_in } else { data_out };

        let open = match self.channel(index, &slot) {
            Ok(open) => open,
            Err(e) => {
                error!("scsi target {}: failed to open channel: {:#}", index, e);
                let status = ScsiStatus::check_condition(SCSI_SENSE_ABORTED_COMMAND, 0, 0);
                return respond(req, VIRTIO_SCSI_S_OK, &status, expected as u32, 0);
            }
        };
        let inflight = open.inflight.clone();
        inflight.set(inflight.get() + 1);
        let done = inflight.clone();
        let res = submit_io(&mut *open.channel, io, req, move |req, bdev_io, ok| {
            done.set(done.get() - 1);
            let transferred = if ok { xfer_len } else { 0 };
            let status = bdev_io.scsi_status();
            let resp = build_resp(VIRTIO_SCSI_S_OK, &status, (expected - transferred) as u32);
            let n = req.chain().write_at(0, resp.as_bytes());
            (n + if is_read { transferred } else { 0 }) as u32
        });
        if let Err(Rejected { error, req }) = res {
            inflight.set(inflight.get() - 1);
            self.fail(req, ExecuteError::Submit(error), expected);
        }
    }

    fn fail(&self, req: PendingRequest, e: ExecuteError, expected: usize) {
        error!("scsi request {}: {}", req.chain().index(), e);
        respond(req, VIRTIO_SCSI_S_OK, &e.as_status(), expected as u32, 0);
    }
}

impl QueueHandler for ScsiHandler {
    fn polls_queue(&self, queue: usize) -> bool {
        queue != EVENT_QUEUE
    }

    fn handle_request(&mut self, queue: usize, req: PendingRequest) {
        if queue == CONTROL_QUEUE {
            self.handle_control(req);
        } else {
            self.handle_command(req);
        }
    }

    fn poll(&mut self) -> usize {
        let mut n = 0;
        for open in self.open.iter_mut().flatten() {
            n += open.channel.poll();
        }
        for open in self.retired.iter_mut() {
            n += open.channel.poll();
        }
        self.retired.retain(|open| open.inflight.get() != 0);
        n
    }
}
