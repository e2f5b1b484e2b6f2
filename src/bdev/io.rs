// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::bdev::IoType;

pub const SCSI_STATUS_GOOD: u8 = 0x00;
pub const SCSI_STATUS_CHECK_CONDITION: u8 = 0x02;

pub const SCSI_SENSE_NO_SENSE: u8 = 0x00;
pub const SCSI_SENSE_ILLEGAL_REQUEST: u8 = 0x05;
pub const SCSI_SENSE_ABORTED_COMMAND: u8 = 0x0b;

pub const SCSI_ASC_NO_ADDITIONAL_SENSE: u8 = 0x00;

pub const NVME_SCT_GENERIC: u8 = 0x0;
pub const NVME_SC_SUCCESS: u8 = 0x00;
pub const NVME_SC_INTERNAL_DEVICE_ERROR: u8 = 0x06;

/// SCSI status byte plus the sense key and additional sense code/qualifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScsiStatus {
    pub sc: u8,
    pub sk: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl ScsiStatus {
    pub const GOOD: ScsiStatus = ScsiStatus {
        sc: SCSI_STATUS_GOOD,
        sk: SCSI_SENSE_NO_SENSE,
        asc: SCSI_ASC_NO_ADDITIONAL_SENSE,
        ascq: 0,
    };

    /// CHECK CONDITION with the given sense data.
    pub const fn check_condition(sk: u8, asc: u8, ascq: u8) -> ScsiStatus {
        ScsiStatus {
            sc: SCSI_STATUS_CHECK_CONDITION,
            sk,
            asc,
            ascq,
        }
    }
}

/// How a request ended, in whatever detail the device reported it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// Failed without further detail.
    Failed,
    ScsiError(ScsiStatus),
    NvmeError { sct: u8, sc: u8 },
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        match self {
            IoStatus::Success => true,
            IoStatus::Failed => false,
            IoStatus::ScsiError(s) => s.sc == SCSI_STATUS_GOOD,
            IoStatus::NvmeError { sct, sc } => *sct == NVME_SCT_GENERIC && *sc == NVME_SC_SUCCESS,
        }
    }
}

/// The handle a completion receives.
///
/// Status details are read through the accessors, translated into the vocabulary the consumer
/// speaks. Consumers hand it back with [`BdevIo::free`] once they are done.
#[derive(Debug)]
pub struct BdevIo {
    io_type: IoType,
    status: IoStatus,
}

impl BdevIo {
    pub fn new(io_type: IoType, status: IoStatus) -> BdevIo {
        BdevIo { io_type, status }
    }

    pub fn io_type(&self) -> IoType {
        self.io_type
    }

    pub fn status(&self) -> &IoStatus {
        &self.status
    }

    /// Status as an NVMe `(status code type, status code)` pair.
    pub fn nvme_status(&self) -> (u8, u8) {
        match self.status {
            IoStatus::NvmeError { sct, sc } => (sct, sc),
            s if s.is_success() => (NVME_SCT_GENERIC, NVME_SC_SUCCESS),
            _ => (NVME_SCT_GENERIC, NVME_SC_INTERNAL_DEVICE_ERROR),
        }
    }

    /// Status as SCSI status and sense.
    pub fn scsi_status(&self) -> ScsiStatus {
        match self.status {
            IoStatus::ScsiError(s) => s,
            s if s.is_success() => ScsiStatus::GOOD,
            _ => ScsiStatus::check_condition(
                SCSI_SENSE_ABORTED_COMMAND,
                SCSI_ASC_NO_ADDITIONAL_SENSE,
                0,
            ),
        }
    }

    /// Releases the handle.
    pub fn free(self) {}
}
