// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vhost-user devices: their lifecycle, the registry that tracks them, and the device types.

mod backend;
pub mod blk;
mod device;
mod dispatch;
mod registry;
pub mod scsi;

use std::fmt;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;
use vm_memory::MemoryMapError;

pub use self::backend::DeviceBackend;
pub use self::backend::QueueHandler;
pub use self::backend::BASE_FEATURES;
pub use self::device::DeviceState;
pub use self::device::VhostDevice;
pub use self::device::VhostSession;
pub use self::dispatch::submit_io;
pub use self::dispatch::PendingRequest;
pub use self::dispatch::Rejected;
pub use self::dispatch::UsedSink;
pub use self::registry::DeviceRegistry;
use crate::reactor;
use crate::reactor::CoreMask;
use crate::virtio;

/// Most virtqueues one device may have.
pub const MAX_VHOST_VRINGS: usize = 256;
/// Most devices one registry tracks.
pub const MAX_VHOST_DEVICES: usize = 64;

/// Identifies the vhost-user connection a device is loaded for.
pub type ConnectionId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Scsi,
    Blk,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceType::Scsi => write!(f, "scsi"),
            DeviceType::Blk => write!(f, "blk"),
        }
    }
}

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("configured as {expected} but the backend is {actual}")]
    BackendMismatch {
        expected: DeviceType,
        actual: DeviceType,
    },
    #[error("failed to start backend: {0:#}")]
    BackendStart(anyhow::Error),
    #[error("too many {what}: the limit is {max}")]
    CapacityExceeded { what: &'static str, max: usize },
    #[error("block device {0} is already claimed")]
    ClaimFailed(String),
    #[error("cpumask {0} names no running reactor")]
    InvalidCoreMask(CoreMask),
    #[error("invalid device name {0:?}")]
    InvalidName(String),
    #[error("device {name} cannot {op} while {state:?}")]
    InvalidState {
        name: String,
        state: DeviceState,
        op: &'static str,
    },
    #[error("invalid memory table: {0}")]
    Memory(#[source] MemoryMapError),
    #[error("device {0} already exists")]
    NameConflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("negotiation incomplete: {0}")]
    NotReady(String),
    #[error("failed to set up queue: {0}")]
    Queue(#[source] virtio::Error),
    #[error("cross-core call failed: {0}")]
    Reactor(#[source] reactor::Error),
    #[error("timed out: {0}")]
    TimedOut(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reactor::Error> for Error {
    fn from(e: reactor::Error) -> Self {
        match e {
            reactor::Error::TimedOut(core) => {
                Error::TimedOut(format!("no response from core {}", core))
            }
            e => Error::Reactor(e),
        }
    }
}
