// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Split virtqueue handling for vhost-user backends.
//!
//! The guest driver owns the descriptor table and the available ring; this side only reads them.
//! The used ring is only written from here. All accesses go through a [`vm_memory::MemoryMap`]
//! snapshot and never keep translated pointers beyond a single request.

mod descriptor_chain;
mod queue;

use remain::sorted;
use thiserror::Error as ThisError;
use vm_memory::GuestAddress;
use vm_memory::MemoryMapError;

pub use self::descriptor_chain::ChainBuffer;
pub use self::descriptor_chain::DescriptorAccess;
pub use self::descriptor_chain::DescriptorChain;
pub use self::descriptor_chain::VIRTQ_DESC_F_INDIRECT;
pub use self::descriptor_chain::VIRTQ_DESC_F_NEXT;
pub use self::descriptor_chain::VIRTQ_DESC_F_WRITE;
pub use self::queue::split_descriptor_chain::Desc;
pub use self::queue::split_descriptor_chain::SplitDescriptorChain;
pub use self::queue::split_queue::vring_need_event;
pub use self::queue::split_queue::AvailBatch;
pub use self::queue::split_queue::VirtqueueRing;
pub use self::queue::split_queue::VIRTQ_AVAIL_F_NO_INTERRUPT;
pub use self::queue::split_queue::VIRTQ_USED_F_NO_NOTIFY;
pub use self::queue::QueueConfig;

/// The device complies with virtio 1.0 or later.
pub const VIRTIO_F_VERSION_1: u32 = 32;
/// The driver may request notifications when the available ring is empty.
pub const VIRTIO_F_NOTIFY_ON_EMPTY: u32 = 24;
/// Indirect descriptor tables.
pub const VIRTIO_RING_F_INDIRECT_DESC: u32 = 28;
/// `used_event`/`avail_event` notification suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u32 = 29;
/// vhost-user protocol feature negotiation is available.
pub const VHOST_USER_F_PROTOCOL_FEATURES: u32 = 30;

/// Largest queue size a split virtqueue may have.
pub const MAX_QUEUE_SIZE: u16 = 32768;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("avail index moved by {delta} entries on a queue of size {size}")]
    AvailIndexJump { delta: u16, size: u16 },
    #[error("queue size {0} is not a power of two between 1 and 32768")]
    InvalidQueueSize(u16),
    #[error("malformed descriptor chain at head {head}: {source:#}")]
    MalformedChain {
        head: u16,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to access ring memory: {0}")]
    Memory(#[source] MemoryMapError),
    #[error("queue is not ready: {0} is not set")]
    QueueNotReady(&'static str),
    #[error("{name} at {addr} with size {size:#x} is not in guest memory")]
    RingOutOfRange {
        name: &'static str,
        addr: GuestAddress,
        size: u64,
    },
    #[error("used entry for descriptor {id} is beyond queue size {size}")]
    UsedIdOutOfRange { id: u16, size: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;
