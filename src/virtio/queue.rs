// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod split_descriptor_chain;
pub mod split_queue;

use std::num::Wrapping;

use base::Event;
use vm_memory::GuestAddress;
use vm_memory::MemoryMap;

use crate::virtio::Error;
use crate::virtio::Result;
use crate::virtio::VirtqueueRing;
use crate::virtio::MAX_QUEUE_SIZE;

/// Queue state collected from the vhost-user front-end before the queue is started.
///
/// Every `SET_VRING_*` message lands in one of the setters; [`QueueConfig::activate`] turns the
/// result into a [`VirtqueueRing`] once the guest memory table is known.
#[derive(Debug)]
pub struct QueueConfig {
    max_size: u16,
    size: u16,
    desc_table: Option<GuestAddress>,
    avail_ring: Option<GuestAddress>,
    used_ring: Option<GuestAddress>,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
    acked_features: u64,
    kick: Option<Event>,
    call: Option<Event>,
}

impl QueueConfig {
    /// Creates a queue configuration that allows the front-end to pick any size up to
    /// `max_size`.
    pub fn new(max_size: u16) -> QueueConfig {
        QueueConfig {
            max_size,
            size: max_size,
            desc_table: None,
            avail_ring: None,
            used_ring: None,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            acked_features: 0,
            kick: None,
            call: None,
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn set_size(&mut self, size: u16) {
        self.size = size;
    }

    pub fn set_desc_table(&mut self, addr: GuestAddress) {
        self.desc_table = Some(addr);
    }

    pub fn set_avail_ring(&mut self, addr: GuestAddress) {
        self.avail_ring = Some(addr);
    }

    pub fn set_used_ring(&mut self, addr: GuestAddress) {
        self.used_ring = Some(addr);
    }

    /// Sets where processing resumes, as carried by `SET_VRING_BASE`.
    pub fn set_next_avail(&mut self, idx: u16) {
        self.next_avail = Wrapping(idx);
    }

    pub fn set_next_used(&mut self, idx: u16) {
        self.next_used = Wrapping(idx);
    }

    pub fn ack_features(&mut self, features: u64) {
        self.acked_features |= features;
    }

    pub fn acked_features(&self) -> u64 {
        self.acked_features
    }

    pub fn set_kick_event(&mut self, event: Event) {
        self.kick = Some(event);
    }

    pub fn set_call_event(&mut self, event: Event) {
        self.call = Some(event);
    }

    /// Returns true once all three ring addresses are known.
    pub fn is_ready(&self) -> bool {
        self.desc_table.is_some() && self.avail_ring.is_some() && self.used_ring.is_some()
    }

    /// Validates the configuration against `mem` and produces the running ring.
    pub fn activate(self, mem: &MemoryMap) -> Result<VirtqueueRing> {
        let desc_table = self.desc_table.ok_or(Error::QueueNotReady("descriptor table"))?;
        let avail_ring = self.avail_ring.ok_or(Error::QueueNotReady("available ring"))?;
        let used_ring = self.used_ring.ok_or(Error::QueueNotReady("used ring"))?;
        if self.size == 0
            || !self.size.is_power_of_two()
            || self.size > self.max_size
            || self.size > MAX_QUEUE_SIZE
        {
            return Err(Error::InvalidQueueSize(self.size));
        }
        VirtqueueRing::new(
            mem.clone(),
            self.size,
            desc_table,
            avail_ring,
            used_ring,
            self.next_avail,
            self.next_used,
            self.acked_features,
            self.kick,
            self.call,
        )
    }
}
