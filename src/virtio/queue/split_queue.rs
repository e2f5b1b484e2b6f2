// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::Wrapping;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use base::error;
use base::Event;
use vm_memory::GuestAddress;
use vm_memory::MemoryMap;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::virtio::DescriptorChain;
use crate::virtio::Error;
use crate::virtio::Result;
use crate::virtio::SplitDescriptorChain;
use crate::virtio::VIRTIO_RING_F_EVENT_IDX;

pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 0x1;
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct virtq_used_elem {
    pub id: u32,
    pub len: u32,
}

/// Returns true if moving the used index from `old` to `new` crosses `event_idx`, the point at
/// which the driver asked to be notified.
///
/// Same as the virtio 1.x `vring_need_event` macro. All arithmetic wraps at
/// `u16::MAX`, so the comparison measures distances around the ring instead of comparing raw
/// indices:
///
/// ```text
///      (new - event_idx - 1) < (new - old)
/// ```
///
/// The left side is how far the ring has moved past the requested event, the right side how far
/// it moved since the last notification. The event was crossed exactly when the former is
/// shorter.
pub fn vring_need_event(event_idx: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event_idx).wrapping_sub(1) < new.wrapping_sub(old)
}

/// An activated virtio queue with split queue layout.
///
/// A ring is driven by exactly one thread, the one polling its device. Guest-visible indices are
/// never cached as pointers; each access translates through `mem`.
#[derive(Debug)]
pub struct VirtqueueRing {
    mem: MemoryMap,

    /// The queue size in elements the driver selected. This is always guaranteed to be a power of
    /// two, as required for split virtqueues.
    size: u16,

    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,

    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,

    // Device feature bits accepted by the driver
    features: u64,
    // Used index at the time the guest was last notified.
    last_used: Wrapping<u16>,

    kick: Option<Event>,
    call: Option<Event>,
}

impl VirtqueueRing {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mem: MemoryMap,
        size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
        next_avail: Wrapping<u16>,
        next_used: Wrapping<u16>,
        features: u64,
        kick: Option<Event>,
        call: Option<Event>,
    ) -> Result<VirtqueueRing> {
        Self::validate_rings(&mem, size, desc_table, avail_ring, used_ring)?;

        let mut ring = VirtqueueRing {
            mem,
            size,
            desc_table,
            avail_ring,
            used_ring,
            next_avail,
            next_used,
            features,
            last_used: next_used,
            kick,
            call,
        };
        // Rings are polled, so the driver never needs to kick.
        ring.set_no_notify(true)?;
        if ring.event_idx_enabled() {
            ring.set_avail_event(ring.next_avail)?;
        }
        Ok(ring)
    }

    fn ring_sizes(
        queue_size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> [(GuestAddress, u64, &'static str); 3] {
        let queue_size = queue_size as u64;
        [
            (desc_table, 16 * queue_size, "descriptor table"),
            (avail_ring, 6 + 2 * queue_size, "available ring"),
            (used_ring, 6 + 8 * queue_size, "used ring"),
        ]
    }

    fn validate_rings(
        mem: &MemoryMap,
        size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> Result<()> {
        for (addr, len, name) in Self::ring_sizes(size, desc_table, avail_ring, used_ring) {
            if !mem.is_valid_range(addr, len) {
                return Err(Error::RingOutOfRange {
                    name,
                    addr,
                    size: len,
                });
            }
        }
        Ok(())
    }

    /// Return the actual size of the queue, as the driver may not set up a
    /// queue as big as the device allows.
    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn next_avail(&self) -> u16 {
        self.next_avail.0
    }

    pub fn next_used(&self) -> u16 {
        self.next_used.0
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    /// The event the driver signals after adding buffers, if one was supplied.
    pub fn kick_event(&self) -> Option<&Event> {
        self.kick.as_ref()
    }

    pub fn mem(&self) -> &MemoryMap {
        &self.mem
    }

    /// Checks that all three rings are mapped by `mem`.
    pub fn check_memory(&self, mem: &MemoryMap) -> Result<()> {
        Self::validate_rings(
            mem,
            self.size,
            self.desc_table,
            self.avail_ring,
            self.used_ring,
        )
    }

    /// Swaps in a new memory table after checking that all three rings are still mapped.
    ///
    /// The caller must have stopped processing the queue. On error the old table stays in use.
    pub fn set_memory(&mut self, mem: MemoryMap) -> Result<()> {
        self.check_memory(&mem)?;
        self.mem = mem;
        Ok(())
    }

    fn event_idx_enabled(&self) -> bool {
        self.features & (1u64 << VIRTIO_RING_F_EVENT_IDX) != 0
    }

    // Return `index` modulo the currently configured queue size.
    fn wrap_queue_index(&self, index: Wrapping<u16>) -> u16 {
        // We know that `self.size` is a power of two (enforced by `QueueConfig::activate()`), so
        // the modulus can be calculated with a bitmask rather than actual division.
        debug_assert!(self.size.is_power_of_two());
        index.0 & self.size.wrapping_sub(1)
    }

    fn read_u16(&self, addr: GuestAddress) -> Result<u16> {
        self.mem
            .read_obj_from_addr::<u16>(addr)
            .map(u16::from_le)
            .map_err(Error::Memory)
    }

    fn write_u16(&self, val: u16, addr: GuestAddress) -> Result<()> {
        self.mem
            .write_obj_at_addr(val.to_le(), addr)
            .map_err(Error::Memory)
    }

    // Get the index of the first available descriptor chain in the available ring
    // (the next one that the driver will fill).
    fn get_avail_index(&self) -> Result<Wrapping<u16>> {
        let avail_index = self.read_u16(self.avail_ring.unchecked_add(2))?;
        // Ring entries and descriptors exposed by this index must not be read before it.
        fence(Ordering::Acquire);
        Ok(Wrapping(avail_index))
    }

    // Query the value of a single-bit flag in the available ring.
    fn get_avail_flag(&self, flag: u16) -> Result<bool> {
        fence(Ordering::SeqCst);
        let avail_flags = self.read_u16(self.avail_ring)?;
        Ok(avail_flags & flag == flag)
    }

    // Get the `used_event` field in the available ring.
    //
    // The returned value is the index of the next descriptor chain entry for which the driver
    // needs to be notified upon use. Only valid if `VIRTIO_RING_F_EVENT_IDX` was negotiated.
    fn get_used_event(&self) -> Result<Wrapping<u16>> {
        fence(Ordering::SeqCst);
        let used_event_addr = self.avail_ring.unchecked_add(4 + 2 * u64::from(self.size));
        Ok(Wrapping(self.read_u16(used_event_addr)?))
    }

    // Set the `avail_event` field in the used ring.
    //
    // This tells the driver that it need not kick the queue until it reaches `avail_index`.
    fn set_avail_event(&self, avail_index: Wrapping<u16>) -> Result<()> {
        fence(Ordering::SeqCst);
        let avail_event_addr = self.used_ring.unchecked_add(4 + 8 * u64::from(self.size));
        self.write_u16(avail_index.0, avail_event_addr)
    }

    /// Sets or clears `VIRTQ_USED_F_NO_NOTIFY`, which asks the driver not to kick the queue.
    pub fn set_no_notify(&mut self, no_notify: bool) -> Result<()> {
        let flags = self.read_u16(self.used_ring)?;
        let flags = if no_notify {
            flags | VIRTQ_USED_F_NO_NOTIFY
        } else {
            flags & !VIRTQ_USED_F_NO_NOTIFY
        };
        self.write_u16(flags, self.used_ring)
    }

    /// Starts reading newly available descriptor heads, at most `max_count` of them.
    ///
    /// The heads are read lazily from the ring as the returned batch is iterated. Nothing is
    /// consumed until [`AvailBatch::accept`] is called; dropping the batch leaves the ring as it
    /// was, so the same heads are offered again by the next call.
    pub fn fetch_available(&mut self, max_count: u16) -> Result<AvailBatch<'_>> {
        let avail_index = self.get_avail_index()?;
        let pending = (avail_index - self.next_avail).0;
        if pending > self.size {
            return Err(Error::AvailIndexJump {
                delta: pending,
                size: self.size,
            });
        }
        let start = self.next_avail;
        Ok(AvailBatch {
            ring: self,
            pos: start,
            end: start + Wrapping(pending.min(max_count)),
        })
    }

    /// Walks and translates the descriptor chain starting at `head`.
    ///
    /// Any protocol violation in the chain fails only this chain with
    /// [`Error::MalformedChain`]; the ring itself stays usable.
    pub fn walk_chain(&self, head: u16) -> Result<DescriptorChain> {
        let chain = SplitDescriptorChain::new(&self.mem, self.desc_table, self.size, head);
        DescriptorChain::new(chain, &self.mem, head)
            .map_err(|source| Error::MalformedChain { head, source })
    }

    /// Puts descriptor chain `id` on the used ring, reporting `len` bytes written to it.
    pub fn post_used(&mut self, id: u16, len: u32) -> Result<()> {
        if id >= self.size {
            return Err(Error::UsedIdOutOfRange {
                id,
                size: self.size,
            });
        }

        let next_used = self.wrap_queue_index(self.next_used) as u64;
        let used_elem = self.used_ring.unchecked_add(4 + next_used * 8);
        let elem = virtq_used_elem {
            id: u32::from(id).to_le(),
            len: len.to_le(),
        };
        self.mem
            .write_obj_at_addr(elem, used_elem)
            .map_err(Error::Memory)?;

        // The entry must be visible before the index that publishes it.
        fence(Ordering::Release);

        self.next_used += Wrapping(1);
        self.write_u16(self.next_used.0, self.used_ring.unchecked_add(2))
    }

    /// Returns if the guest should be notified about the entries posted since the last
    /// notification.
    ///
    /// With `VIRTIO_RING_F_EVENT_IDX` this is [`vring_need_event`] applied to the driver's
    /// `used_event`; otherwise the driver's `VIRTQ_AVAIL_F_NO_INTERRUPT` flag decides. If the
    /// ring cannot be read the answer is yes, since a spurious interrupt is harmless and a
    /// missing one can hang the guest.
    pub fn should_notify(&self) -> bool {
        let wanted = if self.event_idx_enabled() {
            self.get_used_event().map(|used_event| {
                vring_need_event(used_event.0, self.next_used.0, self.last_used.0)
            })
        } else {
            self.get_avail_flag(VIRTQ_AVAIL_F_NO_INTERRUPT)
                .map(|no_interrupt| !no_interrupt)
        };
        wanted.unwrap_or_else(|e| {
            error!("failed to read notification state: {}", e);
            true
        })
    }

    /// Signals the call event if [`VirtqueueRing::should_notify`] says so. Returns whether the
    /// guest was notified.
    pub fn notify_guest(&mut self) -> bool {
        if !self.should_notify() {
            return false;
        }
        self.last_used = self.next_used;
        if let Some(call) = &self.call {
            if let Err(e) = call.signal() {
                error!("failed to signal call event: {}", e);
            }
        }
        true
    }
}

/// Descriptor heads made available by the driver, read lazily by iterating.
///
/// Iteration stops at the count fixed when the batch was created, even if the driver adds more
/// entries meanwhile. The batch cannot be restarted.
pub struct AvailBatch<'q> {
    ring: &'q mut VirtqueueRing,
    pos: Wrapping<u16>,
    end: Wrapping<u16>,
}

impl AvailBatch<'_> {
    /// The ring the batch reads from, e.g. to walk a head's chain while iterating.
    pub fn ring(&self) -> &VirtqueueRing {
        self.ring
    }

    /// Number of entries not yet yielded.
    pub fn remaining(&self) -> u16 {
        (self.end - self.pos).0
    }

    /// Commits every head yielded so far, advancing the ring's next available index past them.
    /// Returns the number of heads committed.
    pub fn accept(self) -> Result<u16> {
        let taken = (self.pos - self.ring.next_avail).0;
        self.ring.next_avail = self.pos;
        if self.ring.event_idx_enabled() {
            self.ring.set_avail_event(self.ring.next_avail)?;
        }
        Ok(taken)
    }
}

impl Iterator for AvailBatch<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.pos == self.end {
            return None;
        }
        let offset = 4 + u64::from(self.ring.wrap_queue_index(self.pos)) * 2;
        match self.ring.read_u16(self.ring.avail_ring.unchecked_add(offset)) {
            Ok(head) => {
                self.pos += Wrapping(1);
                Some(head)
            }
            Err(e) => {
                error!("failed to read available ring entry: {}", e);
                self.end = self.pos;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining() as usize;
        (n, Some(n))
    }
}
