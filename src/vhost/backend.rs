// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::reactor::CoreId;
use crate::vhost::DeviceType;
use crate::vhost::PendingRequest;
use crate::virtio::VHOST_USER_F_PROTOCOL_FEATURES;
use crate::virtio::VIRTIO_F_VERSION_1;
use crate::virtio::VIRTIO_RING_F_EVENT_IDX;

/// Features every device offers regardless of type.
pub const BASE_FEATURES: u64 = 1 << VIRTIO_F_VERSION_1
    | 1 << VHOST_USER_F_PROTOCOL_FEATURES
    | 1 << VIRTIO_RING_F_EVENT_IDX;

/// The operations a device type provides. One instance is shared by every core the device may
/// run on.
pub trait DeviceBackend: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Device-specific virtio feature bits the implementation knows about.
    fn virtio_features(&self) -> u64;

    /// Bits of [`DeviceBackend::virtio_features`] that are not offered.
    fn disabled_features(&self) -> u64 {
        0
    }

    /// Feature bits offered to the driver.
    fn offered_features(&self) -> u64 {
        BASE_FEATURES | (self.virtio_features() & !self.disabled_features())
    }

    /// Most queues a driver may set up.
    fn max_queues(&self) -> usize;

    /// Fewest queues a driver must set up before the device can start.
    fn min_queues(&self) -> usize {
        1
    }

    /// Device configuration space as returned for `GET_CONFIG`.
    fn config_space(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Creates the request handler for `core`. Runs on that core.
    fn start(&self, core: CoreId) -> anyhow::Result<Box<dyn QueueHandler>>;

    /// Called once after the device has been drained and removed.
    fn on_remove(&self) {}
}

/// Per-core request processing of a loaded device. Lives on, and is only called from, the core
/// polling the device.
pub trait QueueHandler {
    /// Whether the device should fetch requests from `queue`.
    fn polls_queue(&self, _queue: usize) -> bool {
        true
    }

    /// Takes ownership of one request. It must eventually be completed, possibly from a later
    /// [`QueueHandler::poll`].
    fn handle_request(&mut self, queue: usize, req: PendingRequest);

    /// Drives outstanding backend work. Returns how much was done.
    fn poll(&mut self) -> usize;
}
