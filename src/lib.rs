// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Userspace vhost target: virtqueue processing for vhost-user SCSI and block devices.
//!
//! Devices are constructed in a [`vhost::DeviceRegistry`], bound to one reactor core when a
//! frontend connection finishes negotiation, and service their rings from a poller on that core.
//! All device state changes coming from other threads go through the
//! [`reactor::CrossCoreEventBridge`].

pub mod bdev;
pub mod config;
pub mod reactor;
pub mod vhost;
pub mod virtio;

#[cfg(test)]
mod testing;
