// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest physical address space as seen by a vhost-user backend.

mod guest_address;
pub mod memory_map;

pub use guest_address::*;
pub use memory_map::Error as MemoryMapError;
pub use memory_map::*;
