// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Platform plumbing shared by the vhost target crates: errno errors, eventfd-backed events,
//! memory mappings, iovec buffers, CPU affinity and the logging bootstrap.

mod errno;
mod event;
mod iobuf;
mod mmap;
mod sched;
pub mod syslog;

pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use event::Event;
pub use event::EventWaitResult;
pub use iobuf::IoBuf;
pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
pub use mmap::Error as MmapError;
pub use mmap::MemoryMapping;
pub use mmap::Result as MmapResult;
pub use sched::set_cpu_affinity;

/// Returns the page size of the host in bytes.
pub fn pagesize() -> usize {
    // SAFETY:
    // Trivially safe, sysconf only reads a constant.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
