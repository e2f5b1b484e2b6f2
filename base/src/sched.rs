// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wrappers for CPU affinity functions.

use std::mem;

use crate::errno_result;
use crate::Error;
use crate::Result;

/// Restricts the calling thread to the CPUs in `cpus`.
pub fn set_cpu_affinity<I: IntoIterator<Item = usize>>(cpus: I) -> Result<()> {
    // SAFETY:
    // `cpu_set_t` is a plain bitmask for which all-zeroes is the empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };
    for cpu in cpus {
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(Error::new(libc::EINVAL));
        }
        // SAFETY:
        // `cpu` was checked against the set size above.
        unsafe { libc::CPU_SET(cpu, &mut cpu_set) };
    }

    // SAFETY:
    // The kernel only reads `cpu_set`, and the size passed matches its type.
    let ret = unsafe { libc::sched_setaffinity(0, mem::size_of_val(&cpu_set), &cpu_set) };
    if ret != 0 {
        return errno_result();
    }
    Ok(())
}
