// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitives whose methods panic instead of returning a poison error.
//!
//! Releases are built with `panic=abort`, so a panic while a lock is held already takes the whole
//! target down and callers never have to reason about poison. The wrappers here let code lock a
//! mutex without sprinkling `.lock().unwrap()` around, which keeps `unwrap` meaningful in review.
//!
//! The crate also provides [`Promise`]/[`Waitable`], a one-shot completion used to hand a single
//! value from one thread to a waiter that gives up after a deadline.

mod condvar;
mod mutex;
mod oneshot;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
pub use crate::oneshot::create_promise_and_waitable;
pub use crate::oneshot::Promise;
pub use crate::oneshot::WaitResult;
pub use crate::oneshot::Waitable;
