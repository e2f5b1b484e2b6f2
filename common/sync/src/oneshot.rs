// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot completion: one thread fulfils a [`Promise`] exactly once, another thread waits on the
//! matching [`Waitable`] with an optional deadline.

use std::sync::Arc;
use std::time::Duration;

use crate::Condvar;
use crate::Mutex;

enum Slot<T> {
    Pending,
    Ready(T),
    Taken,
    Abandoned,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

/// Outcome of [`Waitable::wait`].
#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult<T> {
    /// The promise was signaled with this value.
    Ready(T),
    /// The deadline passed first. The promise may still be signaled later; the value is then
    /// discarded.
    TimedOut,
    /// The promise was dropped without being signaled.
    Abandoned,
}

/// Producer half. Signaling consumes it, so a value is delivered at most once.
pub struct Promise<T>(Arc<Shared<T>>);

impl<T> Promise<T> {
    /// Publishes `value` and wakes the waiter.
    pub fn signal(self, value: T) {
        {
            let mut slot = self.0.slot.lock();
            // A waiter that already gave up leaves the slot `Taken`; the value is dropped then.
            if let Slot::Pending = *slot {
                *slot = Slot::Ready(value);
            }
        }
        self.0.condvar.notify_all();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let mut slot = self.0.slot.lock();
        if let Slot::Pending = *slot {
            *slot = Slot::Abandoned;
            drop(slot);
            self.0.condvar.notify_all();
        }
    }
}

/// Consumer half.
pub struct Waitable<T>(Arc<Shared<T>>);

impl<T> Waitable<T> {
    /// Blocks until the promise is signaled or dropped, or until `timeout` elapses. `None` waits
    /// forever. A zero timeout only observes a value that is already there.
    pub fn wait(self, timeout: Option<Duration>) -> WaitResult<T> {
        let shared = &*self.0;
        let pending = |slot: &mut Slot<T>| matches!(slot, Slot::Pending);
        let mut slot = match timeout {
            Some(timeout) => {
                shared
                    .condvar
                    .wait_timeout_while(shared.slot.lock(), timeout, pending)
                    .0
            }
            None => shared.condvar.wait_while(shared.slot.lock(), pending),
        };
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => WaitResult::Ready(value),
            Slot::Abandoned => WaitResult::Abandoned,
            Slot::Pending | Slot::Taken => WaitResult::TimedOut,
        }
    }

    /// Returns true if a value is already waiting to be collected.
    pub fn is_ready(&self) -> bool {
        matches!(*self.0.slot.lock(), Slot::Ready(_))
    }
}

/// Creates a linked promise and waitable.
pub fn create_promise_and_waitable<T>() -> (Promise<T>, Waitable<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        condvar: Condvar::new(),
    });
    (Promise(Arc::clone(&shared)), Waitable(shared))
}
