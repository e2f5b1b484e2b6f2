// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Routing between descriptor chains, block-device submissions and the used ring.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use base::error;

use crate::bdev::BdevIo;
use crate::bdev::IoChannel;
use crate::bdev::IoRequest;
use crate::bdev::SubmitError;
use crate::virtio::DescriptorChain;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedEntry {
    pub queue: usize,
    pub id: u16,
    pub len: u32,
}

/// Completed requests waiting to be written to their used rings. Shared by the requests of one
/// device on one core.
#[derive(Clone, Default)]
pub struct UsedSink(Rc<RefCell<VecDeque<UsedEntry>>>);

impl UsedSink {
    fn push(&self, entry: UsedEntry) {
        self.0.borrow_mut().push_back(entry);
    }

    /// Removes and returns everything completed so far, in completion order.
    pub fn drain(&self) -> Vec<UsedEntry> {
        self.0.borrow_mut().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// A request taken off an available ring and not yet on the used ring.
///
/// It owns the descriptor chain, so the guest buffers stay mapped for as long as the request
/// exists. Completing it queues the used entry; dropping it uncompleted also queues one, with a
/// length of zero, so the guest never loses a descriptor.
pub struct PendingRequest {
    chain: DescriptorChain,
    queue: usize,
    sink: UsedSink,
    done: bool,
}

impl PendingRequest {
    pub fn new(chain: DescriptorChain, queue: usize, sink: UsedSink) -> PendingRequest {
        PendingRequest {
            chain,
            queue,
            sink,
            done: false,
        }
    }

    pub fn chain(&self) -> &DescriptorChain {
        &self.chain
    }

    pub fn queue(&self) -> usize {
        self.queue
    }

    /// Finishes the request, reporting `len` bytes written into the guest's buffers.
    pub fn complete(mut self, len: u32) {
        self.finish(len);
    }

    fn finish(&mut self, len: u32) {
        self.done = true;
        self.sink.push(UsedEntry {
            queue: self.queue,
            id: self.chain.index(),
            len,
        });
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.done {
            error!(
                "request {} on queue {} dropped without completion",
                self.chain.index(),
                self.queue
            );
            self.finish(0);
        }
    }
}

/// A submission the block device refused. The completion never ran, so the request is handed
/// back for the caller to fail.
pub struct Rejected {
    pub error: SubmitError,
    pub req: PendingRequest,
}

/// Submits `io` on behalf of `req`.
///
/// When the device completes, `finish` turns the outcome into guest-visible status (writing into
/// the chain as needed) and returns the number of bytes written to the guest, which completes
/// `req`.
pub fn submit_io<F>(
    channel: &mut dyn IoChannel,
    io: IoRequest,
    req: PendingRequest,
    finish: F,
) -> Result<(), Rejected>
where
    F: FnOnce(&PendingRequest, &BdevIo, bool) -> u32 + 'static,
{
    let slot = Rc::new(Cell::new(Some(req)));
    let cb_slot = slot.clone();
    let res = channel.submit(
        io,
        Box::new(move |bdev_io: BdevIo, success: bool| {
            if let Some(req) = cb_slot.take() {
                let len = finish(&req, &bdev_io, success);
                req.complete(len);
            }
            bdev_io.free();
        }),
    );
    match res {
        Ok(()) => Ok(()),
        Err(error) => match slot.take() {
            Some(req) => Err(Rejected { error, req }),
            // The channel ran the completion before failing; the request is already answered.
            None => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use base::IoBuf;

    use super::*;
    use crate::bdev::BlockDevice;
    use crate::testing::GuestDriver;
    use crate::testing::MemBdev;

    fn request(driver: &mut GuestDriver, sink: &UsedSink) -> PendingRequest {
        let buf = driver.alloc(512);
        let head = driver.add_chain(&[(buf, 512, true)]);
        let ring = driver.queue_config(0).activate(&driver.mem).unwrap();
        PendingRequest::new(ring.walk_chain(head).unwrap(), 0, sink.clone())
    }

    #[test]
    fn complete_and_drop_both_queue_entries() {
        let mut driver = GuestDriver::new(8);
        let sink = UsedSink::default();
        let a = request(&mut driver, &sink);
        let b = request(&mut driver, &sink);
        b.complete(7);
        drop(a);
        assert_eq!(
            sink.drain(),
            vec![
                UsedEntry {
                    queue: 0,
                    id: 1,
                    len: 7
                },
                UsedEntry {
                    queue: 0,
                    id: 0,
                    len: 0
                },
            ]
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn submitted_request_completes_from_poll() {
        let mut driver = GuestDriver::new(8);
        let sink = UsedSink::default();
        let bdev = MemBdev::new("mem0", 512, 4);
        bdev.fill(0, &[0x42; 512]);
        let mut ch = bdev.io_channel().unwrap();
        let req = request(&mut driver, &sink);
        let iovs = req.chain().writable_iobufs(0, 512);
        let res = submit_io(
            &mut *ch,
            IoRequest::Read { offset: 0, iovs },
            req,
            |req, _, ok| {
                assert!(ok);
                req.chain().writable_len() as u32
            },
        );
        assert!(res.is_ok());
        assert!(sink.is_empty());
        ch.poll();
        assert_eq!(sink.drain()[0].len, 512);
        let mut out = [0u8; 512];
        driver
            .mem
            .read_exact_at_addr(&mut out, vm_memory::GuestAddress(0x10000))
            .unwrap();
        assert_eq!(out, [0x42; 512]);
    }

    #[test]
    fn rejected_submission_returns_request() {
        let mut driver = GuestDriver::new(8);
        let sink = UsedSink::default();
        let bdev = MemBdev::new("mem0", 512, 4);
        bdev.state
            .reject
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut ch = bdev.io_channel().unwrap();
        let req = request(&mut driver, &sink);
        let mut scratch = [0u8; 512];
        let iovs = [IoBuf::new(scratch.as_mut_ptr(), 512)].into_iter().collect();
        match submit_io(&mut *ch, IoRequest::Read { offset: 0, iovs }, req, |_, _, _| 1) {
            Err(Rejected { error, req }) => {
                assert_eq!(error, SubmitError(-libc::ENOMEM));
                req.complete(0);
            }
            Ok(()) => panic!("submission should fail"),
        }
        assert_eq!(sink.drain().len(), 1);
    }
}
