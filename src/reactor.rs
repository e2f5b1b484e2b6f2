// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-core polling threads and the cross-core call bridge.
//!
//! Every core runs one reactor thread. Device rings are only ever touched by the reactor that
//! polls them, so the data path needs no locks. Control operations that must change that state
//! from elsewhere are shipped to the owning reactor with [`CrossCoreEventBridge::call`], which
//! runs a closure there between two polling rounds and waits for it with a deadline.

use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::sync::mpsc::TryRecvError;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use base::error;
use base::info;
use base::warn;
use remain::sorted;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sync::create_promise_and_waitable;
use sync::WaitResult;
use thiserror::Error as ThisError;

use crate::config::ReactorConfig;

pub type CoreId = u32;
pub type PollerId = u64;

#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("core {0} is not running a reactor")]
    CoreNotFound(CoreId),
    #[error("reactor on core {0} has shut down")]
    Disconnected(CoreId),
    #[error("core {0} is listed twice")]
    DuplicateCore(CoreId),
    #[error("no reactor cores configured")]
    NoCores,
    #[error("cross-core call issued from core {0} to itself")]
    SameCore(CoreId),
    #[error("failed to spawn reactor thread for core {0}: {1}")]
    SpawnThread(CoreId, #[source] std::io::Error),
    #[error("timed out waiting for core {0}")]
    TimedOut(CoreId),
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static CURRENT_CORE: Cell<Option<CoreId>> = const { Cell::new(None) };
}

/// Returns the core whose reactor is running on this thread, if any.
pub fn current_core() -> Option<CoreId> {
    CURRENT_CORE.with(Cell::get)
}

/// A set of cores, written as a hexadecimal mask (`"0x5"`) or an integer in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CoreMask(u64);

impl CoreMask {
    pub const fn new(bits: u64) -> CoreMask {
        CoreMask(bits)
    }

    pub fn from_cores<I: IntoIterator<Item = CoreId>>(cores: I) -> CoreMask {
        CoreMask(
            cores
                .into_iter()
                .filter(|&c| c < 64)
                .fold(0, |m, c| m | 1 << c),
        )
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn contains(&self, core: CoreId) -> bool {
        core < 64 && self.0 & (1 << core) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CoreId> + '_ {
        (0..64).filter(|&c| self.contains(c))
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for CoreMask {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u64::from_str_radix(hex, 16).map(CoreMask)
    }
}

impl Serialize for CoreMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CoreMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bits(u64),
            Hex(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bits(bits) => Ok(CoreMask(bits)),
            Raw::Hex(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Work a reactor performs on every round.
pub trait Poller: 'static {
    /// Does whatever work is pending and returns how much was done. Zero lets the reactor idle.
    fn poll(&mut self) -> usize;

    /// Returns true once the poller has nothing left to do. The reactor drops it at the end of
    /// the round.
    fn is_done(&self) -> bool {
        false
    }
}

trait AnyPoller {
    fn poll(&mut self) -> usize;
    fn is_done(&self) -> bool;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<P: Poller> AnyPoller for P {
    fn poll(&mut self) -> usize {
        Poller::poll(self)
    }

    fn is_done(&self) -> bool {
        Poller::is_done(self)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// State owned by one reactor thread. Only closures running on that thread can reach it.
pub struct CoreContext {
    core: CoreId,
    next_id: PollerId,
    pollers: BTreeMap<PollerId, Box<dyn AnyPoller>>,
}

impl CoreContext {
    fn new(core: CoreId) -> CoreContext {
        CoreContext {
            core,
            next_id: 0,
            pollers: BTreeMap::new(),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Adds `poller` to this core's polling round.
    pub fn register_poller<P: Poller>(&mut self, poller: P) -> PollerId {
        let id = self.next_id;
        self.next_id += 1;
        self.pollers.insert(id, Box::new(poller));
        id
    }

    /// Removes and drops a poller. Returns false if `id` was not registered.
    pub fn unregister_poller(&mut self, id: PollerId) -> bool {
        self.pollers.remove(&id).is_some()
    }

    /// Returns the poller registered as `id` if it is a `P`.
    pub fn poller_mut<P: Poller>(&mut self, id: PollerId) -> Option<&mut P> {
        self.pollers.get_mut(&id)?.as_any_mut().downcast_mut()
    }

    pub fn num_pollers(&self) -> usize {
        self.pollers.len()
    }

    fn poll_all(&mut self) -> usize {
        let work = self.pollers.values_mut().map(|p| p.poll()).sum();
        self.pollers.retain(|_, p| !p.is_done());
        work
    }
}

type CoreFn = Box<dyn FnOnce(&mut CoreContext) + Send>;

enum CoreMessage {
    Call(CoreFn),
    Shutdown,
}

fn run_reactor(core: CoreId, rx: Receiver<CoreMessage>, idle: Duration) {
    CURRENT_CORE.with(|c| c.set(Some(core)));
    let mut ctx = CoreContext::new(core);
    info!("reactor started on core {}", core);
    'run: loop {
        loop {
            match rx.try_recv() {
                Ok(CoreMessage::Call(f)) => f(&mut ctx),
                Ok(CoreMessage::Shutdown) | Err(TryRecvError::Disconnected) => break 'run,
                Err(TryRecvError::Empty) => break,
            }
        }
        if ctx.poll_all() == 0 {
            match rx.recv_timeout(idle) {
                Ok(CoreMessage::Call(f)) => f(&mut ctx),
                Ok(CoreMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break 'run,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
    if ctx.num_pollers() != 0 {
        warn!(
            "reactor on core {} stopping with {} pollers registered",
            core,
            ctx.num_pollers()
        );
    }
    info!("reactor stopped on core {}", core);
}

/// Runs closures on reactor threads.
#[derive(Clone)]
pub struct CrossCoreEventBridge {
    senders: Arc<BTreeMap<CoreId, Sender<CoreMessage>>>,
}

impl CrossCoreEventBridge {
    /// Cores that accept calls, in ascending order.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.senders.keys().copied()
    }

    pub fn has_core(&self, core: CoreId) -> bool {
        self.senders.contains_key(&core)
    }

    fn sender(&self, core: CoreId) -> Result<&Sender<CoreMessage>> {
        self.senders.get(&core).ok_or(Error::CoreNotFound(core))
    }

    /// Runs `f` on `core` and waits up to `timeout` for its result.
    ///
    /// Calls to one core run one at a time in the order they were issued. On
    /// [`Error::TimedOut`] the closure is not cancelled: it still runs once when the core gets to
    /// it, and its result is discarded. `errmsg` describes the call in the timeout log.
    pub fn call<F, R>(&self, core: CoreId, timeout: Duration, errmsg: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut CoreContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if current_core() == Some(core) {
            return Err(Error::SameCore(core));
        }
        let sender = self.sender(core)?;
        let (promise, waitable) = create_promise_and_waitable();
        sender
            .send(CoreMessage::Call(Box::new(move |ctx| {
                promise.signal(f(ctx));
            })))
            .map_err(|_| Error::Disconnected(core))?;

        match waitable.wait(Some(timeout)) {
            WaitResult::Ready(r) => Ok(r),
            WaitResult::TimedOut => {
                error!("{}: core {} did not respond within {:?}", errmsg, core, timeout);
                Err(Error::TimedOut(core))
            }
            WaitResult::Abandoned => Err(Error::Disconnected(core)),
        }
    }

    /// Queues `f` on `core` without waiting for it.
    pub fn send<F>(&self, core: CoreId, f: F) -> Result<()>
    where
        F: FnOnce(&mut CoreContext) + Send + 'static,
    {
        self.sender(core)?
            .send(CoreMessage::Call(Box::new(f)))
            .map_err(|_| Error::Disconnected(core))
    }
}

struct ReactorThread {
    worker: Option<(Sender<CoreMessage>, JoinHandle<()>)>,
}

impl ReactorThread {
    fn stop_internal(&mut self) {
        if let Some((sender, handle)) = self.worker.take() {
            // A send error means the thread is already gone.
            let _ = sender.send(CoreMessage::Shutdown);
            if let Err(e) = handle.join() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.stop_internal();
    }
}

/// The set of running reactor threads. Dropping it stops and joins all of them.
pub struct Reactors {
    threads: Vec<ReactorThread>,
    bridge: CrossCoreEventBridge,
}

impl Reactors {
    /// Starts one reactor thread per configured core.
    pub fn new(cfg: &ReactorConfig) -> Result<Reactors> {
        if cfg.cores.is_empty() {
            return Err(Error::NoCores);
        }
        let idle = Duration::from_micros(cfg.idle_poll_interval_us);
        let mut threads = Vec::with_capacity(cfg.cores.len());
        let mut senders = BTreeMap::new();
        for &core in &cfg.cores {
            if senders.contains_key(&core) {
                return Err(Error::DuplicateCore(core));
            }
            let (tx, rx) = mpsc::channel();
            let pin = cfg.pin_threads;
            let handle = thread::Builder::new()
                .name(format!("reactor_{}", core))
                .spawn(move || {
                    if pin {
                        if let Err(e) = base::set_cpu_affinity([core as usize]) {
                            warn!("failed to pin reactor to cpu {}: {}", core, e);
                        }
                    }
                    run_reactor(core, rx, idle)
                })
                .map_err(|e| Error::SpawnThread(core, e))?;
            threads.push(ReactorThread {
                worker: Some((tx.clone(), handle)),
            });
            senders.insert(core, tx);
        }
        Ok(Reactors {
            threads,
            bridge: CrossCoreEventBridge {
                senders: Arc::new(senders),
            },
        })
    }

    pub fn bridge(&self) -> CrossCoreEventBridge {
        self.bridge.clone()
    }

    /// Stops every reactor after the calls already queued to it have run.
    pub fn stop(mut self) {
        for t in &mut self.threads {
            t.stop_internal();
        }
    }
}
