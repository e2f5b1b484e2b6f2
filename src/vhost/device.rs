// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One vhost device and the poller that runs it on its core.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use base::debug;
use base::error;
use base::info;
use smallvec::SmallVec;
use sync::Mutex;
use vm_memory::MemoryMap;
use vm_memory::MemoryRegion;

use crate::config::DeviceConfig;
use crate::reactor::CoreContext;
use crate::reactor::CoreId;
use crate::reactor::CoreMask;
use crate::reactor::CrossCoreEventBridge;
use crate::reactor::Poller;
use crate::reactor::PollerId;
use crate::vhost::ConnectionId;
use crate::vhost::DeviceBackend;
use crate::vhost::DeviceType;
use crate::vhost::Error;
use crate::vhost::PendingRequest;
use crate::vhost::QueueHandler;
use crate::vhost::Result;
use crate::vhost::UsedSink;
use crate::vhost::MAX_VHOST_VRINGS;
use crate::virtio;
use crate::virtio::DescriptorChain;
use crate::virtio::QueueConfig;
use crate::virtio::VirtqueueRing;

/// Most chains taken from one queue per polling round.
const REQUEST_BATCH: u16 = 32;
/// How often an unload or removal rechecks whether its core finished the drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Exists but no driver is connected.
    Constructed,
    /// Polled on its core for a connected driver.
    Loaded,
    /// The driver went away; outstanding requests are draining.
    Disconnecting,
    /// Being destroyed; outstanding requests are draining.
    Removing,
    /// Destroyed.
    Unloaded,
}

/// What a front-end negotiated with the driver before the device can start.
pub struct VhostSession {
    pub mem: MemoryMap,
    pub queues: Vec<QueueConfig>,
    /// Features acknowledged by the driver.
    pub features: u64,
}

#[derive(Clone, Copy)]
struct Binding {
    connection_id: ConnectionId,
    core: CoreId,
    poller: Option<PollerId>,
    features: u64,
    num_queues: usize,
}

struct DeviceInner {
    state: DeviceState,
    binding: Option<Binding>,
}

/// A vhost device.
///
/// Control operations may be called from any non-reactor thread. While loaded, all request
/// processing happens on the single core recorded at load time.
pub struct VhostDevice {
    config: DeviceConfig,
    backend: Arc<dyn DeviceBackend>,
    bridge: CrossCoreEventBridge,
    task_cnt: Arc<AtomicU32>,
    inner: Mutex<DeviceInner>,
}

impl VhostDevice {
    pub fn new(
        config: DeviceConfig,
        backend: Arc<dyn DeviceBackend>,
        bridge: CrossCoreEventBridge,
    ) -> VhostDevice {
        VhostDevice {
            config,
            backend,
            bridge,
            task_cnt: Arc::new(AtomicU32::new(0)),
            inner: Mutex::new(DeviceInner {
                state: DeviceState::Constructed,
                binding: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.backend.device_type()
    }

    pub fn cpumask(&self) -> CoreMask {
        self.config.cpumask
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn offered_features(&self) -> u64 {
        self.backend.offered_features()
    }

    pub fn config_space(&self) -> Vec<u8> {
        self.backend.config_space()
    }

    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.lock().binding.map(|b| b.connection_id)
    }

    /// The core polling the device, once a load has been started.
    pub fn core(&self) -> Option<CoreId> {
        self.inner.lock().binding.map(|b| b.core)
    }

    pub fn negotiated_features(&self) -> Option<u64> {
        self.inner.lock().binding.map(|b| b.features)
    }

    pub fn num_queues(&self) -> usize {
        self.inner.lock().binding.map_or(0, |b| b.num_queues)
    }

    /// Requests taken from the available rings and not yet posted as used.
    pub fn task_count(&self) -> u32 {
        self.task_cnt.load(Ordering::Acquire)
    }

    fn invalid_state(&self, state: DeviceState, op: &'static str) -> Error {
        Error::InvalidState {
            name: self.name().to_string(),
            state,
            op,
        }
    }

    fn check_session(&self, session: &VhostSession) -> Result<()> {
        if session.mem.num_regions() == 0 {
            return Err(Error::NotReady("no memory table".to_string()));
        }
        let max = self.backend.max_queues().min(MAX_VHOST_VRINGS);
        if session.queues.len() > max {
            return Err(Error::CapacityExceeded { what: "queues", max });
        }
        if session.queues.len() < self.backend.min_queues() {
            return Err(Error::NotReady(format!(
                "{} queues set up, {} required",
                session.queues.len(),
                self.backend.min_queues()
            )));
        }
        let unoffered = session.features & !self.backend.offered_features();
        if unoffered != 0 {
            return Err(Error::NotReady(format!(
                "features {:#x} were never offered",
                unoffered
            )));
        }
        for (i, queue) in session.queues.iter().enumerate() {
            if !queue.is_ready() {
                return Err(Error::NotReady(format!("queue {} addresses not set", i)));
            }
            if queue.size() > self.config.max_queue_size {
                return Err(Error::Queue(virtio::Error::InvalidQueueSize(queue.size())));
            }
        }
        Ok(())
    }

    /// Starts polling the device on `core` for `connection_id`.
    ///
    /// On [`Error::TimedOut`] the start is still pending on `core` and takes effect when the core
    /// gets to it.
    pub fn load(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        session: VhostSession,
        core: CoreId,
    ) -> Result<()> {
        let rings = self.bind(connection_id, session, core)?;
        self.start(connection_id, core, rings)
    }

    /// Checks `session` and records the device as taken by `connection_id` on `core`, without
    /// contacting the core yet.
    pub(super) fn bind(
        &self,
        connection_id: ConnectionId,
        session: VhostSession,
        core: CoreId,
    ) -> Result<Vec<VirtqueueRing>> {
        let mut inner = self.inner.lock();
        if inner.state != DeviceState::Constructed || inner.binding.is_some() {
            return Err(self.invalid_state(inner.state, "load"));
        }
        self.check_session(&session)?;
        let VhostSession {
            mem,
            queues,
            features,
        } = session;
        let rings = queues
            .into_iter()
            .map(|mut queue| {
                queue.ack_features(features);
                queue.activate(&mem)
            })
            .collect::<virtio::Result<Vec<_>>>()
            .map_err(Error::Queue)?;
        inner.binding = Some(Binding {
            connection_id,
            core,
            poller: None,
            features,
            num_queues: rings.len(),
        });
        Ok(rings)
    }

    /// Registers the poller for a device bound by [`VhostDevice::bind`].
    pub(super) fn start(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        core: CoreId,
        rings: Vec<VirtqueueRing>,
    ) -> Result<()> {
        let device = self.clone();
        let res = self.bridge.call(
            core,
            self.config.event_timeout(),
            &format!("{}: load", self.name()),
            move |ctx| device.start_on_core(ctx, rings),
        );
        match res {
            Ok(Ok(())) => {
                info!(
                    "{}: loaded for connection {} on core {}",
                    self.name(),
                    connection_id,
                    core
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e @ crate::reactor::Error::TimedOut(_)) => Err(e.into()),
            Err(e) => {
                // The start never reached the core.
                let mut inner = self.inner.lock();
                if inner.state == DeviceState::Constructed {
                    inner.binding = None;
                }
                Err(e.into())
            }
        }
    }

    fn start_on_core(&self, ctx: &mut CoreContext, rings: Vec<VirtqueueRing>) -> Result<()> {
        let handler = match self.backend.start(ctx.core()) {
            Ok(h) => h,
            Err(e) => {
                self.inner.lock().binding = None;
                return Err(Error::BackendStart(e));
            }
        };
        let poller = DevicePoller::new(
            self.name().to_string(),
            rings,
            handler,
            self.task_cnt.clone(),
        );
        let id = ctx.register_poller(poller);
        let mut inner = self.inner.lock();
        if let Some(binding) = inner.binding.as_mut() {
            binding.poller = Some(id);
        }
        inner.state = DeviceState::Loaded;
        Ok(())
    }

    /// Stops the device for a departing connection, waiting for outstanding requests. The device
    /// returns to [`DeviceState::Constructed`] and can be loaded again.
    ///
    /// On [`Error::TimedOut`] from the core the device stays [`DeviceState::Disconnecting`] and the
    /// drain finishes on the core.
    pub fn unload(self: &Arc<Self>, connection_id: ConnectionId) -> Result<()> {
        let (core, poller) = {
            let mut inner = self.inner.lock();
            let binding = match (inner.state, inner.binding) {
                (DeviceState::Loaded, Some(b)) if b.connection_id == connection_id => b,
                (DeviceState::Loaded, _) => {
                    return Err(Error::NotFound(format!("connection {}", connection_id)))
                }
                (state, _) => return Err(self.invalid_state(state, "unload")),
            };
            let poller = binding
                .poller
                .ok_or_else(|| self.invalid_state(inner.state, "unload"))?;
            inner.state = DeviceState::Disconnecting;
            (binding.core, poller)
        };

        self.drain(core, poller, DeviceState::Constructed)?;
        info!("{}: unloaded connection {}", self.name(), connection_id);
        Ok(())
    }

    /// Destroys the device, first waiting for any outstanding requests to complete.
    ///
    /// Calling it again while removal is in progress, or after it finished, returns `Ok` without
    /// starting another drain.
    pub fn remove(self: &Arc<Self>) -> Result<()> {
        let binding = {
            let mut inner = self.inner.lock();
            match inner.state {
                DeviceState::Removing | DeviceState::Unloaded => {
                    debug!("{}: already {:?}", self.name(), inner.state);
                    return Ok(());
                }
                DeviceState::Disconnecting => {
                    return Err(self.invalid_state(inner.state, "remove"))
                }
                DeviceState::Constructed if inner.binding.is_some() => {
                    // A load is still in flight on its core.
                    return Err(self.invalid_state(inner.state, "remove"));
                }
                _ => {
                    inner.state = DeviceState::Removing;
                    inner.binding
                }
            }
        };

        match binding {
            Some(Binding {
                core,
                poller: Some(poller),
                ..
            }) => self.drain(core, poller, DeviceState::Unloaded)?,
            _ => self.settle(DeviceState::Unloaded),
        }
        info!("{}: removed", self.name());
        Ok(())
    }

    /// Ends an unload or removal: unbinds the device and moves it to `state`.
    fn settle(&self, state: DeviceState) {
        if state == DeviceState::Unloaded {
            self.backend.on_remove();
        }
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.binding = None;
    }

    /// Has the poller on `core` stop fetching new requests and retire once every outstanding one
    /// has been posted, settling the device in `finish`. Whatever the poller does on its core is
    /// final; this only waits for it.
    ///
    /// If requests are still outstanding after the drain timeout the drain is cancelled on the
    /// core, which puts the device back to [`DeviceState::Loaded`].
    fn drain(self: &Arc<Self>, core: CoreId, poller: PollerId, finish: DeviceState) -> Result<()> {
        let timeout = self.config.event_timeout();
        let drain_timeout = self.config.drain_timeout();
        let device = self.clone();
        let res = self.bridge.call(
            core,
            timeout,
            &format!("{}: drain", self.name()),
            move |ctx| match ctx.poller_mut::<DevicePoller>(poller) {
                Some(p) => {
                    p.drain = Some(Drain { device, finish });
                    true
                }
                None => false,
            },
        );
        match res {
            Ok(true) => {}
            Ok(false) => {
                self.inner.lock().state = DeviceState::Loaded;
                return Err(Error::NotFound(format!("poller of {}", self.name())));
            }
            // Still queued on the core, which finishes the drain when it gets to it.
            Err(e @ crate::reactor::Error::TimedOut(_)) => return Err(e.into()),
            Err(e) => {
                // Never reached the core.
                self.inner.lock().state = DeviceState::Loaded;
                return Err(e.into());
            }
        }

        let deadline = Instant::now() + drain_timeout;
        while Instant::now() < deadline {
            if self.state() == finish {
                return Ok(());
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }

        let device = self.clone();
        let cancelled = self.bridge.call(
            core,
            timeout,
            &format!("{}: cancel drain", self.name()),
            move |ctx| match ctx.poller_mut::<DevicePoller>(poller) {
                Some(p) => {
                    p.drain = None;
                    device.inner.lock().state = DeviceState::Loaded;
                    true
                }
                // Retired between the deadline and this call.
                None => false,
            },
        )?;
        if !cancelled {
            return Ok(());
        }
        let outstanding = self.task_count();
        error!(
            "{}: {} requests still outstanding after {:?}",
            self.name(),
            outstanding,
            drain_timeout
        );
        Err(Error::TimedOut(format!(
            "{} requests outstanding on {}",
            outstanding,
            self.name()
        )))
    }

    /// Replaces the guest memory table of a loaded device.
    ///
    /// The new table is swapped in between polling rounds, after checking that every ring is
    /// still mapped by it. Requests already in flight keep the mappings they were started with.
    pub fn set_mem_table(&self, regions: Vec<MemoryRegion>) -> Result<()> {
        let mem = MemoryMap::new(regions).map_err(Error::Memory)?;
        let (core, poller) = {
            let inner = self.inner.lock();
            match (inner.state, inner.binding) {
                (
                    DeviceState::Loaded,
                    Some(Binding {
                        core,
                        poller: Some(poller),
                        ..
                    }),
                ) => (core, poller),
                (state, _) => return Err(self.invalid_state(state, "remap memory")),
            }
        };
        let name = self.name().to_string();
        self.bridge.call(
            core,
            self.config.event_timeout(),
            &format!("{}: remap memory", name),
            move |ctx| match ctx.poller_mut::<DevicePoller>(poller) {
                Some(p) => p.set_memory(mem).map_err(Error::Queue),
                None => Err(Error::NotFound(format!("poller of {}", name))),
            },
        )??;
        info!("{}: memory table updated", self.name());
        Ok(())
    }
}

/// Moves requests between a loaded device's rings and its handler. Registered on the device's
/// core for as long as the device is loaded.
struct DevicePoller {
    name: String,
    rings: Vec<VirtqueueRing>,
    /// Queues whose available ring was found corrupt; they are no longer read.
    broken: Vec<bool>,
    needs_notify: Vec<bool>,
    handler: Box<dyn QueueHandler>,
    sink: UsedSink,
    task_cnt: Arc<AtomicU32>,
    /// Set while draining; no new requests are fetched.
    drain: Option<Drain>,
    done: bool,
}

/// A drain in progress on the device's poller.
struct Drain {
    device: Arc<VhostDevice>,
    /// Where the device ends up once nothing is outstanding.
    finish: DeviceState,
}

impl DevicePoller {
    fn new(
        name: String,
        rings: Vec<VirtqueueRing>,
        handler: Box<dyn QueueHandler>,
        task_cnt: Arc<AtomicU32>,
    ) -> DevicePoller {
        let n = rings.len();
        DevicePoller {
            name,
            rings,
            broken: vec![false; n],
            needs_notify: vec![false; n],
            handler,
            sink: UsedSink::default(),
            task_cnt,
            drain: None,
            done: false,
        }
    }

    fn set_memory(&mut self, mem: MemoryMap) -> virtio::Result<()> {
        for ring in &self.rings {
            ring.check_memory(&mem)?;
        }
        for ring in &mut self.rings {
            ring.set_memory(mem.clone())?;
        }
        Ok(())
    }

    fn process_queue(&mut self, queue: usize) -> usize {
        let ring = &mut self.rings[queue];
        let mut batch = match ring.fetch_available(REQUEST_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                error!("{}: queue {} disabled: {}", self.name, queue, e);
                self.broken[queue] = true;
                return 0;
            }
        };
        let mut fetched: SmallVec<[(u16, virtio::Result<DescriptorChain>); 32]> = SmallVec::new();
        while let Some(head) = batch.next() {
            fetched.push((head, batch.ring().walk_chain(head)));
        }
        if let Err(e) = batch.accept() {
            error!("{}: queue {}: failed to publish avail_event: {}", self.name, queue, e);
        }

        let count = fetched.len();
        for (head, chain) in fetched {
            match chain {
                Ok(chain) => {
                    self.task_cnt.fetch_add(1, Ordering::AcqRel);
                    let req = PendingRequest::new(chain, queue, self.sink.clone());
                    self.handler.handle_request(queue, req);
                }
                Err(e) => {
                    error!("{}: queue {}: {}", self.name, queue, e);
                    match self.rings[queue].post_used(head, 0) {
                        Ok(()) => self.needs_notify[queue] = true,
                        Err(e) => error!(
                            "{}: queue {}: dropping head {}: {}",
                            self.name, queue, head, e
                        ),
                    }
                }
            }
        }
        count
    }

    fn post_completions(&mut self) -> usize {
        let done = self.sink.drain();
        for entry in &done {
            if let Err(e) = self.rings[entry.queue].post_used(entry.id, entry.len) {
                error!("{}: queue {}: {}", self.name, entry.queue, e);
            }
            self.task_cnt.fetch_sub(1, Ordering::AcqRel);
            self.needs_notify[entry.queue] = true;
        }
        for (ring, notify) in self.rings.iter_mut().zip(self.needs_notify.iter_mut()) {
            if std::mem::take(notify) {
                ring.notify_guest();
            }
        }
        done.len()
    }
}

impl Poller for DevicePoller {
    fn poll(&mut self) -> usize {
        let mut work = self.handler.poll();
        if self.drain.is_none() {
            for queue in 0..self.rings.len() {
                if !self.broken[queue] && self.handler.polls_queue(queue) {
                    work += self.process_queue(queue);
                }
            }
        }
        work += self.post_completions();
        if self.task_cnt.load(Ordering::Acquire) == 0 {
            if let Some(drain) = self.drain.take() {
                debug!("{}: drained", self.name);
                drain.device.settle(drain.finish);
                self.done = true;
            }
        }
        work
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    use vm_memory::GuestAddress;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::reactor::Reactors;
    use crate::testing::GuestDriver;
    use crate::virtio::VIRTQ_DESC_F_NEXT;

    #[derive(Default)]
    struct Switches {
        hold: AtomicBool,
        fail_start: AtomicBool,
        removed: AtomicBool,
    }

    struct TestBackend(Arc<Switches>);

    impl DeviceBackend for TestBackend {
        fn device_type(&self) -> DeviceType {
            DeviceType::Blk
        }

        fn virtio_features(&self) -> u64 {
            0
        }

        fn max_queues(&self) -> usize {
            2
        }

        fn start(&self, _core: CoreId) -> anyhow::Result<Box<dyn QueueHandler>> {
            if self.0.fail_start.load(Ordering::SeqCst) {
                anyhow::bail!("no channel");
            }
            Ok(Box::new(TestHandler {
                switches: self.0.clone(),
                held: Vec::new(),
            }))
        }

        fn on_remove(&self) {
            self.0.removed.store(true, Ordering::SeqCst);
        }
    }

    /// Completes every request with its writable length, or holds them while `hold` is set.
    struct TestHandler {
        switches: Arc<Switches>,
        held: Vec<PendingRequest>,
    }

    impl QueueHandler for TestHandler {
        fn handle_request(&mut self, _queue: usize, req: PendingRequest) {
            self.held.push(req);
        }

        fn poll(&mut self) -> usize {
            if self.switches.hold.load(Ordering::SeqCst) {
                return 0;
            }
            let n = self.held.len();
            for req in self.held.drain(..) {
                let len = req.chain().writable_len() as u32;
                req.complete(len);
            }
            n
        }
    }

    struct Fixture {
        _reactors: Reactors,
        switches: Arc<Switches>,
        device: Arc<VhostDevice>,
        driver: GuestDriver,
    }

    fn fixture(drain_timeout_ms: u64) -> Fixture {
        fixture_with_timeouts(drain_timeout_ms, 1000)
    }

    fn fixture_with_timeouts(drain_timeout_ms: u64, event_timeout_ms: u64) -> Fixture {
        let reactors = Reactors::new(&ReactorConfig {
            cores: vec![0, 1],
            ..Default::default()
        })
        .unwrap();
        let switches = Arc::new(Switches::default());
        let mut config = DeviceConfig::new("vhost.0", DeviceType::Blk);
        config.drain_timeout_ms = drain_timeout_ms;
        config.event_timeout_ms = event_timeout_ms;
        let device = Arc::new(VhostDevice::new(
            config,
            Arc::new(TestBackend(switches.clone())),
            reactors.bridge(),
        ));
        Fixture {
            _reactors: reactors,
            switches,
            device,
            driver: GuestDriver::new(16),
        }
    }

    fn session(driver: &GuestDriver) -> VhostSession {
        VhostSession {
            mem: driver.mem.clone(),
            queues: vec![driver.queue_config(0)],
            features: 0,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Keeps `core` inside a call until the returned sender is used or dropped.
    fn occupy(device: &VhostDevice, core: CoreId) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel::<()>();
        device
            .bridge
            .send(core, move |_| {
                let _ = rx.recv();
            })
            .unwrap();
        tx
    }

    fn pollers_on(device: &VhostDevice, core: CoreId) -> usize {
        device
            .bridge
            .call(core, Duration::from_secs(5), "count pollers", |ctx| ctx.num_pollers())
            .unwrap()
    }

    fn submit(driver: &mut GuestDriver, len: u32) -> u16 {
        let buf = driver.alloc(u64::from(len));
        let head = driver.add_chain(&[(buf, len, true)]);
        driver.publish(head);
        head
    }

    #[test]
    fn load_process_unload() {
        let mut f = fixture(1000);
        f.device.load(3, session(&f.driver), 1).unwrap();
        assert_eq!(f.device.state(), DeviceState::Loaded);
        assert_eq!(f.device.core(), Some(1));
        assert_eq!(f.device.connection_id(), Some(3));
        assert_eq!(f.device.num_queues(), 1);

        let head = submit(&mut f.driver, 64);
        wait_until(|| f.driver.used_idx() == 1);
        assert_eq!(f.driver.used_elem(0), (u32::from(head), 64));
        assert_eq!(f.device.task_count(), 0);

        assert!(matches!(f.device.unload(4), Err(Error::NotFound(_))));
        f.device.unload(3).unwrap();
        assert_eq!(f.device.state(), DeviceState::Constructed);
        assert_eq!(f.device.connection_id(), None);

        // Reconnect where the previous connection left off.
        let mut cfg = f.driver.queue_config(0);
        cfg.set_next_avail(1);
        cfg.set_next_used(1);
        let s = VhostSession {
            mem: f.driver.mem.clone(),
            queues: vec![cfg],
            features: 0,
        };
        f.device.load(5, s, 0).unwrap();
        let head = submit(&mut f.driver, 32);
        wait_until(|| f.driver.used_idx() == 2);
        assert_eq!(f.driver.used_elem(1), (u32::from(head), 32));
    }

    #[test]
    fn load_rejects_incomplete_negotiation() {
        let f = fixture(1000);
        let mut s = session(&f.driver);
        s.features = 1 << 40;
        assert!(matches!(f.device.load(1, s, 1), Err(Error::NotReady(_))));

        let mut s = session(&f.driver);
        s.queues.clear();
        assert!(matches!(f.device.load(1, s, 1), Err(Error::NotReady(_))));

        let mut s = session(&f.driver);
        s.queues = (0..3).map(|_| f.driver.queue_config(0)).collect();
        assert!(matches!(
            f.device.load(1, s, 1),
            Err(Error::CapacityExceeded { max: 2, .. })
        ));

        let mut s = session(&f.driver);
        s.queues = vec![QueueConfig::new(16)];
        assert!(matches!(f.device.load(1, s, 1), Err(Error::NotReady(_))));

        let s = VhostSession {
            mem: MemoryMap::default(),
            ..session(&f.driver)
        };
        assert!(matches!(f.device.load(1, s, 1), Err(Error::NotReady(_))));

        assert!(matches!(
            f.device.load(1, session(&f.driver), 9),
            Err(Error::Reactor(_))
        ));
        assert_eq!(f.device.state(), DeviceState::Constructed);
        assert_eq!(f.device.connection_id(), None);

        f.device.load(1, session(&f.driver), 1).unwrap();
        assert!(matches!(
            f.device.load(2, session(&f.driver), 1),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn backend_start_failure_leaves_device_constructed() {
        let f = fixture(1000);
        f.switches.fail_start.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.device.load(1, session(&f.driver), 1),
            Err(Error::BackendStart(_))
        ));
        assert_eq!(f.device.state(), DeviceState::Constructed);
        assert_eq!(f.device.core(), None);
        f.switches.fail_start.store(false, Ordering::SeqCst);
        f.device.load(1, session(&f.driver), 1).unwrap();
    }

    #[test]
    fn remove_waits_for_outstanding_requests() {
        let mut f = fixture(10_000);
        f.device.load(1, session(&f.driver), 1).unwrap();
        f.switches.hold.store(true, Ordering::SeqCst);
        submit(&mut f.driver, 16);
        wait_until(|| f.device.task_count() == 1);

        let device = f.device.clone();
        let remover = thread::spawn(move || device.remove());
        wait_until(|| f.device.state() == DeviceState::Removing);
        thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished());
        assert_eq!(f.device.state(), DeviceState::Removing);

        // A second removal does not start another drain.
        f.device.remove().unwrap();
        assert_eq!(f.device.state(), DeviceState::Removing);

        f.switches.hold.store(false, Ordering::SeqCst);
        remover.join().unwrap().unwrap();
        assert_eq!(f.device.state(), DeviceState::Unloaded);
        assert_eq!(f.driver.used_idx(), 1);
        assert_eq!(f.device.task_count(), 0);
        assert!(f.switches.removed.load(Ordering::SeqCst));

        f.device.remove().unwrap();
        assert!(matches!(
            f.device.load(1, session(&f.driver), 1),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn drain_timeout_keeps_device_loaded() {
        let mut f = fixture(20);
        f.device.load(1, session(&f.driver), 1).unwrap();
        f.switches.hold.store(true, Ordering::SeqCst);
        submit(&mut f.driver, 16);
        wait_until(|| f.device.task_count() == 1);

        assert!(matches!(f.device.remove(), Err(Error::TimedOut(_))));
        assert_eq!(f.device.state(), DeviceState::Loaded);
        assert!(!f.switches.removed.load(Ordering::SeqCst));

        f.switches.hold.store(false, Ordering::SeqCst);
        wait_until(|| f.driver.used_idx() == 1);
        // Fetching resumed after the failed drain.
        submit(&mut f.driver, 16);
        wait_until(|| f.driver.used_idx() == 2);
        f.device.remove().unwrap();
        assert_eq!(f.device.state(), DeviceState::Unloaded);
    }

    #[test]
    fn timed_out_load_starts_on_core() {
        let mut f = fixture_with_timeouts(1000, 20);
        let release = occupy(&f.device, 1);
        assert!(matches!(
            f.device.load(7, session(&f.driver), 1),
            Err(Error::TimedOut(_))
        ));
        assert_eq!(f.device.state(), DeviceState::Constructed);
        assert_eq!(f.device.core(), Some(1));
        assert!(matches!(f.device.remove(), Err(Error::InvalidState { .. })));

        release.send(()).unwrap();
        wait_until(|| f.device.state() == DeviceState::Loaded);
        assert_eq!(f.device.connection_id(), Some(7));
        let head = submit(&mut f.driver, 16);
        wait_until(|| f.driver.used_idx() == 1);
        assert_eq!(f.driver.used_elem(0), (u32::from(head), 16));
        f.device.unload(7).unwrap();
        assert_eq!(pollers_on(&f.device, 1), 0);
    }

    #[test]
    fn timed_out_drain_finishes_on_core() {
        let mut f = fixture_with_timeouts(10_000, 20);
        f.device.load(1, session(&f.driver), 1).unwrap();
        f.switches.hold.store(true, Ordering::SeqCst);
        submit(&mut f.driver, 16);
        wait_until(|| f.device.task_count() == 1);

        let release = occupy(&f.device, 1);
        assert!(matches!(f.device.remove(), Err(Error::TimedOut(_))));
        // The drain is still queued on the core, so nothing was rolled back.
        assert_eq!(f.device.state(), DeviceState::Removing);
        f.device.remove().unwrap();
        assert!(matches!(f.device.unload(1), Err(Error::InvalidState { .. })));

        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(f.device.state(), DeviceState::Removing);
        assert_eq!(f.device.task_count(), 1);

        f.switches.hold.store(false, Ordering::SeqCst);
        wait_until(|| f.device.state() == DeviceState::Unloaded);
        assert!(f.switches.removed.load(Ordering::SeqCst));
        assert_eq!(f.driver.used_idx(), 1);
        assert_eq!(f.device.core(), None);
        assert_eq!(pollers_on(&f.device, 1), 0);
    }

    #[test]
    fn malformed_chain_is_returned_empty() {
        let mut f = fixture(1000);
        f.device.load(1, session(&f.driver), 1).unwrap();
        // A chain that points back at itself.
        let buf = f.driver.alloc(16);
        f.driver.write_desc(0, buf, 16, VIRTQ_DESC_F_NEXT, 0);
        f.driver.publish(0);
        wait_until(|| f.driver.used_idx() == 1);
        assert_eq!(f.driver.used_elem(0), (0, 0));
        assert_eq!(f.device.task_count(), 0);

        // The queue keeps working.
        let buf = f.driver.alloc(8);
        f.driver.write_desc(1, buf, 8, crate::virtio::VIRTQ_DESC_F_WRITE, 0);
        f.driver.publish(1);
        wait_until(|| f.driver.used_idx() == 2);
        assert_eq!(f.driver.used_elem(1), (1, 8));
    }

    #[test]
    fn remap_memory() {
        let mut f = fixture(1000);
        let regions: Vec<MemoryRegion> = f.driver.mem.regions().cloned().collect();
        assert!(matches!(
            f.device.set_mem_table(regions.clone()),
            Err(Error::InvalidState { .. })
        ));
        f.device.load(1, session(&f.driver), 1).unwrap();
        f.device.set_mem_table(regions).unwrap();

        // Too small to hold the available ring.
        let small = MemoryRegion::anonymous(GuestAddress(0), 0x1000).unwrap();
        assert!(matches!(
            f.device.set_mem_table(vec![small]),
            Err(Error::Queue(virtio::Error::RingOutOfRange { .. }))
        ));

        let head = submit(&mut f.driver, 8);
        wait_until(|| f.driver.used_idx() == 1);
        assert_eq!(f.driver.used_elem(0), (u32::from(head), 8));
    }
}
