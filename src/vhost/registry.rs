// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use base::info;
use sync::Mutex;

use crate::config::DeviceConfig;
use crate::reactor::CoreId;
use crate::reactor::CoreMask;
use crate::reactor::CrossCoreEventBridge;
use crate::vhost::ConnectionId;
use crate::vhost::DeviceBackend;
use crate::vhost::DeviceState;
use crate::vhost::Error;
use crate::vhost::Result;
use crate::vhost::VhostDevice;
use crate::vhost::VhostSession;
use crate::vhost::MAX_VHOST_DEVICES;

/// Every constructed device, in construction order.
pub struct DeviceRegistry {
    bridge: CrossCoreEventBridge,
    devices: Mutex<Vec<Arc<VhostDevice>>>,
}

impl DeviceRegistry {
    pub fn new(bridge: CrossCoreEventBridge) -> DeviceRegistry {
        DeviceRegistry {
            bridge,
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Creates a device named `config.name` served by `backend`.
    pub fn construct(
        &self,
        config: DeviceConfig,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Arc<VhostDevice>> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(Error::InvalidName(config.name));
        }
        if config.device_type != backend.device_type() {
            return Err(Error::BackendMismatch {
                expected: config.device_type,
                actual: backend.device_type(),
            });
        }
        if !self.bridge.cores().any(|c| config.cpumask.contains(c)) {
            return Err(Error::InvalidCoreMask(config.cpumask));
        }

        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.name() == config.name) {
            return Err(Error::NameConflict(config.name));
        }
        if devices.len() >= MAX_VHOST_DEVICES {
            return Err(Error::CapacityExceeded {
                what: "devices",
                max: MAX_VHOST_DEVICES,
            });
        }
        let device = Arc::new(VhostDevice::new(config, backend, self.bridge.clone()));
        info!(
            "constructed {} device {} on cpumask {}",
            device.device_type(),
            device.name(),
            device.cpumask()
        );
        devices.push(device.clone());
        Ok(device)
    }

    /// The core in `mask` polling the fewest devices, lowest numbered on ties.
    fn select_core(&self, mask: CoreMask, devices: &[Arc<VhostDevice>]) -> Result<CoreId> {
        self.bridge
            .cores()
            .filter(|&c| mask.contains(c))
            .min_by_key(|&c| {
                let load = devices.iter().filter(|d| d.core() == Some(c)).count();
                (load, c)
            })
            .ok_or(Error::InvalidCoreMask(mask))
    }

    /// Starts device `name` for a newly negotiated connection.
    ///
    /// The connection check, the core choice and the binding happen under one lock, so
    /// concurrent loads see each other's connection and core.
    pub fn load(
        &self,
        name: &str,
        connection_id: ConnectionId,
        session: VhostSession,
    ) -> Result<()> {
        let (device, core, rings) = {
            let devices = self.devices.lock();
            if devices
                .iter()
                .any(|d| d.connection_id() == Some(connection_id))
            {
                return Err(Error::NameConflict(format!("connection {}", connection_id)));
            }
            let device = devices
                .iter()
                .find(|d| d.name() == name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("device {}", name)))?;
            let core = self.select_core(device.cpumask(), &devices)?;
            let rings = device.bind(connection_id, session, core)?;
            (device, core, rings)
        };
        device.start(connection_id, core, rings)
    }

    /// Stops whichever device is serving `connection_id`.
    pub fn unload(&self, connection_id: ConnectionId) -> Result<()> {
        let device = self
            .find_by_connection(connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {}", connection_id)))?;
        device.unload(connection_id)
    }

    /// Removes device `name`, waiting for its outstanding requests, and forgets it.
    pub fn remove(&self, name: &str) -> Result<()> {
        let device = self
            .find_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("device {}", name)))?;
        device.remove()?;
        if device.state() == DeviceState::Unloaded {
            self.devices.lock().retain(|d| !Arc::ptr_eq(d, &device));
        }
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<VhostDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    pub fn find_by_connection(&self, connection_id: ConnectionId) -> Option<Arc<VhostDevice>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.connection_id() == Some(connection_id))
            .cloned()
    }

    /// Snapshot of all devices in construction order.
    pub fn devices(&self) -> Vec<Arc<VhostDevice>> {
        self.devices.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::config::ReactorConfig;
    use crate::reactor::Reactors;
    use crate::testing::GuestDriver;
    use crate::testing::MemBdev;
    use crate::vhost::blk::BlkBackend;
    use crate::vhost::DeviceType;

    fn reactors() -> Reactors {
        Reactors::new(&ReactorConfig {
            cores: vec![0, 1],
            ..Default::default()
        })
        .unwrap()
    }

    fn blk(name: &str) -> Arc<dyn DeviceBackend> {
        BlkBackend::new(MemBdev::new(name, 512, 64), 1).unwrap()
    }

    fn config(name: &str, mask: u64) -> DeviceConfig {
        let mut cfg = DeviceConfig::new(name, DeviceType::Blk);
        cfg.cpumask = CoreMask::new(mask);
        cfg
    }

    fn session() -> VhostSession {
        let driver = GuestDriver::new(16);
        VhostSession {
            mem: driver.mem.clone(),
            queues: vec![driver.queue_config(0)],
            features: 0,
        }
    }

    #[test]
    fn construct_validation() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        reg.construct(config("blk0", 0x1), blk("m0")).unwrap();
        assert!(matches!(
            reg.construct(config("blk0", 0x1), blk("m1")),
            Err(Error::NameConflict(_))
        ));
        assert!(matches!(
            reg.construct(config("", 0x1), blk("m2")),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            reg.construct(config("blk1", 0x4), blk("m3")),
            Err(Error::InvalidCoreMask(_))
        ));
        let scsi = DeviceConfig::new("scsi0", DeviceType::Scsi);
        assert!(matches!(
            reg.construct(scsi, blk("m4")),
            Err(Error::BackendMismatch { .. })
        ));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find_by_name("blk0").unwrap().state(), DeviceState::Constructed);
    }

    #[test]
    fn capacity_limit() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        for i in 0..MAX_VHOST_DEVICES {
            reg.construct(config(&format!("d{}", i), 0x1), blk("m"))
                .unwrap();
        }
        assert!(matches!(
            reg.construct(config("one-more", 0x1), blk("m")),
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn load_balances_across_cores() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        for name in ["a", "b", "c"] {
            reg.construct(config(name, 0x3), blk(name)).unwrap();
        }
        reg.load("a", 10, session()).unwrap();
        reg.load("b", 11, session()).unwrap();
        reg.load("c", 12, session()).unwrap();
        let cores: Vec<_> = reg.devices().iter().map(|d| d.core()).collect();
        assert_eq!(cores, vec![Some(0), Some(1), Some(0)]);

        assert!(matches!(
            reg.load("missing", 13, session()),
            Err(Error::NotFound(_))
        ));
        assert_eq!(reg.find_by_connection(11).unwrap().name(), "b");

        reg.unload(11).unwrap();
        assert!(reg.find_by_connection(11).is_none());
        assert!(matches!(reg.unload(11), Err(Error::NotFound(_))));

        reg.remove("c").unwrap();
        assert!(reg.find_by_name("c").is_none());
        assert!(matches!(reg.remove("c"), Err(Error::NotFound(_))));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_connection_rejected() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        reg.construct(config("a", 0x1), blk("a")).unwrap();
        reg.construct(config("b", 0x1), blk("b")).unwrap();
        reg.load("a", 1, session()).unwrap();
        assert!(matches!(
            reg.load("b", 1, session()),
            Err(Error::NameConflict(_))
        ));
    }

    #[test]
    fn concurrent_loads_share_one_connection() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        let names: Vec<String> = (0..8).map(|i| format!("d{}", i)).collect();
        for name in &names {
            reg.construct(config(name, 0x3), blk(name)).unwrap();
        }
        let barrier = &Barrier::new(names.len());
        let reg = &reg;
        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    s.spawn(move || {
                        barrier.wait();
                        reg.load(name, 1, session())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::NameConflict(_))));
        assert_eq!(
            reg.devices()
                .iter()
                .filter(|d| d.connection_id() == Some(1))
                .count(),
            1
        );
    }

    #[test]
    fn concurrent_loads_balance_cores() {
        let r = reactors();
        let reg = DeviceRegistry::new(r.bridge());
        let names: Vec<String> = (0..6).map(|i| format!("d{}", i)).collect();
        for name in &names {
            reg.construct(config(name, 0x3), blk(name)).unwrap();
        }
        let barrier = &Barrier::new(names.len());
        let reg = &reg;
        thread::scope(|s| {
            for (i, name) in names.iter().enumerate() {
                s.spawn(move || {
                    barrier.wait();
                    reg.load(name, i as ConnectionId, session()).unwrap();
                });
            }
        });
        let on_core = |c| reg.devices().iter().filter(|d| d.core() == Some(c)).count();
        assert_eq!(on_core(0), 3);
        assert_eq!(on_core(1), 3);
    }
}
