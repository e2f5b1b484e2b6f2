// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Launcher-facing configuration.
//!
//! A launcher parses its own command line or config file into these structs; nothing here reads
//! the environment. All fields have defaults, so `{}` is a valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use base::syslog::LogConfig;
use serde::Deserialize;
use serde::Serialize;

use crate::reactor::CoreId;
use crate::reactor::CoreMask;
use crate::vhost::DeviceType;

/// Reactor thread layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    /// Cores that get a reactor thread.
    pub cores: Vec<CoreId>,
    /// How long an idle reactor sleeps waiting for cross-core calls before polling again.
    pub idle_poll_interval_us: u64,
    /// Pin each reactor thread to the CPU with its core number.
    pub pin_threads: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            cores: vec![0],
            idle_poll_interval_us: 100,
            pin_threads: false,
        }
    }
}

fn default_event_timeout_ms() -> u64 {
    1000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_max_queue_size() -> u16 {
    256
}

fn default_cpumask() -> CoreMask {
    CoreMask::new(1)
}

/// One vhost device to construct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    /// Cores the device may be polled on.
    #[serde(default = "default_cpumask")]
    pub cpumask: CoreMask,
    pub device_type: DeviceType,
    /// Deadline for each cross-core control call.
    #[serde(default = "default_event_timeout_ms")]
    pub event_timeout_ms: u64,
    /// Deadline for outstanding I/O to drain on removal.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Largest queue size the front-end may configure.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u16,
}

impl DeviceConfig {
    pub fn new(name: &str, device_type: DeviceType) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            cpumask: default_cpumask(),
            device_type,
            event_timeout_ms: default_event_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_queue_size: default_max_queue_size(),
        }
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Everything a launcher needs to bring the target up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub log: LogConfig,
    pub reactor: ReactorConfig,
    pub devices: Vec<DeviceConfig>,
}

impl TargetConfig {
    /// Reads a JSON configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<TargetConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: TargetConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.reactor.cores, vec![0]);
        assert_eq!(cfg.reactor.idle_poll_interval_us, 100);
        assert_eq!(cfg.log, LogConfig::default());
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn device_defaults_and_mask_forms() {
        let cfg: TargetConfig = serde_json::from_str(
            r#"{
                "reactor": { "cores": [0, 1, 2] },
                "devices": [
                    { "name": "scsi0", "device_type": "scsi", "cpumask": "0x6" },
                    { "name": "blk0", "device_type": "blk", "cpumask": 1, "event_timeout_ms": 5 }
                ]
            }"#,
        )
        .unwrap();
        let scsi = &cfg.devices[0];
        assert_eq!(scsi.device_type, DeviceType::Scsi);
        assert_eq!(scsi.cpumask.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(scsi.event_timeout(), Duration::from_secs(1));
        assert_eq!(scsi.drain_timeout(), Duration::from_secs(30));
        assert_eq!(scsi.max_queue_size, 256);
        let blk = &cfg.devices[1];
        assert_eq!(blk.device_type, DeviceType::Blk);
        assert_eq!(blk.event_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(serde_json::from_str::<ReactorConfig>(r#"{ "corez": [1] }"#).is_err());
        assert!(serde_json::from_str::<DeviceConfig>(r#"{ "name": "x" }"#).is_err());
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "log": { "filter": "debug" } }"#).unwrap();
        let cfg = TargetConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.log.filter, "debug");
        assert!(TargetConfig::from_file(Path::new("/nonexistent/target.json")).is_err());
    }
}
