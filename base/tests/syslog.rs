// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::syslog;
use base::syslog::LogConfig;

#[test]
fn macros() {
    syslog::init_with(LogConfig {
        filter: "debug".to_string(),
        proc_name: Some("syslog-test".to_string()),
    })
    .unwrap();
    // A second initialisation keeps the first logger.
    syslog::init().unwrap();

    base::error!("this is an error {}", 3);
    base::warn!("this is a warning {}", "uh oh");
    base::info!("this is info {}", true);
    base::debug!("this is debug info {:?}", Some("helpful stuff"));
    base::trace!("this is filtered out");
}

#[test]
fn config_from_json() {
    let cfg: LogConfig =
        serde_json::from_str(r#"{"filter": "vhost_target::virtio=trace", "proc_name": "tgt"}"#)
            .unwrap();
    assert_eq!(cfg.filter, "vhost_target::virtio=trace");
    assert_eq!(cfg.proc_name.as_deref(), Some("tgt"));

    assert!(serde_json::from_str::<LogConfig>(r#"{"pipe": true}"#).is_err());
}
