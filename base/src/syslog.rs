// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Logging bootstrap.
//!
//! Code logs through the `log` macros re-exported from this crate (`base::error!` and friends).
//! Until [`init`] or [`init_with`] succeeds those messages are discarded.
//!
//! ```
//! use base::syslog;
//! use base::warn;
//!
//! syslog::init().expect("failed to initialize logging");
//! warn!("this is your {} warning", "final");
//! ```

use std::env;
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error as ThisError;

static INIT: Once = Once::new();

/// Errors returned by [`init_with`].
#[sorted]
#[derive(ThisError, Debug)]
pub enum Error {
    /// A different logger was installed by someone else.
    #[error("a global logger is already installed: {0}")]
    AlreadyInstalled(log::SetLoggerError),
}

/// Logging configuration, usually part of a launcher's config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `env_logger` style filter, e.g. `info` or `vhost_target::virtio=trace`. `RUST_LOG` wins
    /// when it is set.
    pub filter: String,
    /// Name printed in front of each line. Defaults to the executable name.
    pub proc_name: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
            proc_name: None,
        }
    }
}

fn get_proc_name() -> String {
    env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or("vhost")
        .to_string()
}

/// Installs the logger with [`LogConfig::default`]. Calling it again is a no-op.
pub fn init() -> Result<(), Error> {
    init_with(LogConfig::default())
}

/// Installs the logger once. Later calls keep the first configuration and return `Ok`.
pub fn init_with(cfg: LogConfig) -> Result<(), Error> {
    let mut result = Ok(());
    INIT.call_once(|| {
        let proc_name = cfg.proc_name.clone().unwrap_or_else(get_proc_name);
        let filter = env::var("RUST_LOG").unwrap_or(cfg.filter);

        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&filter);
        builder.format(move |buf, record| {
            write!(buf, "[{} {}", proc_name, record.level())?;
            if let Some(path) = record.file() {
                write!(buf, " {}", path)?;
                if let Some(line) = record.line() {
                    write!(buf, ":{}", line)?;
                }
            }
            writeln!(buf, "] {}", record.args())
        });
        let logger = builder.build();
        let max_level = logger.filter();
        match log::set_boxed_logger(Box::new(logger)) {
            Ok(()) => log::set_max_level(max_level),
            Err(e) => result = Err(Error::AlreadyInstalled(e)),
        }
    });
    result
}
