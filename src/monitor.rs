//! The file-monitor contract and backend selection.
//!
//! The supervisor never talks to a backend directly; it goes through the
//! proxy in [`crate::proxy`]. Backends only need to implement the small
//! [`FileMonitor`] trait and are constructed through a [`MonitorFactory`]
//! so embedders can supply their own.

use crate::error::Result;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Invoked by a backend with the path of a changed file. May be called from
/// any backend thread.
pub type ChangeCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Builds a backend from the change callback and the reload interval.
pub type MonitorFactory = fn(ChangeCallback, Duration) -> Result<Box<dyn FileMonitor>>;

pub trait FileMonitor: Send {
    /// Start monitoring a new path. Idempotent, and safe to call while
    /// events are being delivered.
    fn add_path(&self, path: &Path);

    /// Begin producing events. Must not block.
    fn start(&mut self) -> Result<()>;

    /// Request termination.
    fn stop(&self);

    /// Block until the backend has stopped.
    fn join(&mut self);
}

/// Overrides backend auto-detection; accepts `polling`, `native` or
/// `watchman`.
pub const DEFAULT_MONITOR_ENV: &str = "RELOADEX_DEFAULT_MONITOR";

pub fn polling_monitor(
    callback: ChangeCallback,
    interval: Duration,
) -> Result<Box<dyn FileMonitor>> {
    Ok(Box::new(crate::polling::PollingMonitor::new(
        callback, interval,
    )))
}

pub fn native_monitor(
    callback: ChangeCallback,
    _interval: Duration,
) -> Result<Box<dyn FileMonitor>> {
    Ok(Box::new(crate::native::NativeMonitor::new(callback)?))
}

#[cfg(unix)]
pub fn watchman_monitor(
    callback: ChangeCallback,
    _interval: Duration,
) -> Result<Box<dyn FileMonitor>> {
    Ok(Box::new(crate::watchman::WatchmanMonitor::new(callback)?))
}

/// Pick a backend: the environment override first, then a running watchman
/// daemon, then the OS-native watcher. The polling backend is the fallback
/// when native watcher creation fails at runtime.
pub fn find_default_monitor_factory() -> MonitorFactory {
    if let Ok(name) = env::var(DEFAULT_MONITOR_ENV) {
        match name.as_str() {
            "polling" => {
                debug!("file monitor backend: polling");
                return polling_monitor;
            }
            "native" => {
                debug!("file monitor backend: native");
                return native_monitor;
            }
            #[cfg(unix)]
            "watchman" => {
                debug!("file monitor backend: watchman");
                return watchman_monitor;
            }
            other => warn!("unknown monitor backend {:?}, autodetecting", other),
        }
    }

    #[cfg(unix)]
    {
        if watchman_sockpath().is_some() {
            debug!("file monitor backend: watchman");
            return watchman_monitor;
        }
    }

    debug!("file monitor backend: native");
    native_monitor
}

/// Find the watchman socket, preferring `WATCHMAN_SOCK` over asking the
/// daemon itself.
#[cfg(unix)]
pub fn watchman_sockpath() -> Option<PathBuf> {
    if let Ok(path) = env::var("WATCHMAN_SOCK") {
        return Some(PathBuf::from(path));
    }

    let output = std::process::Command::new("watchman")
        .arg("--output-encoding=json")
        .arg("get-sockname")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    value
        .get("sockname")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_selects_polling() {
        env::set_var(DEFAULT_MONITOR_ENV, "polling");
        let factory = find_default_monitor_factory();
        env::remove_var(DEFAULT_MONITOR_ENV);
        assert!(factory == polling_monitor as MonitorFactory);
    }
}
