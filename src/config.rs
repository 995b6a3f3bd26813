//! Supervisor configuration.
//!
//! [`Config`] is not constructable, use [`ConfigBuilder`].
//!
//! # Examples
//!
//! ```
//! # use reloadex::ConfigBuilder;
//! ConfigBuilder::default()
//!     .reload_interval(std::time::Duration::from_secs(2))
//!     .ignore_files(vec!["*.log".to_string()])
//!     .build()
//!     .expect("invalid config");
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::monitor::MonitorFactory;

/// Settings for the supervisor loop.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
#[non_exhaustive]
pub struct Config {
    /// Minimum wall-clock interval between two worker generations, and the
    /// poll interval handed to the file monitor backend.
    #[builder(default = "Duration::from_secs(1)")]
    pub reload_interval: Duration,
    /// Grace period between a polite kill and a forced one. `None` disables
    /// the graceful step entirely, see [`ConfigBuilder::no_graceful_shutdown`].
    #[builder(default = "Some(Duration::from_secs(1))", setter(strip_option))]
    pub shutdown_interval: Option<Duration>,
    /// Shell-style patterns; matching paths never reach the file monitor.
    #[builder(default)]
    pub ignore_files: Vec<String>,
    /// Positional arguments handed to a registered worker entry point.
    #[builder(default)]
    pub worker_args: Vec<String>,
    /// Keyword arguments handed to a registered worker entry point.
    #[builder(default)]
    pub worker_kwargs: HashMap<String, String>,
    /// Also watch files under `~/.cargo` and toolchain sysroots. Off by
    /// default; third-party code rarely changes mid-development and watching
    /// it makes every dependency update a reload storm.
    #[builder(default)]
    pub scan_vendored: bool,
    /// Explicit file monitor backend. `None` selects one automatically, see
    /// [`crate::monitor::find_default_monitor_factory`].
    #[builder(default, setter(strip_option))]
    pub monitor_factory: Option<MonitorFactory>,
}

impl ConfigBuilder {
    /// Skip the polite-kill step and go straight to a forced kill when a
    /// generation ends with the worker still alive.
    pub fn no_graceful_shutdown(&mut self) -> &mut Self {
        self.shutdown_interval = Some(None);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default()
            .build()
            .expect("default config must build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals() {
        let config = Config::default();
        assert_eq!(config.reload_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_interval, Some(Duration::from_secs(1)));
        assert!(config.ignore_files.is_empty());
        assert!(!config.scan_vendored);
        assert!(config.monitor_factory.is_none());
    }

    #[test]
    fn graceful_shutdown_can_be_disabled() {
        let config = ConfigBuilder::default()
            .no_graceful_shutdown()
            .build()
            .unwrap();
        assert_eq!(config.shutdown_interval, None);
    }

    #[test]
    fn builder_accepts_overrides() {
        let config = ConfigBuilder::default()
            .reload_interval(Duration::from_millis(250))
            .shutdown_interval(Duration::from_secs(5))
            .ignore_files(vec!["/tmp/*".to_string()])
            .build()
            .unwrap();
        assert_eq!(config.reload_interval, Duration::from_millis(250));
        assert_eq!(config.shutdown_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.ignore_files, vec!["/tmp/*".to_string()]);
    }
}
