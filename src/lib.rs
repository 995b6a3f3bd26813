//! Restarts an embedded server process when its source files change.
//!
//! The first call to [`start_reloader`] turns the process into a supervisor
//! that spawns the same program again as a monitored worker. Inside the
//! worker the call returns a [`ReloaderProxy`] immediately and the caller
//! carries on as the server, so the usual pattern is a single call near the
//! top of `main`:
//!
//! ```no_run
//! fn main() -> reloadex::Result<()> {
//!     let proxy = reloadex::start_reloader("myapp.main", reloadex::Config::default())?;
//!     proxy.watch_files(vec!["config.ini".into()]);
//!     // run the server ...
//!     Ok(())
//! }
//! ```
//!
//! The supervisor restarts the worker when a watched file changes, when the
//! worker calls [`ReloaderProxy::trigger_reload`], or on SIGHUP, and stops
//! on SIGINT or SIGTERM.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod cli;
pub mod config;
pub mod error;
mod ipc;
pub mod monitor;
mod native;
mod pipe;
mod polling;
mod proxy;
pub mod reloader;
mod scanner;
mod signal;
#[cfg(unix)]
mod watchman;
pub mod worker;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::monitor::{ChangeCallback, FileMonitor, MonitorFactory};
pub use crate::reloader::{start_reloader, Reloader, WorkerResult};
pub use crate::worker::{
    get_reloader, is_active, register_worker, spawned_worker, ReloaderProxy, WorkerArgs,
};
