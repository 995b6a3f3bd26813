//! The supervisor: a single-threaded event loop over the self-pipe.
//!
//! Signals, worker packets and file changes all arrive as one-byte control
//! codes on one descriptor, so the loop has exactly one place to block.
//! Each generation spawns a worker, reacts to events until something ends
//! the generation, tears the worker down, and reports how the next
//! iteration should proceed.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipc::{self, ProcessGroup};
use crate::monitor;
use crate::pipe::{new_packet_queue, Packet, PacketQueue};
use crate::proxy::FileMonitorProxy;
use crate::signal::{
    self, ControlChannel, CTL_FILE_CHANGED, CTL_SIGCHLD, CTL_SIGHUP, CTL_SIGINT, CTL_SIGTERM,
    CTL_WORKER_COMMAND,
};
use crate::worker::{self, ReloaderProxy, Worker, WorkerArgs};
use std::io::BufRead;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of one worker generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WorkerResult {
    /// Stop the supervisor.
    Exit,
    /// Restart after the debounce.
    Reload,
    /// The worker crashed or finished on its own; hold until something
    /// changes.
    Wait,
}

pub(crate) const WAIT_MAIN_SPEC: &str = "reloadex.reloader.wait_main";

/// Start the supervisor, or finish worker startup when called inside one.
///
/// The first call in an ordinary process becomes the supervisor: it blocks
/// in the reload loop and terminates the process with exit code 1 once the
/// loop ends, so it never returns there. Inside a worker (including
/// re-entrant calls) the [`ReloaderProxy`] comes back immediately and the
/// caller carries on as the server.
pub fn start_reloader(spec: &str, config: Config) -> Result<ReloaderProxy> {
    if worker::is_active() {
        return Ok(worker::get_reloader());
    }
    if let Some(proxy) = worker::spawned_worker(spec)? {
        return Ok(proxy);
    }

    let mut reloader = Reloader::new(spec, config)?;
    if let Err(err) = reloader.run() {
        error!("{}", err);
    }
    std::process::exit(1);
}

/// Restarts a worker process whenever the file monitor reports a change.
pub struct Reloader {
    spec: String,
    config: Config,
    control: ControlChannel,
    queue: PacketQueue,
    group: ProcessGroup,
    monitor: Option<FileMonitorProxy>,
}

impl Reloader {
    pub fn new(spec: &str, config: Config) -> Result<Reloader> {
        Ok(Reloader {
            spec: spec.to_string(),
            config,
            control: ControlChannel::new()?,
            queue: new_packet_queue(),
            group: ProcessGroup::new()?,
            monitor: None,
        })
    }

    /// Execute the reloader until interrupted, blocking the current thread.
    pub fn run(&mut self) -> Result<()> {
        signal::capture_signals(&self.control)?;
        let result = self.start_monitor().and_then(|()| self.run_loop());
        self.stop_monitor();
        signal::restore_signals();
        result
    }

    /// Execute a single generation and return the worker's exit code.
    pub fn run_once(&mut self) -> Result<i32> {
        signal::capture_signals(&self.control)?;
        let spec = self.spec.clone();
        let outcome = self
            .start_monitor()
            .and_then(|()| self.run_generation(&spec, false));
        self.stop_monitor();
        signal::restore_signals();
        let (_result, exitcode) = outcome?;
        Ok(exitcode.unwrap_or(1))
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let started = Instant::now();
            let spec = self.spec.clone();
            let result = self.run_generation(&spec, false)?.0;
            if result == WorkerResult::Exit {
                return Ok(());
            }
            if result == WorkerResult::Wait {
                info!("Waiting for changes before reloading.");
                if self.run_generation(WAIT_MAIN_SPEC, true)?.0 == WorkerResult::Exit {
                    return Ok(());
                }
            }
            if let Some(remaining) = remaining_debounce(self.config.reload_interval, started.elapsed())
            {
                thread::sleep(remaining);
            }
        }
    }

    fn run_generation(&mut self, spec: &str, quiet: bool) -> Result<(WorkerResult, Option<i32>)> {
        let args = if spec == self.spec {
            WorkerArgs {
                args: self.config.worker_args.clone(),
                kwargs: self.config.worker_kwargs.clone(),
            }
        } else {
            WorkerArgs::default()
        };
        let mut worker = Worker::new(spec, args, self.config.scan_vendored);

        let proxy = self
            .monitor
            .as_ref()
            .ok_or_else(|| Error::Monitor("file monitor is not running".to_string()))?;
        proxy.clear_changes();
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }

        worker.start(&self.queue, self.control.notifier())?;
        if let Err(err) = self.group.add_child(worker.pid()) {
            debug!("couldn't add the worker to the process group: {}", err);
        }
        if quiet {
            debug!("Starting monitor for PID {}.", worker.pid());
        } else {
            info!("Starting monitor for PID {}.", worker.pid());
        }

        let mut result = WorkerResult::Wait;
        let mut soft_kill = true;
        let fatal = loop {
            // Every packet the worker managed to send is applied before any
            // other event is considered: a watch announcement must never
            // lose to the file change it enables.
            let packet = match self.queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            if let Some(packet) = packet {
                match packet {
                    None => {
                        if worker.is_alive() {
                            // a closed pipe with a live process is either a
                            // crash in progress or a stuck child; give it
                            // one interval to become the former
                            thread::sleep(self.config.reload_interval);
                        }
                        if worker.is_alive() {
                            if quiet {
                                debug!("Worker pipe died unexpectedly, triggering a reload.");
                            } else {
                                info!("Worker pipe died unexpectedly, triggering a reload.");
                            }
                            result = WorkerResult::Reload;
                        } else {
                            debug!("worker pipe closed, looks like a crash");
                        }
                        break false;
                    }
                    Some(Packet::Reload) => {
                        debug!("worker triggered a reload");
                        result = WorkerResult::Reload;
                        break false;
                    }
                    Some(Packet::WatchFiles(paths)) => {
                        for path in &paths {
                            proxy.add_path(path);
                        }
                        continue;
                    }
                    Some(other) => {
                        debug!("ignoring unexpected packet {:?}", other);
                        continue;
                    }
                }
            }

            let code = match self.control.wait()? {
                Some(code) => code,
                None => {
                    result = WorkerResult::Exit;
                    break true;
                }
            };
            match code {
                CTL_WORKER_COMMAND => {}
                CTL_FILE_CHANGED => {
                    if proxy.is_changed() {
                        result = WorkerResult::Reload;
                        break false;
                    }
                }
                CTL_SIGHUP => {
                    info!("Received SIGHUP, triggering a reload.");
                    result = WorkerResult::Reload;
                    break false;
                }
                CTL_SIGINT => {
                    // the terminal already delivered the interrupt to the
                    // whole group; a soft kill would deliver it twice
                    result = WorkerResult::Exit;
                    soft_kill = false;
                    break false;
                }
                CTL_SIGTERM => {
                    result = WorkerResult::Exit;
                    break false;
                }
                CTL_SIGCHLD => {
                    if !worker.is_alive() {
                        break false;
                    }
                }
                other => debug!("ignoring unknown control code {}", other),
            }
        };
        if fatal {
            error!("Lost the control channel, shutting down.");
        }

        if worker.is_alive() {
            if let Some(grace) = self.config.shutdown_interval {
                if soft_kill {
                    if quiet {
                        debug!("Gracefully killing the server.");
                    } else {
                        info!("Gracefully killing the server.");
                    }
                    worker.kill(true);
                }
                worker.wait(grace);
            }
        }
        if worker.is_alive() {
            if quiet {
                debug!("Server did not exit, forcefully killing.");
            } else {
                info!("Server did not exit, forcefully killing.");
            }
            worker.kill(false);
        }
        worker.join();
        if let Some(code) = worker.exitcode() {
            debug!("Server exited with code {}.", code);
        }

        proxy.clear_changes();
        Ok((result, worker.exitcode()))
    }

    fn start_monitor(&mut self) -> Result<()> {
        let interval = self.config.reload_interval;
        let factory = self
            .config
            .monitor_factory
            .unwrap_or_else(monitor::find_default_monitor_factory);

        let notifier = self.control.notifier();
        let mut proxy = match FileMonitorProxy::new(factory, interval, &self.config.ignore_files, move || {
            notifier.notify(CTL_FILE_CHANGED)
        }) {
            Ok(proxy) => proxy,
            Err(err) => {
                // watch limits and missing daemons land here; polling
                // always works
                warn!("file monitor failed to start ({}), falling back to polling", err);
                let notifier = self.control.notifier();
                FileMonitorProxy::new(
                    monitor::polling_monitor,
                    interval,
                    &self.config.ignore_files,
                    move || notifier.notify(CTL_FILE_CHANGED),
                )?
            }
        };
        proxy.start()?;
        self.monitor = Some(proxy);
        Ok(())
    }

    fn stop_monitor(&mut self) {
        if let Some(mut proxy) = self.monitor.take() {
            proxy.stop();
        }
    }
}

/// Entry point for the wait-for-changes child: read one line from the
/// terminal and ask for a reload, or sit quietly until the supervisor
/// replaces us.
pub(crate) fn wait_main(_args: &WorkerArgs) -> i32 {
    if ipc::stdin_is_tty() {
        let stdin = std::io::stdin();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_ok() && !line.is_empty() {
            worker::get_reloader().trigger_reload();
            return 0;
        }
    }
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

/// Sleep long enough that generations start at least one reload interval
/// apart.
fn remaining_debounce(interval: Duration, elapsed: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_clamps_to_zero() {
        let interval = Duration::from_secs(1);
        assert_eq!(
            remaining_debounce(interval, Duration::from_millis(300)),
            Some(Duration::from_millis(700))
        );
        assert_eq!(remaining_debounce(interval, Duration::from_secs(5)), None);
    }

    #[test]
    fn worker_results_compare() {
        assert_eq!(WorkerResult::Reload, WorkerResult::Reload);
        assert_ne!(WorkerResult::Exit, WorkerResult::Wait);
    }
}
