//! Worker lifecycle: the supervisor-side handle, the child-side bootstrap,
//! and the in-worker capability for talking back upstream.
//!
//! A worker is this same executable spawned again with its original
//! arguments plus a private environment payload. Control therefore flows
//! back into the embedder's `start_reloader` call, which finishes the
//! bootstrap here and hands the caller a [`ReloaderProxy`]. A payload that
//! names a *different* registered entry (the wait-for-changes child, or
//! anything added with [`register_worker`]) runs that entry instead and
//! exits with its return value.

use crate::error::{Error, Result};
use crate::ipc::{self, TermiosSnapshot};
use crate::pipe::{ControlPipe, Packet, PacketQueue};
use crate::scanner::ModuleScanner;
use crate::signal::{self, ControlNotifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WORKER_ENV: &str = "RELOADEX_WORKER";

/// An entry point invocable by dotted name.
pub type WorkerEntry = fn(&WorkerArgs) -> i32;

/// Arguments carried to a registered entry point.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerArgs {
    pub args: Vec<String>,
    pub kwargs: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct SpawnPayload {
    spec: String,
    args: Vec<String>,
    kwargs: HashMap<String, String>,
    pipe: String,
    scan_vendored: bool,
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, WorkerEntry>> = {
        let mut entries: HashMap<String, WorkerEntry> = HashMap::new();
        entries.insert(
            crate::reloader::WAIT_MAIN_SPEC.to_string(),
            crate::reloader::wait_main as WorkerEntry,
        );
        Mutex::new(entries)
    };
    static ref PROXY: Mutex<Option<ReloaderProxy>> = Mutex::new(None);
}

/// Make `entry` reachable by spec name from a freshly spawned worker.
pub fn register_worker(spec: &str, entry: WorkerEntry) {
    if let Ok(mut registry) = REGISTRY.lock() {
        registry.insert(spec.to_string(), entry);
    }
}

fn resolve_spec(spec: &str) -> Option<WorkerEntry> {
    REGISTRY.lock().ok().and_then(|r| r.get(spec).copied())
}

/// `true` while the current process is being monitored by a supervisor.
pub fn is_active() -> bool {
    PROXY.lock().map(|proxy| proxy.is_some()).unwrap_or(false)
}

/// The current process's [`ReloaderProxy`].
///
/// Panics when the process is not controlled by a supervisor; check
/// [`is_active`] first if unsure.
pub fn get_reloader() -> ReloaderProxy {
    PROXY
        .lock()
        .ok()
        .and_then(|proxy| proxy.clone())
        .expect("process is not controlled by reloadex")
}

/// Capability handed to worker code; both calls are transport-level sends
/// on the control pipe.
#[derive(Clone)]
pub struct ReloaderProxy {
    pipe: Arc<ControlPipe>,
}

impl ReloaderProxy {
    /// Ask the supervisor to track some custom paths.
    pub fn watch_files(&self, files: Vec<PathBuf>) {
        if let Err(err) = self.pipe.send(&Packet::WatchFiles(files)) {
            debug!("couldn't reach the supervisor: {}", err);
        }
    }

    /// Ask the supervisor for a restart.
    pub fn trigger_reload(&self) {
        if let Err(err) = self.pipe.send(&Packet::Reload) {
            debug!("couldn't reach the supervisor: {}", err);
        }
    }
}

/// Finish worker-side startup if this process was spawned as a worker.
///
/// Returns `Ok(None)` in an ordinary process, and `Ok(Some(proxy))` in a
/// worker whose payload matches `spec`. When the payload names a different
/// registered entry, that entry runs here and the process exits.
pub fn spawned_worker(spec: &str) -> Result<Option<ReloaderProxy>> {
    if let Ok(Some(proxy)) = PROXY.lock().map(|slot| slot.clone()) {
        return Ok(Some(proxy));
    }
    let payload = match env::var(WORKER_ENV) {
        Ok(payload) => payload,
        Err(_) => return Ok(None),
    };
    // grandchildren must not mistake themselves for workers
    env::remove_var(WORKER_ENV);
    let payload: SpawnPayload = serde_json::from_str(&payload)?;

    let mut pipe = ControlPipe::from_child_env(&payload.pipe)?;
    pipe.activate_child()?;
    signal::ignore_reload_signals();

    let proxy = ReloaderProxy {
        pipe: Arc::new(pipe),
    };
    if let Ok(mut slot) = PROXY.lock() {
        *slot = Some(proxy.clone());
    }

    let mut scanner = ModuleScanner::new(proxy.clone(), payload.scan_vendored);
    scanner.start();
    // a crash anywhere in this process, a registered entry or the server
    // code that continues after the re-entrant call, still reports the
    // files it loaded on the way down
    scanner.install_panic_sweep();

    if payload.spec != spec {
        let args = WorkerArgs {
            args: payload.args,
            kwargs: payload.kwargs,
        };
        let code = match resolve_spec(&payload.spec) {
            Some(entry) => entry(&args),
            None => {
                error!("no worker entry registered for {:?}", payload.spec);
                1
            }
        };
        std::process::exit(code);
    }

    Ok(Some(proxy))
}

/// Supervisor-side handle for one worker generation.
pub struct Worker {
    spec: String,
    args: WorkerArgs,
    scan_vendored: bool,
    pipe: Option<ControlPipe>,
    child: Option<Child>,
    pid: u32,
    exitcode: Option<i32>,
    stdin_termios: Option<TermiosSnapshot>,
}

impl Worker {
    pub fn new(spec: &str, args: WorkerArgs, scan_vendored: bool) -> Worker {
        Worker {
            spec: spec.to_string(),
            args,
            scan_vendored,
            pipe: None,
            child: None,
            pid: 0,
            exitcode: None,
            stdin_termios: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exitcode(&self) -> Option<i32> {
        self.exitcode
    }

    /// Spawn the worker: snapshot the terminal, build the control pipe,
    /// re-exec this binary with the spawn payload, then activate our side
    /// and hand over stdin as the first packet.
    pub fn start(&mut self, queue: &PacketQueue, notifier: ControlNotifier) -> Result<()> {
        self.stdin_termios = ipc::snapshot_termios();

        let mut pipe = ControlPipe::pair()?;
        let stdin = ipc::prepare_stdin()?;

        let payload = SpawnPayload {
            spec: self.spec.clone(),
            args: self.args.args.clone(),
            kwargs: self.args.kwargs.clone(),
            pipe: pipe.child_env(),
            scan_vendored: self.scan_vendored,
        };

        let exe = env::current_exe().map_err(Error::Spawn)?;
        let mut command = Command::new(exe);
        command.args(env::args_os().skip(1));
        command.env(WORKER_ENV, serde_json::to_string(&payload)?);
        command.stdin(Stdio::null());
        ipc::prepare_command(&mut command);

        let child = command.spawn().map_err(Error::Spawn)?;
        self.pid = child.id();

        pipe.activate_parent(queue, notifier)?;
        match ipc::send_handle_to(stdin, self.pid) {
            Ok(remote) => {
                if let Err(err) = pipe.send(&Packet::Stdin(remote)) {
                    debug!("worker died before the stdin handoff: {}", err);
                }
            }
            Err(err) => debug!("stdin handoff failed: {}", err),
        }
        ipc::release_stdin(stdin);

        self.pipe = Some(pipe);
        self.child = Some(child);
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    self.record_exit(status);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Soft is a polite request honoring a grace period; hard is
    /// unconditional.
    pub fn kill(&mut self, soft: bool) {
        if self.child.is_none() {
            return;
        }
        if soft {
            ipc::kill_process(self.pid, true);
        } else if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }

    /// Wait up to `timeout` for the worker to exit; `None` means it is
    /// still alive.
    pub fn wait(&mut self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return self.exitcode;
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Block until the worker is collected, then restore the terminal and
    /// tear down the pipe.
    pub fn join(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => self.record_exit(status),
                Err(err) => debug!("couldn't collect the worker: {}", err),
            }
        }
        if let Some(state) = self.stdin_termios.take() {
            ipc::restore_termios(&state);
        }
        if let Some(mut pipe) = self.pipe.take() {
            pipe.close();
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        if self.exitcode.is_none() {
            self.exitcode = Some(exit_code(status));
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nine(_args: &WorkerArgs) -> i32 {
        9
    }

    #[test]
    fn registry_resolves_registered_entries() {
        register_worker("tests.worker.nine", nine);
        let entry = resolve_spec("tests.worker.nine").unwrap();
        assert_eq!(entry(&WorkerArgs::default()), 9);
    }

    #[test]
    fn registry_misses_unknown_specs() {
        assert!(resolve_spec("tests.worker.never-registered").is_none());
    }

    #[test]
    fn wait_entry_is_always_registered() {
        assert!(resolve_spec(crate::reloader::WAIT_MAIN_SPEC).is_some());
    }

    #[test]
    fn spawn_payload_round_trips() {
        let payload = SpawnPayload {
            spec: "myapp.serve".to_string(),
            args: vec!["--port".to_string(), "8080".to_string()],
            kwargs: vec![("env".to_string(), "dev".to_string())]
                .into_iter()
                .collect(),
            pipe: "3,4,5,6".to_string(),
            scan_vendored: true,
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        let decoded: SpawnPayload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.spec, payload.spec);
        assert_eq!(decoded.args, payload.args);
        assert_eq!(decoded.kwargs, payload.kwargs);
        assert_eq!(decoded.pipe, payload.pipe);
        assert_eq!(decoded.scan_vendored, payload.scan_vendored);
    }

    #[test]
    #[cfg(unix)]
    fn exit_codes_cover_signals() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), -15);
    }

    #[test]
    fn outside_a_worker_nothing_is_active() {
        assert!(!is_active());
    }
}
