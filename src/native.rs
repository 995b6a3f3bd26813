//! OS-native watcher backend, a thin wrapper over the notify crate.
//!
//! Watched files are grouped by parent directory; each directory gets one
//! non-recursive watch and delivered events are filtered against the exact
//! path set. This keeps coupling to notify inside this module.

use crate::error::{Error, Result};
use crate::monitor::{ChangeCallback, FileMonitor};
use notify::{op, raw_watcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub struct NativeMonitor {
    shared: Arc<NativeShared>,
    rx: Option<Receiver<notify::RawEvent>>,
    handle: Option<JoinHandle<()>>,
}

struct NativeShared {
    callback: ChangeCallback,
    watcher: Mutex<Option<RecommendedWatcher>>,
    paths: Mutex<HashSet<PathBuf>>,
    dirs: Mutex<HashSet<PathBuf>>,
}

impl NativeMonitor {
    pub fn new(callback: ChangeCallback) -> Result<NativeMonitor> {
        let (tx, rx) = channel();
        let watcher = raw_watcher(tx)?;
        Ok(NativeMonitor {
            shared: Arc::new(NativeShared {
                callback,
                watcher: Mutex::new(Some(watcher)),
                paths: Mutex::new(HashSet::new()),
                dirs: Mutex::new(HashSet::new()),
            }),
            rx: Some(rx),
            handle: None,
        })
    }
}

impl NativeShared {
    fn add_path(&self, path: &Path) {
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => path.to_path_buf(),
        };

        {
            let mut dirs = match self.dirs.lock() {
                Ok(dirs) => dirs,
                Err(_) => return,
            };
            if !dirs.contains(&dir) {
                if let Ok(mut guard) = self.watcher.lock() {
                    if let Some(watcher) = guard.as_mut() {
                        // missing directories and watch limits surface here;
                        // the path stays in the set and a later add retries
                        match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                            Ok(()) => {
                                dirs.insert(dir);
                            }
                            Err(err) => error!("native watcher error: {}", err),
                        }
                    }
                }
            }
        }

        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path.to_path_buf());
        }
    }

    fn contains(&self, path: &Path) -> bool {
        self.paths
            .lock()
            .map(|paths| paths.contains(path))
            .unwrap_or(false)
    }
}

impl FileMonitor for NativeMonitor {
    fn add_path(&self, path: &Path) {
        self.shared.add_path(path);
    }

    fn start(&mut self) -> Result<()> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| Error::Monitor("native monitor already started".to_string()))?;
        let shared = Arc::clone(&self.shared);
        self.handle = Some(
            thread::Builder::new()
                .name("reloadex-native".to_string())
                .spawn(move || {
                    while let Ok(event) = rx.recv() {
                        if let Some(path) = event.path {
                            if shared.contains(&path) {
                                (shared.callback)(path.clone());
                            }
                            // a write-then-rename replaces the inode under a
                            // watched name; re-register the destination so
                            // the next save is still seen
                            if let Ok(change) = event.op {
                                if change.contains(op::RENAME) {
                                    shared.add_path(&path);
                                }
                            }
                        }
                    }
                })?,
        );
        Ok(())
    }

    fn stop(&self) {}

    fn join(&mut self) {
        // dropping the watcher closes the event channel, which ends the
        // delivery thread
        if let Ok(mut guard) = self.shared.watcher.lock() {
            guard.take();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
