//! The default polling backend.
//!
//! A helper thread stats every watched file once per interval and compares
//! mtimes against a cache. A path missing at its first observation is cached
//! at the epoch, so the file showing up later registers as a change. A
//! path's cargo dep-info twin (`app` → `app.d`) contributes to its effective
//! mtime, so one rebuild that touches both produces one event, attributed to
//! the artifact. Equal mtimes are treated as unchanged even when the file
//! size differs.

use crate::error::Result;
use crate::monitor::{ChangeCallback, FileMonitor};
use crate::scanner;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct PollingMonitor {
    shared: Arc<PollShared>,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

struct PollShared {
    callback: ChangeCallback,
    paths: Mutex<HashSet<PathBuf>>,
    enabled: AtomicBool,
}

impl PollingMonitor {
    pub fn new(callback: ChangeCallback, interval: Duration) -> PollingMonitor {
        PollingMonitor {
            shared: Arc::new(PollShared {
                callback,
                paths: Mutex::new(HashSet::new()),
                enabled: AtomicBool::new(false),
            }),
            interval,
            handle: None,
        }
    }
}

impl FileMonitor for PollingMonitor {
    fn add_path(&self, path: &Path) {
        if let Ok(mut paths) = self.shared.paths.lock() {
            paths.insert(path.to_path_buf());
        }
    }

    fn start(&mut self) -> Result<()> {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        self.handle = Some(
            thread::Builder::new()
                .name("reloadex-poll".to_string())
                .spawn(move || {
                    let mut mtimes = HashMap::new();
                    while shared.enabled.load(Ordering::SeqCst) {
                        let snapshot: Vec<PathBuf> = match shared.paths.lock() {
                            Ok(paths) => paths.iter().cloned().collect(),
                            Err(_) => break,
                        };
                        for path in scan_once(&snapshot, &mut mtimes) {
                            (shared.callback)(path);
                        }
                        thread::sleep(interval);
                    }
                })?,
        );
        Ok(())
    }

    fn stop(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn scan_once(paths: &[PathBuf], mtimes: &mut HashMap<PathBuf, SystemTime>) -> Vec<PathBuf> {
    let mut changes = Vec::new();
    for path in paths {
        let mtime = effective_mtime(path);
        match mtimes.get_mut(path) {
            None => {
                mtimes.insert(path.clone(), mtime);
            }
            Some(cached) => {
                if *cached < mtime {
                    *cached = mtime;
                    changes.push(path.clone());
                }
            }
        }
    }
    changes.sort();
    changes
}

fn effective_mtime(path: &Path) -> SystemTime {
    let mut mtime = file_mtime(path);
    if let Some(twin) = scanner::dep_info_twin(path) {
        let twin_mtime = file_mtime(&twin);
        if twin_mtime > mtime {
            mtime = twin_mtime;
        }
    }
    mtime
}

/// Deleted or unreadable files report the epoch.
fn file_mtime(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> ChangeCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn add_path_is_idempotent() {
        let monitor = PollingMonitor::new(noop_callback(), Duration::from_millis(10));
        let path = Path::new("/srv/app/settings.ini");
        monitor.add_path(path);
        monitor.add_path(path);
        assert_eq!(monitor.shared.paths.lock().unwrap().len(), 1);
    }

    #[test]
    fn missing_file_changes_when_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.ini");
        let watched = vec![path.clone()];
        let mut mtimes = HashMap::new();

        assert!(scan_once(&watched, &mut mtimes).is_empty());
        fs::write(&path, b"created").unwrap();
        assert_eq!(scan_once(&watched, &mut mtimes), vec![path]);
    }

    #[test]
    fn deletion_alone_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.ini");
        fs::write(&path, b"x").unwrap();
        let watched = vec![path.clone()];
        let mut mtimes = HashMap::new();

        assert!(scan_once(&watched, &mut mtimes).is_empty());
        fs::remove_file(&path).unwrap();
        assert!(scan_once(&watched, &mut mtimes).is_empty());
    }

    #[test]
    fn reappearance_after_deletion_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flappy.ini");
        fs::write(&path, b"x").unwrap();
        let watched = vec![path.clone()];
        let mut mtimes = HashMap::new();

        assert!(scan_once(&watched, &mut mtimes).is_empty());
        fs::remove_file(&path).unwrap();
        assert!(scan_once(&watched, &mut mtimes).is_empty());

        // back-date the cache so the recreated file is unambiguously newer
        *mtimes.get_mut(&path).unwrap() = UNIX_EPOCH;
        fs::write(&path, b"y").unwrap();
        assert_eq!(scan_once(&watched, &mut mtimes), vec![path]);
    }

    #[test]
    fn dep_info_twin_counts_toward_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("server");
        let watched = vec![artifact.clone()];
        let mut mtimes = HashMap::new();

        // artifact absent, twin absent: cached at the epoch
        assert!(scan_once(&watched, &mut mtimes).is_empty());

        // only the dep-info twin shows up; the change lands on the artifact
        fs::write(dir.path().join("server.d"), b"server: src/main.rs\n").unwrap();
        assert_eq!(scan_once(&watched, &mut mtimes), vec![artifact]);
    }

    #[test]
    fn changes_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join("b.ini");
        let a = dir.path().join("a.ini");
        let watched = vec![b.clone(), a.clone()];
        let mut mtimes = HashMap::new();

        assert!(scan_once(&watched, &mut mtimes).is_empty());
        fs::write(&b, b"x").unwrap();
        fs::write(&a, b"x").unwrap();
        assert_eq!(scan_once(&watched, &mut mtimes), vec![a, b]);
    }
}
