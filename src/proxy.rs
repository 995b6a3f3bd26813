//! Thread-safe adapter between the supervisor and a monitor backend.
//!
//! The proxy owns the backend, expands watch patterns, applies ignore
//! patterns, and collapses the backend's event stream into one notification
//! per generation.

use crate::error::Result;
use crate::monitor::{ChangeCallback, FileMonitor, MonitorFactory};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use walkdir::WalkDir;

pub struct FileMonitorProxy {
    shared: Arc<ProxyShared>,
    monitor: Box<dyn FileMonitor>,
}

struct ProxyShared {
    ignores: GlobSet,
    state: Mutex<ChangeState>,
    notify: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct ChangeState {
    changed_paths: HashSet<PathBuf>,
    is_changed: bool,
}

impl ProxyShared {
    // called from backend threads
    fn file_changed(&self, path: PathBuf) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.changed_paths.insert(path.clone()) {
            info!("{} changed; reloading ...", path.display());
        }
        if !state.is_changed {
            state.is_changed = true;
            (self.notify)();
        }
    }
}

impl FileMonitorProxy {
    pub fn new<F>(
        factory: MonitorFactory,
        interval: Duration,
        ignore_files: &[String],
        notify: F,
    ) -> Result<FileMonitorProxy>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_files {
            builder.add(Glob::new(pattern)?);
            debug!("adding ignore: {:?}", pattern);
        }
        let shared = Arc::new(ProxyShared {
            ignores: builder.build()?,
            state: Mutex::new(ChangeState::default()),
            notify: Box::new(notify),
        });
        let callback: ChangeCallback = {
            let shared = Arc::clone(&shared);
            Arc::new(move |path| shared.file_changed(path))
        };
        let monitor = factory(callback, interval)?;
        Ok(FileMonitorProxy { shared, monitor })
    }

    /// Expand `pattern` as a recursive glob and watch every match that no
    /// ignore pattern claims. Directories are walked down to their files. A
    /// glob matching nothing is passed through unchanged, so a file that is
    /// merely missing right now is still tracked.
    pub fn add_path(&self, pattern: &Path) {
        let text = pattern.to_string_lossy();
        let mut matches: Vec<PathBuf> = Vec::new();
        match glob::glob(&text) {
            Ok(entries) => matches.extend(entries.filter_map(|entry| entry.ok())),
            Err(err) => {
                warn!("bad watch pattern {:?}: {}", pattern, err);
                return;
            }
        }
        if matches.is_empty() {
            matches.push(pattern.to_path_buf());
        }

        for path in matches {
            if path.is_dir() {
                for entry in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
                    if entry.file_type().is_file() {
                        self.add_file(entry.path());
                    }
                }
            } else {
                self.add_file(&path);
            }
        }
    }

    fn add_file(&self, path: &Path) {
        if self.shared.ignores.is_match(path) {
            debug!("ignoring {:?}: matched ignore filter", path);
            return;
        }
        self.monitor.add_path(path);
    }

    pub fn is_changed(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.is_changed)
            .unwrap_or(false)
    }

    /// Reset at the start of every generation.
    pub fn clear_changes(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.is_changed = false;
            state.changed_paths.clear();
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.monitor.start()
    }

    pub fn stop(&mut self) {
        self.monitor.stop();
        self.monitor.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockMonitor {
        added: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl FileMonitor for MockMonitor {
        fn add_path(&self, path: &Path) {
            self.added.lock().unwrap().push(path.to_path_buf());
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop(&self) {}
        fn join(&mut self) {}
    }

    fn mock_proxy(
        ignore_files: &[String],
    ) -> (FileMonitorProxy, Arc<Mutex<Vec<PathBuf>>>, Arc<AtomicUsize>) {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_files {
            builder.add(Glob::new(pattern).unwrap());
        }
        let notified = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(ProxyShared {
            ignores: builder.build().unwrap(),
            state: Mutex::new(ChangeState::default()),
            notify: {
                let notified = Arc::clone(&notified);
                Box::new(move || {
                    notified.fetch_add(1, Ordering::SeqCst);
                })
            },
        });
        let added = Arc::new(Mutex::new(Vec::new()));
        let proxy = FileMonitorProxy {
            shared,
            monitor: Box::new(MockMonitor {
                added: Arc::clone(&added),
            }),
        };
        (proxy, added, notified)
    }

    #[test]
    fn ignored_paths_never_reach_the_backend() {
        let (proxy, added, _) = mock_proxy(&["/tmp/*".to_string()]);
        proxy.add_path(Path::new("/tmp/a"));
        proxy.add_path(Path::new("/var/never-here-b"));
        assert_eq!(
            *added.lock().unwrap(),
            vec![PathBuf::from("/var/never-here-b")]
        );
    }

    #[test]
    fn empty_glob_passes_the_raw_pattern_through() {
        let (proxy, added, _) = mock_proxy(&[]);
        proxy.add_path(Path::new("/no/such/place/app.ini"));
        assert_eq!(
            *added.lock().unwrap(),
            vec![PathBuf::from("/no/such/place/app.ini")]
        );
    }

    #[test]
    fn globs_expand_to_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("one.ini"), b"x").unwrap();
        fs::write(dir.path().join("two.ini"), b"x").unwrap();
        fs::write(dir.path().join("other.txt"), b"x").unwrap();

        let (proxy, added, _) = mock_proxy(&[]);
        proxy.add_path(&dir.path().join("*.ini"));

        let mut added = added.lock().unwrap().clone();
        added.sort();
        assert_eq!(
            added,
            vec![dir.path().join("one.ini"), dir.path().join("two.ini")]
        );
    }

    #[test]
    fn directories_are_walked_to_their_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/deep.ini"), b"x").unwrap();
        fs::write(dir.path().join("top.ini"), b"x").unwrap();

        let (proxy, added, _) = mock_proxy(&[]);
        proxy.add_path(dir.path());

        let mut added = added.lock().unwrap().clone();
        added.sort();
        assert_eq!(
            added,
            vec![dir.path().join("sub/deep.ini"), dir.path().join("top.ini")]
        );
    }

    #[test]
    fn first_change_notifies_exactly_once_per_generation() {
        let (proxy, _, notified) = mock_proxy(&[]);
        assert!(!proxy.is_changed());

        proxy.shared.file_changed(PathBuf::from("/srv/a"));
        proxy.shared.file_changed(PathBuf::from("/srv/b"));
        proxy.shared.file_changed(PathBuf::from("/srv/a"));
        assert!(proxy.is_changed());
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        proxy.clear_changes();
        assert!(!proxy.is_changed());

        proxy.shared.file_changed(PathBuf::from("/srv/a"));
        assert!(proxy.is_changed());
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
