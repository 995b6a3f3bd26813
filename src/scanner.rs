//! The worker-side scanner that discovers what the running program is made
//! of.
//!
//! A compiled program has no module table to walk; its loaded artifacts are
//! the executable itself plus any file-backed shared objects. Each artifact
//! expands to its cargo dep-info twin and the source files that dep-info
//! lists, so editing a source file or rebuilding the binary both surface as
//! changes upstream. Paths under the cargo home or a toolchain sysroot are
//! filtered out unless configured otherwise, the way one would not want a
//! reload on every third-party import.

use crate::worker::ReloaderProxy;
use std::collections::HashSet;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically reports newly discovered files to the supervisor, one
/// `watch_files` packet per cycle.
pub struct ModuleScanner {
    shared: Arc<ScanShared>,
    handle: Option<JoinHandle<()>>,
}

struct ScanShared {
    proxy: ReloaderProxy,
    seen: Mutex<HashSet<PathBuf>>,
    include_vendored: bool,
    enabled: AtomicBool,
}

impl ModuleScanner {
    pub fn new(proxy: ReloaderProxy, include_vendored: bool) -> ModuleScanner {
        ModuleScanner {
            shared: Arc::new(ScanShared {
                proxy,
                seen: Mutex::new(HashSet::new()),
                include_vendored,
                enabled: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("reloadex-scan".to_string())
            .spawn(move || {
                while shared.enabled.load(Ordering::SeqCst) {
                    shared.update();
                    thread::sleep(SCAN_INTERVAL);
                }
            });
        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(err) => error!("couldn't start the module scanner: {}", err),
        }
    }

    /// Make a crashing worker sweep once more before it dies, wherever the
    /// panic happens: files loaded along the failure path become watched,
    /// so fixing any of them wakes the supervisor.
    pub fn install_panic_sweep(&self) {
        let shared = Arc::clone(&self.shared);
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            shared.update();
            previous(info);
        }));
    }

    pub fn stop(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl ScanShared {
    fn update(&self) {
        let mut new_paths = Vec::new();
        {
            let mut seen = match self.seen.lock() {
                Ok(seen) => seen,
                Err(_) => return,
            };
            for path in expand_artifact_paths(&loaded_artifacts()) {
                let path = absolute(path);
                if !self.include_vendored && is_vendored(&path) {
                    continue;
                }
                if !path.is_file() {
                    continue;
                }
                if seen.insert(path.clone()) {
                    new_paths.push(path);
                }
            }
        }
        if !new_paths.is_empty() {
            self.proxy.watch_files(new_paths);
        }
    }
}

fn loaded_artifacts() -> Vec<PathBuf> {
    let mut artifacts = Vec::new();
    if let Ok(exe) = env::current_exe() {
        artifacts.push(exe);
    }
    #[cfg(target_os = "linux")]
    artifacts.extend(mapped_objects());
    artifacts
}

#[cfg(target_os = "linux")]
fn mapped_objects() -> Vec<PathBuf> {
    let mut objects = Vec::new();
    let mut seen = HashSet::new();
    if let Ok(maps) = fs::read_to_string("/proc/self/maps") {
        for line in maps.lines() {
            if let Some(idx) = line.find('/') {
                let path = &line[idx..];
                if path.ends_with(" (deleted)") {
                    continue;
                }
                if seen.insert(path.to_string()) {
                    objects.push(PathBuf::from(path));
                }
            }
        }
    }
    objects
}

/// An artifact contributes itself, its dep-info twin, and every source the
/// dep-info names.
pub fn expand_artifact_paths(artifacts: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for artifact in artifacts {
        paths.push(artifact.clone());
        if let Some(twin) = dep_info_twin(artifact) {
            if let Ok(contents) = fs::read_to_string(&twin) {
                paths.extend(parse_dep_info(&contents));
            }
            paths.push(twin);
        }
    }
    paths
}

/// `app` pairs with `app.d`, `libapp.so` with `libapp.d`. Returns the first
/// twin that exists on disk.
pub fn dep_info_twin(path: &Path) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(".d");
    let appended = path.with_file_name(&name);
    if appended.is_file() {
        return Some(appended);
    }
    let replaced = path.with_extension("d");
    if replaced != *path && replaced.is_file() {
        return Some(replaced);
    }
    None
}

/// Makefile-style dep-info: `target: src/a.rs src/with\ space.rs`.
pub fn parse_dep_info(contents: &str) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        let rest = match line.find(": ") {
            Some(idx) => &line[idx + 2..],
            None => continue,
        };
        paths.extend(split_escaped(rest).into_iter().map(PathBuf::from));
    }
    paths
}

fn split_escaped(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut token = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some(' ') => {
                    token.push(' ');
                    chars.next();
                }
                Some('\\') => {
                    token.push('\\');
                    chars.next();
                }
                _ => token.push('\\'),
            },
            ' ' => {
                if !token.is_empty() {
                    out.push(std::mem::take(&mut token));
                }
            }
            _ => token.push(c),
        }
    }
    if !token.is_empty() {
        out.push(token);
    }
    out
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    env::current_dir()
        .map(|cwd| cwd.join(&path))
        .unwrap_or(path)
}

fn is_vendored(path: &Path) -> bool {
    for comp in path.components() {
        let comp = comp.as_os_str();
        if comp == OsStr::new(".cargo") || comp == OsStr::new(".rustup") {
            return true;
        }
    }
    path.starts_with("/usr/lib")
        || path.starts_with("/usr/local/lib")
        || path.starts_with("/lib")
        || path.starts_with("/lib64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_info_lines_parse() {
        let contents = "target/debug/app: src/main.rs src/lib.rs\n";
        assert_eq!(
            parse_dep_info(contents),
            vec![PathBuf::from("src/main.rs"), PathBuf::from("src/lib.rs")]
        );
    }

    #[test]
    fn dep_info_honors_escaped_spaces() {
        let contents = "target/debug/app: src/odd\\ name.rs src/lib.rs\n";
        assert_eq!(
            parse_dep_info(contents),
            vec![PathBuf::from("src/odd name.rs"), PathBuf::from("src/lib.rs")]
        );
    }

    #[test]
    fn dep_info_skips_comments_and_bare_targets() {
        let contents = "# env-dep:PATH\ntarget/debug/app:\n";
        assert!(parse_dep_info(contents).is_empty());
    }

    #[test]
    fn twin_is_found_by_appending() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("server");
        let twin = dir.path().join("server.d");
        fs::write(&twin, b"server: src/main.rs\n").unwrap();
        assert_eq!(dep_info_twin(&artifact), Some(twin));
    }

    #[test]
    fn twin_is_found_by_replacing_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("libserver.so");
        let twin = dir.path().join("libserver.d");
        fs::write(&twin, b"libserver.so: src/lib.rs\n").unwrap();
        assert_eq!(dep_info_twin(&artifact), Some(twin));
    }

    #[test]
    fn no_twin_without_a_file() {
        assert_eq!(dep_info_twin(Path::new("/nowhere/app")), None);
    }

    #[test]
    fn vendored_paths_are_recognized() {
        assert!(is_vendored(Path::new(
            "/home/dev/.cargo/registry/src/lib.rs"
        )));
        assert!(is_vendored(Path::new(
            "/home/dev/.rustup/toolchains/stable/lib/libstd.so"
        )));
        assert!(is_vendored(Path::new("/usr/lib/libc.so.6")));
        assert!(!is_vendored(Path::new("/home/dev/project/src/main.rs")));
    }

    #[test]
    fn artifacts_expand_to_twin_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("server");
        let twin = dir.path().join("server.d");
        fs::write(&artifact, b"\x7fELF").unwrap();
        fs::write(&twin, b"server: src/main.rs src/lib.rs\n").unwrap();

        let expanded = expand_artifact_paths(&[artifact.clone()]);
        assert!(expanded.contains(&artifact));
        assert!(expanded.contains(&twin));
        assert!(expanded.contains(&PathBuf::from("src/main.rs")));
        assert!(expanded.contains(&PathBuf::from("src/lib.rs")));
    }
}
