//! Watchman daemon backend.
//!
//! Speaks the JSON protocol over the daemon's unix socket: one JSON value
//! per line in both directions. Each watched file's parent directory gets a
//! subscription limited to its immediate regular files; delivered names are
//! joined back onto the subscription root and filtered against the watched
//! path set.

use crate::error::{Error, Result};
use crate::monitor::{watchman_sockpath, ChangeCallback, FileMonitor};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WatchmanMonitor {
    shared: Arc<WatchmanShared>,
    reader: Option<UnixStream>,
    handle: Option<JoinHandle<()>>,
}

struct WatchmanShared {
    callback: ChangeCallback,
    sock: Mutex<UnixStream>,
    paths: Mutex<HashSet<PathBuf>>,
    dirs: Mutex<HashSet<PathBuf>>,
    enabled: AtomicBool,
}

impl WatchmanMonitor {
    pub fn new(callback: ChangeCallback) -> Result<WatchmanMonitor> {
        let sockpath = watchman_sockpath()
            .ok_or_else(|| Error::Monitor("watchman socket not found".to_string()))?;
        let mut sock = UnixStream::connect(&sockpath)?;
        sock.set_read_timeout(Some(RECV_TIMEOUT))?;

        send(&mut sock, &json!(["version"]))?;
        let mut buffer = Vec::new();
        for _ in 0..5 {
            if let Some(line) = read_line(&mut sock, &mut buffer)? {
                if let Ok(value) = serde_json::from_slice::<Value>(&line) {
                    if let Some(version) = value.get("version").and_then(Value::as_str) {
                        debug!("connected to watchman v{}", version);
                    }
                }
                break;
            }
        }

        let reader = sock.try_clone()?;
        Ok(WatchmanMonitor {
            shared: Arc::new(WatchmanShared {
                callback,
                sock: Mutex::new(sock),
                paths: Mutex::new(HashSet::new()),
                dirs: Mutex::new(HashSet::new()),
                enabled: AtomicBool::new(false),
            }),
            reader: Some(reader),
            handle: None,
        })
    }
}

impl FileMonitor for WatchmanMonitor {
    fn add_path(&self, path: &Path) {
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => path.to_path_buf(),
        };

        {
            let mut dirs = match self.shared.dirs.lock() {
                Ok(dirs) => dirs,
                Err(_) => return,
            };
            if !dirs.contains(&dir) {
                match self.shared.subscribe(&dir) {
                    Ok(()) => {
                        dirs.insert(dir);
                    }
                    Err(err) => error!("watchman error: {}", err),
                }
            }
        }

        if let Ok(mut paths) = self.shared.paths.lock() {
            paths.insert(path.to_path_buf());
        }
    }

    fn start(&mut self) -> Result<()> {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Monitor("watchman monitor already started".to_string()))?;
        let shared = Arc::clone(&self.shared);
        self.handle = Some(
            thread::Builder::new()
                .name("reloadex-watchman".to_string())
                .spawn(move || {
                    let mut buffer = Vec::new();
                    while shared.enabled.load(Ordering::SeqCst) {
                        match read_line(&mut reader, &mut buffer) {
                            Ok(Some(line)) => match serde_json::from_slice::<Value>(&line) {
                                Ok(value) => shared.handle_message(&value),
                                Err(_) => info!("ignoring corrupted payload from watchman"),
                            },
                            Ok(None) => continue,
                            Err(err) => {
                                error!("watchman error: {}", err);
                                break;
                            }
                        }
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

impl WatchmanShared {
    fn subscribe(&self, dir: &Path) -> Result<()> {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = format!("{}.{}", process::id(), dir.display());
        let request = subscription_request(dir, since + 1, &name);
        let mut sock = self.sock.lock()?;
        send(&mut sock, &request)
    }

    fn handle_message(&self, value: &Value) {
        if let Some(warning) = value.get("warning").and_then(Value::as_str) {
            error!("watchman warning={}", warning);
        }
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            error!("watchman error={}", error);
            return;
        }
        if value.get("subscription").is_none() {
            return;
        }
        let root = match value.get("root").and_then(Value::as_str) {
            Some(root) => PathBuf::from(root),
            None => return,
        };
        let files = match value.get("files").and_then(Value::as_array) {
            Some(files) => files,
            None => return,
        };
        for file in files {
            if let Some(name) = file.as_str() {
                let path = root.join(name);
                let matched = self
                    .paths
                    .lock()
                    .map(|paths| paths.contains(&path))
                    .unwrap_or(false);
                if matched {
                    (self.callback)(path);
                }
            }
        }
    }
}

/// The subscription covers only the directory's own regular files; watchman
/// watches whole subtrees, the `depth eq 0` clause narrows it back down.
/// `since` is one second in the future so a directory the daemon already
/// watches does not replay buffered changes.
fn subscription_request(dir: &Path, since: u64, name: &str) -> Value {
    json!([
        "subscribe",
        dir,
        name,
        {
            "since": since,
            "expression": [
                "allof",
                ["type", "f"],
                ["dirname", "", ["depth", "eq", 0]],
            ],
            "fields": ["name"],
        }
    ])
}

fn send(sock: &mut UnixStream, msg: &Value) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    sock.write_all(&line)?;
    Ok(())
}

/// One newline-terminated message, buffering partial reads across timeouts.
/// `Ok(None)` is a timeout tick; reaching EOF means the daemon went away.
fn read_line(sock: &mut UnixStream, buffer: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    loop {
        if let Some(idx) = buffer.iter().position(|&b| b == b'\n') {
            let rest = buffer.split_off(idx + 1);
            let mut line = std::mem::replace(buffer, rest);
            line.pop();
            return Ok(Some(line));
        }

        let mut chunk = [0u8; 4096];
        match sock.read(&mut chunk) {
            Ok(0) => return Err(Error::Monitor("lost connection to watchman".to_string())),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                return Ok(None)
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_narrows_to_immediate_files() {
        let request = subscription_request(Path::new("/srv/app"), 42, "99./srv/app");
        assert_eq!(request[0], "subscribe");
        assert_eq!(request[1], "/srv/app");
        assert_eq!(request[2], "99./srv/app");
        assert_eq!(request[3]["since"], 42);
        assert_eq!(request[3]["fields"], json!(["name"]));
        assert_eq!(
            request[3]["expression"],
            json!(["allof", ["type", "f"], ["dirname", "", ["depth", "eq", 0]]])
        );
    }

    #[test]
    fn read_line_buffers_partial_messages() {
        use std::os::unix::net::UnixStream;

        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

        a.write_all(b"{\"ver").unwrap();
        let mut buffer = Vec::new();
        assert_eq!(read_line(&mut b, &mut buffer).unwrap(), None);

        a.write_all(b"sion\":1}\n{\"x\"").unwrap();
        assert_eq!(
            read_line(&mut b, &mut buffer).unwrap(),
            Some(b"{\"version\":1}".to_vec())
        );
        assert_eq!(buffer, b"{\"x\"");
    }
}
