//! End-to-end checks of the bundled binary: a full supervisor, a real
//! worker process, and the control pipe between them.

#![cfg(unix)]

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn reloadex() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_reloadex"));
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().expect("try_wait failed") {
            Some(status) => return status.code(),
            None => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[test]
fn once_passes_a_clean_exit_through() {
    let mut child = reloadex()
        .args(&["-1", "-q", "-m", "true"])
        .spawn()
        .expect("couldn't spawn reloadex");
    let code = wait_with_timeout(&mut child, Duration::from_secs(20));
    if code.is_none() {
        let _ = child.kill();
    }
    assert_eq!(code, Some(0));
}

#[test]
fn once_reports_a_failing_worker() {
    let mut child = reloadex()
        .args(&["-1", "-q", "-m", "false"])
        .spawn()
        .expect("couldn't spawn reloadex");
    let code = wait_with_timeout(&mut child, Duration::from_secs(20));
    if code.is_none() {
        let _ = child.kill();
    }
    assert_eq!(code, Some(1));
}

#[test]
fn sighup_reloads_and_sigterm_stops() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let mut child = reloadex()
        .args(&["-q", "-m", "sleep", "--", "30"])
        .spawn()
        .expect("couldn't spawn reloadex");
    let pid = Pid::from_raw(child.id() as i32);

    // let the first generation come up
    thread::sleep(Duration::from_millis(1500));
    kill(pid, Signal::SIGHUP).expect("couldn't signal the supervisor");

    // one graceful kill plus the debounce later, generation two is running
    thread::sleep(Duration::from_millis(2500));
    kill(pid, Signal::SIGTERM).expect("couldn't signal the supervisor");

    let code = wait_with_timeout(&mut child, Duration::from_secs(20));
    if code.is_none() {
        let _ = child.kill();
    }
    assert_eq!(code, Some(1));
}
