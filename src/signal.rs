//! The supervisor's single wakeup source.
//!
//! Every event the supervisor reacts to arrives as one byte on one pipe:
//! signal handlers, the control-pipe reader thread, and the file monitor all
//! write a control code here. Reading from a single descriptor is what
//! closes the race between "signal arrived just before the wait" and
//! "signal arrived during the wait".

use crate::error::Result;
use crate::ipc::{self, Handle};

pub const CTL_WORKER_COMMAND: u8 = b'c';
pub const CTL_FILE_CHANGED: u8 = b'f';
pub const CTL_SIGHUP: u8 = b'h';
pub const CTL_SIGINT: u8 = b'i';
pub const CTL_SIGTERM: u8 = b't';
pub const CTL_SIGCHLD: u8 = b'd';

pub use self::imp::{capture_signals, ignore_reload_signals, restore_signals};

/// The self-pipe. Owned by the supervisor for its whole lifetime.
pub struct ControlChannel {
    read: Handle,
    write: Handle,
}

impl ControlChannel {
    pub fn new() -> Result<ControlChannel> {
        let (read, write) = ipc::pipe_cloexec()?;
        Ok(ControlChannel { read, write })
    }

    /// Block until the next control code. `None` means the pipe itself died,
    /// which is fatal for the supervisor.
    pub fn wait(&self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = ipc::read(self.read, &mut buf)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(buf[0]))
        }
    }

    pub fn notifier(&self) -> ControlNotifier {
        ControlNotifier { write: self.write }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        ipc::close_quiet(self.read);
        ipc::close_quiet(self.write);
    }
}

/// A cheap clonable writer for helper threads.
#[derive(Clone, Copy)]
pub struct ControlNotifier {
    write: Handle,
}

impl ControlNotifier {
    pub fn notify(&self, code: u8) {
        if ipc::write_all(self.write, &[code]).is_err() {
            debug!("control channel closed, dropping notification");
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use nix::libc;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    static WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

    lazy_static! {
        static ref SAVED: Mutex<Vec<(Signal, SigAction)>> = Mutex::new(Vec::new());
    }

    // Runs in signal context: a single write(2) and nothing else.
    extern "C" fn relay(signum: libc::c_int) {
        let code = match signum {
            libc::SIGINT => CTL_SIGINT,
            libc::SIGTERM => CTL_SIGTERM,
            libc::SIGHUP => CTL_SIGHUP,
            libc::SIGCHLD => CTL_SIGCHLD,
            _ => return,
        };
        let fd = WAKEUP_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::write(fd, &code as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    pub fn capture_signals(chan: &ControlChannel) -> Result<()> {
        WAKEUP_FD.store(chan.write, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(relay),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut saved = SAVED.lock()?;
        for &sig in &[
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGCHLD,
        ] {
            let old = unsafe { sigaction(sig, &action) }.map_err(ipc::from_nix_error)?;
            saved.push((sig, old));
        }
        Ok(())
    }

    pub fn restore_signals() {
        WAKEUP_FD.store(-1, Ordering::SeqCst);
        if let Ok(mut saved) = SAVED.lock() {
            for (sig, old) in saved.drain(..).rev() {
                unsafe {
                    let _ = sigaction(sig, &old);
                }
            }
        }
    }

    /// The worker must not act on SIGHUP; reload decisions belong to the
    /// supervisor.
    pub fn ignore_reload_signals() {
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(Signal::SIGHUP, &action);
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::wincon::{CTRL_BREAK_EVENT, CTRL_CLOSE_EVENT, CTRL_C_EVENT};

    static WAKEUP: AtomicUsize = AtomicUsize::new(0);

    // Console control handlers run on their own thread, so a pipe write is
    // safe here.
    unsafe extern "system" fn relay(event: DWORD) -> BOOL {
        let code = match event {
            CTRL_C_EVENT => CTL_SIGINT,
            CTRL_BREAK_EVENT | CTRL_CLOSE_EVENT => CTL_SIGTERM,
            _ => return FALSE,
        };
        let h = WAKEUP.load(Ordering::SeqCst);
        if h != 0 {
            let _ = ipc::write_all(h, &[code]);
            TRUE
        } else {
            FALSE
        }
    }

    pub fn capture_signals(chan: &ControlChannel) -> Result<()> {
        WAKEUP.store(chan.write, Ordering::SeqCst);
        if unsafe { SetConsoleCtrlHandler(Some(relay), TRUE) } == 0 {
            return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn restore_signals() {
        WAKEUP.store(0, Ordering::SeqCst);
        unsafe {
            SetConsoleCtrlHandler(Some(relay), FALSE);
        }
    }

    pub fn ignore_reload_signals() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_wakes_waiter() {
        let chan = ControlChannel::new().unwrap();
        let notifier = chan.notifier();
        notifier.notify(CTL_FILE_CHANGED);
        notifier.notify(CTL_SIGHUP);
        assert_eq!(chan.wait().unwrap(), Some(CTL_FILE_CHANGED));
        assert_eq!(chan.wait().unwrap(), Some(CTL_SIGHUP));
    }
}
