//! Low-level plumbing shared by the supervisor and the worker: raw OS pipes,
//! descriptor inheritance, the stdin handoff, terminal state, and the
//! process-group helper that keeps grandchildren from outliving the worker.

#![allow(unsafe_code)]

pub use self::imp::*;

#[cfg(unix)]
mod imp {
    use crate::error::Result;
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::libc;
    use nix::sys::signal::{raise, Signal};
    use nix::sys::termios::{tcgetattr, tcsetattr, FlushArg, SetArg, Termios};
    use nix::unistd;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::process::Command;

    pub type Handle = RawFd;

    pub fn from_nix_error(err: nix::Error) -> io::Error {
        match err {
            nix::Error::Sys(errno) => io::Error::from_raw_os_error(errno as i32),
            nix::Error::InvalidPath => io::Error::new(io::ErrorKind::InvalidInput, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }

    /// A pipe whose ends survive exec, for handing to a child process.
    pub fn pipe() -> Result<(Handle, Handle)> {
        let (r, w) = unistd::pipe().map_err(from_nix_error)?;
        Ok((r, w))
    }

    /// A pipe private to this process (the supervisor's wakeup channel).
    pub fn pipe_cloexec() -> Result<(Handle, Handle)> {
        let (r, w) = unistd::pipe().map_err(from_nix_error)?;
        set_cloexec(r)?;
        set_cloexec(w)?;
        Ok((r, w))
    }

    pub fn read(h: Handle, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match unistd::read(h, buf) {
                Ok(n) => return Ok(n),
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(err) => return Err(from_nix_error(err)),
            }
        }
    }

    pub fn write_all(h: Handle, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match unistd::write(h, buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
                Err(err) => return Err(from_nix_error(err)),
            }
        }
        Ok(())
    }

    pub fn close_quiet(h: Handle) {
        let _ = unistd::close(h);
    }

    pub fn set_inheritable(h: Handle) -> Result<()> {
        let flags = fcntl(h, FcntlArg::F_GETFD).map_err(from_nix_error)?;
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.remove(FdFlag::FD_CLOEXEC);
        fcntl(h, FcntlArg::F_SETFD(flags)).map_err(from_nix_error)?;
        Ok(())
    }

    pub fn set_cloexec(h: Handle) -> Result<()> {
        fcntl(h, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(from_nix_error)?;
        Ok(())
    }

    /// Duplicate the supervisor's stdin so the worker can keep using the
    /// controlling terminal. Must run before the spawn; exec carries the
    /// descriptor across at the same number.
    pub fn prepare_stdin() -> Result<Handle> {
        let fd = unistd::dup(libc::STDIN_FILENO).map_err(from_nix_error)?;
        set_inheritable(fd)?;
        Ok(fd)
    }

    /// The value the worker should be told about. A plain dup keeps its
    /// number across exec, so this is the fd itself.
    pub fn send_handle_to(h: Handle, _pid: u32) -> Result<u64> {
        Ok(h as u64)
    }

    pub fn release_stdin(h: Handle) {
        close_quiet(h);
    }

    /// Install an inherited descriptor as stdin. `dup2` over fd 0 so that
    /// anything assuming stdin is fd 0 keeps working.
    pub fn patch_stdin(h: Handle) -> Result<()> {
        unistd::dup2(h, libc::STDIN_FILENO).map_err(from_nix_error)?;
        if h != libc::STDIN_FILENO {
            close_quiet(h);
        }
        Ok(())
    }

    pub fn stdin_is_tty() -> bool {
        unistd::isatty(libc::STDIN_FILENO).unwrap_or(false)
    }

    pub struct TermiosSnapshot(Termios);

    pub fn snapshot_termios() -> Option<TermiosSnapshot> {
        if stdin_is_tty() {
            tcgetattr(libc::STDIN_FILENO).ok().map(TermiosSnapshot)
        } else {
            None
        }
    }

    /// A worker that died mid-readline must not leave the terminal raw.
    pub fn restore_termios(state: &TermiosSnapshot) {
        if stdin_is_tty() {
            let _ = nix::sys::termios::tcflush(libc::STDIN_FILENO, FlushArg::TCIOFLUSH);
            let _ = tcsetattr(libc::STDIN_FILENO, SetArg::TCSANOW, &state.0);
        }
    }

    /// Used by the worker's pipe reader when the supervisor goes away.
    pub fn interrupt_self() {
        let _ = raise(Signal::SIGINT);
    }

    pub fn kill_process(pid: u32, soft: bool) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let sig = if soft { Signal::SIGTERM } else { Signal::SIGKILL };
        let _ = kill(Pid::from_raw(pid as i32), sig);
    }

    pub fn prepare_command(_cmd: &mut Command) {}

    /// The worker shares the supervisor's process group, so a terminal
    /// interrupt already reaches every descendant. Nothing to track.
    pub struct ProcessGroup;

    impl ProcessGroup {
        pub fn new() -> Result<ProcessGroup> {
            Ok(ProcessGroup)
        }

        pub fn add_child(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(windows)]
mod imp {
    use crate::error::{Error, Result};
    use std::io;
    use std::mem;
    use std::process::Command;
    use std::ptr;
    use winapi::shared::minwindef::{DWORD, FALSE, LPCVOID, LPVOID, TRUE};
    use winapi::shared::winerror::ERROR_BROKEN_PIPE;
    use winapi::um::consoleapi::GetConsoleMode;
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{ReadFile, WriteFile};
    use winapi::um::handleapi::{CloseHandle, DuplicateHandle, SetHandleInformation};
    use winapi::um::jobapi2::{AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject};
    use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
    use winapi::um::namedpipeapi::CreatePipe;
    use winapi::um::processenv::{GetStdHandle, SetStdHandle};
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcess, TerminateProcess};
    use winapi::um::winbase::{HANDLE_FLAG_INHERIT, STD_INPUT_HANDLE};
    use winapi::um::wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    use winapi::um::winnt::{
        JobObjectExtendedLimitInformation, DUPLICATE_SAME_ACCESS, HANDLE,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        PROCESS_DUP_HANDLE, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
    };

    pub type Handle = usize;

    fn last_err() -> io::Error {
        io::Error::last_os_error()
    }

    fn raw_pipe(inherit: bool) -> Result<(Handle, Handle)> {
        let mut sa: SECURITY_ATTRIBUTES = unsafe { mem::zeroed() };
        sa.nLength = mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD;
        sa.bInheritHandle = if inherit { TRUE } else { FALSE };

        let mut read: HANDLE = ptr::null_mut();
        let mut write: HANDLE = ptr::null_mut();
        let ok = unsafe { CreatePipe(&mut read, &mut write, &mut sa, 0) };
        if ok == 0 {
            return Err(Error::Io(last_err()));
        }
        Ok((read as Handle, write as Handle))
    }

    pub fn pipe() -> Result<(Handle, Handle)> {
        raw_pipe(true)
    }

    pub fn pipe_cloexec() -> Result<(Handle, Handle)> {
        raw_pipe(false)
    }

    pub fn read(h: Handle, buf: &mut [u8]) -> io::Result<usize> {
        let mut n: DWORD = 0;
        let ok = unsafe {
            ReadFile(
                h as HANDLE,
                buf.as_mut_ptr() as LPVOID,
                buf.len() as DWORD,
                &mut n,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            if unsafe { GetLastError() } == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(last_err());
        }
        Ok(n as usize)
    }

    pub fn write_all(h: Handle, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut n: DWORD = 0;
            let ok = unsafe {
                WriteFile(
                    h as HANDLE,
                    buf.as_ptr() as LPCVOID,
                    buf.len() as DWORD,
                    &mut n,
                    ptr::null_mut(),
                )
            };
            if ok == 0 || n == 0 {
                return Err(last_err());
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }

    pub fn close_quiet(h: Handle) {
        unsafe {
            CloseHandle(h as HANDLE);
        }
    }

    pub fn set_inheritable(h: Handle) -> Result<()> {
        let ok = unsafe { SetHandleInformation(h as HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) };
        if ok == 0 {
            return Err(Error::Io(last_err()));
        }
        Ok(())
    }

    pub fn set_cloexec(h: Handle) -> Result<()> {
        let ok = unsafe { SetHandleInformation(h as HANDLE, HANDLE_FLAG_INHERIT, 0) };
        if ok == 0 {
            return Err(Error::Io(last_err()));
        }
        Ok(())
    }

    pub fn prepare_stdin() -> Result<Handle> {
        Ok(unsafe { GetStdHandle(STD_INPUT_HANDLE) } as Handle)
    }

    /// Duplicate our stdin handle into the worker; the raw handle number is
    /// what travels over the control pipe.
    pub fn send_handle_to(h: Handle, pid: u32) -> Result<u64> {
        let target = unsafe { OpenProcess(PROCESS_DUP_HANDLE, FALSE, pid) };
        if target.is_null() {
            return Err(Error::Io(last_err()));
        }
        let mut remote: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                h as HANDLE,
                target,
                &mut remote,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            )
        };
        unsafe {
            CloseHandle(target);
        }
        if ok == 0 {
            return Err(Error::Io(last_err()));
        }
        Ok(remote as u64)
    }

    pub fn release_stdin(_h: Handle) {
        // the console handle is borrowed, not owned
    }

    pub fn patch_stdin(h: Handle) -> Result<()> {
        if unsafe { SetStdHandle(STD_INPUT_HANDLE, h as HANDLE) } == 0 {
            return Err(Error::Io(last_err()));
        }
        Ok(())
    }

    pub fn stdin_is_tty() -> bool {
        let mut mode: DWORD = 0;
        unsafe { GetConsoleMode(GetStdHandle(STD_INPUT_HANDLE), &mut mode) != 0 }
    }

    pub struct TermiosSnapshot;

    pub fn snapshot_termios() -> Option<TermiosSnapshot> {
        None
    }

    pub fn restore_termios(_state: &TermiosSnapshot) {}

    pub fn interrupt_self() {
        std::process::exit(130);
    }

    pub fn kill_process(pid: u32, soft: bool) {
        if soft {
            unsafe {
                GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            }
        } else {
            let target = unsafe { OpenProcess(PROCESS_TERMINATE, FALSE, pid) };
            if !target.is_null() {
                unsafe {
                    TerminateProcess(target, 1);
                    CloseHandle(target);
                }
            }
        }
    }

    pub fn prepare_command(cmd: &mut Command) {
        use std::os::windows::process::CommandExt;
        use winapi::um::winbase::CREATE_NEW_PROCESS_GROUP;

        // a fresh console group so CTRL_BREAK reaches only the worker
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    /// Job Object with kill-on-close so grandchildren die with the job
    /// handle when the supervisor exits.
    pub struct ProcessGroup {
        job: HANDLE,
    }

    impl ProcessGroup {
        pub fn new() -> Result<ProcessGroup> {
            let job = unsafe { CreateJobObjectW(ptr::null_mut(), ptr::null()) };
            if job.is_null() {
                return Err(Error::Io(last_err()));
            }

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { mem::zeroed() };
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let ok = unsafe {
                SetInformationJobObject(
                    job,
                    JobObjectExtendedLimitInformation,
                    &mut info as *mut _ as LPVOID,
                    mem::size_of_val(&info) as DWORD,
                )
            };
            if ok == 0 {
                let err = last_err();
                unsafe {
                    CloseHandle(job);
                }
                return Err(Error::Io(err));
            }

            Ok(ProcessGroup { job })
        }

        pub fn add_child(&self, pid: u32) -> Result<()> {
            let target =
                unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, FALSE, pid) };
            if target.is_null() {
                return Err(Error::Io(last_err()));
            }
            let ok = unsafe { AssignProcessToJobObject(self.job, target) };
            let err = last_err();
            unsafe {
                CloseHandle(target);
            }
            if ok == 0 {
                // ACCESS_DENIED before Windows 8 means the process already
                // belongs to another job; not fatal
                if err.raw_os_error() == Some(5) {
                    return Ok(());
                }
                return Err(Error::Io(err));
            }
            Ok(())
        }
    }

    impl Drop for ProcessGroup {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.job);
            }
        }
    }

    unsafe impl Send for ProcessGroup {}
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (r, w) = pipe().unwrap();
        write_all(w, b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read(r, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
        close_quiet(r);
        close_quiet(w);
    }

    #[test]
    fn read_sees_eof_after_close() {
        let (r, w) = pipe().unwrap();
        close_quiet(w);
        let mut buf = [0u8; 1];
        assert_eq!(read(r, &mut buf).unwrap(), 0);
        close_quiet(r);
    }

    #[test]
    fn inheritable_toggles_cloexec() {
        use nix::fcntl::{fcntl, FcntlArg, FdFlag};

        let (r, _w) = pipe_cloexec().unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(r, FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));

        set_inheritable(r).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(r, FcntlArg::F_GETFD).unwrap());
        assert!(!flags.contains(FdFlag::FD_CLOEXEC));
    }
}
