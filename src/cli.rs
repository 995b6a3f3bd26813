//! CLI argument handling and the worker-side half of the bundled binary.

use crate::worker::ReloaderProxy;
use clap::{App, AppSettings, Arg};
use log::LevelFilter;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct CliArgs {
    pub module: String,
    pub watch: Vec<String>,
    pub ignore: Vec<String>,
    pub reload_interval: u64,
    pub shutdown_interval: u64,
    pub once: bool,
    pub forwarded: Vec<String>,
}

pub fn get_args() -> (CliArgs, LevelFilter) {
    get_args_impl(None::<&[&str]>)
}

#[allow(dead_code)]
pub fn get_args_from<I, T>(from: I) -> (CliArgs, LevelFilter)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    get_args_impl(Some(from))
}

fn get_args_impl<I, T>(from: Option<I>) -> (CliArgs, LevelFilter)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let app = App::new("reloadex")
        .version(crate_version!())
        .about("Run a program under a supervisor that restarts it when files change")
        .setting(AppSettings::TrailingVarArg)
        .arg(Arg::with_name("module")
                 .help("Program to execute inside the worker")
                 .short("m")
                 .takes_value(true)
                 .value_name("program")
                 .required(true))
        .arg(Arg::with_name("watch")
                 .help("Watch an additional file or directory")
                 .short("w")
                 .long("watch")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("path"))
        .arg(Arg::with_name("ignore")
                 .help("Ignore changes to paths matching the pattern")
                 .short("x")
                 .long("ignore")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("pattern"))
        .arg(Arg::with_name("verbose")
                 .help("Print debugging messages to stderr")
                 .short("v")
                 .long("verbose"))
        .arg(Arg::with_name("quiet")
                 .help("Only print warnings and errors")
                 .short("q")
                 .long("quiet"))
        .arg(Arg::with_name("reload-interval")
                 .help("Seconds between restarts, defaults to 1")
                 .long("reload-interval")
                 .takes_value(true)
                 .value_name("seconds"))
        .arg(Arg::with_name("shutdown-interval")
                 .help("Grace period before a force kill, defaults to the reload interval")
                 .long("shutdown-interval")
                 .takes_value(true)
                 .value_name("seconds"))
        .arg(Arg::with_name("once").short("1").hidden(true))
        .arg(Arg::with_name("args")
                 .help("Arguments forwarded to the program")
                 .multiple(true));

    let args = match from {
        None => app.get_matches(),
        Some(from) => app.get_matches_from(from),
    };

    let reload_interval = if args.occurrences_of("reload-interval") > 0 {
        value_t!(args.value_of("reload-interval"), u64).unwrap_or_else(|e| e.exit())
    } else {
        1
    };
    let shutdown_interval = if args.occurrences_of("shutdown-interval") > 0 {
        value_t!(args.value_of("shutdown-interval"), u64).unwrap_or_else(|e| e.exit())
    } else {
        reload_interval
    };
    if reload_interval == 0 || shutdown_interval == 0 {
        clap::Error::value_validation_auto("intervals must be positive".to_string()).exit();
    }

    let loglevel = if args.is_present("verbose") {
        LevelFilter::Debug
    } else if args.is_present("quiet") {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };

    let cli = CliArgs {
        module: args.value_of("module").unwrap_or_default().to_string(),
        watch: values_t!(args.values_of("watch"), String).unwrap_or_else(|_| Vec::new()),
        ignore: values_t!(args.values_of("ignore"), String).unwrap_or_else(|_| Vec::new()),
        reload_interval,
        shutdown_interval,
        once: args.is_present("once"),
        forwarded: values_t!(args.values_of("args"), String).unwrap_or_else(|_| Vec::new()),
    };

    (cli, loglevel)
}

/// The worker half of the CLI: announce what to watch, then run the target
/// program and pass its exit status through.
pub fn run_module(args: &CliArgs, proxy: &ReloaderProxy) -> i32 {
    let mut files: Vec<PathBuf> = Vec::new();
    for path in &args.watch {
        files.push(absolute(Path::new(path)));
    }
    if let Some(program) = resolve_program(&args.module) {
        files.push(program);
    }
    if !files.is_empty() {
        proxy.watch_files(files);
    }

    let mut command = Command::new(&args.module);
    command.args(&args.forwarded);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("couldn't start {}: {}", args.module, err);
            return 1;
        }
    };

    forward_termination(child.id());

    match child.wait() {
        Ok(status) => status.code().unwrap_or(1),
        Err(err) => {
            error!("couldn't collect {}: {}", args.module, err);
            1
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Locate the target so its binary can be watched too; editing (or
/// rebuilding) the program restarts it.
fn resolve_program(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 {
        return fs::canonicalize(path).ok();
    }
    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !env::consts::EXE_SUFFIX.is_empty() {
            let candidate = dir.join(format!("{}{}", name, env::consts::EXE_SUFFIX));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// The supervisor's polite kill lands on the worker, not on the target it
/// spawned; pass SIGTERM along so the server actually stops.
#[cfg(unix)]
fn forward_termination(pid: u32) {
    use nix::libc;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicI32, Ordering};

    static TARGET: AtomicI32 = AtomicI32::new(0);

    extern "C" fn relay(signum: libc::c_int) {
        let pid = TARGET.load(Ordering::SeqCst);
        if pid > 0 {
            unsafe {
                libc::kill(pid, signum);
            }
        }
        unsafe {
            libc::_exit(128 + signum);
        }
    }

    TARGET.store(pid as i32, Ordering::SeqCst);
    let action = SigAction::new(SigHandler::Handler(relay), SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGTERM, &action);
    }
}

#[cfg(not(unix))]
fn forward_termination(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_flag_set() {
        let (args, level) = get_args_from(&[
            "reloadex",
            "-m",
            "server",
            "-w",
            "config.ini",
            "-w",
            "templates",
            "-x",
            "*.log",
            "--reload-interval",
            "3",
            "-v",
            "--",
            "--port",
            "8080",
        ]);
        assert_eq!(args.module, "server");
        assert_eq!(args.watch, vec!["config.ini", "templates"]);
        assert_eq!(args.ignore, vec!["*.log"]);
        assert_eq!(args.reload_interval, 3);
        assert_eq!(args.shutdown_interval, 3);
        assert!(!args.once);
        assert_eq!(args.forwarded, vec!["--port", "8080"]);
        assert_eq!(level, LevelFilter::Debug);
    }

    #[test]
    fn intervals_default_to_one_second() {
        let (args, level) = get_args_from(&["reloadex", "-m", "server"]);
        assert_eq!(args.reload_interval, 1);
        assert_eq!(args.shutdown_interval, 1);
        assert_eq!(level, LevelFilter::Info);
    }

    #[test]
    fn shutdown_interval_overrides_independently() {
        let (args, _) = get_args_from(&[
            "reloadex",
            "-m",
            "server",
            "--shutdown-interval",
            "7",
        ]);
        assert_eq!(args.reload_interval, 1);
        assert_eq!(args.shutdown_interval, 7);
    }

    #[test]
    fn quiet_lowers_the_log_level() {
        let (args, level) = get_args_from(&["reloadex", "-m", "server", "-q", "-1"]);
        assert!(args.once);
        assert_eq!(level, LevelFilter::Warn);
    }

    #[test]
    #[cfg(unix)]
    fn programs_resolve_through_the_path() {
        assert!(resolve_program("sh").is_some());
        assert!(resolve_program("definitely-not-a-real-program-here").is_none());
    }
}
