#[macro_use]
extern crate log;

use log::{Level, LevelFilter};
use reloadex::cli;
use reloadex::{ConfigBuilder, Reloader};
use std::io::Write;
use std::process;
use std::time::Duration;

const CLI_SPEC: &str = "reloadex.cli.main";

fn init_logger(level: LevelFilter) {
    let mut log_builder = env_logger::Builder::new();
    log_builder
        .format(|buf, record| match record.level() {
            Level::Info => writeln!(buf, "{}", record.args()),
            level => writeln!(buf, "[{}] {}", level, record.args()),
        })
        .filter(None, level)
        .init();
}

fn main() {
    let (args, level) = cli::get_args();
    init_logger(level);

    // A freshly spawned worker finishes its startup here and runs the
    // target program; the first invocation falls through and becomes the
    // supervisor.
    match reloadex::spawned_worker(CLI_SPEC) {
        Ok(Some(proxy)) => process::exit(cli::run_module(&args, &proxy)),
        Ok(None) => {}
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }

    let config = match ConfigBuilder::default()
        .reload_interval(Duration::from_secs(args.reload_interval))
        .shutdown_interval(Duration::from_secs(args.shutdown_interval))
        .ignore_files(args.ignore.clone())
        .build()
    {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    let mut reloader = match Reloader::new(CLI_SPEC, config) {
        Ok(reloader) => reloader,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    if args.once {
        match reloader.run_once() {
            Ok(0) => process::exit(0),
            Ok(_) => process::exit(1),
            Err(err) => {
                error!("{}", err);
                process::exit(1);
            }
        }
    }

    if let Err(err) = reloader.run() {
        error!("{}", err);
    }
    process::exit(1);
}
