use envmod::{cli, executor};
use slog::{o, Drain as _, Level, LevelFilter, Logger};
use slog_term::{FullFormat, PlainSyncDecorator};
use std::{io, process};

fn main() {
    let spec = cli::parse();
    let level = if spec.verbose {
        Level::Debug
    } else {
        Level::Info
    };
    // The drain has to be synchronous: the pipeline ends in an exec, which
    // would strand an async drain's worker thread along with any buffered
    // records. It also has to write to stderr, since stdout belongs to the
    // target command.
    let decorator = PlainSyncDecorator::new(io::stderr());
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    let log = Logger::root(drain, o!());

    let err = executor::start(&spec, &log);
    eprintln!("{err}");
    process::exit(err.exit_code());
}
