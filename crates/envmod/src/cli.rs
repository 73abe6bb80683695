//! The command-line surface: the option set, the `-U` identity grammar, and
//! the program-name aliases that make the binary act as a family of
//! single-purpose tools.

use crate::{
    executor::{LockSpec, StartupSpec},
    limits::Limits,
};
use clap::Parser;
use envmod_linux::{Gid, Uid};
use std::{
    env,
    ffi::OsString,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Debug, Parser)]
#[command(
    name = "envmod",
    about = "Apply process-state mutations in a fixed order, then execute a command."
)]
pub struct Options {
    /// Change the root directory.
    #[arg(short = '/', value_name = "DIR")]
    new_root: Option<PathBuf>,

    /// Change the working directory.
    #[arg(short = 'C', value_name = "DIR")]
    working_directory: Option<PathBuf>,

    /// Drop to the given identity and export UID/GID. Accepts
    /// user[:group[:group...]] or numeric :uid[:gid[:gid...]].
    #[arg(short = 'U', value_name = "USER")]
    user: Option<UserSpec>,

    /// Adjust the niceness by this delta. Negative deltas need privilege.
    #[arg(short = 'n', value_name = "DELTA", allow_negative_numbers = true)]
    nice: Option<i32>,

    /// Take an exclusive lock on FILE; fail immediately if it is held.
    #[arg(short = 'l', value_name = "FILE", conflicts_with = "lock_wait")]
    lock: Option<PathBuf>,

    /// Take an exclusive lock on FILE; wait for it if it is held.
    #[arg(short = 'L', value_name = "FILE")]
    lock_wait: Option<PathBuf>,

    /// Close standard input.
    #[arg(short = '0')]
    close_stdin: bool,

    /// Close standard output.
    #[arg(short = '1')]
    close_stdout: bool,

    /// Close standard error.
    #[arg(short = '2')]
    close_stderr: bool,

    /// Run the command in a new session.
    #[arg(short = 'P')]
    new_session: bool,

    /// Override the command's argv[0].
    #[arg(short = 'b', value_name = "NAME")]
    argv0: Option<String>,

    /// Populate the environment from a directory of files. Repeatable.
    #[arg(short = 'e', value_name = "DIR")]
    env_dirs: Vec<PathBuf>,

    /// Populate the environment from a file of KEY=VALUE lines. Repeatable.
    #[arg(short = 'E', value_name = "FILE")]
    env_files: Vec<PathBuf>,

    /// Clear the environment first.
    #[arg(short = 'x')]
    clear_environment: bool,

    /// Limit the data, stack, locked-memory, and address-space segments.
    #[arg(short = 'm', value_name = "BYTES", allow_negative_numbers = true)]
    limit_memory: Option<i64>,

    /// Limit the address space.
    #[arg(short = 'a', value_name = "BYTES", allow_negative_numbers = true)]
    limit_address_space: Option<i64>,

    /// Limit the data segment.
    #[arg(short = 'd', value_name = "BYTES", allow_negative_numbers = true)]
    limit_data: Option<i64>,

    /// Limit the number of open file descriptors.
    #[arg(short = 'o', value_name = "N", allow_negative_numbers = true)]
    limit_open_files: Option<i64>,

    /// Limit the number of processes per uid.
    #[arg(short = 'p', value_name = "N", allow_negative_numbers = true)]
    limit_processes: Option<i64>,

    /// Limit the size of files that may be created.
    #[arg(short = 'f', value_name = "BYTES", allow_negative_numbers = true)]
    limit_file_size: Option<i64>,

    /// Limit the size of core dumps.
    #[arg(short = 'c', value_name = "BYTES", allow_negative_numbers = true)]
    limit_core: Option<i64>,

    /// Limit the resident set size.
    #[arg(short = 'r', value_name = "BYTES", allow_negative_numbers = true)]
    limit_rss: Option<i64>,

    /// Limit CPU time, in seconds.
    #[arg(short = 't', value_name = "SECONDS", allow_negative_numbers = true)]
    limit_cpu: Option<i64>,

    /// Limit the amount of locked memory.
    #[arg(short = 'M', value_name = "BYTES", allow_negative_numbers = true)]
    limit_memlock: Option<i64>,

    /// Limit the stack segment.
    #[arg(short = 's', value_name = "BYTES", allow_negative_numbers = true)]
    limit_stack: Option<i64>,

    /// Log each stage as it is applied.
    #[arg(short = 'v')]
    verbose: bool,

    /// The command to execute and its arguments.
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        required = true
    )]
    command: Vec<String>,
}

impl Options {
    fn into_spec(self) -> StartupSpec {
        let limits = Limits {
            data: self.limit_data.or(self.limit_memory),
            stack: self.limit_stack.or(self.limit_memory),
            memlock: self.limit_memlock.or(self.limit_memory),
            address_space: self.limit_address_space.or(self.limit_memory),
            open_files: self.limit_open_files,
            processes: self.limit_processes,
            file_size: self.limit_file_size,
            core: self.limit_core,
            rss: self.limit_rss,
            cpu: self.limit_cpu,
        };
        let lock = match (self.lock, self.lock_wait) {
            (Some(path), _) => Some(LockSpec { path, wait: false }),
            (None, Some(path)) => Some(LockSpec { path, wait: true }),
            (None, None) => None,
        };
        let mut command = self.command.into_iter();
        // clap's `required` guarantees at least one trailing argument.
        let program = command.next().unwrap();
        StartupSpec {
            new_root: self.new_root,
            working_directory: self.working_directory,
            user: self.user,
            nice_delta: self.nice.unwrap_or(0),
            limits,
            lock,
            clear_environment: self.clear_environment,
            env_dirs: self.env_dirs,
            env_files: self.env_files,
            close_stdin: self.close_stdin,
            close_stdout: self.close_stdout,
            close_stderr: self.close_stderr,
            new_session: self.new_session,
            argv0: self.argv0,
            program,
            arguments: command.collect(),
            verbose: self.verbose,
        }
    }
}

/// Parse the process's own arguments, applying the program-name rewrite
/// first. Exits with a usage error via clap on malformed input.
pub fn parse() -> StartupSpec {
    let argv = rewrite_alias(env::args_os().collect());
    Options::parse_from(argv).into_spec()
}

/// How the requested identity was spelled. Resolution against the passwd and
/// group databases is deferred to the privilege-drop stage so that a bad name
/// is a stage failure, not a usage error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserSpec {
    Named { user: String, groups: Vec<String> },
    Numeric { uid: Option<Uid>, gids: Vec<Gid> },
}

impl FromStr for UserSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(numeric) = value.strip_prefix(':') {
            let mut fields = numeric.split(':');
            let uid_field = fields.next().unwrap();
            let uid = if uid_field.is_empty() {
                None
            } else {
                Some(Uid::from(parse_id(uid_field)?))
            };
            let gids = fields
                .map(|field| parse_id(field).map(Gid::from))
                .collect::<Result<Vec<_>, _>>()?;
            match (uid, gids) {
                (None, gids) if gids.is_empty() => Err("empty user specification".to_string()),
                // A lone uid doubles as the gid.
                (Some(uid), gids) if gids.is_empty() => Ok(UserSpec::Numeric {
                    uid: Some(uid),
                    gids: vec![Gid::from(uid.as_u32())],
                }),
                (uid, gids) => Ok(UserSpec::Numeric { uid, gids }),
            }
        } else {
            let mut fields = value.split(':');
            let user = fields.next().unwrap();
            if user.is_empty() {
                return Err("empty user specification".to_string());
            }
            let groups = fields
                .map(|field| {
                    if field.is_empty() {
                        Err("empty group name".to_string())
                    } else {
                        Ok(field.to_string())
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(UserSpec::Named {
                user: user.to_string(),
                groups,
            })
        }
    }
}

fn parse_id(field: &str) -> Result<u32, String> {
    field
        .parse()
        .map_err(|_| format!("bad numeric id: {field}"))
}

/// Rewrite an alias invocation into the equivalent envmod argument vector,
/// selected on the basename the tool was invoked by. A link named `setuidgid`
/// therefore behaves as the single-purpose utility of that name.
fn rewrite_alias(argv: Vec<OsString>) -> Vec<OsString> {
    let Some(name) = argv
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
    else {
        return argv;
    };
    match name {
        "envmod" => argv,
        "setuidgid" | "envuidgid" => insert_flag(argv, "-U"),
        "envdir" => insert_flag(argv, "-e"),
        "pgrphack" => insert_flag(argv, "-P"),
        "setlock" => rewrite_setlock(argv),
        "softlimit" => rewrite_softlimit(argv),
        _ => {
            eprintln!("warning: program-name unsupported, assuming `envmod`");
            argv
        }
    }
}

fn insert_flag(mut argv: Vec<OsString>, flag: &str) -> Vec<OsString> {
    argv.insert(1, flag.into());
    argv
}

/// `setlock [-nNxX] FILE cmd...` becomes `-l FILE cmd...` (non-blocking) or
/// `-L FILE cmd...` (blocking, the default).
fn rewrite_setlock(argv: Vec<OsString>) -> Vec<OsString> {
    // The caller only dispatches here on argv[0], so argv is never empty.
    let mut argv = argv.into_iter();
    let mut rewritten = vec![argv.next().unwrap()];
    let mut lock_flag = "-L";
    let mut argv = argv.peekable();
    while let Some(arg) = argv.peek() {
        match arg.to_str() {
            Some("-n") => lock_flag = "-l",
            Some("-N") => lock_flag = "-L",
            Some(ignored @ ("-x" | "-X")) => {
                eprintln!("warning: '{ignored}' is ignored");
            }
            _ => break,
        }
        argv.next();
    }
    rewritten.push(lock_flag.into());
    rewritten.extend(argv);
    rewritten
}

fn softlimit_memlock_flag(arg: &OsString) -> Option<OsString> {
    let arg = arg.to_str()?;
    let value = arg.strip_prefix("-l")?;
    Some(format!("-M{value}").into())
}

/// softlimit's flags are envmod's, except that softlimit spells the
/// locked-memory limit `-l`, which envmod uses for the lock file.
fn rewrite_softlimit(argv: Vec<OsString>) -> Vec<OsString> {
    let mut rewritten = Vec::with_capacity(argv.len());
    let mut argv = argv.into_iter();
    rewritten.push(argv.next().unwrap());
    let mut in_flags = true;
    while let Some(arg) = argv.next() {
        if in_flags && arg.to_str().is_some_and(|arg| arg.starts_with('-')) {
            let is_detached_flag = arg.len() == 2;
            rewritten.push(softlimit_memlock_flag(&arg).unwrap_or(arg));
            if is_detached_flag {
                // The value is the next argument; it must not end flag parsing.
                if let Some(value) = argv.next() {
                    rewritten.push(value);
                }
            }
        } else {
            in_flags = false;
            rewritten.push(arg);
        }
    }
    rewritten
}
