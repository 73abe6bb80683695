//! The startup pipeline: every mutation envmod applies to its own process,
//! executed in the fixed order the tool guarantees, ending in the exec of the
//! target command.

use crate::{cli::UserSpec, env as environment, limits::Limits};
use anyhow::{anyhow, Error};
use envmod_linux::{self as linux, Fd, FileMode, Gid, LockFlags, OpenFlags, Uid};
use slog::{debug, Logger};
use std::{
    convert::Infallible,
    env,
    ffi::CString,
    fmt::{self, Display, Formatter},
    os::unix::ffi::OsStrExt as _,
    path::{Path, PathBuf},
};

/// All necessary information to set up and launch the target command. Built
/// from the command line by [`crate::cli::parse`]; field order follows the
/// pipeline order, which is fixed no matter how the flags were ordered.
#[derive(Debug)]
pub struct StartupSpec {
    pub new_root: Option<PathBuf>,
    pub working_directory: Option<PathBuf>,
    pub user: Option<UserSpec>,
    pub nice_delta: i32,
    pub limits: Limits,
    pub lock: Option<LockSpec>,
    pub clear_environment: bool,
    pub env_dirs: Vec<PathBuf>,
    pub env_files: Vec<PathBuf>,
    pub close_stdin: bool,
    pub close_stdout: bool,
    pub close_stderr: bool,
    pub new_session: bool,
    pub argv0: Option<String>,
    pub program: String,
    pub arguments: Vec<String>,
    pub verbose: bool,
}

#[derive(Debug)]
pub struct LockSpec {
    pub path: PathBuf,
    pub wait: bool,
}

/// A fatal pipeline failure. The variant decides the exit code; the payload
/// is the message printed on stderr. There is no retry anywhere: whatever
/// supervises this tool is the retry policy.
#[derive(Debug)]
pub enum StartupError {
    Filesystem(Error),
    Privilege(Error),
    Scheduling(Error),
    Limit(Error),
    Lock(Error),
    Environment(Error),
    Descriptor(Error),
    Session(Error),
    Exec(Error),
}

impl StartupError {
    /// Lock failures get their own exit code so a supervisor can tell
    /// "already running" from "broken invocation"; exec failures use the
    /// conventional could-not-execute code, distinct from anything the target
    /// itself would exit with.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Lock(_) => 1,
            StartupError::Exec(_) => 127,
            _ => 2,
        }
    }
}

impl Display for StartupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Filesystem(err)
            | StartupError::Privilege(err)
            | StartupError::Scheduling(err)
            | StartupError::Limit(err)
            | StartupError::Lock(err)
            | StartupError::Environment(err)
            | StartupError::Descriptor(err)
            | StartupError::Session(err)
            | StartupError::Exec(err) => Display::fmt(err, f),
        }
    }
}

fn fserr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Filesystem(Error::from(err))
}

fn priverr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Privilege(Error::from(err))
}

fn schederr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Scheduling(Error::from(err))
}

fn limiterr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Limit(Error::from(err))
}

fn lockerr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Lock(Error::from(err))
}

fn enverr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Environment(Error::from(err))
}

fn descerr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Descriptor(Error::from(err))
}

fn sesserr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Session(Error::from(err))
}

fn execerr<E>(err: E) -> StartupError
where
    Error: From<E>,
{
    StartupError::Exec(Error::from(err))
}

/// Run the requested mutations in pipeline order, then exec the target.
///
/// This function shouldn't return on success, because the last step replaces
/// the process image. A return value is therefore always the failure that
/// stopped the pipeline, with nothing attempted past it.
pub fn start(spec: &StartupSpec, log: &Logger) -> StartupError {
    match start_inner(spec, log) {
        Ok(infallible) => match infallible {},
        Err(err) => err,
    }
}

fn start_inner(spec: &StartupSpec, log: &Logger) -> Result<Infallible, StartupError> {
    if let Some(dir) = &spec.new_root {
        set_up_root(dir, log)?;
    }
    if let Some(dir) = &spec.working_directory {
        set_up_working_directory(dir, log)?;
    }
    if let Some(user) = &spec.user {
        drop_privileges(user, log)?;
    }
    if spec.nice_delta != 0 {
        set_up_niceness(spec.nice_delta, log)?;
    }
    spec.limits.apply(log).map_err(limiterr)?;
    if let Some(lock) = &spec.lock {
        acquire_lock(lock, log)?;
    }
    set_up_environment(spec, log)?;
    close_descriptors(spec, log)?;
    if spec.new_session {
        set_up_session(log)?;
    }
    do_exec(spec, log)
}

fn path_cstr(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(Error::new)
}

fn set_up_root(dir: &Path, log: &Logger) -> Result<(), StartupError> {
    debug!(log, "changing root directory"; "path" => %dir.display());
    let path = path_cstr(dir).map_err(fserr)?;
    linux::chroot(&path).map_err(|err| {
        fserr(anyhow!(
            "unable to change root directory to {}: {err}",
            dir.display()
        ))
    })?;
    // The old working directory is outside the new root; without this,
    // relative resolution in later stages would escape the chroot.
    linux::chdir(c"/")
        .map_err(|err| fserr(anyhow!("unable to change directory to /: {err}")))?;
    Ok(())
}

fn set_up_working_directory(dir: &Path, log: &Logger) -> Result<(), StartupError> {
    debug!(log, "changing working directory"; "path" => %dir.display());
    let path = path_cstr(dir).map_err(fserr)?;
    linux::chdir(&path).map_err(|err| {
        fserr(anyhow!(
            "unable to change directory to {}: {err}",
            dir.display()
        ))
    })?;
    Ok(())
}

fn resolve_identity(user: &UserSpec) -> Result<(Option<Uid>, Vec<Gid>), StartupError> {
    match user {
        UserSpec::Numeric { uid, gids } => Ok((*uid, gids.clone())),
        UserSpec::Named { user, groups } => {
            let name = CString::new(user.as_str()).map_err(|err| priverr(Error::new(err)))?;
            let passwd =
                linux::getpwnam(&name).ok_or_else(|| priverr(anyhow!("unknown user: {user}")))?;
            if groups.is_empty() {
                return Ok((Some(passwd.uid), vec![passwd.gid]));
            }
            let mut gids = Vec::with_capacity(groups.len());
            for group in groups {
                let name =
                    CString::new(group.as_str()).map_err(|err| priverr(Error::new(err)))?;
                gids.push(
                    linux::getgrnam(&name)
                        .ok_or_else(|| priverr(anyhow!("unknown group: {group}")))?,
                );
            }
            Ok((Some(passwd.uid), gids))
        }
    }
}

fn drop_privileges(user: &UserSpec, log: &Logger) -> Result<(), StartupError> {
    // The parser guarantees at least one gid in either spelling.
    let (uid, gids) = resolve_identity(user)?;
    debug!(log, "dropping privileges"; "uid" => ?uid, "gids" => ?gids);
    // Group identity goes first: once the uid is dropped, changing groups
    // would no longer be authorized.
    linux::setgroups(&gids).map_err(|err| priverr(anyhow!("unable to set groups: {err}")))?;
    linux::setgid(gids[0])
        .map_err(|err| priverr(anyhow!("unable to set gid {}: {err}", gids[0])))?;
    if let Some(uid) = uid {
        linux::setuid(uid).map_err(|err| priverr(anyhow!("unable to set uid {uid}: {err}")))?;
        env::set_var("UID", uid.as_u32().to_string());
    }
    env::set_var("GID", gids[0].as_u32().to_string());
    Ok(())
}

fn set_up_niceness(delta: i32, log: &Logger) -> Result<(), StartupError> {
    let value = linux::nice(delta)
        .map_err(|err| schederr(anyhow!("unable to set nice level: {err}")))?;
    debug!(log, "adjusted niceness"; "delta" => delta, "value" => value);
    Ok(())
}

fn acquire_lock(lock: &LockSpec, log: &Logger) -> Result<(), StartupError> {
    let path = path_cstr(&lock.path).map_err(lockerr)?;
    let fd = linux::open(
        &path,
        OpenFlags::WRONLY | OpenFlags::APPEND | OpenFlags::CREAT,
        FileMode::RUSR | FileMode::WUSR | FileMode::RGRP | FileMode::ROTH,
    )
    .map_err(|err| lockerr(anyhow!("unable to open lock: {err}")))?;
    let flags = if lock.wait {
        LockFlags::EX
    } else {
        LockFlags::EX | LockFlags::NB
    };
    linux::flock(fd.as_fd(), flags).map_err(|err| lockerr(anyhow!("unable to lock: {err}")))?;
    debug!(log, "acquired lock"; "path" => %lock.path.display());
    // The descriptor must stay open, and not close-on-exec, so that the lock
    // is held for the whole lifetime of the launched program. It is released
    // only when that program exits or closes it.
    let _ = fd.into_fd();
    Ok(())
}

fn set_up_environment(spec: &StartupSpec, log: &Logger) -> Result<(), StartupError> {
    if spec.clear_environment {
        debug!(log, "clearing environment");
        environment::clear();
    }
    for dir in &spec.env_dirs {
        debug!(log, "applying environment directory"; "path" => %dir.display());
        environment::apply_env_dir(dir).map_err(enverr)?;
    }
    for file in &spec.env_files {
        debug!(log, "applying environment file"; "path" => %file.display());
        environment::apply_env_file(file).map_err(enverr)?;
    }
    Ok(())
}

fn close_descriptors(spec: &StartupSpec, log: &Logger) -> Result<(), StartupError> {
    let selections = [
        (spec.close_stdin, Fd::STDIN, "standard input"),
        (spec.close_stdout, Fd::STDOUT, "standard output"),
        (spec.close_stderr, Fd::STDERR, "standard error"),
    ];
    for (selected, fd, name) in selections {
        if selected {
            debug!(log, "closing descriptor"; "which" => name);
            linux::close(fd).map_err(|err| descerr(anyhow!("unable to close {name}: {err}")))?;
        }
    }
    Ok(())
}

fn set_up_session(log: &Logger) -> Result<(), StartupError> {
    debug!(log, "starting new session");
    linux::setsid().map_err(|err| sesserr(anyhow!("setsid: {err}")))
}

fn do_exec(spec: &StartupSpec, log: &Logger) -> Result<Infallible, StartupError> {
    let program = CString::new(spec.program.as_str()).map_err(|err| execerr(Error::new(err)))?;
    let argv0 = spec.argv0.as_deref().unwrap_or(spec.program.as_str());
    let argv0 = CString::new(argv0).map_err(|err| execerr(Error::new(err)))?;
    let arguments = spec
        .arguments
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| execerr(Error::new(err)))?;
    let mut argv = Vec::with_capacity(arguments.len() + 1);
    argv.push(argv0.as_c_str());
    argv.extend(arguments.iter().map(CString::as_c_str));
    debug!(log, "executing target"; "program" => &spec.program);
    let err = linux::execvp(&program, &argv);
    Err(execerr(anyhow!(
        "unable to execute {}: {err}",
        spec.program
    )))
}
