//! Function wrappers for the Linux syscalls envmod uses to mutate its own
//! process before replacing itself with the target program.

use core::{
    ffi::{c_char, c_int, CStr},
    fmt::{self, Debug, Display, Formatter},
    mem, ptr,
};
use derive_more::{BitOr, Display, From};

#[derive(Clone, Copy, From, PartialEq, Eq)]
pub struct Errno(c_int);

impl Errno {
    pub const EAGAIN: Self = Self(libc::EAGAIN);
    pub const ENOENT: Self = Self(libc::ENOENT);
    pub const EPERM: Self = Self(libc::EPERM);

    pub fn last() -> Self {
        // Every wrapper in this crate calls this immediately after a failed
        // return, before anything else can clobber errno.
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }

    /// The strerror(3) description, undecorated, as perror(3) would print it.
    pub fn desc(&self) -> String {
        let mut buf = [0 as c_char; 128];
        let ret = unsafe { libc::strerror_r(self.0, buf.as_mut_ptr(), buf.len()) };
        if ret != 0 {
            return format!("Unknown error {}", self.0);
        }
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.desc())
    }
}

impl Debug for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self.desc())
    }
}

fn check(ret: c_int) -> Result<c_int, Errno> {
    if ret == -1 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fd(c_int);

impl Fd {
    pub const STDIN: Self = Self(0);
    pub const STDOUT: Self = Self(1);
    pub const STDERR: Self = Self(2);

    pub fn from_raw(fd: c_int) -> Self {
        Self(fd)
    }

    pub fn as_c_int(&self) -> c_int {
        self.0
    }
}

/// An [`Fd`] that is closed on drop. [`OwnedFd::into_fd`] gives the
/// descriptor up without closing it, which is how a descriptor is handed
/// over to the program that replaces this process image.
#[derive(Debug)]
pub struct OwnedFd {
    fd: Fd,
}

impl OwnedFd {
    pub fn from_fd(fd: Fd) -> Self {
        Self { fd }
    }

    pub fn as_fd(&self) -> Fd {
        self.fd
    }

    pub fn into_fd(self) -> Fd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        // Nothing useful to do with a close error here.
        let _ = close(self.fd);
    }
}

#[derive(Clone, Copy, Debug, Display, From, PartialEq, Eq)]
#[repr(transparent)]
pub struct Uid(libc::uid_t);

impl Uid {
    pub const ROOT: Self = Self(0);

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Display, From, PartialEq, Eq)]
#[repr(transparent)]
pub struct Gid(libc::gid_t);

impl Gid {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

#[derive(BitOr, Clone, Copy, Default)]
pub struct OpenFlags(c_int);

impl OpenFlags {
    pub const RDONLY: Self = Self(libc::O_RDONLY);
    pub const WRONLY: Self = Self(libc::O_WRONLY);
    pub const APPEND: Self = Self(libc::O_APPEND);
    pub const CREAT: Self = Self(libc::O_CREAT);
    pub const TRUNC: Self = Self(libc::O_TRUNC);
}

#[derive(BitOr, Clone, Copy, Default)]
pub struct FileMode(libc::mode_t);

impl FileMode {
    pub const RWXU: Self = Self(0o0700);
    pub const RUSR: Self = Self(0o0400);
    pub const WUSR: Self = Self(0o0200);
    pub const XUSR: Self = Self(0o0100);

    pub const RWXG: Self = Self(0o0070);
    pub const RGRP: Self = Self(0o0040);
    pub const WGRP: Self = Self(0o0020);
    pub const XGRP: Self = Self(0o0010);

    pub const RWXO: Self = Self(0o0007);
    pub const ROTH: Self = Self(0o0004);
    pub const WOTH: Self = Self(0o0002);
    pub const XOTH: Self = Self(0o0001);
}

#[derive(BitOr, Clone, Copy, Default)]
pub struct LockFlags(c_int);

impl LockFlags {
    pub const EX: Self = Self(libc::LOCK_EX);
    pub const NB: Self = Self(libc::LOCK_NB);
}

pub fn open(path: &CStr, flags: OpenFlags, mode: FileMode) -> Result<OwnedFd, Errno> {
    let fd = check(unsafe { libc::open(path.as_ptr(), flags.0, mode.0 as libc::c_uint) })?;
    Ok(OwnedFd::from_fd(Fd(fd)))
}

pub fn close(fd: Fd) -> Result<(), Errno> {
    check(unsafe { libc::close(fd.0) }).map(drop)
}

pub fn flock(fd: Fd, flags: LockFlags) -> Result<(), Errno> {
    check(unsafe { libc::flock(fd.0, flags.0) }).map(drop)
}

pub fn chroot(path: &CStr) -> Result<(), Errno> {
    check(unsafe { libc::chroot(path.as_ptr()) }).map(drop)
}

pub fn chdir(path: &CStr) -> Result<(), Errno> {
    check(unsafe { libc::chdir(path.as_ptr()) }).map(drop)
}

pub fn setsid() -> Result<(), Errno> {
    check(unsafe { libc::setsid() }).map(drop)
}

pub fn getuid() -> Uid {
    Uid(unsafe { libc::getuid() })
}

pub fn geteuid() -> Uid {
    Uid(unsafe { libc::geteuid() })
}

pub fn getgid() -> Gid {
    Gid(unsafe { libc::getgid() })
}

pub fn setuid(uid: Uid) -> Result<(), Errno> {
    check(unsafe { libc::setuid(uid.0) }).map(drop)
}

pub fn setgid(gid: Gid) -> Result<(), Errno> {
    check(unsafe { libc::setgid(gid.0) }).map(drop)
}

pub fn setgroups(gids: &[Gid]) -> Result<(), Errno> {
    // Gid is repr(transparent) over gid_t, so the slice can be passed through.
    check(unsafe { libc::setgroups(gids.len(), gids.as_ptr().cast()) }).map(drop)
}

/// Adjust the process's niceness by `increment` and return the new value.
///
/// nice(2) can legitimately return -1, so the only reliable failure signal is
/// errno, which has to be cleared going in.
pub fn nice(increment: c_int) -> Result<c_int, Errno> {
    unsafe { *libc::__errno_location() = 0 };
    let ret = unsafe { libc::nice(increment) };
    let errno = Errno::last();
    if ret == -1 && errno != Errno(0) {
        Err(errno)
    } else {
        Ok(ret)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resource(c_int);

impl Resource {
    pub const DATA: Self = Self(libc::RLIMIT_DATA as c_int);
    pub const STACK: Self = Self(libc::RLIMIT_STACK as c_int);
    pub const MEMLOCK: Self = Self(libc::RLIMIT_MEMLOCK as c_int);
    pub const AS: Self = Self(libc::RLIMIT_AS as c_int);
    pub const NOFILE: Self = Self(libc::RLIMIT_NOFILE as c_int);
    pub const NPROC: Self = Self(libc::RLIMIT_NPROC as c_int);
    pub const FSIZE: Self = Self(libc::RLIMIT_FSIZE as c_int);
    pub const CORE: Self = Self(libc::RLIMIT_CORE as c_int);
    pub const RSS: Self = Self(libc::RLIMIT_RSS as c_int);
    pub const CPU: Self = Self(libc::RLIMIT_CPU as c_int);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rlimit {
    pub cur: u64,
    pub max: u64,
}

impl Rlimit {
    pub const INFINITY: u64 = libc::RLIM_INFINITY as u64;
}

pub fn getrlimit(resource: Resource) -> Result<Rlimit, Errno> {
    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    check(unsafe { libc::getrlimit(resource.0 as _, &mut rlimit) })?;
    Ok(Rlimit {
        cur: rlimit.rlim_cur as u64,
        max: rlimit.rlim_max as u64,
    })
}

pub fn setrlimit(resource: Resource, rlimit: Rlimit) -> Result<(), Errno> {
    let rlimit = libc::rlimit {
        rlim_cur: rlimit.cur as libc::rlim_t,
        rlim_max: rlimit.max as libc::rlim_t,
    };
    check(unsafe { libc::setrlimit(resource.0 as _, &rlimit) }).map(drop)
}

/// Replace the process image with `file`, resolved via `PATH` when it
/// contains no slash. Returns only on failure.
pub fn execvp(file: &CStr, argv: &[&CStr]) -> Errno {
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    unsafe { libc::execvp(file.as_ptr(), argv_ptrs.as_ptr()) };
    Errno::last()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Passwd {
    pub uid: Uid,
    pub gid: Gid,
}

/// Look `name` up in the passwd database. `None` means no such user.
pub fn getpwnam(name: &CStr) -> Option<Passwd> {
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        None
    } else {
        let passwd = unsafe { &*passwd };
        Some(Passwd {
            uid: Uid(passwd.pw_uid),
            gid: Gid(passwd.pw_gid),
        })
    }
}

/// Look `name` up in the group database. `None` means no such group.
pub fn getgrnam(name: &CStr) -> Option<Gid> {
    let group = unsafe { libc::getgrnam(name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        Some(Gid(unsafe { (*group).gr_gid }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn errno_desc_is_undecorated() {
        assert_eq!(Errno::EAGAIN.desc(), "Resource temporarily unavailable");
    }

    #[test]
    fn open_in_missing_directory_fails_with_enoent() {
        let err = open(
            c"/no-such-directory/lock",
            OpenFlags::WRONLY | OpenFlags::CREAT,
            FileMode::RUSR | FileMode::WUSR,
        )
        .unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn flock_excludes_other_descriptions_of_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = CString::new(dir.path().join("lock").to_str().unwrap()).unwrap();
        let flags = OpenFlags::WRONLY | OpenFlags::APPEND | OpenFlags::CREAT;
        let mode = FileMode::RUSR | FileMode::WUSR;

        let first = open(&path, flags, mode).unwrap();
        flock(first.as_fd(), LockFlags::EX | LockFlags::NB).unwrap();

        // A second open file description contends even within one process.
        let second = open(&path, flags, mode).unwrap();
        let err = flock(second.as_fd(), LockFlags::EX | LockFlags::NB).unwrap_err();
        assert_eq!(err, Errno::EAGAIN);

        // Dropping the holder releases the lock.
        drop(first);
        flock(second.as_fd(), LockFlags::EX | LockFlags::NB).unwrap();
    }

    #[test]
    fn nice_with_zero_increment_reports_current_value() {
        let first = nice(0).unwrap();
        let second = nice(0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn getrlimit_soft_is_within_hard() {
        let rlimit = getrlimit(Resource::NOFILE).unwrap();
        assert!(rlimit.cur <= rlimit.max);
    }

    #[test]
    fn execvp_of_missing_program_returns() {
        let err = execvp(c"/no-such-directory/program", &[c"program"]);
        assert_eq!(err, Errno::ENOENT);
    }

    #[test]
    fn getpwnam_resolves_root() {
        let passwd = getpwnam(c"root").unwrap();
        assert_eq!(passwd.uid, Uid::ROOT);
    }

    #[test]
    fn getgrnam_of_unknown_group_is_none() {
        assert!(getgrnam(c"no-such-group-envmod").is_none());
    }

    #[test]
    fn setgroups_requires_privilege() {
        if geteuid() == Uid::ROOT {
            return;
        }
        let err = setgroups(&[Gid::from(12345)]).unwrap_err();
        assert_eq!(err, Errno::EPERM);
    }
}
