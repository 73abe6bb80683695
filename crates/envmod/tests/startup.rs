//! End-to-end tests that drive the compiled binary the way a caller would
//! and observe what the launched command sees.

use envmod_linux::{geteuid, Uid};
use indoc::indoc;
use std::{
    fs,
    io::{BufRead as _, BufReader},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
    process::{Child, Command, Output, Stdio},
};
use tempfile::TempDir;

const LOCK_CONTENTION_MESSAGE: &str = "unable to lock: Resource temporarily unavailable\n";

fn envmod_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_envmod"))
}

fn running_as_root() -> bool {
    geteuid() == Uid::ROOT
}

/// A field of the test process's own /proc/self/stat, by the 1-based index
/// proc(5) documents, for comparing against what the launched command sees.
fn self_stat_field(index: usize) -> i64 {
    let stat = fs::read_to_string("/proc/self/stat").unwrap();
    // comm can contain spaces; skip past its closing paren first.
    let rest = &stat[stat.rfind(')').unwrap() + 2..];
    rest.split(' ').nth(index - 3).unwrap().parse().unwrap()
}

enum StatusExpectation {
    Exact(i32),
    Failure,
}

struct Test {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    expected_status: StatusExpectation,
    expected_stdout: Option<String>,
    expected_stderr: Option<String>,
}

impl Test {
    fn new(args: &[&str]) -> Self {
        Test {
            program: envmod_bin(),
            args: args.iter().map(ToString::to_string).collect(),
            envs: vec![],
            expected_status: StatusExpectation::Exact(0),
            expected_stdout: None,
            expected_stderr: None,
        }
    }

    /// Run through a differently-named link instead of the envmod binary.
    fn via(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn env(mut self, name: &str, value: &str) -> Self {
        self.envs.push((name.to_string(), value.to_string()));
        self
    }

    fn expected_status(mut self, status: i32) -> Self {
        self.expected_status = StatusExpectation::Exact(status);
        self
    }

    fn expected_failure(mut self) -> Self {
        self.expected_status = StatusExpectation::Failure;
        self
    }

    fn expected_stdout(mut self, stdout: &str) -> Self {
        self.expected_stdout = Some(stdout.to_string());
        self
    }

    fn expected_stderr(mut self, stderr: &str) -> Self {
        self.expected_stderr = Some(stderr.to_string());
        self
    }

    fn run(self) -> Output {
        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(name, value)| (name, value)))
            .output()
            .unwrap();
        let status = output.status.code().unwrap_or_else(|| {
            panic!("command killed by signal: {:?}", output.status);
        });
        match self.expected_status {
            StatusExpectation::Exact(expected) => assert_eq!(status, expected),
            StatusExpectation::Failure => assert_ne!(status, 0),
        }
        if let Some(expected) = &self.expected_stdout {
            assert_eq!(&String::from_utf8_lossy(&output.stdout), expected);
        }
        if let Some(expected) = &self.expected_stderr {
            assert_eq!(&String::from_utf8_lossy(&output.stderr), expected);
        }
        output
    }
}

fn stdout_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// An envmod invocation holding a lock through its launched command, proving
/// along the way that the lock descriptor survives the exec.
struct LockHolder {
    child: Child,
}

impl LockHolder {
    fn hold(lock: &Path) -> Self {
        let mut child = Command::new(envmod_bin())
            .arg("-l")
            .arg(lock)
            .args(["sh", "-c", "echo ready && cat"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut ready = String::new();
        BufReader::new(child.stdout.as_mut().unwrap())
            .read_line(&mut ready)
            .unwrap();
        assert_eq!(ready, "ready\n");
        LockHolder { child }
    }

    fn release(mut self) {
        // EOF on stdin lets the held cat, and with it the lock, go.
        drop(self.child.stdin.take());
        assert!(self.child.wait().unwrap().success());
    }
}

#[test]
fn chdir_changes_the_working_directory() {
    let dir = TempDir::new().unwrap();
    let output = Test::new(&["-C", dir.path().to_str().unwrap(), "sh", "-c", "pwd"]).run();
    let cwd = stdout_str(&output);
    assert_eq!(
        Path::new(cwd.trim()).file_name(),
        dir.path().file_name(),
    );
}

#[test]
fn chdir_to_missing_directory_fails_before_launch() {
    Test::new(&["-C", "/no-such-envmod-dir", "echo", "nope"])
        .expected_status(2)
        .expected_stdout("")
        .expected_stderr(
            "unable to change directory to /no-such-envmod-dir: No such file or directory\n",
        )
        .run();
}

#[test]
fn argv0_round_trips() {
    Test::new(&["-b", "Yburo0Fo3SGpAKdc", "sh", "-c", "echo $0"])
        .expected_stdout("Yburo0Fo3SGpAKdc\n")
        .run();
}

#[test]
fn argv0_defaults_to_the_program() {
    Test::new(&["sh", "-c", "echo $0"])
        .expected_stdout("sh\n")
        .run();
}

#[test]
fn niceness_is_additive() {
    let expected = (self_stat_field(19) + 5).min(19);
    Test::new(&["-n", "5", "sh", "-c", "cut -d' ' -f19 /proc/self/stat"])
        .expected_stdout(&format!("{expected}\n"))
        .run();
}

#[test]
fn lock_excludes_other_invocations_and_survives_exec() {
    let dir = TempDir::new().unwrap();
    let lock = dir.path().join("lock");
    let lock_str = lock.to_str().unwrap();

    let holder = LockHolder::hold(&lock);
    // The holder's *launched* sh owns the lock now; contenders fail fast and
    // never run their command.
    Test::new(&["-l", lock_str, "echo", "should-not-run"])
        .expected_status(1)
        .expected_stdout("")
        .expected_stderr(LOCK_CONTENTION_MESSAGE)
        .run();
    holder.release();

    // With the holder gone the lock is free again.
    Test::new(&["-l", lock_str, "true"]).run();
}

#[test]
fn blocking_lock_acquires_when_free() {
    let dir = TempDir::new().unwrap();
    Test::new(&["-L", dir.path().join("lock").to_str().unwrap(), "true"]).run();
}

#[test]
fn lock_file_open_failure_is_a_lock_error() {
    Test::new(&["-l", "/no-such-envmod-dir/lock", "true"])
        .expected_status(1)
        .expected_stderr("unable to open lock: No such file or directory\n")
        .run();
}

#[test]
fn closing_stdin_is_destructive() {
    Test::new(&["-0", "cat"])
        .expected_failure()
        .expected_stdout("")
        .run();
}

#[test]
fn closing_stdout_is_destructive() {
    Test::new(&["-1", "sh", "-c", "echo hello"])
        .expected_failure()
        .expected_stdout("")
        .run();
}

#[test]
fn closing_stderr_loses_the_message() {
    Test::new(&["-2", "sh", "-c", "echo hello 1>&2"])
        .expected_failure()
        .expected_stdout("")
        .expected_stderr("")
        .run();
}

#[test]
fn new_session_detaches() {
    let session = self_stat_field(6);
    let output = Test::new(&["-P", "sh", "-c", "cut -d' ' -f6 /proc/self/stat"]).run();
    assert_ne!(stdout_str(&output).trim().parse::<i64>().unwrap(), session);
}

#[test]
fn env_dir_sets_and_unsets() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("ENVMOD_IT_SET"), "bar\n").unwrap();
    fs::write(dir.path().join("ENVMOD_IT_EMPTY"), "").unwrap();
    Test::new(&[
        "-e",
        dir.path().to_str().unwrap(),
        "sh",
        "-c",
        "echo ${ENVMOD_IT_SET:-unset} ${ENVMOD_IT_EMPTY:-unset}",
    ])
    .env("ENVMOD_IT_EMPTY", "leftover")
    .expected_stdout("bar unset\n")
    .run();
}

#[test]
fn env_file_sets_and_unsets() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("env");
    fs::write(
        &file,
        indoc! {"
            ENVMOD_IT_FILE_SET=bar
            ENVMOD_IT_FILE_EMPTY=
        "},
    )
    .unwrap();
    Test::new(&[
        "-E",
        file.to_str().unwrap(),
        "sh",
        "-c",
        "echo ${ENVMOD_IT_FILE_SET:-unset} ${ENVMOD_IT_FILE_EMPTY:-unset}",
    ])
    .env("ENVMOD_IT_FILE_EMPTY", "leftover")
    .expected_stdout("bar unset\n")
    .run();
}

#[test]
fn clearing_the_environment_drops_inherited_variables() {
    Test::new(&["-x", "/bin/sh", "-c", "echo ${ENVMOD_IT_LEFTOVER:-unset}"])
        .env("ENVMOD_IT_LEFTOVER", "x")
        .expected_stdout("unset\n")
        .run();
}

#[test]
fn open_file_limit_is_applied() {
    Test::new(&["-o", "9", "sh", "-c", "ulimit -n"])
        .expected_stdout("9\n")
        .run();
}

#[test]
fn exec_failure_exits_127() {
    Test::new(&["/no-such-envmod-program"])
        .expected_status(127)
        .expected_stderr(
            "unable to execute /no-such-envmod-program: No such file or directory\n",
        )
        .run();
}

#[test]
fn verbose_logs_each_stage() {
    let output = Test::new(&["-v", "true"]).run();
    assert!(String::from_utf8_lossy(&output.stderr).contains("executing target"));
}

fn linked_as(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let link = dir.path().join(name);
    symlink(envmod_bin(), &link).unwrap();
    (dir, link)
}

#[test]
fn pgrphack_link_detaches_the_session() {
    let (_dir, link) = linked_as("pgrphack");
    let session = self_stat_field(6);
    let output = Test::new(&["sh", "-c", "cut -d' ' -f6 /proc/self/stat"])
        .via(link)
        .run();
    assert_ne!(stdout_str(&output).trim().parse::<i64>().unwrap(), session);
}

#[test]
fn envdir_link_populates_the_environment() {
    let (_dir, link) = linked_as("envdir");
    let env_dir = TempDir::new().unwrap();
    fs::write(env_dir.path().join("ENVMOD_IT_ALIAS"), "via-link\n").unwrap();
    Test::new(&[
        env_dir.path().to_str().unwrap(),
        "sh",
        "-c",
        "echo $ENVMOD_IT_ALIAS",
    ])
    .via(link)
    .expected_stdout("via-link\n")
    .run();
}

#[test]
fn setlock_link_contends_like_the_lock_flag() {
    let (_dir, link) = linked_as("setlock");
    let dir = TempDir::new().unwrap();
    let lock = dir.path().join("lock");

    let holder = LockHolder::hold(&lock);
    Test::new(&["-n", lock.to_str().unwrap(), "true"])
        .via(link)
        .expected_status(1)
        .expected_stderr(LOCK_CONTENTION_MESSAGE)
        .run();
    holder.release();
}

#[test]
fn privilege_drop_applies_numeric_identity() {
    if !running_as_root() {
        return;
    }
    Test::new(&["-U", ":1234:5678", "sh", "-c", "id -u && id -g"])
        .expected_stdout("1234\n5678\n")
        .run();
}

#[test]
fn privilege_drop_exports_uid_and_gid() {
    if !running_as_root() {
        return;
    }
    Test::new(&["-U", "root:root", "sh", "-c", "echo $UID $GID"])
        .expected_stdout("0 0\n")
        .run();
}

#[test]
fn unknown_user_is_a_privilege_error() {
    Test::new(&["-U", "no-such-envmod-user", "true"])
        .expected_status(2)
        .expected_stderr("unknown user: no-such-envmod-user\n")
        .run();
}

#[test]
fn negative_niceness_needs_privilege() {
    if running_as_root() {
        return;
    }
    let output = Test::new(&["-n", "-3", "true"]).expected_status(2).run();
    assert!(String::from_utf8_lossy(&output.stderr).contains("unable to set nice level"));
}

#[test]
fn negative_niceness_applies_for_root() {
    if !running_as_root() {
        return;
    }
    let expected = (self_stat_field(19) - 3).max(-20);
    Test::new(&["-n", "-3", "sh", "-c", "cut -d' ' -f19 /proc/self/stat"])
        .expected_stdout(&format!("{expected}\n"))
        .run();
}

#[test]
fn chroot_happens_before_chdir() {
    if !running_as_root() {
        return;
    }
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    // /sub only exists inside the new root, and the empty root can't satisfy
    // the exec: reaching the exec failure proves both earlier stages ran, in
    // order, inside the chroot.
    let output = Test::new(&[
        "-/",
        dir.path().to_str().unwrap(),
        "-C",
        "/sub",
        "/no-such-program",
    ])
    .expected_status(127)
    .run();
    assert!(String::from_utf8_lossy(&output.stderr).contains("unable to execute"));
}

#[test]
fn chroot_needs_privilege() {
    if running_as_root() {
        return;
    }
    let dir = TempDir::new().unwrap();
    Test::new(&["-/", dir.path().to_str().unwrap(), "true"])
        .expected_status(2)
        .expected_stderr(&format!(
            "unable to change root directory to {}: Operation not permitted\n",
            dir.path().display()
        ))
        .run();
}
