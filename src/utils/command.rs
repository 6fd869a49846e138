//! Command execution primitives with consistent error handling.

use std::ffi::OsStr;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const TIMEOUT_POLL: Duration = Duration::from_millis(100);

/// Run a command in a directory, returning trimmed stdout or `None` on failure.
///
/// Useful when command failure is expected/acceptable (e.g., checking for optional tags).
pub fn run_in_optional<S: AsRef<OsStr>>(dir: &Path, program: &str, args: &[S]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        None
    } else {
        Some(stdout)
    }
}

/// Exit code and raw stdout of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run a command in a directory and capture its stdout bytes, whatever the exit status.
pub fn capture_in<S: AsRef<OsStr>>(dir: &Path, program: &str, args: &[S]) -> Result<CapturedOutput> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| {
            Error::internal_io(
                format!("Failed to run {}: {}", program, e),
                Some(program.to_string()),
            )
        })?;

    Ok(CapturedOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
    })
}

/// Run a command to completion and return its exit code.
///
/// `input` is piped to stdin when given; stdout and stderr are both sent to
/// `sink` (typically a log file) or discarded. A process killed by a signal
/// reports `-1`.
pub fn run_status<S: AsRef<OsStr>>(
    dir: &Path,
    program: &str,
    args: &[S],
    input: Option<&[u8]>,
    sink: Option<&File>,
) -> Result<i32> {
    let mut child = spawn(dir, program, args, input.is_some(), sink)?;

    if let Some(bytes) = input {
        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin closes the pipe; that's not our failure.
            let _ = stdin.write_all(bytes);
        }
    }

    let status = child.wait().map_err(|e| {
        Error::internal_io(
            format!("Failed to wait for {}: {}", program, e),
            Some(program.to_string()),
        )
    })?;

    Ok(status.code().unwrap_or(-1))
}

/// Run a command with a deadline.
///
/// Returns `Ok(None)` when the deadline passed; the child is killed in that case.
pub fn run_with_timeout<S: AsRef<OsStr>>(
    dir: &Path,
    program: &str,
    args: &[S],
    timeout: Duration,
    sink: Option<&File>,
) -> Result<Option<i32>> {
    let mut child = spawn(dir, program, args, false, sink)?;
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status.code().unwrap_or(-1))),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            Ok(None) => std::thread::sleep(TIMEOUT_POLL),
            Err(e) => {
                return Err(Error::internal_io(
                    format!("Failed to poll {}: {}", program, e),
                    Some(program.to_string()),
                ))
            }
        }
    }
}

fn spawn<S: AsRef<OsStr>>(
    dir: &Path,
    program: &str,
    args: &[S],
    piped_stdin: bool,
    sink: Option<&File>,
) -> Result<std::process::Child> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    cmd.stdin(if piped_stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    match sink.map(|f| (f.try_clone(), f.try_clone())) {
        Some((Ok(out), Ok(err))) => {
            cmd.stdout(Stdio::from(out));
            cmd.stderr(Stdio::from(err));
        }
        _ => {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
    }

    cmd.spawn().map_err(|e| {
        Error::internal_io(
            format!("Failed to run {}: {}", program, e),
            Some(program.to_string()),
        )
    })
}

/// Locate an executable on `PATH`.
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        executable_candidates(tool)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

#[cfg(windows)]
fn executable_candidates(tool: &str) -> Vec<String> {
    vec![
        format!("{}.exe", tool),
        format!("{}.bat", tool),
        format!("{}.cmd", tool),
        tool.to_string(),
    ]
}

#[cfg(not(windows))]
fn executable_candidates(tool: &str) -> Vec<String> {
    vec![tool.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn run_in_optional_returns_none_on_failure() {
        let result = run_in_optional(Path::new("/tmp"), "false", &[] as &[&str]);
        assert!(result.is_none());
    }

    #[test]
    fn run_in_optional_trims_stdout() {
        let result = run_in_optional(Path::new("/tmp"), "echo", &["  hello  "]);
        assert_eq!(result.as_deref(), Some("hello"));
    }

    #[test]
    fn capture_in_keeps_status_and_bytes() {
        let out = capture_in(Path::new("/tmp"), "sh", &["-c", "printf 'a\\nb'; exit 1"]).unwrap();
        assert_eq!(out.code, 1);
        assert_eq!(out.stdout, b"a\nb");
        assert!(!out.success());
    }

    #[test]
    fn run_status_reports_exit_code() {
        let code = run_status(Path::new("/tmp"), "sh", &["-c", "exit 3"], None, None).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn run_status_pipes_input_and_writes_sink() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("out.log");
        let log = File::create(&log_path).unwrap();

        let code = run_status(dir.path(), "cat", &[] as &[&str], Some(b"secret\n"), Some(&log))
            .unwrap();
        assert_eq!(code, 0);

        let mut written = String::new();
        File::open(&log_path)
            .unwrap()
            .read_to_string(&mut written)
            .unwrap();
        assert_eq!(written, "secret\n");
    }

    #[test]
    fn run_status_fails_for_unknown_program() {
        let result = run_status(
            Path::new("/tmp"),
            "nonexistent_command_xyz",
            &[] as &[&str],
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn run_with_timeout_kills_slow_commands() {
        let result = run_with_timeout(
            Path::new("/tmp"),
            "sleep",
            &["5"],
            Duration::from_millis(200),
            None,
        )
        .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn run_with_timeout_returns_code_for_fast_commands() {
        let result =
            run_with_timeout(Path::new("/tmp"), "true", &[] as &[&str], Duration::from_secs(5), None)
                .unwrap();
        assert_eq!(result, Some(0));
    }

    #[test]
    fn find_on_path_locates_shell() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("nonexistent_command_xyz").is_none());
    }
}
