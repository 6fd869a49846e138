//! Per-project log of external tool output.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;
use crate::utils::command;

/// Collects the output of every child process run for one project.
///
/// Writes are best-effort: a log that cannot be written never fails a stage.
#[derive(Debug, Default)]
pub struct ProjectLog {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl ProjectLog {
    /// Open (and truncate) the project's log file.
    pub fn create(project_dir: &Path) -> Result<Self> {
        let path = paths::project_log(project_dir);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("open {}", path.display())))
            })?;

        Ok(ProjectLog {
            file: Some(file),
            path: Some(path),
        })
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        ProjectLog::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn section(&mut self, title: &str) {
        self.write_bytes(format!("\n==> {}\n", title).as_bytes());
    }

    pub fn note(&mut self, line: &str) {
        self.write_bytes(format!("{}\n", line).as_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(bytes);
        }
    }

    /// Run a command with its output appended to the log. Returns the exit
    /// code; a command that could not start reports `-1`.
    pub fn exec<S: AsRef<OsStr>>(
        &mut self,
        dir: &Path,
        program: &str,
        args: &[S],
        input: Option<&[u8]>,
    ) -> i32 {
        let rendered: Vec<String> = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();
        self.section(&format!("{} {}", program, rendered.join(" ")));

        match command::run_status(dir, program, args, input, self.file.as_ref()) {
            Ok(code) => {
                if code != 0 {
                    self.note(&format!("exit status {}", code));
                }
                code
            }
            Err(e) => {
                self.note(&format!("{}: {}", e.message, e.details));
                -1
            }
        }
    }

    pub fn sink(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exec_appends_output_and_status() {
        let dir = TempDir::new().unwrap();
        let mut log = ProjectLog::create(dir.path()).unwrap();

        assert_eq!(log.exec(dir.path(), "sh", &["-c", "echo built; exit 2"], None), 2);
        assert_eq!(log.exec(dir.path(), "nonexistent_command_xyz", &["x"], None), -1);

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("==> sh -c echo built; exit 2"));
        assert!(content.contains("built"));
        assert!(content.contains("exit status 2"));
        assert!(content.contains("nonexistent_command_xyz"));
    }

    #[test]
    fn create_truncates_previous_run() {
        let dir = TempDir::new().unwrap();
        std::fs::write(paths::project_log(dir.path()), "old run").unwrap();

        let log = ProjectLog::create(dir.path()).unwrap();
        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn disabled_log_still_runs_commands() {
        let mut log = ProjectLog::disabled();
        assert_eq!(log.exec(Path::new("/tmp"), "true", &[] as &[&str], None), 0);
        assert!(log.path().is_none());
    }
}
