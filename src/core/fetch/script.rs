use std::path::{Path, PathBuf};

use super::{FetchAdapter, AGE_UNKNOWN};
use crate::defaults;
use crate::logs::ProjectLog;
use crate::utils::command;

/// Project-provided sync script.
///
/// Invoked as `droidship-sync <verb> [arg]` with the verbs `lastdate`,
/// `fetch`, `changes [--tags]`, `merge [token]`, `diff` and `restore`
/// (patch on stdin). `changes` exits 0 when there is something new and may
/// print a checkout token.
pub struct SyncScript {
    dir: PathBuf,
    program: String,
}

impl SyncScript {
    pub fn new(dir: &Path) -> Self {
        SyncScript {
            dir: dir.to_path_buf(),
            program: dir.join(defaults::SYNC_SCRIPT).to_string_lossy().into_owned(),
        }
    }

    pub fn present(dir: &Path) -> bool {
        is_executable(&dir.join(defaults::SYNC_SCRIPT))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

impl FetchAdapter for SyncScript {
    fn kind(&self) -> &'static str {
        "script"
    }

    fn last_update_label(&self) -> String {
        command::run_in_optional(&self.dir, &self.program, &["lastdate"])
            .unwrap_or_else(|| AGE_UNKNOWN.to_string())
    }

    fn fetch(&self, log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, &self.program, &["fetch"], None) == 0
    }

    fn has_remote_changes(
        &self,
        follow_tags: bool,
        log: &mut ProjectLog,
    ) -> Option<(bool, Option<String>)> {
        let mut args = vec!["changes"];
        if follow_tags {
            args.push("--tags");
        }

        match command::capture_in(&self.dir, &self.program, &args) {
            Ok(out) => {
                let token = Some(out.stdout_text()).filter(|t| !t.is_empty());
                Some((out.success(), token))
            }
            Err(e) => {
                log.note(&e.to_string());
                None
            }
        }
    }

    fn merge_or_checkout(&self, token: Option<&str>, log: &mut ProjectLog) -> bool {
        let mut args = vec!["merge"];
        args.extend(token);
        log.exec(&self.dir, &self.program, &args, None) == 0
    }

    fn local_diff(&self) -> Vec<u8> {
        command::capture_in(&self.dir, &self.program, &["diff"])
            .ok()
            .filter(|out| out.success())
            .map(|out| out.stdout)
            .unwrap_or_default()
    }

    fn restore_diff(&self, diff: &[u8], log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, &self.program, &["restore"], Some(diff)) == 0
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn install(dir: &Path, body: &str) {
        let path = dir.join(defaults::SYNC_SCRIPT);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn changes_verb_reports_token() {
        let dir = TempDir::new().unwrap();
        install(
            dir.path(),
            r#"case "$1" in
  changes) [ "$2" = "--tags" ] && echo v3.1; exit 0 ;;
  lastdate) echo "3 hours ago" ;;
  *) exit 1 ;;
esac"#,
        );

        let script = SyncScript::new(dir.path());
        let mut log = ProjectLog::disabled();
        assert_eq!(
            script.has_remote_changes(true, &mut log),
            Some((true, Some("v3.1".to_string())))
        );
        assert_eq!(script.has_remote_changes(false, &mut log), Some((true, None)));
        assert_eq!(script.last_update_label(), "3 hours ago");
        assert!(!script.fetch(&mut log));
    }

    #[test]
    fn restore_receives_patch_on_stdin() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), r#"[ "$1" = "restore" ] && cat > restored.patch"#);

        let script = SyncScript::new(dir.path());
        assert!(script.restore_diff(b"patch body", &mut ProjectLog::disabled()));
        assert_eq!(
            std::fs::read(dir.path().join("restored.patch")).unwrap(),
            b"patch body"
        );
    }

    #[test]
    fn non_executable_script_is_not_a_marker() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(defaults::SYNC_SCRIPT), "#!/bin/sh\n").unwrap();
        assert!(!SyncScript::present(dir.path()));
    }
}
