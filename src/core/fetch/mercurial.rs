use std::path::{Path, PathBuf};

use super::{FetchAdapter, AGE_UNKNOWN};
use crate::logs::ProjectLog;
use crate::utils::command;

pub struct Mercurial {
    dir: PathBuf,
}

impl Mercurial {
    pub fn new(dir: &Path) -> Self {
        Mercurial {
            dir: dir.to_path_buf(),
        }
    }

    fn query(&self, args: &[&str]) -> Option<String> {
        command::run_in_optional(&self.dir, "hg", args)
    }
}

impl FetchAdapter for Mercurial {
    fn kind(&self) -> &'static str {
        "hg"
    }

    fn last_update_label(&self) -> String {
        self.query(&["log", "-l", "1", "-T", "{date|age}"])
            .unwrap_or_else(|| AGE_UNKNOWN.to_string())
    }

    fn fetch(&self, log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "hg", &["pull"], None) == 0
    }

    fn has_remote_changes(
        &self,
        follow_tags: bool,
        log: &mut ProjectLog,
    ) -> Option<(bool, Option<String>)> {
        if follow_tags {
            // `hg tags` lists newest first and always includes `tip`.
            let newest = self
                .query(&["tags", "-q"])
                .and_then(|out| out.lines().find(|t| *t != "tip").map(str::to_string));
            let Some(newest) = newest else {
                log.note("no tags found");
                return Some((false, None));
            };
            let current = self
                .query(&["log", "-r", ".", "-T", "{tags}"])
                .unwrap_or_default();
            let at_tag = current.split_whitespace().any(|t| t == newest);
            return Some((!at_tag, Some(newest)));
        }

        // Empty output is a valid answer here, so the status decides.
        let Some(incoming) = command::capture_in(
            &self.dir,
            "hg",
            &["log", "-r", "descendants(.) and branch(.) and not .", "-T", "{node}\n"],
        )
        .ok()
        .filter(|out| out.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).lines().count())
        else {
            log.note("could not list upstream changesets");
            return None;
        };
        log.note(&format!("{} upstream changeset(s)", incoming));
        Some((incoming > 0, None))
    }

    fn merge_or_checkout(&self, token: Option<&str>, log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "hg", &["revert", "--all", "--no-backup"], None);
        match token {
            Some(tag) => log.exec(&self.dir, "hg", &["update", "-r", tag], None) == 0,
            None => log.exec(&self.dir, "hg", &["update"], None) == 0,
        }
    }

    fn local_diff(&self) -> Vec<u8> {
        command::capture_in(&self.dir, "hg", &["diff"])
            .map(|out| out.stdout)
            .unwrap_or_default()
    }

    fn restore_diff(&self, diff: &[u8], log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "hg", &["import", "--no-commit", "-"], Some(diff)) == 0
    }
}
