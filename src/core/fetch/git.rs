use std::path::{Path, PathBuf};

use super::{FetchAdapter, AGE_UNKNOWN};
use crate::logs::ProjectLog;
use crate::utils::command;

pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: &Path) -> Self {
        Git {
            dir: dir.to_path_buf(),
        }
    }

    fn query(&self, args: &[&str]) -> Option<String> {
        command::run_in_optional(&self.dir, "git", args)
    }

    fn newest_tag(&self) -> Option<String> {
        self.query(&["tag", "--sort=-creatordate"])
            .and_then(|out| out.lines().next().map(str::to_string))
    }
}

impl FetchAdapter for Git {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn last_update_label(&self) -> String {
        self.query(&["log", "-n", "1", "--format=%cr"])
            .unwrap_or_else(|| AGE_UNKNOWN.to_string())
    }

    fn fetch(&self, log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "git", &["fetch", "--tags"], None) == 0
    }

    fn has_remote_changes(
        &self,
        follow_tags: bool,
        log: &mut ProjectLog,
    ) -> Option<(bool, Option<String>)> {
        if follow_tags {
            let Some(newest) = self.newest_tag() else {
                log.note("no tags found");
                return Some((false, None));
            };
            let at_head = self.query(&["tag", "--points-at", "HEAD"]).unwrap_or_default();
            let current = at_head.lines().any(|t| t == newest);
            return Some((!current, Some(newest)));
        }

        // Fails on a detached HEAD or a branch without upstream.
        let Some(behind) = self
            .query(&["rev-list", "--count", "HEAD..@{upstream}"])
            .and_then(|count| count.parse::<u64>().ok())
        else {
            log.note("no upstream to compare with (detached HEAD or untracked branch)");
            return None;
        };
        log.note(&format!("{} upstream commit(s)", behind));
        Some((behind > 0, None))
    }

    fn merge_or_checkout(&self, token: Option<&str>, log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "git", &["checkout", "."], None);
        match token {
            Some(tag) => log.exec(&self.dir, "git", &["checkout", tag], None) == 0,
            None => log.exec(&self.dir, "git", &["merge"], None) == 0,
        }
    }

    fn local_diff(&self) -> Vec<u8> {
        command::capture_in(&self.dir, "git", &["diff"])
            .map(|out| out.stdout)
            .unwrap_or_default()
    }

    fn restore_diff(&self, diff: &[u8], log: &mut ProjectLog) -> bool {
        log.exec(&self.dir, "git", &["apply"], Some(diff)) == 0
    }
}
