//! Version-control synchronization behind one capability surface.
//!
//! A project is matched to an adapter by marker detection (custom script,
//! then `.git`, then `.hg`). Projects with no marker are skipped, which is
//! not a failure.

mod git;
mod mercurial;
mod script;

pub use git::Git;
pub use mercurial::Mercurial;
pub use script::SyncScript;

use std::path::Path;

use serde::Serialize;

use crate::logs::ProjectLog;

pub const AGE_UNKNOWN: &str = "age unknown";

pub trait FetchAdapter {
    /// Short backend name for reports.
    fn kind(&self) -> &'static str;

    /// Human readable age of the last local update.
    fn last_update_label(&self) -> String;

    fn fetch(&self, log: &mut ProjectLog) -> bool;

    /// Whether fetched upstream state differs from the working copy.
    ///
    /// With `follow_tags` the token names the newest tag to check out.
    /// `None` when the backend could not tell.
    fn has_remote_changes(&self, follow_tags: bool, log: &mut ProjectLog)
        -> Option<(bool, Option<String>)>;

    /// Discard local modifications, then merge upstream or check out `token`.
    fn merge_or_checkout(&self, token: Option<&str>, log: &mut ProjectLog) -> bool;

    /// Uncommitted local modifications as a patch.
    fn local_diff(&self) -> Vec<u8>;

    fn restore_diff(&self, diff: &[u8], log: &mut ProjectLog) -> bool;
}

pub trait FetchDetector {
    fn detect(&self, project_dir: &Path) -> Option<Box<dyn FetchAdapter>>;
}

/// Detects the backend from files present in the project directory.
pub struct MarkerDetector;

impl FetchDetector for MarkerDetector {
    fn detect(&self, project_dir: &Path) -> Option<Box<dyn FetchAdapter>> {
        if SyncScript::present(project_dir) {
            return Some(Box::new(SyncScript::new(project_dir)));
        }
        if project_dir.join(".git").exists() {
            return Some(Box::new(Git::new(project_dir)));
        }
        if project_dir.join(".hg").exists() {
            return Some(Box::new(Mercurial::new(project_dir)));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped,
    Unchanged,
    Updated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    NotNeeded,
    Restored,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub restore: RestoreOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SyncReport {
    fn of(outcome: SyncOutcome) -> Self {
        SyncReport {
            outcome,
            restore: RestoreOutcome::NotNeeded,
            token: None,
        }
    }
}

/// Run one sync cycle.
///
/// Local changes are captured before the merge and re-applied only after a
/// successful merge, and only when there were any.
pub fn sync(
    adapter: Option<&dyn FetchAdapter>,
    preserve: bool,
    follow_tags: bool,
    log: &mut ProjectLog,
) -> SyncReport {
    let Some(adapter) = adapter else {
        return SyncReport::of(SyncOutcome::Skipped);
    };

    let diff = if preserve {
        adapter.local_diff()
    } else {
        Vec::new()
    };

    if !adapter.fetch(log) {
        return SyncReport::of(SyncOutcome::Failed);
    }

    let Some((changed, token)) = adapter.has_remote_changes(follow_tags, log) else {
        log.note("could not compare with upstream");
        return SyncReport::of(SyncOutcome::Failed);
    };
    if !changed {
        return SyncReport::of(SyncOutcome::Unchanged);
    }

    if !adapter.merge_or_checkout(token.as_deref(), log) {
        if !diff.is_empty() {
            log.section("local changes discarded by the failed merge");
            log.write_bytes(&diff);
        }
        return SyncReport {
            token,
            ..SyncReport::of(SyncOutcome::Failed)
        };
    }

    let restore = if diff.is_empty() {
        RestoreOutcome::NotNeeded
    } else if adapter.restore_diff(&diff, log) {
        RestoreOutcome::Restored
    } else {
        RestoreOutcome::Failed
    };

    SyncReport {
        outcome: SyncOutcome::Updated,
        restore,
        token,
    }
}
