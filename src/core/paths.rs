use std::path::{Path, PathBuf};

use crate::defaults;

/// Shared release directory for a workdir.
pub fn releases(workdir: &Path) -> PathBuf {
    workdir.join(defaults::RELEASES_DIR)
}

/// Default configuration file for a workdir.
pub fn config_file(workdir: &Path) -> PathBuf {
    workdir.join(defaults::CONFIG_FILE)
}

/// Retry state file for a workdir.
pub fn ledger_file(workdir: &Path) -> PathBuf {
    workdir.join(defaults::LEDGER_FILE)
}

/// Per-project log file.
pub fn project_log(project_dir: &Path) -> PathBuf {
    project_dir.join(defaults::PROJECT_LOG_FILE)
}

/// Expand `~` and make a path absolute relative to `base`.
pub fn expand(raw: &Path, base: &Path) -> PathBuf {
    let text = raw.to_string_lossy();
    let expanded = PathBuf::from(shellexpand::tilde(&text).into_owned());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}
