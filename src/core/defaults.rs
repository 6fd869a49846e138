//! Built-in defaults and well-known names.

use std::time::Duration;

use crate::config::{ConfigLayer, TaskDecl};

/// Directory (inside the workdir) that receives every released artifact.
pub const RELEASES_DIR: &str = "DROIDSHIP-RELEASES";

/// Optional configuration file, looked up in the workdir.
pub const CONFIG_FILE: &str = "droidship.toml";

/// Retry state written at the end of every run.
pub const LEDGER_FILE: &str = ".droidship-last.json";

/// Per-project log of child process output, truncated each run.
pub const PROJECT_LOG_FILE: &str = "droidship.log";

/// Executable marker for projects synced by a custom script.
pub const SYNC_SCRIPT: &str = "droidship-sync";

/// Optional script run in the build root before any task.
pub const ENTRYPOINT_SCRIPT: &str = "droidship-entrypoint";

/// Only build outputs below this path segment are release candidates.
pub const APK_OUTPUT_SEGMENT: &str = "build/outputs/apk/";

/// Upper bound on waiting for a device to become reachable.
pub const DEVICE_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_TASK_NAME: &str = "release";
pub const DEFAULT_TASK_EXEC: &str = "assembleRelease";

/// Bottom of every resolution chain. Every field is present.
pub fn builtin_layer() -> ConfigLayer {
    ConfigLayer {
        sync: Some(false),
        preserve: Some(false),
        build: Some(false),
        force: Some(false),
        follow_tags: Some(false),
        subdir: None,
        tasks: Some(default_tasks()),
        keystore: None,
        keyalias: None,
        deploy: Some(Default::default()),
    }
}

pub fn default_tasks() -> Vec<TaskDecl> {
    vec![TaskDecl {
        exec: Some(DEFAULT_TASK_EXEC.to_string()),
        ..TaskDecl::named(DEFAULT_TASK_NAME)
    }]
}

/// Global default baked into the retry state.
///
/// Everything is disabled so that only the keys a ledger entry carries
/// cause work on the next `--retry`.
pub fn retry_layer() -> ConfigLayer {
    ConfigLayer {
        tasks: Some(Vec::new()),
        ..builtin_layer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_layer_is_fully_populated() {
        let layer = builtin_layer();
        assert_eq!(layer.sync, Some(false));
        assert_eq!(layer.build, Some(false));
        assert_eq!(layer.tasks.as_ref().map(Vec::len), Some(1));
        assert_eq!(layer.tasks.unwrap()[0].exec(), DEFAULT_TASK_EXEC);
    }

    #[test]
    fn retry_layer_declares_no_tasks() {
        let layer = retry_layer();
        assert_eq!(layer.tasks, Some(Vec::new()));
        assert_eq!(layer.force, Some(false));
    }
}
