use serde::Serialize;
use std::path::Path;

use crate::config::TaskDecl;
use crate::defaults;
use crate::logs::ProjectLog;
use crate::resolve::EffectiveConfig;

// === Build tool ===

pub trait BuildTool {
    /// Prepare the build root. Runs before any task.
    fn setup(&self, root: &Path, log: &mut ProjectLog) -> bool;

    /// Run one named task and report its exit code.
    fn run_task(&self, root: &Path, task: &str, log: &mut ProjectLog) -> i32;
}

/// Gradle, preferring the project's wrapper when present.
pub struct Gradle;

impl Gradle {
    pub fn wrapper(root: &Path) -> Option<std::path::PathBuf> {
        let name = if cfg!(windows) { "gradlew.bat" } else { "gradlew" };
        let path = root.join(name);
        path.is_file().then_some(path)
    }
}

impl BuildTool for Gradle {
    fn setup(&self, root: &Path, log: &mut ProjectLog) -> bool {
        let script = root.join(defaults::ENTRYPOINT_SCRIPT);
        if !script.is_file() {
            return true;
        }
        log_status!("build", "Running {}", defaults::ENTRYPOINT_SCRIPT);
        log.exec(root, &script.to_string_lossy(), &[] as &[&str], None) == 0
    }

    fn run_task(&self, root: &Path, task: &str, log: &mut ProjectLog) -> i32 {
        let program = Gradle::wrapper(root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gradle".to_string());
        log.exec(root, &program, &["--no-daemon", task], None)
    }
}

// === Task loop ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    SetupFailed,
    TaskFailed { task: String, code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    /// Tasks to run again: the failed one and every later one that builds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<TaskDecl>,
}

impl BuildReport {
    pub fn failed(&self) -> bool {
        self.outcome != BuildOutcome::Succeeded
    }
}

/// Run tasks strictly in order, stopping at the first failure.
///
/// `after_task` is called after every successful task so the caller can
/// pick up that task's outputs.
pub fn run_tasks<F>(
    tool: &dyn BuildTool,
    root: &Path,
    tasks: &[EffectiveConfig],
    log: &mut ProjectLog,
    mut after_task: F,
) -> BuildReport
where
    F: FnMut(&EffectiveConfig),
{
    let mut report = BuildReport {
        outcome: BuildOutcome::Succeeded,
        completed: Vec::new(),
        skipped: Vec::new(),
        retry: Vec::new(),
    };

    if !tool.setup(root, log) {
        report.outcome = BuildOutcome::SetupFailed;
        report.retry = pinned(tasks);
        return report;
    }

    for (index, task) in tasks.iter().enumerate() {
        let Some(spec) = &task.task else {
            continue;
        };

        if !task.build {
            report.skipped.push(spec.name.clone());
            continue;
        }

        log_status!("build", "{}: {}", task.project, spec.exec);
        let code = tool.run_task(root, &spec.exec, log);
        if code != 0 {
            log_status!("build", "{}: {} failed ({})", task.project, spec.name, code);
            report.outcome = BuildOutcome::TaskFailed {
                task: spec.name.clone(),
                code,
            };
            report.retry = pinned(&tasks[index..]);
            return report;
        }

        report.completed.push(spec.name.clone());
        after_task(task);
    }

    report
}

fn pinned(tasks: &[EffectiveConfig]) -> Vec<TaskDecl> {
    tasks
        .iter()
        .filter(|t| t.build)
        .filter_map(EffectiveConfig::to_task_decl)
        .collect()
}
