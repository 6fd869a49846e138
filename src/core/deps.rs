//! External tools a run needs on `PATH`.

use std::collections::BTreeSet;
use std::path::Path;

use crate::build::Gradle;
use crate::config::RunPlan;
use crate::error::{Error, Result};
use crate::fetch::SyncScript;
use crate::resolve::ProjectConfig;
use crate::utils::command;

/// Tools the plan will invoke, given the resolved projects.
///
/// Call after `RunPlan::prepare` so keystores carry their `used` flags.
pub fn required_tools(plan: &RunPlan, configs: &[ProjectConfig], workdir: &Path) -> BTreeSet<&'static str> {
    let mut tools = BTreeSet::new();

    let carried_signing = plan.projects.values().any(|s| !s.resign.is_empty());
    if plan.keystores.any_used() || carried_signing {
        tools.insert("keytool");
        tools.insert("apksigner");
    }

    let carried_deploys = plan.projects.values().any(|s| !s.deploylist.is_empty());
    let deploys = configs.iter().any(|c| {
        c.build_tasks()
            .any(|t| !plan.devices.targets(&t.deploy_groups).is_empty())
    });
    if deploys || carried_deploys {
        tools.insert("adb");
    }

    for config in configs {
        let project_dir = workdir.join(&config.name);

        if config.project.sync && !SyncScript::present(&project_dir) {
            if project_dir.join(".git").exists() {
                tools.insert("git");
            } else if project_dir.join(".hg").exists() {
                tools.insert("hg");
            }
        }

        if config.builds_anything() && Gradle::wrapper(&config.build_root(&project_dir)).is_none() {
            tools.insert("gradle");
        }
    }

    tools
}

/// Fail with every tool that is not on `PATH`.
pub fn check(tools: &BTreeSet<&'static str>) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|tool| command::find_on_path(tool).is_none())
        .map(|tool| tool.to_string())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(Error::dependency_missing(missing)
        .with_hint("Install the missing tools, or pass --skip-deps-check to run anyway"))
}
