use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use droidship::deps;
use droidship::pipeline;
use droidship::resolve::ProjectConfig;

use super::{CmdResult, GlobalArgs, PlanArgs};

#[derive(Args)]
pub struct PlanCmdArgs {
    #[command(flatten)]
    pub plan: PlanArgs,
}

#[derive(Serialize)]
pub struct PlanOutput {
    pub workdir: PathBuf,
    pub retry: bool,
    pub projects: Vec<ProjectConfig>,
    /// Projects in the workdir the plan does not touch.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    pub keys: Vec<String>,
    pub tools: BTreeSet<&'static str>,
}

/// Resolve and validate without running anything or asking for passwords.
pub(crate) fn run(args: PlanCmdArgs, global: &GlobalArgs) -> CmdResult<PlanOutput> {
    let workdir = global.workdir()?;
    let mut plan = args.plan.load(&workdir)?;

    let projects = pipeline::discover_projects(&workdir)?;
    let configs = plan.prepare(&projects, &workdir)?;
    let skipped = projects
        .into_iter()
        .filter(|name| !configs.iter().any(|c| &c.name == name))
        .collect();
    let tools = deps::required_tools(&plan, &configs, &workdir);

    Ok((
        PlanOutput {
            workdir,
            retry: plan.retry,
            keys: plan.keystores.used_pairs(),
            projects: configs,
            skipped,
            tools,
        },
        0,
    ))
}
