use clap::Args;

use droidship::build::Gradle;
use droidship::deploy::Adb;
use droidship::deps;
use droidship::fetch::MarkerDetector;
use droidship::keystore::Keytool;
use droidship::paths;
use droidship::pipeline::{self, Orchestrator, RunReport, Toolchain};
use droidship::sign::ApkSigner;

use super::{CmdResult, GlobalArgs, PlanArgs};
use crate::tty::TtyPrompt;

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Do not look for required tools on PATH before starting
    #[arg(long)]
    pub skip_deps_check: bool,
}

/// Sync, build, sign and deploy every selected project, then write the
/// retry state.
///
/// Stage failures are part of the report and the retry state, not errors:
/// the exit code is 0 once the run got past setup.
pub(crate) fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<RunReport> {
    let workdir = global.workdir()?;
    let mut plan = args.plan.load(&workdir)?;

    let projects = pipeline::discover_projects(&workdir)?;
    let configs = plan.prepare(&projects, &workdir)?;

    if !args.skip_deps_check {
        deps::check(&deps::required_tools(&plan, &configs, &workdir))?;
    }

    plan.keystores.unlock(&mut TtyPrompt, &Keytool)?;

    let tools = Toolchain {
        fetch: &MarkerDetector,
        build: &Gradle,
        signer: &ApkSigner,
        transport: &Adb,
    };
    let outcome = Orchestrator::new(&workdir, &plan, tools).run(&configs);

    let ledger_path = paths::ledger_file(&workdir);
    outcome.ledger.save(&ledger_path)?;
    if outcome.ledger.is_clean() {
        droidship::log_status!("run", "Nothing left to retry");
    } else {
        droidship::log_status!(
            "run",
            "{} project(s) have pending work, resume with --retry",
            outcome.ledger.projects.len()
        );
    }

    Ok((outcome.report, 0))
}
