use std::path::{Path, PathBuf};

use clap::Args;

use droidship::config::{parse_flag, BuildOverride, CliOverrides, FileConfig, RunPlan};
use droidship::ledger::Ledger;
use droidship::paths;

pub type CmdResult<T> = droidship::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub workdir: Option<PathBuf>,
}

impl GlobalArgs {
    /// Directory holding the projects, the config file and the retry state.
    pub fn workdir(&self) -> droidship::Result<PathBuf> {
        let dir = match &self.workdir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| {
                droidship::Error::internal_io(e.to_string(), Some("resolve current directory".to_string()))
            })?,
        };

        if !dir.is_dir() {
            return Err(droidship::Error::validation_invalid_argument(
                "workdir",
                format!("'{}' is not a directory", dir.display()),
                None,
                None,
            ));
        }
        Ok(dir)
    }
}

/// Where a run takes its configuration from.
#[derive(Args, Debug, Default)]
pub struct PlanArgs {
    /// Resume from the retry state; config file and overrides are ignored
    #[arg(short, long)]
    pub retry: bool,

    /// Config file (default: droidship.toml in the workdir)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Rebuild this project even without new changes (repeatable)
    #[arg(short, long, value_name = "PROJECT")]
    pub force: Vec<String>,

    /// Pull changes before building (y/n)
    #[arg(long, value_name = "Y|N", value_parser = parse_flag)]
    pub sync: Option<bool>,

    /// Re-apply local changes after pulling (y/n)
    #[arg(long, value_name = "Y|N", value_parser = parse_flag)]
    pub preserve: Option<bool>,

    /// Follow the newest tag instead of the branch head (y/n)
    #[arg(long, value_name = "Y|N", value_parser = parse_flag)]
    pub follow_tags: Option<bool>,

    /// Build switch, or `<keystore-path>,<alias>` to build and sign with that key
    #[arg(long, value_name = "Y|N|KEYSTORE,ALIAS")]
    pub build: Option<BuildOverride>,

    /// Deploy to this device group or serial (repeatable)
    #[arg(long, value_name = "GROUP")]
    pub deploy: Vec<String>,
}

impl PlanArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            force: self.force.clone(),
            sync: self.sync,
            preserve: self.preserve,
            follow_tags: self.follow_tags,
            build: self.build.clone(),
            deploy: self.deploy.clone(),
        }
    }

    fn has_overrides(&self) -> bool {
        self.config.is_some()
            || !self.force.is_empty()
            || self.sync.is_some()
            || self.preserve.is_some()
            || self.follow_tags.is_some()
            || self.build.is_some()
            || !self.deploy.is_empty()
    }

    /// The retry state, or the config file with command-line overrides on top.
    pub fn load(&self, workdir: &Path) -> droidship::Result<RunPlan> {
        if self.retry {
            if self.has_overrides() {
                droidship::log_status!("retry", "Ignoring config and overrides, resuming from the retry state");
            }
            return Ledger::load(&paths::ledger_file(workdir)).map(Ledger::into_plan);
        }

        let (path, required) = match &self.config {
            Some(path) => (paths::expand(path, workdir), true),
            None => (paths::config_file(workdir), false),
        };
        let file = FileConfig::load(&path, required)?;
        Ok(RunPlan::from_config(file, &self.overrides()))
    }
}

pub mod pending;
pub mod plan;
pub mod run;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (droidship::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
        crate::Commands::Pending(args) => dispatch!(args, global, pending),
    }
}
