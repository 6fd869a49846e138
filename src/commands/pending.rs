use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use droidship::ledger::Ledger;
use droidship::paths;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct PendingArgs {}

#[derive(Serialize)]
pub struct PendingOutput {
    pub path: PathBuf,
    pub projects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<Ledger>,
}

/// Show what a `--retry` run would pick up.
pub(crate) fn run(_args: PendingArgs, global: &GlobalArgs) -> CmdResult<PendingOutput> {
    let workdir = global.workdir()?;
    let path = paths::ledger_file(&workdir);

    if !path.is_file() {
        return Ok((
            PendingOutput {
                path,
                projects: Vec::new(),
                ledger: None,
            },
            0,
        ));
    }

    let ledger = Ledger::load(&path)?;
    Ok((
        PendingOutput {
            path,
            projects: ledger.projects.keys().cloned().collect(),
            ledger: Some(ledger),
        },
        0,
    ))
}
