use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{pending, plan, run};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "droidship")]
#[command(version = VERSION)]
#[command(about = "Sync, build, sign and deploy a directory of Android projects")]
struct Cli {
    /// Directory holding the projects (default: current directory)
    #[arg(short = 'C', long, global = true, value_name = "DIR")]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the release pipeline over every project
    Run(run::RunArgs),
    /// Resolve and validate the configuration without running anything
    Plan(plan::PlanCmdArgs),
    /// Show the work left for a --retry run
    Pending(pending::PendingArgs),
}

fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if !e.use_stderr() {
                e.exit();
            }
            let err = droidship::Error::validation_invalid_argument(
                "command_line",
                e.to_string(),
                None,
                None,
            );
            let _ = output::print_result::<serde_json::Value>(Err(err));
            return std::process::ExitCode::from(2);
        }
    };

    let global = GlobalArgs {
        workdir: cli.workdir,
    };

    tty::status("droidship is working...");
    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    let _ = output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
