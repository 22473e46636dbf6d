use std::process::ExitCode;

use clap::Parser;
use pr_telemetry_cli::{error_envelope, init_logging, run_cli, Cli};
use serde_json::Value;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_format()) {
        eprintln!("{err:#}");
    }

    match run_cli(cli) {
        Ok(output) => print_json(&output),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            print_json(&error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}

fn print_json(value: &Value) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("failed to encode output: {err}");
            ExitCode::FAILURE
        }
    }
}
