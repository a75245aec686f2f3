mod bootstrap;
mod bus_listener;
mod channels;
mod cli;
mod commands;
mod config;
mod heal;
mod ingress;
mod probe;
mod process_session;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::{init_tracing, run_gateway};
use crate::cli::{Cli, CliCommand};
use crate::commands::{run_replay_preview, run_status_command};
use crate::config::GatewayConfig;

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Some(CliCommand::Status { json }) => {
            run_status_command(&cli.state_dir, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(CliCommand::ReplayPreview { json }) => {
            run_replay_preview(&cli.state_dir, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some(CliCommand::Run) | None => {
            let config = GatewayConfig::from_cli(&cli)?;
            let exit = run_gateway(config).await?;
            Ok(exit.exit_code())
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}
