mod cli;
mod commands;
mod jobs;
mod model;
mod pipeline;
mod semantic;
mod settings;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::jobs::ControlAction;

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings_path = cli.settings.as_deref();
    let service = commands::job_service(&cli.root, settings_path)?;

    match cli.command {
        Commands::Start(args) => commands::start::run(&service, settings_path, args),
        Commands::Work(args) => commands::work::run(&service, args),
        Commands::Pause(args) => commands::control::run(&service, ControlAction::Pause, args),
        Commands::Resume(args) => commands::control::run(&service, ControlAction::Resume, args),
        Commands::Cancel(args) => commands::control::run(&service, ControlAction::Cancel, args),
        Commands::Status(args) => commands::status::status(&service, args),
        Commands::Result(args) => commands::status::result(&service, args),
        Commands::Jobs(args) => commands::status::jobs(&service, args),
        Commands::Batch(args) => commands::batch::run(&service, args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
