//! trialsync CLI - operator tooling for a device's offline store
//!
//! Inspect and edit the local queue, push pending changes to the remote
//! document store and review the conflict audit log.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::CommandContext;
use crate::commands::completions::run_completions;
use crate::commands::conflicts::run_conflicts;
use crate::commands::device_id::run_device_id;
use crate::commands::new_id::run_new_id;
use crate::commands::queue::run_queue;
use crate::commands::save::{run_save, SaveArgs};
use crate::commands::show::run_show;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("trialsync=warn,trialsync_core=warn")
            }),
        )
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let context = CommandContext::load(
        cli.config.as_deref(),
        cli.db_path.clone(),
        cli.remote_url.clone(),
    )?;

    match cli.command {
        Commands::NewId { prefix } => run_new_id(prefix.as_deref(), &context).await?,
        Commands::DeviceId => run_device_id(&context).await?,
        Commands::Save {
            id,
            entity_type,
            priority,
            file,
            set,
        } => {
            run_save(
                SaveArgs {
                    id,
                    entity_type,
                    priority,
                    file,
                    assignments: set,
                },
                &context,
            )
            .await?;
        }
        Commands::Show { id, entity_type } => run_show(&id, &entity_type, &context).await?,
        Commands::Queue { json } => run_queue(json, &context).await?,
        Commands::Sync { json } => run_sync(json, &context).await?,
        Commands::Conflicts { limit, json } => run_conflicts(limit, json, &context).await?,
        Commands::Status => run_status(&context).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
