use trialsync_core::QueuedChange;

use crate::commands::common::{format_queue_lines, CommandContext};
use crate::error::CliError;

pub async fn run_queue(as_json: bool, context: &CommandContext) -> Result<(), CliError> {
    let engine = context.open_local_engine().await?;
    let changes: Vec<QueuedChange> = engine.pending_changes();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("No queued changes.");
        return Ok(());
    }

    for line in format_queue_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}
