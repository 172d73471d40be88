use crate::commands::common::{format_conflict_lines, CommandContext};
use crate::error::CliError;

pub async fn run_conflicts(
    limit: usize,
    as_json: bool,
    context: &CommandContext,
) -> Result<(), CliError> {
    let store = context.open_store().await?;
    let conflicts = store.recent_conflicts(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
