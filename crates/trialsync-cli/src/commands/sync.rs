use crate::commands::common::{format_report_lines, CommandContext};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, context: &CommandContext) -> Result<(), CliError> {
    let remote = context.remote_store()?;
    let engine = context.open_engine(remote).await?;
    let report = engine.sync_pending().await?;
    engine.cleanup();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_report_lines(&report) {
            println!("{line}");
        }
    }

    if report.failed > 0 {
        return Err(CliError::SyncIncomplete {
            failed: report.failed,
        });
    }
    Ok(())
}
