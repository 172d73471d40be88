use trialsync_core::IdGenerator;

use crate::commands::common::CommandContext;
use crate::error::CliError;

const DEFAULT_PREFIX: &str = "patient";

pub async fn run_new_id(prefix: Option<&str>, context: &CommandContext) -> Result<(), CliError> {
    let store = context.open_store().await?;
    let ids = IdGenerator::new(store.device_id().await?);
    println!("{}", ids.new_id(prefix.unwrap_or(DEFAULT_PREFIX))?);
    Ok(())
}
