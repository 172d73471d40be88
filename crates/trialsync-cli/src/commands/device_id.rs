use crate::commands::common::CommandContext;
use crate::error::CliError;

pub async fn run_device_id(context: &CommandContext) -> Result<(), CliError> {
    let store = context.open_store().await?;
    println!("{}", store.device_id().await?);
    Ok(())
}
