use crate::commands::common::CommandContext;
use crate::error::CliError;

pub async fn run_show(id: &str, entity_type: &str, context: &CommandContext) -> Result<(), CliError> {
    let store = context.open_store().await?;
    let id = store
        .resolved_id(id)
        .await?
        .unwrap_or_else(|| id.to_string());
    let record = store
        .get(entity_type, &id)
        .await?
        .ok_or_else(|| CliError::EntityNotFound {
            entity_type: entity_type.to_string(),
            id: id.clone(),
        })?;

    println!("{}", serde_json::to_string_pretty(&record.to_document())?);
    Ok(())
}
