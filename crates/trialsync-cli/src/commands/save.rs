use std::path::PathBuf;

use crate::cli::PriorityArg;
use crate::commands::common::{build_document, read_document_file, CommandContext};
use crate::error::CliError;

pub struct SaveArgs {
    pub id: String,
    pub entity_type: String,
    pub priority: PriorityArg,
    pub file: Option<PathBuf>,
    pub assignments: Vec<String>,
}

pub async fn run_save(args: SaveArgs, context: &CommandContext) -> Result<(), CliError> {
    let engine = context.open_local_engine().await?;

    let new_data = if let Some(path) = &args.file {
        read_document_file(path)?
    } else {
        let store = engine.store();
        let id = store
            .resolved_id(&args.id)
            .await?
            .unwrap_or_else(|| args.id.clone());
        let stored = store
            .get(&args.entity_type, &id)
            .await?
            .map(|record| record.data);
        build_document(stored, &args.assignments)?
    };

    let receipt = engine
        .save(
            &args.id,
            &args.entity_type,
            new_data,
            None,
            args.priority.into(),
        )
        .await?;
    engine.cleanup();

    match receipt {
        Some(receipt) => println!(
            "Queued {}:{} v{} [{}] {}",
            receipt.entity_type,
            receipt.entity_id,
            receipt.version,
            receipt.priority,
            receipt.changed_fields.join(", ")
        ),
        None => println!("No changes to save."),
    }
    Ok(())
}
