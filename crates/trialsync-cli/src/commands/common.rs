use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use trialsync_core::models::ConflictRecord;
use trialsync_core::paths::set_path;
use trialsync_core::util::normalize_text_option;
use trialsync_core::{
    EngineConfig, HttpRemoteStore, LocalStore, MemoryRemoteStore, QueuedChange, RemoteStore,
    SyncEngine, SyncReport,
};

use crate::error::CliError;

/// Resolved configuration shared by every subcommand.
#[derive(Clone)]
pub struct CommandContext {
    pub config: EngineConfig,
    pub db_path: PathBuf,
}

impl CommandContext {
    /// Merge the config file, environment and command-line flags, in that
    /// order of increasing precedence.
    pub fn load(
        config_path: Option<&Path>,
        cli_db_path: Option<PathBuf>,
        cli_remote_url: Option<String>,
    ) -> Result<Self, CliError> {
        let mut config = EngineConfig::load(config_path)?;
        if let Some(url) = normalize_text_option(cli_remote_url) {
            config.remote_url = Some(url);
        }
        config.validate()?;
        let db_path = resolve_db_path(cli_db_path, config.device_db.clone())?;
        Ok(Self { config, db_path })
    }

    pub async fn open_store(&self) -> Result<LocalStore, CliError> {
        Ok(LocalStore::open_path(&self.db_path).await?)
    }

    pub fn remote_store(&self) -> Result<Arc<dyn RemoteStore>, CliError> {
        let Some(url) = self.config.remote_url.as_deref() else {
            return Err(CliError::RemoteNotConfigured);
        };
        let mut remote =
            HttpRemoteStore::new(url, Duration::from_millis(self.config.remote_timeout_ms))?;
        if let Some(token) = &self.config.remote_token {
            remote = remote.with_token(token.clone());
        }
        Ok(Arc::new(remote))
    }

    pub async fn open_engine(&self, remote: Arc<dyn RemoteStore>) -> Result<SyncEngine, CliError> {
        let store = self.open_store().await?;
        Ok(SyncEngine::new(store, remote, self.config.clone()).await?)
    }

    /// Engine for local-only commands. Saving never reaches the remote store,
    /// so a detached in-process remote stands in when none is configured.
    pub async fn open_local_engine(&self) -> Result<SyncEngine, CliError> {
        let remote: Arc<dyn RemoteStore> = if self.config.remote_url.is_some() {
            self.remote_store()?
        } else {
            MemoryRemoteStore::shared()
        };
        self.open_engine(remote).await
    }
}

pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    configured: Option<PathBuf>,
) -> Result<PathBuf, CliError> {
    match cli_db_path.or(configured) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("trialsync").join("device.db"))
        .ok_or(CliError::NoDataDir)
}

/// Parse `path=json`. Values that are not valid JSON are taken as strings.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let Some((path, value)) = raw.split_once('=') else {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    };
    let path = path.trim();
    if path.is_empty() {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((path.to_string(), value))
}

/// Apply `assignments` on top of `base`.
pub fn build_document(base: Option<Value>, assignments: &[String]) -> Result<Value, CliError> {
    let mut document = match base {
        Some(Value::Object(map)) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    for raw in assignments {
        let (path, value) = parse_assignment(raw)?;
        set_path(&mut document, &path, value)?;
    }
    Ok(document)
}

pub fn read_document_file(path: &Path) -> Result<Value, CliError> {
    let document: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    if document.is_object() {
        Ok(document)
    } else {
        Err(CliError::NotAnObject)
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_queue_lines(changes: &[QueuedChange]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    changes
        .iter()
        .map(|change| {
            let age = format_relative_time(change.enqueued_at, now_ms);
            let line = format!(
                "{:<8}  {}:{}  v{}  fields={}  {age}",
                change.priority.as_str(),
                change.form_type,
                change.form_id,
                change.version,
                change.delta.len()
            );
            match &change.last_error {
                Some(error) => format!("{line}  retries={}  last_error={error}", change.retries),
                None => line,
            }
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<20}  {}:{}  local=v{} server=v{}  {}",
                format_timestamp(conflict.resolved_at),
                conflict.kind.as_str(),
                conflict.table,
                conflict.entity_id,
                conflict.local_version,
                conflict.server_version,
                conflict.resolution
            )
        })
        .collect()
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    if report.skipped {
        return vec!["Sync already in progress".to_string()];
    }

    let mut lines = vec![format!(
        "Synced {}, failed {}, rejected {} in {} ms",
        report.synced, report.failed, report.rejected, report.duration_ms
    )];
    for (temporary, permanent) in &report.id_map {
        lines.push(format!("  id {temporary} -> {permanent}"));
    }
    for conflict in &report.conflicts {
        lines.push(format!(
            "  conflict {}:{} ({}, {})",
            conflict.table, conflict.entity_id, conflict.kind, conflict.resolution
        ));
    }
    for failure in &report.failures {
        lines.push(format!(
            "  failed {}:{}: {}",
            failure.entity_type, failure.entity_id, failure.error
        ));
    }
    lines
}
