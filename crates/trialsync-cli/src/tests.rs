use std::path::PathBuf;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::json;
use trialsync_core::models::{ConflictKind, ConflictRecord, FieldChanges, Resolution};
use trialsync_core::{QueuedChange, SyncPriority, SyncReport};

use crate::cli::{Cli, Commands, CompletionShell, PriorityArg};
use crate::commands::common::{
    build_document, format_conflict_lines, format_queue_lines, format_relative_time,
    format_report_lines, format_timestamp, parse_assignment, read_document_file, resolve_db_path,
    CommandContext,
};
use crate::commands::completions::render_completions;
use crate::commands::save::{run_save, SaveArgs};
use crate::error::CliError;

fn context(db_path: PathBuf) -> CommandContext {
    CommandContext {
        config: trialsync_core::EngineConfig::default(),
        db_path,
    }
}

#[test]
fn parse_assignment_reads_json_values() {
    assert_eq!(
        parse_assignment("baseline.hba1c=7.2").unwrap(),
        ("baseline.hba1c".to_string(), json!(7.2))
    );
    assert_eq!(
        parse_assignment("consent={\"signed\": true}").unwrap(),
        ("consent".to_string(), json!({"signed": true}))
    );
}

#[test]
fn parse_assignment_falls_back_to_string() {
    assert_eq!(
        parse_assignment("status=screening").unwrap(),
        ("status".to_string(), json!("screening"))
    );
}

#[test]
fn parse_assignment_rejects_missing_path() {
    assert!(matches!(
        parse_assignment("=1"),
        Err(CliError::InvalidAssignment(_))
    ));
    assert!(matches!(
        parse_assignment("status"),
        Err(CliError::InvalidAssignment(_))
    ));
}

#[test]
fn build_document_applies_assignments_over_base() {
    let document = build_document(
        Some(json!({"status": "screening", "baseline": {"weight": 70}})),
        &["baseline.hba1c=7.2".to_string(), "status=\"active\"".to_string()],
    )
    .unwrap();
    assert_eq!(
        document,
        json!({"status": "active", "baseline": {"weight": 70, "hba1c": 7.2}})
    );
}

#[test]
fn build_document_starts_empty_without_base() {
    let document = build_document(None, &["visit=3".to_string()]).unwrap();
    assert_eq!(document, json!({"visit": 3}));
}

#[test]
fn read_document_file_requires_object() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("entity.json");
    std::fs::write(&path, "[1, 2]").unwrap();
    assert!(matches!(read_document_file(&path), Err(CliError::NotAnObject)));

    std::fs::write(&path, r#"{"status": "active"}"#).unwrap();
    assert_eq!(read_document_file(&path).unwrap(), json!({"status": "active"}));
}

#[test]
fn resolve_db_path_prefers_flag_over_config() {
    let resolved = resolve_db_path(
        Some(PathBuf::from("/tmp/flag.db")),
        Some(PathBuf::from("/tmp/config.db")),
    )
    .unwrap();
    assert_eq!(resolved, PathBuf::from("/tmp/flag.db"));

    let resolved = resolve_db_path(None, Some(PathBuf::from("/tmp/config.db"))).unwrap();
    assert_eq!(resolved, PathBuf::from("/tmp/config.db"));
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
}

#[test]
fn format_timestamp_renders_utc() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn queue_lines_include_last_error() {
    let change = QueuedChange {
        change_id: "c1".to_string(),
        form_id: "p1".to_string(),
        form_type: "baseline".to_string(),
        delta: FieldChanges::from([("hba1c".to_string(), json!(7.2))]),
        priority: SyncPriority::High,
        enqueued_at: 0,
        version: 2,
        retries: 3,
        last_error: Some("network error".to_string()),
    };
    let lines = format_queue_lines(&[change]);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("high      baseline:p1  v2  fields=1"));
    assert!(lines[0].ends_with("retries=3  last_error=network error"));
}

#[test]
fn conflict_lines_show_kind_and_versions() {
    let conflict = ConflictRecord {
        id: 1,
        table: "patient".to_string(),
        entity_id: "p9".to_string(),
        kind: ConflictKind::ChecksumMismatch,
        resolution: Resolution::MergeNeeded,
        local_version: 2,
        server_version: 2,
        local_checksum: "aaaa".to_string(),
        server_checksum: "bbbb".to_string(),
        resolved_at: 0,
    };
    let lines = format_conflict_lines(&[conflict]);
    assert!(lines[0].contains("patient:p9  local=v2 server=v2"));
    assert!(lines[0].contains(ConflictKind::ChecksumMismatch.as_str()));
}

#[test]
fn report_lines_list_id_map_and_failures() {
    let mut report = SyncReport {
        synced: 1,
        failed: 1,
        duration_ms: 12,
        ..SyncReport::default()
    };
    report
        .id_map
        .insert("patient_tmp".to_string(), "AbC123".to_string());
    report.failures.push(trialsync_core::SyncFailure {
        entity_type: "baseline".to_string(),
        entity_id: "p2".to_string(),
        change_ids: vec!["c2".to_string()],
        error: "network error".to_string(),
        retryable: true,
    });

    assert_eq!(
        format_report_lines(&report),
        vec![
            "Synced 1, failed 1, rejected 0 in 12 ms".to_string(),
            "  id patient_tmp -> AbC123".to_string(),
            "  failed baseline:p2: network error".to_string(),
        ]
    );
}

#[test]
fn skipped_report_is_one_line() {
    let report = SyncReport {
        skipped: true,
        ..SyncReport::default()
    };
    assert_eq!(format_report_lines(&report), vec!["Sync already in progress"]);
}

#[test]
fn cli_parses_save_with_assignments() {
    let cli = Cli::try_parse_from([
        "trialsync",
        "--db-path",
        "/tmp/device.db",
        "save",
        "p1",
        "--type",
        "patient",
        "--priority",
        "critical",
        "--set",
        "status=active",
        "--set",
        "baseline.hba1c=7.2",
    ])
    .unwrap();
    assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/device.db")));
    match cli.command {
        Commands::Save {
            id,
            entity_type,
            priority,
            set,
            file,
        } => {
            assert_eq!(id, "p1");
            assert_eq!(entity_type, "patient");
            assert_eq!(priority, PriorityArg::Critical);
            assert_eq!(set.len(), 2);
            assert!(file.is_none());
        }
        _ => panic!("expected save"),
    }
}

#[test]
fn cli_save_requires_data() {
    assert!(Cli::try_parse_from(["trialsync", "save", "p1", "--type", "patient"]).is_err());
}

#[test]
fn cli_global_flags_follow_subcommand() {
    let cli = Cli::try_parse_from(["trialsync", "sync", "--remote-url", "https://sync.example.org"])
        .unwrap();
    assert_eq!(cli.remote_url.as_deref(), Some("https://sync.example.org"));
}

#[test]
fn completions_name_the_binary() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("trialsync"));
}

#[tokio::test]
async fn save_queues_change_in_local_store() {
    let dir = tempfile::tempdir().unwrap();
    let context = context(dir.path().join("device.db"));

    run_save(
        SaveArgs {
            id: "p1".to_string(),
            entity_type: "baseline".to_string(),
            priority: PriorityArg::High,
            file: None,
            assignments: vec!["hba1c=7.2".to_string()],
        },
        &context,
    )
    .await
    .unwrap();

    let store = context.open_store().await.unwrap();
    let queued = store.queued_changes().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].0.priority, SyncPriority::High);
    let record = store.get("baseline", "p1").await.unwrap().unwrap();
    assert_eq!(record.data, json!({"hba1c": 7.2}));
    assert!(record.metadata.is_dirty);
}

#[tokio::test]
async fn sync_requires_remote_url() {
    let dir = tempfile::tempdir().unwrap();
    let context = context(dir.path().join("device.db"));
    assert!(matches!(
        context.remote_store(),
        Err(CliError::RemoteNotConfigured)
    ));
}
