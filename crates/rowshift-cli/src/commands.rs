//! Subcommand execution.

use std::sync::Arc;
use std::time::Duration;

use rowshift_core::migration::EnqueueRequest;
use rowshift_core::{MigrationError, MigrationStatus, Scheduler, SyncTriggerEngine, Value};
use thiserror::Error;

use crate::config::Command;
use crate::formatter::{
    format_message, format_records, JobRecord, MigrationRecord, OutputFormat, ProgressRecord,
    TableRecord, TriggerRecord,
};

/// Errors reported by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Migration engine error.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] rowshift_core::Error),

    /// Bad command-line input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Execute a non-worker subcommand and return its output.
pub fn execute(
    command: Command,
    scheduler: &Arc<Scheduler>,
    format: OutputFormat,
) -> Result<String, CliError> {
    match command {
        Command::Tables => {
            let store = scheduler.store();
            let mut records = Vec::new();
            for def in store.list_tables()? {
                let rows = store.count(&def.name)?;
                records.push(TableRecord::new(&def, rows));
            }
            Ok(format_records(format, &records)?)
        }

        Command::Migrations { status } => {
            let definitions = match status {
                Some(status) => {
                    let status = MigrationStatus::parse(&status).ok_or_else(|| {
                        CliError::InvalidInput(format!(
                            "unknown status '{}'. Use: active, paused, finished, failed",
                            status
                        ))
                    })?;
                    scheduler.registry().list_by_status(status)?
                }
                None => scheduler.registry().list()?,
            };
            let records: Vec<MigrationRecord> = definitions.iter().map(Into::into).collect();
            Ok(format_records(format, &records)?)
        }

        Command::Jobs { id } => {
            scheduler.registry().require(id)?;
            let jobs = scheduler.tracker().jobs_for(id)?;
            let records: Vec<JobRecord> = jobs.iter().map(Into::into).collect();
            Ok(format_records(format, &records)?)
        }

        Command::Progress { id } => {
            let progress = scheduler.progress(id)?;
            Ok(format_records(format, &[ProgressRecord::from(&progress)])?)
        }

        Command::Triggers { source } => {
            let engine = SyncTriggerEngine::new(scheduler.store());
            let (triggers, column_syncs) = match source {
                Some(source) => (
                    engine.triggers_for(&source)?,
                    engine.column_syncs_for(&source)?,
                ),
                None => (engine.list()?, engine.list_column_syncs()?),
            };
            let mut records: Vec<TriggerRecord> = triggers.iter().map(Into::into).collect();
            records.extend(column_syncs.iter().map(TriggerRecord::from));
            Ok(format_records(format, &records)?)
        }

        Command::Pause { id } => {
            let def = scheduler.pause(id)?;
            Ok(format_message(format, &format!("migration {} {}", def.id, def.status)))
        }

        Command::Resume { id } => {
            let def = scheduler.resume(id)?;
            Ok(format_message(format, &format!("migration {} {}", def.id, def.status)))
        }

        Command::Retry { id } => {
            let def = scheduler.retry_failed(id)?;
            Ok(format_message(
                format,
                &format!("migration {} {}, failed jobs reset", def.id, def.status),
            ))
        }

        Command::Enqueue {
            job_class,
            table,
            column,
            arguments,
            batch_size,
            sub_batch_size,
            interval,
        } => {
            let column = match column {
                Some(column) => column,
                None => scheduler
                    .store()
                    .require_table(&table)?
                    .leading_key()
                    .to_string(),
            };

            let mut request =
                EnqueueRequest::new(job_class, table, column).with_arguments(parse_arguments(&arguments)?);
            request.batch_size = batch_size;
            request.sub_batch_size = sub_batch_size;
            request.interval = interval.map(Duration::from_secs);

            let def = scheduler.enqueue(request)?;
            Ok(format_records(format, &[MigrationRecord::from(&def)])?)
        }

        Command::Work { .. } => Err(CliError::InvalidInput(
            "work runs in the worker loop".to_string(),
        )),
    }
}

/// Parse a JSON array of transformation arguments.
pub fn parse_arguments(json: &str) -> Result<Vec<Value>, CliError> {
    let parsed: serde_json::Value = serde_json::from_str(json)?;
    let items = parsed
        .as_array()
        .ok_or_else(|| CliError::InvalidInput("arguments must be a JSON array".to_string()))?;
    items
        .iter()
        .map(|item| {
            Value::from_json(item).ok_or_else(|| {
                CliError::InvalidInput(format!("unsupported argument value: {}", item))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowshift_core::{EngineConfig, Row, StorageConfig, TableStore, TransformationRegistry};

    fn scheduler() -> Arc<Scheduler> {
        let store = TableStore::open(StorageConfig::temporary()).unwrap();
        store.create_table("events", &["id"]).unwrap();
        for id in 1..=5 {
            store
                .insert("events", Row::new().with("id", id).with("amount", id))
                .unwrap();
        }
        Arc::new(
            Scheduler::new(
                Arc::new(store),
                Arc::new(TransformationRegistry::with_builtins()),
                EngineConfig::immediate(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_parse_arguments() {
        let args = parse_arguments(r#"["amount", 3, null, true]"#).unwrap();
        assert_eq!(
            args,
            vec![
                Value::from("amount"),
                Value::Int64(3),
                Value::Null,
                Value::Bool(true)
            ]
        );
        assert!(parse_arguments(r#"{"a": 1}"#).is_err());
        assert!(parse_arguments("not json").is_err());
    }

    #[test]
    fn test_enqueue_then_inspect() {
        let scheduler = scheduler();
        let output = execute(
            Command::Enqueue {
                job_class: "copy_column".into(),
                table: "events".into(),
                column: None,
                arguments: r#"["amount", "amount_v2"]"#.into(),
                batch_size: Some(2),
                sub_batch_size: Some(2),
                interval: None,
            },
            &scheduler,
            OutputFormat::Json,
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        let id = parsed[0]["id"].as_u64().unwrap();
        assert_eq!(parsed[0]["status"], "active");

        scheduler.finalize(id).unwrap();

        let output = execute(Command::Progress { id }, &scheduler, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["succeeded"], 3);
        assert_eq!(parsed[0]["percent"], 100.0);

        let output = execute(Command::Jobs { id }, &scheduler, OutputFormat::Csv).unwrap();
        assert_eq!(output.lines().count(), 4);

        let output = execute(
            Command::Migrations {
                status: Some("finished".into()),
            },
            &scheduler,
            OutputFormat::Json,
        )
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_status_and_transition() {
        let scheduler = scheduler();
        assert!(matches!(
            execute(
                Command::Migrations {
                    status: Some("sleeping".into())
                },
                &scheduler,
                OutputFormat::Table
            ),
            Err(CliError::InvalidInput(_))
        ));
        assert!(matches!(
            execute(Command::Resume { id: 42 }, &scheduler, OutputFormat::Table),
            Err(CliError::Migration(MigrationError::MigrationNotFound { .. }))
        ));
    }
}
