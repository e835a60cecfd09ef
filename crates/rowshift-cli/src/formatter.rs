//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use serde::Serialize;

use rowshift_core::{
    ColumnSyncDef, Cursor, KeyRange, MigrationDefinition, MigrationJob, MigrationProgress,
    SyncTriggerDef, TableDef,
};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// A printable row of command output.
pub trait Record: Serialize {
    /// Column names.
    fn header() -> &'static [&'static str];

    /// Cell values in header order.
    fn cells(&self) -> Vec<String>;
}

/// Format a list of records.
pub fn format_records<R: Record>(
    format: OutputFormat,
    records: &[R],
) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Table => {
            if records.is_empty() {
                return Ok("No results".to_string());
            }
            let mut table = Table::new();
            table.set_header(R::header().iter().map(Cell::new).collect::<Vec<_>>());
            for record in records {
                table.add_row(record.cells().into_iter().map(Cell::new).collect::<Vec<_>>());
            }
            Ok(format!("{}\n{} row(s)", table, records.len()))
        }
        OutputFormat::Json => serde_json::to_string_pretty(records),
        OutputFormat::Csv => {
            let mut output = R::header().join(",");
            output.push('\n');
            for record in records {
                let cells: Vec<String> = record.cells().iter().map(|c| escape_csv(c)).collect();
                output.push_str(&cells.join(","));
                output.push('\n');
            }
            Ok(output)
        }
    }
}

/// Format a simple message.
pub fn format_message(format: OutputFormat, message: &str) -> String {
    match format {
        OutputFormat::Json => serde_json::json!({ "message": message }).to_string(),
        OutputFormat::Table | OutputFormat::Csv => message.to_string(),
    }
}

/// A table.
#[derive(Debug, Serialize)]
pub struct TableRecord {
    pub name: String,
    pub key_columns: Vec<String>,
    pub rows: u64,
}

impl TableRecord {
    pub fn new(def: &TableDef, rows: u64) -> Self {
        Self {
            name: def.name.clone(),
            key_columns: def.key_columns.clone(),
            rows,
        }
    }
}

impl Record for TableRecord {
    fn header() -> &'static [&'static str] {
        &["name", "key", "rows"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.key_columns.join(", "),
            self.rows.to_string(),
        ]
    }
}

/// A migration definition.
#[derive(Debug, Serialize)]
pub struct MigrationRecord {
    pub id: u64,
    pub job_class: String,
    pub table: String,
    pub column: String,
    pub arguments: Vec<serde_json::Value>,
    pub status: String,
    pub bounds: Option<String>,
    pub last_scheduled: Option<String>,
    pub completed_through: Option<String>,
    pub batch_size: u64,
    pub sub_batch_size: u64,
    pub interval_ms: u64,
    pub error: Option<String>,
}

impl From<&MigrationDefinition> for MigrationRecord {
    fn from(def: &MigrationDefinition) -> Self {
        Self {
            id: def.id,
            job_class: def.job_class.clone(),
            table: def.table.clone(),
            column: def.column.clone(),
            arguments: def.arguments.iter().map(|v| v.to_json()).collect(),
            status: def.status.to_string(),
            bounds: def.bounds.as_ref().map(KeyRange::to_string),
            last_scheduled: def.last_scheduled.as_ref().map(Cursor::to_string),
            completed_through: def.completed_through.as_ref().map(Cursor::to_string),
            batch_size: def.batch_size,
            sub_batch_size: def.sub_batch_size,
            interval_ms: def.interval_us / 1000,
            error: def.error.clone(),
        }
    }
}

impl Record for MigrationRecord {
    fn header() -> &'static [&'static str] {
        &["id", "job_class", "table", "status", "bounds", "completed_through", "error"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.job_class.clone(),
            format!("{}.{}", self.table, self.column),
            self.status.clone(),
            optional(&self.bounds),
            optional(&self.completed_through),
            optional(&self.error),
        ]
    }
}

/// A migration job.
#[derive(Debug, Serialize)]
pub struct JobRecord {
    pub id: u64,
    pub range: String,
    pub status: String,
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub rows_processed: u64,
    pub error: Option<String>,
}

impl From<&MigrationJob> for JobRecord {
    fn from(job: &MigrationJob) -> Self {
        Self {
            id: job.id,
            range: job.range.to_string(),
            status: job.status.to_string(),
            attempts: job.attempts,
            claimed_by: job.claimed_by.clone(),
            rows_processed: job.rows_processed,
            error: job.error.clone(),
        }
    }
}

impl Record for JobRecord {
    fn header() -> &'static [&'static str] {
        &["id", "range", "status", "attempts", "worker", "rows", "error"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.range.clone(),
            self.status.clone(),
            self.attempts.to_string(),
            optional(&self.claimed_by),
            self.rows_processed.to_string(),
            optional(&self.error),
        ]
    }
}

/// A sync trigger.
#[derive(Debug, Serialize)]
pub struct TriggerRecord {
    pub name: String,
    pub source: String,
    pub destination: String,
    pub mapping: String,
    pub operations: Vec<String>,
}

impl From<&SyncTriggerDef> for TriggerRecord {
    fn from(def: &SyncTriggerDef) -> Self {
        Self {
            name: def.name.clone(),
            source: def.source.clone(),
            destination: def.destination.clone(),
            mapping: def.mapping.clone(),
            operations: def.operations.iter().map(|op| op.to_string()).collect(),
        }
    }
}

impl From<&ColumnSyncDef> for TriggerRecord {
    fn from(def: &ColumnSyncDef) -> Self {
        Self {
            name: def.name.clone(),
            source: def.table.clone(),
            destination: def.table.clone(),
            mapping: format!("{} -> {}", def.from, def.to),
            operations: vec!["insert".to_string(), "update".to_string()],
        }
    }
}

impl Record for TriggerRecord {
    fn header() -> &'static [&'static str] {
        &["name", "source", "destination", "mapping", "operations"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.source.clone(),
            self.destination.clone(),
            self.mapping.clone(),
            self.operations.join(", "),
        ]
    }
}

/// Progress of one migration.
#[derive(Debug, Serialize)]
pub struct ProgressRecord {
    pub id: u64,
    pub status: String,
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rows_processed: u64,
    pub percent: f64,
}

impl From<&MigrationProgress> for ProgressRecord {
    fn from(progress: &MigrationProgress) -> Self {
        Self {
            id: progress.definition.id,
            status: progress.definition.status.to_string(),
            pending: progress.jobs.pending,
            running: progress.jobs.running,
            succeeded: progress.jobs.succeeded,
            failed: progress.jobs.failed,
            rows_processed: progress.rows_processed,
            percent: progress.percent(),
        }
    }
}

impl Record for ProgressRecord {
    fn header() -> &'static [&'static str] {
        &["id", "status", "pending", "running", "succeeded", "failed", "rows", "percent"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.status.clone(),
            self.pending.to_string(),
            self.running.to_string(),
            self.succeeded.to_string(),
            self.failed.to_string(),
            self.rows_processed.to_string(),
            format!("{:.1}%", self.percent),
        ]
    }
}

fn optional(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

/// Escape a value for CSV output.
fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowshift_core::ColumnSyncSpec;

    fn sample() -> Vec<TriggerRecord> {
        vec![TriggerRecord {
            name: "table_sync_trigger_abc".into(),
            source: "orders".into(),
            destination: "orders_p".into(),
            mapping: "identity".into(),
            operations: vec!["insert".into(), "update".into()],
        }]
    }

    #[test]
    fn test_table_format() {
        let output = format_records(OutputFormat::Table, &sample()).unwrap();
        assert!(output.contains("orders_p"));
        assert!(output.ends_with("1 row(s)"));

        let empty: Vec<TriggerRecord> = Vec::new();
        assert_eq!(format_records(OutputFormat::Table, &empty).unwrap(), "No results");
    }

    #[test]
    fn test_column_sync_record() {
        let def = ColumnSyncDef {
            name: ColumnSyncSpec::new("users", "email", "email_address").resolved_name(),
            table: "users".into(),
            from: "email".into(),
            to: "email_address".into(),
            installed_at: 0,
        };
        let record = TriggerRecord::from(&def);
        assert!(record.name.starts_with("column_sync_trigger_"));
        assert_eq!(record.source, record.destination);
        assert_eq!(record.mapping, "email -> email_address");
    }

    #[test]
    fn test_json_format() {
        let output = format_records(OutputFormat::Json, &sample()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["source"], "orders");
        assert_eq!(parsed[0]["operations"][1], "update");
    }

    #[test]
    fn test_csv_escaping() {
        let output = format_records(OutputFormat::Csv, &sample()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "name,source,destination,mapping,operations");
        assert!(lines[1].ends_with("\"insert, update\""));
    }

    #[test]
    fn test_message_format() {
        assert_eq!(format_message(OutputFormat::Table, "paused"), "paused");
        assert_eq!(
            format_message(OutputFormat::Json, "paused"),
            r#"{"message":"paused"}"#
        );
    }
}
