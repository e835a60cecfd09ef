//! Command-line arguments and the configuration derived from them.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rowshift_core::{EngineConfig, StorageConfig, WorkerPoolConfig};

use crate::formatter::OutputFormat;

/// Default database directory.
pub const DEFAULT_DATA_PATH: &str = "./rowshift_data";

/// rowshift command-line interface.
#[derive(Parser, Debug)]
#[command(name = "rowshift")]
#[command(version, about = "Batched background migrations and dual-write sync", long_about = None)]
pub struct Args {
    /// Path to the database directory.
    #[arg(short, long, default_value = DEFAULT_DATA_PATH, global = true)]
    pub data_path: PathBuf,

    /// Output format.
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    /// Attempts per job before a migration fails.
    #[arg(long, default_value_t = 3, global = true)]
    pub max_attempts: u32,

    /// Minimum pacing interval in seconds.
    #[arg(long, default_value_t = 2, global = true)]
    pub min_interval: u64,

    /// Wall-clock budget of one batch in seconds.
    #[arg(long, default_value_t = 300, global = true)]
    pub batch_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List tables.
    Tables,

    /// List migrations.
    Migrations {
        /// Only show migrations with this status.
        #[arg(long)]
        status: Option<String>,
    },

    /// List the jobs of a migration.
    Jobs {
        /// Migration id.
        id: u64,
    },

    /// Show the progress of a migration.
    Progress {
        /// Migration id.
        id: u64,
    },

    /// List sync triggers.
    Triggers {
        /// Only show triggers on this source table.
        #[arg(long)]
        source: Option<String>,
    },

    /// Pause a migration.
    Pause {
        /// Migration id.
        id: u64,
    },

    /// Resume a paused migration.
    Resume {
        /// Migration id.
        id: u64,
    },

    /// Retry a failed migration.
    Retry {
        /// Migration id.
        id: u64,
    },

    /// Enqueue a migration.
    Enqueue {
        /// Transformation name (copy_rows, copy_column, fill_column).
        job_class: String,

        /// Table to walk.
        table: String,

        /// Batching column. Defaults to the table's leading key column.
        #[arg(long)]
        column: Option<String>,

        /// Transformation arguments as a JSON array.
        #[arg(long, default_value = "[]")]
        arguments: String,

        /// Keys per job.
        #[arg(long)]
        batch_size: Option<u64>,

        /// Keys per transformation call.
        #[arg(long)]
        sub_batch_size: Option<u64>,

        /// Seconds between batches.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run migration workers until interrupted.
    Work {
        /// Worker threads.
        #[arg(long, default_value_t = 2)]
        workers: usize,

        /// Idle poll interval in milliseconds.
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,

        /// Drive this migration to completion inline and exit.
        #[arg(long)]
        finalize: Option<u64>,
    },
}

/// Configuration shared by all subcommands.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Database location.
    pub storage: StorageConfig,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Output format.
    pub format: OutputFormat,
}

impl Args {
    /// Split the arguments into configuration and the subcommand to run.
    pub fn into_config(self) -> (CliConfig, Command) {
        let engine = EngineConfig::default()
            .with_max_attempts(self.max_attempts)
            .with_minimum_interval(Duration::from_secs(self.min_interval))
            .with_batch_timeout(Duration::from_secs(self.batch_timeout));

        let config = CliConfig {
            storage: StorageConfig::new(self.data_path),
            engine,
            format: self.format,
        };
        (config, self.command)
    }
}

impl Command {
    /// Worker pool settings of a `work` command.
    pub fn pool_config(&self) -> Option<WorkerPoolConfig> {
        match self {
            Command::Work {
                workers, poll_ms, ..
            } => Some(
                WorkerPoolConfig::default()
                    .with_workers(*workers)
                    .with_poll_interval(Duration::from_millis(*poll_ms)),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["rowshift", "tables"]).unwrap();
        let (config, command) = args.into_config();
        assert_eq!(command, Command::Tables);
        assert_eq!(config.storage.path, PathBuf::from(DEFAULT_DATA_PATH));
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.minimum_interval, Duration::from_secs(2));
        assert_eq!(config.format, OutputFormat::Table);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "rowshift",
            "progress",
            "7",
            "--data-path",
            "/var/lib/rowshift",
            "--format",
            "json",
            "--max-attempts",
            "5",
        ])
        .unwrap();
        let (config, command) = args.into_config();
        assert_eq!(command, Command::Progress { id: 7 });
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/rowshift"));
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.format, OutputFormat::Json);
    }

    #[test]
    fn test_enqueue_and_work() {
        let args = Args::try_parse_from([
            "rowshift",
            "enqueue",
            "copy_column",
            "events",
            "--arguments",
            r#"["amount", "amount_v2"]"#,
            "--batch-size",
            "500",
        ])
        .unwrap();
        match args.command {
            Command::Enqueue {
                job_class,
                table,
                column,
                batch_size,
                ..
            } => {
                assert_eq!(job_class, "copy_column");
                assert_eq!(table, "events");
                assert_eq!(column, None);
                assert_eq!(batch_size, Some(500));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["rowshift", "work", "--workers", "4"]).unwrap();
        let pool = args.command.pool_config().unwrap();
        assert_eq!(pool.workers, 4);
        assert_eq!(pool.poll_interval, Duration::from_millis(500));
    }
}
