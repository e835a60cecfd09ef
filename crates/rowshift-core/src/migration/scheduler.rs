//! Migration scheduling and batch execution.
//!
//! The scheduler holds no in-memory coordination state. Every decision is
//! taken against the registry and the job tracker, so any number of
//! schedulers (threads or processes sharing the database) can run side by
//! side.

use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::EngineConfig;
use super::error::{run_tx, MigrationError};
use super::range::{BatchRange, RangeCalculator};
use super::registry::{
    apply_transition, MigrationDefinition, MigrationRegistry, MigrationStatus, Registration,
};
use super::tracker::{JobCounts, JobOutcome, JobStatus, JobTracker, MigrationJob, Recorded};
use super::transform::{BatchContext, Transformation, TransformationRegistry};
use crate::storage::key::current_timestamp;
use crate::storage::TableStore;
use crate::value::{Cursor, KeyRange, Value};

/// Parameters for a new migration.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Registered transformation name.
    pub job_class: String,
    /// Table to walk.
    pub table: String,
    /// Batching column. Must be the table's leading key column.
    pub column: String,
    /// Transformation arguments.
    pub arguments: Vec<Value>,
    /// Keys per job, or the engine default.
    pub batch_size: Option<u64>,
    /// Keys per transformation call, or the engine default.
    pub sub_batch_size: Option<u64>,
    /// Minimum time between batch starts, or the engine default.
    pub interval: Option<Duration>,
    /// Key range to cover. Defaults to the table's current extent.
    pub bounds: Option<KeyRange>,
    /// Attempts per job, or the engine default.
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    /// New request with engine defaults.
    pub fn new(
        job_class: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            job_class: job_class.into(),
            table: table.into(),
            column: column.into(),
            arguments: Vec::new(),
            batch_size: None,
            sub_batch_size: None,
            interval: None,
            bounds: None,
            max_attempts: None,
        }
    }

    /// Set the transformation arguments.
    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Set the batch and sub-batch sizes.
    pub fn with_batch_sizes(mut self, batch_size: u64, sub_batch_size: u64) -> Self {
        self.batch_size = Some(batch_size);
        self.sub_batch_size = Some(sub_batch_size);
        self
    }

    /// Set the pacing interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set explicit bounds.
    pub fn with_bounds(mut self, bounds: KeyRange) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Set the attempt ceiling.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }
}

/// Result of one scheduling step.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing was due.
    Idle,
    /// A job completed.
    JobSucceeded {
        /// Definition id.
        definition_id: u64,
        /// Job id.
        job_id: u64,
        /// Rows changed.
        rows: u64,
        /// Whether the definition finished with this job.
        finished: bool,
    },
    /// A job failed transiently and will be retried.
    JobRetrying {
        /// Definition id.
        definition_id: u64,
        /// Job id.
        job_id: u64,
        /// Failed attempts so far.
        attempts: u32,
    },
    /// A job failed terminally and the definition halted.
    JobFailed {
        /// Definition id.
        definition_id: u64,
        /// Job id.
        job_id: u64,
        /// Error message.
        error: String,
    },
    /// The definition completed without running a job this step.
    MigrationFinished {
        /// Definition id.
        definition_id: u64,
    },
    /// Scheduling hit a range anomaly and the definition halted.
    MigrationFailed {
        /// Definition id.
        definition_id: u64,
        /// Error message.
        error: String,
    },
    /// The claim was taken over while the job ran; its outcome was dropped.
    Superseded {
        /// Definition id.
        definition_id: u64,
        /// Job id.
        job_id: u64,
    },
}

/// Progress of a migration.
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    /// Current definition.
    pub definition: MigrationDefinition,
    /// Per-status job counts.
    pub jobs: JobCounts,
    /// Rows changed by succeeded jobs.
    pub rows_processed: u64,
    /// Keys currently inside the bounds.
    pub total_keys: u64,
    /// Keys inside the contiguous completed prefix.
    pub completed_keys: u64,
}

impl MigrationProgress {
    /// Completion estimate in percent.
    pub fn percent(&self) -> f64 {
        if self.definition.status == MigrationStatus::Finished {
            return 100.0;
        }
        if self.total_keys == 0 {
            return 0.0;
        }
        (self.completed_keys as f64 / self.total_keys as f64 * 100.0).min(100.0)
    }
}

enum Scheduling {
    Created(MigrationJob),
    Raced,
    Exhausted,
}

/// Drives migrations: computes ranges, creates and claims jobs, executes
/// transformations and records outcomes.
pub struct Scheduler {
    store: Arc<TableStore>,
    transforms: Arc<TransformationRegistry>,
    registry: MigrationRegistry,
    tracker: JobTracker,
    config: EngineConfig,
}

impl Scheduler {
    /// Create a scheduler over a table store.
    pub fn new(
        store: Arc<TableStore>,
        transforms: Arc<TransformationRegistry>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let registry = MigrationRegistry::open(store.db())?;
        let tracker = JobTracker::open(store.db(), config.clone())?;
        Ok(Self {
            store,
            transforms,
            registry,
            tracker,
            config,
        })
    }

    /// The table store.
    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    /// The transformation registry.
    pub fn transforms(&self) -> &Arc<TransformationRegistry> {
        &self.transforms
    }

    /// The migration registry.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// The job tracker.
    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a migration.
    ///
    /// When the table is empty and no bounds are given the definition is
    /// created already finished. Enqueuing an identical migration again
    /// returns the existing definition.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<MigrationDefinition, MigrationError> {
        let transform = self
            .transforms
            .get(&request.job_class)
            .ok_or_else(|| MigrationError::TransformationNotRegistered(request.job_class.clone()))?;
        transform
            .validate_arguments(&request.arguments)
            .map_err(|reason| MigrationError::InvalidArguments {
                job_class: request.job_class.clone(),
                reason,
            })?;

        let table = self.store.require_table(&request.table)?;
        if table.leading_key() != request.column {
            return Err(MigrationError::InvalidDefinition(format!(
                "column {} is not the leading key column of {} ({})",
                request.column,
                request.table,
                table.leading_key()
            )));
        }

        let mut interval = request.interval.unwrap_or(self.config.default_interval);
        if interval < self.config.minimum_interval {
            tracing::warn!(
                table = %request.table,
                requested_ms = interval.as_millis() as u64,
                minimum_ms = self.config.minimum_interval.as_millis() as u64,
                "migration interval raised to the minimum"
            );
            interval = self.config.minimum_interval;
        }

        let bounds = match request.bounds {
            Some(bounds) => {
                table.check_cursor(&bounds.min)?;
                table.check_cursor(&bounds.max)?;
                Some(bounds)
            }
            None => self.store.bounds(&request.table)?,
        };

        let batch_size = request.batch_size.unwrap_or(self.config.default_batch_size);
        let sub_batch_size = request
            .sub_batch_size
            .unwrap_or_else(|| self.config.default_sub_batch_size.min(batch_size));
        let now = current_timestamp();
        let (status, finished_at) = match bounds {
            Some(_) => (MigrationStatus::Active, None),
            None => (MigrationStatus::Finished, Some(now)),
        };

        let def = MigrationDefinition {
            id: 0,
            job_class: request.job_class,
            table: request.table,
            column: request.column,
            arguments: request.arguments,
            key_columns: table.key_columns.clone(),
            bounds,
            batch_size,
            sub_batch_size,
            interval_us: interval.as_micros() as u64,
            status,
            last_scheduled: None,
            completed_through: None,
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts),
            last_batch_started_at: None,
            created_at: now,
            finished_at,
            error: None,
        };

        match self.registry.create(def)? {
            Registration::Created(def) => {
                tracing::info!(
                    definition_id = def.id,
                    job_class = %def.job_class,
                    table = %def.table,
                    status = %def.status,
                    "enqueued migration"
                );
                Ok(def)
            }
            Registration::Existing(def) => {
                tracing::warn!(
                    definition_id = def.id,
                    job_class = %def.job_class,
                    table = %def.table,
                    "migration already registered"
                );
                Ok(def)
            }
        }
    }

    /// One scheduling step across all active migrations.
    ///
    /// Definitions are visited least recently started first and skipped
    /// until their interval has elapsed. The first one that does work ends
    /// the step.
    pub fn run_once(&self, worker_id: &str) -> Result<TickOutcome, MigrationError> {
        let now = current_timestamp();
        let mut active = self.registry.list_by_status(MigrationStatus::Active)?;
        active.sort_by_key(|d| (d.last_batch_started_at.unwrap_or(0), d.id));

        for def in active {
            if !def.is_due(now) {
                continue;
            }
            if let Err(e) = self.runnable(&def) {
                tracing::warn!(
                    definition_id = def.id,
                    job_class = %def.job_class,
                    worker_id,
                    error = %e,
                    "skipping migration this worker cannot run"
                );
                continue;
            }
            if !self
                .registry
                .try_stamp_batch(def.id, def.last_batch_started_at, now)?
            {
                continue;
            }
            let outcome = self.step(&def, worker_id)?;
            if outcome != TickOutcome::Idle {
                return Ok(outcome);
            }
        }
        Ok(TickOutcome::Idle)
    }

    /// Drive one migration to completion on the calling thread, ignoring
    /// its interval. A paused migration is resumed first.
    pub fn finalize(&self, definition_id: u64) -> Result<MigrationDefinition, MigrationError> {
        let worker_id = format!("finalize-{}", std::process::id());
        let current = self.registry.require(definition_id)?;
        if matches!(
            current.status,
            MigrationStatus::Active | MigrationStatus::Paused
        ) {
            self.runnable(&current)?;
        }
        if current.status == MigrationStatus::Paused {
            self.registry
                .transition(definition_id, MigrationStatus::Active)?;
        }
        tracing::info!(definition_id, "finalizing migration");

        loop {
            let def = self.registry.require(definition_id)?;
            match def.status {
                MigrationStatus::Finished => return Ok(def),
                MigrationStatus::Failed => {
                    return Err(MigrationError::MigrationFailed {
                        definition_id,
                        reason: def.error.unwrap_or_default(),
                    })
                }
                MigrationStatus::Paused => {
                    return Err(MigrationError::InvalidTransition {
                        definition_id,
                        from: MigrationStatus::Paused,
                        to: MigrationStatus::Finished,
                    })
                }
                MigrationStatus::Active => {}
            }

            if self.step(&def, &worker_id)? == TickOutcome::Idle {
                std::thread::sleep(self.config.finalize_poll_interval);
            }
        }
    }

    /// Stop scheduling new jobs. Running jobs complete.
    pub fn pause(&self, definition_id: u64) -> Result<MigrationDefinition, MigrationError> {
        self.registry
            .transition(definition_id, MigrationStatus::Paused)
    }

    /// Resume a paused migration.
    pub fn resume(&self, definition_id: u64) -> Result<MigrationDefinition, MigrationError> {
        let def = self.registry.require(definition_id)?;
        if def.status != MigrationStatus::Paused {
            return Err(MigrationError::InvalidTransition {
                definition_id,
                from: def.status,
                to: MigrationStatus::Active,
            });
        }
        self.registry
            .transition(definition_id, MigrationStatus::Active)
    }

    /// Reset failed jobs and reactivate a failed migration.
    pub fn retry_failed(&self, definition_id: u64) -> Result<MigrationDefinition, MigrationError> {
        let def = self.registry.require(definition_id)?;
        if def.status != MigrationStatus::Failed {
            return Err(MigrationError::InvalidTransition {
                definition_id,
                from: def.status,
                to: MigrationStatus::Active,
            });
        }
        let reset = self.tracker.reset_failed(definition_id)?;
        let def = self
            .registry
            .transition(definition_id, MigrationStatus::Active)?;
        tracing::info!(definition_id, reset, "retrying failed migration");
        Ok(def)
    }

    /// Move the upper bound of a migration, typically after the table grew.
    ///
    /// Reopens a finished migration. The bound cannot drop below keys that
    /// were already scheduled.
    pub fn extend_max_value(
        &self,
        definition_id: u64,
        max: Cursor,
    ) -> Result<MigrationDefinition, MigrationError> {
        let current = self.registry.require(definition_id)?;
        let table = self.store.require_table(&current.table)?;
        table.check_cursor(&max)?;
        let table_min = self.store.bounds(&current.table)?.map(|b| b.min);

        let def = self.registry.modify(definition_id, |def| {
            let anomaly = |message: String| MigrationError::RangeAnomaly {
                definition_id,
                message,
            };
            if let Some(last) = &def.last_scheduled {
                if max < *last {
                    return Err(anomaly(format!(
                        "new max {} is below scheduled keys up to {}",
                        max, last
                    )));
                }
            }
            let min = match &def.bounds {
                Some(bounds) if max < bounds.min => {
                    return Err(anomaly(format!(
                        "new max {} is below min {}",
                        max, bounds.min
                    )))
                }
                Some(bounds) => bounds.min.clone(),
                None => match &table_min {
                    Some(min) if *min <= max => min.clone(),
                    _ => max.clone(),
                },
            };
            def.bounds = Some(KeyRange {
                min,
                max: max.clone(),
            });
            if def.status == MigrationStatus::Finished {
                def.status = MigrationStatus::Active;
                def.finished_at = None;
            }
            Ok(())
        })?;

        tracing::info!(
            definition_id,
            max = %max,
            status = %def.status,
            "extended migration bounds"
        );
        Ok(def)
    }

    /// Delete a non-active migration with all its job records.
    pub fn delete_migration(&self, definition_id: u64) -> Result<(), MigrationError> {
        self.registry.delete(definition_id)?;
        let removed = self.tracker.delete_all(definition_id)?;
        tracing::info!(definition_id, removed, "deleted migration");
        Ok(())
    }

    /// Delete job records with the given statuses, succeeded ones by default.
    pub fn delete_job_tracking(
        &self,
        definition_id: u64,
        statuses: &[JobStatus],
    ) -> Result<u64, MigrationError> {
        self.registry.require(definition_id)?;
        if statuses.is_empty() {
            return self
                .tracker
                .delete_tracking(definition_id, &[JobStatus::Succeeded]);
        }
        self.tracker.delete_tracking(definition_id, statuses)
    }

    /// Progress report for a migration.
    pub fn progress(&self, definition_id: u64) -> Result<MigrationProgress, MigrationError> {
        let definition = self.registry.require(definition_id)?;
        let jobs = self.tracker.job_counts(definition_id)?;
        let calc = RangeCalculator::new(&self.store);

        let (total_keys, completed_keys) = match &definition.bounds {
            Some(bounds) => {
                let total = calc.count_in_range(&definition.table, bounds)?;
                let completed = match &definition.completed_through {
                    Some(through) => calc.count_in_range(
                        &definition.table,
                        &KeyRange {
                            min: bounds.min.clone(),
                            max: through.clone(),
                        },
                    )?,
                    None => 0,
                };
                (total, completed)
            }
            None => (0, 0),
        };

        Ok(MigrationProgress {
            definition,
            rows_processed: jobs.rows_processed,
            jobs,
            total_keys,
            completed_keys,
        })
    }

    /// The definition's transformation, if this process can run it.
    fn runnable(
        &self,
        def: &MigrationDefinition,
    ) -> Result<Arc<dyn Transformation>, MigrationError> {
        let transform = self
            .transforms
            .get(&def.job_class)
            .ok_or_else(|| MigrationError::TransformationNotRegistered(def.job_class.clone()))?;
        transform.check_runnable(&def.arguments, self.store.mappings())?;
        Ok(transform)
    }

    fn step(
        &self,
        def: &MigrationDefinition,
        worker_id: &str,
    ) -> Result<TickOutcome, MigrationError> {
        if let Some(job) = self.tracker.claim_next(def.id, worker_id)? {
            return self.execute(def, job, worker_id);
        }

        let job = match self.schedule_next(def.id) {
            Ok(Scheduling::Created(job)) => job,
            Ok(Scheduling::Raced) => return Ok(TickOutcome::Idle),
            Ok(Scheduling::Exhausted) => return self.try_finish(def.id),
            Err(e @ MigrationError::RangeAnomaly { .. }) => return self.halt(def.id, e),
            Err(e) => return Err(e),
        };

        match self.tracker.claim_job(job.key(), worker_id)? {
            Some(job) => self.execute(def, job, worker_id),
            None => Ok(TickOutcome::Idle),
        }
    }

    fn next_range(&self, def: &MigrationDefinition) -> Result<Option<BatchRange>, MigrationError> {
        let bounds = match &def.bounds {
            Some(bounds) => bounds,
            None => return Ok(None),
        };
        let lower = match &def.last_scheduled {
            Some(last) => Bound::Excluded(last),
            None => Bound::Included(&bounds.min),
        };
        Ok(RangeCalculator::new(&self.store).range_between(
            &def.table,
            lower,
            Bound::Included(&bounds.max),
            def.batch_size,
        )?)
    }

    fn schedule_next(&self, definition_id: u64) -> Result<Scheduling, MigrationError> {
        let def = self.registry.require(definition_id)?;
        if def.status != MigrationStatus::Active {
            return Ok(Scheduling::Raced);
        }
        let batch = match self.next_range(&def)? {
            Some(batch) => batch,
            None => return Ok(Scheduling::Exhausted),
        };

        match self
            .tracker
            .create_job(definition_id, def.last_scheduled.as_ref(), batch.range)
        {
            Ok(job) => Ok(Scheduling::Created(job)),
            Err(MigrationError::ScheduleRace { .. }) => Ok(Scheduling::Raced),
            Err(e) => Err(e),
        }
    }

    /// Mark the definition finished once nothing is left to schedule or run.
    fn try_finish(&self, definition_id: u64) -> Result<TickOutcome, MigrationError> {
        let def = self.registry.require(definition_id)?;
        if def.status != MigrationStatus::Active {
            return Ok(TickOutcome::Idle);
        }
        let counts = self.tracker.job_counts(definition_id)?;
        if counts.has_open() || counts.failed > 0 || self.next_range(&def)?.is_some() {
            return Ok(TickOutcome::Idle);
        }

        // A job created after the checks above moves last_scheduled.
        let expected = def.last_scheduled;
        let finished = run_tx(self.registry.definitions_tree(), |defs| {
            let mut def = MigrationDefinition::load_tx(defs, definition_id)?;
            if def.status != MigrationStatus::Active || def.last_scheduled != expected {
                return Ok(false);
            }
            apply_transition(&mut def, MigrationStatus::Finished)?;
            def.store_tx(defs)?;
            Ok(true)
        })?;

        if !finished {
            return Ok(TickOutcome::Idle);
        }
        tracing::info!(
            definition_id,
            jobs = counts.succeeded,
            rows = counts.rows_processed,
            "migration finished"
        );
        Ok(TickOutcome::MigrationFinished { definition_id })
    }

    fn halt(
        &self,
        definition_id: u64,
        error: MigrationError,
    ) -> Result<TickOutcome, MigrationError> {
        let message = error.to_string();
        self.registry.modify(definition_id, |def| {
            if def.status != MigrationStatus::Failed {
                apply_transition(def, MigrationStatus::Failed)?;
            }
            def.error = Some(message.clone());
            Ok(())
        })?;
        tracing::error!(definition_id, error = %message, "migration halted");
        Ok(TickOutcome::MigrationFailed {
            definition_id,
            error: message,
        })
    }

    fn execute(
        &self,
        def: &MigrationDefinition,
        job: MigrationJob,
        worker_id: &str,
    ) -> Result<TickOutcome, MigrationError> {
        let key = job.key();
        let token = job
            .claim_token
            .ok_or(MigrationError::ClaimSuperseded { job_id: job.id })?;
        let superseded = || -> Result<TickOutcome, MigrationError> {
            tracing::warn!(
                definition_id = key.definition_id,
                job_id = key.job_id,
                worker_id,
                "claim superseded, discarding outcome"
            );
            Ok(TickOutcome::Superseded {
                definition_id: key.definition_id,
                job_id: key.job_id,
            })
        };

        tracing::debug!(
            definition_id = def.id,
            job_id = job.id,
            worker_id,
            range = %job.range,
            attempt = job.attempts + 1,
            "running migration job"
        );

        let outcome = match self.run_job(def, &job, token) {
            Ok(rows) => JobOutcome::Succeeded { rows },
            Err(MigrationError::ClaimSuperseded { .. }) => return superseded(),
            Err(e) => JobOutcome::Failed {
                error: e.to_string(),
                transient: e.is_transient(),
            },
        };
        let rows = match outcome {
            JobOutcome::Succeeded { rows } => rows,
            JobOutcome::Failed { .. } => 0,
        };
        let error = match &outcome {
            JobOutcome::Failed { error, .. } => error.clone(),
            JobOutcome::Succeeded { .. } => String::new(),
        };

        match self.tracker.record_outcome(key, token, outcome) {
            Ok(Recorded::Succeeded) => {
                let finished = matches!(
                    self.try_finish(def.id)?,
                    TickOutcome::MigrationFinished { .. }
                );
                tracing::info!(
                    definition_id = def.id,
                    job_id = job.id,
                    worker_id,
                    rows,
                    "migration job succeeded"
                );
                Ok(TickOutcome::JobSucceeded {
                    definition_id: def.id,
                    job_id: job.id,
                    rows,
                    finished,
                })
            }
            Ok(Recorded::Retrying { attempts, .. }) => {
                tracing::warn!(
                    definition_id = def.id,
                    job_id = job.id,
                    worker_id,
                    attempts,
                    error = %error,
                    "migration job will be retried"
                );
                Ok(TickOutcome::JobRetrying {
                    definition_id: def.id,
                    job_id: job.id,
                    attempts,
                })
            }
            Ok(Recorded::Failed) => {
                tracing::error!(
                    definition_id = def.id,
                    job_id = job.id,
                    worker_id,
                    error = %error,
                    "migration job failed"
                );
                Ok(TickOutcome::JobFailed {
                    definition_id: def.id,
                    job_id: job.id,
                    error,
                })
            }
            Err(MigrationError::ClaimSuperseded { .. }) => superseded(),
            Err(e) => Err(e),
        }
    }

    /// Run the transformation over a job's range in sub-batches, each in its
    /// own data transaction.
    fn run_job(
        &self,
        def: &MigrationDefinition,
        job: &MigrationJob,
        token: u64,
    ) -> Result<u64, MigrationError> {
        let transform = self.runnable(def)?;
        let calc = RangeCalculator::new(&self.store);
        let started = Instant::now();

        let mut rows = 0;
        let mut after: Option<Cursor> = None;
        loop {
            let lower = match &after {
                Some(last) => Bound::Excluded(last),
                None => Bound::Included(&job.range.min),
            };
            let keys = calc.next_keys(
                &def.table,
                lower,
                Bound::Included(&job.range.max),
                job.sub_batch_size,
            )?;
            let last = match keys.last() {
                Some(last) => last.clone(),
                None => break,
            };
            // Only work that is still left counts against the budget.
            if after.is_some() && started.elapsed() > self.config.batch_timeout {
                return Err(MigrationError::BatchTimeout {
                    timeout_ms: self.config.batch_timeout.as_millis() as u64,
                });
            }

            let ctx = BatchContext {
                table: &def.table,
                column: &def.column,
                range: &job.range,
                sub_batch_size: job.sub_batch_size,
                arguments: &def.arguments,
                keys: &keys,
            };
            let changed = self.store.transact(|txn| transform.transform(txn, &ctx))?;
            rows += changed;
            tracing::debug!(
                definition_id = def.id,
                job_id = job.id,
                keys = keys.len(),
                changed,
                "processed sub-batch"
            );

            self.tracker.heartbeat(job.key(), token)?;
            if (keys.len() as u64) < job.sub_batch_size {
                break;
            }
            after = Some(last);
        }
        Ok(rows)
    }
}
