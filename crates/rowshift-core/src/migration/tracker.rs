//! Durable per-batch job tracking.
//!
//! Jobs are keyed by `[definition_id (8 bytes BE)][job_id (8 bytes BE)]`.
//! Job ids come from the database's monotonic id generator, so a prefix scan
//! over one definition returns its jobs in creation order, which is also key
//! range order.

use rkyv::{Archive, Deserialize, Serialize};
use sled::transaction::TransactionalTree;
use sled::{Db, Tree};

use super::config::EngineConfig;
use super::error::{run_tx, MigrationError};
use super::registry::{apply_transition, MigrationDefinition, MigrationRegistry, MigrationStatus};
use crate::storage::key::current_timestamp;
use crate::value::KeyRange;

/// Status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Completed.
    Succeeded,
    /// Failed terminally.
    Failed,
}

impl JobStatus {
    /// Parse from a lowercase name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Address of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Owning definition.
    pub definition_id: u64,
    /// Job id.
    pub job_id: u64,
}

impl JobKey {
    /// Encode as a tree key.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.definition_id.to_be_bytes());
        buf[8..].copy_from_slice(&self.job_id.to_be_bytes());
        buf
    }
}

/// One batch of a migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Job id.
    pub id: u64,
    /// Owning definition.
    pub definition_id: u64,
    /// Keys covered by this job.
    pub range: KeyRange,
    /// Batch size at creation.
    pub batch_size: u64,
    /// Sub-batch size at creation.
    pub sub_batch_size: u64,
    /// Current status.
    pub status: JobStatus,
    /// Failed executions so far.
    pub attempts: u32,
    /// Worker holding the claim.
    pub claimed_by: Option<String>,
    /// Token of the current claim.
    pub claim_token: Option<u64>,
    /// Creation time.
    pub created_at: u64,
    /// Start of the latest execution.
    pub started_at: Option<u64>,
    /// Last liveness signal of the running worker.
    pub heartbeat_at: Option<u64>,
    /// Completion time.
    pub finished_at: Option<u64>,
    /// Earliest time the job may be claimed again.
    pub not_before: u64,
    /// Rows changed by the successful execution.
    pub rows_processed: u64,
    /// Last error.
    pub error: Option<String>,
}

impl MigrationJob {
    /// Key of this job.
    pub fn key(&self) -> JobKey {
        JobKey {
            definition_id: self.definition_id,
            job_id: self.id,
        }
    }

    fn is_claimable(&self, now: u64, stale_after_us: u64) -> bool {
        match self.status {
            JobStatus::Pending => self.not_before <= now,
            JobStatus::Running => self.is_stale(now, stale_after_us),
            _ => false,
        }
    }

    fn is_stale(&self, now: u64, stale_after_us: u64) -> bool {
        let last_seen = self.heartbeat_at.or(self.started_at).unwrap_or(self.created_at);
        now.saturating_sub(last_seen) >= stale_after_us
    }

    /// Serialize to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }

    fn load_tx(tree: &TransactionalTree, key: JobKey) -> Result<Self, MigrationError> {
        match tree.get(key.encode())? {
            Some(bytes) => Self::from_bytes(&bytes),
            None => Err(MigrationError::JobNotFound {
                definition_id: key.definition_id,
                job_id: key.job_id,
            }),
        }
    }

    fn store_tx(&self, tree: &TransactionalTree) -> Result<(), MigrationError> {
        tree.insert(self.key().encode().to_vec(), self.to_bytes()?)?;
        Ok(())
    }
}

/// Outcome reported by the worker that ran a job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The transformation completed.
    Succeeded {
        /// Rows changed.
        rows: u64,
    },
    /// The transformation failed.
    Failed {
        /// Error message.
        error: String,
        /// Whether the error is worth retrying.
        transient: bool,
    },
}

/// What the tracker did with a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    /// Job marked succeeded.
    Succeeded,
    /// Job returned to pending for another attempt.
    Retrying {
        /// Failed attempts so far.
        attempts: u32,
        /// Earliest next claim time.
        not_before: u64,
    },
    /// Job and definition marked failed.
    Failed,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    /// Pending jobs.
    pub pending: u64,
    /// Running jobs.
    pub running: u64,
    /// Succeeded jobs.
    pub succeeded: u64,
    /// Failed jobs.
    pub failed: u64,
    /// Rows changed by succeeded jobs.
    pub rows_processed: u64,
}

impl JobCounts {
    /// Total number of jobs.
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.succeeded + self.failed
    }

    /// Whether any job is pending or running.
    pub fn has_open(&self) -> bool {
        self.pending + self.running > 0
    }
}

/// Durable job tracker.
pub struct JobTracker {
    db: Db,
    definitions: Tree,
    jobs: Tree,
    config: EngineConfig,
}

impl JobTracker {
    /// Tree name for jobs.
    pub const JOBS_TREE: &'static str = "migration:jobs";

    /// Open or create the job tracker.
    pub fn open(db: &Db, config: EngineConfig) -> Result<Self, MigrationError> {
        Ok(Self {
            db: db.clone(),
            definitions: db.open_tree(MigrationRegistry::DEFINITIONS_TREE)?,
            jobs: db.open_tree(Self::JOBS_TREE)?,
            config,
        })
    }

    /// Create a pending job for `range`.
    ///
    /// `expected_last` must match the definition's `last_scheduled`, which
    /// serializes concurrent schedulers. The range must start after
    /// everything already scheduled.
    pub fn create_job(
        &self,
        definition_id: u64,
        expected_last: Option<&crate::value::Cursor>,
        range: KeyRange,
    ) -> Result<MigrationJob, MigrationError> {
        let job_id = self.db.generate_id()?;
        let now = current_timestamp();

        let job = run_tx((&self.definitions, &self.jobs), |(defs, jobs)| {
            let mut def = MigrationDefinition::load_tx(defs, definition_id)?;
            if def.status != MigrationStatus::Active || def.last_scheduled.as_ref() != expected_last
            {
                return Err(MigrationError::ScheduleRace { definition_id });
            }
            check_range(&def, &range)?;

            let job = MigrationJob {
                id: job_id,
                definition_id,
                range: range.clone(),
                batch_size: def.batch_size,
                sub_batch_size: def.sub_batch_size,
                status: JobStatus::Pending,
                attempts: 0,
                claimed_by: None,
                claim_token: None,
                created_at: now,
                started_at: None,
                heartbeat_at: None,
                finished_at: None,
                not_before: 0,
                rows_processed: 0,
                error: None,
            };

            def.last_scheduled = Some(range.max.clone());
            def.store_tx(defs)?;
            job.store_tx(jobs)?;
            Ok(job)
        })?;

        tracing::debug!(
            definition_id,
            job_id,
            range = %job.range,
            "created migration job"
        );
        Ok(job)
    }

    /// Get a job.
    pub fn get(&self, key: JobKey) -> Result<Option<MigrationJob>, MigrationError> {
        match self.jobs.get(key.encode())? {
            Some(bytes) => Ok(Some(MigrationJob::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Jobs of a definition in creation order.
    pub fn jobs_for(&self, definition_id: u64) -> Result<Vec<MigrationJob>, MigrationError> {
        self.jobs
            .scan_prefix(definition_id.to_be_bytes())
            .map(|entry| {
                let (_, bytes) = entry?;
                MigrationJob::from_bytes(&bytes)
            })
            .collect()
    }

    /// Per-status counts for a definition.
    pub fn job_counts(&self, definition_id: u64) -> Result<JobCounts, MigrationError> {
        let mut counts = JobCounts::default();
        for job in self.jobs_for(definition_id)? {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => {
                    counts.succeeded += 1;
                    counts.rows_processed += job.rows_processed;
                }
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    /// Claim the next eligible job of a definition for `worker_id`.
    ///
    /// Eligible jobs are pending jobs past their backoff and running jobs
    /// whose heartbeat is stale. Exactly one caller wins each job: the claim
    /// is a compare-and-swap on the stored record.
    pub fn claim_next(
        &self,
        definition_id: u64,
        worker_id: &str,
    ) -> Result<Option<MigrationJob>, MigrationError> {
        let now = current_timestamp();
        let stale_after = self.config.stale_job_timeout.as_micros() as u64;

        for entry in self.jobs.scan_prefix(definition_id.to_be_bytes()) {
            let (key, bytes) = entry?;
            let job = MigrationJob::from_bytes(&bytes)?;
            if !job.is_claimable(now, stale_after) {
                continue;
            }

            if job.status == JobStatus::Running {
                match self.reclaim_stale(&job, worker_id)? {
                    Some(claimed) => return Ok(Some(claimed)),
                    None => continue,
                }
            }

            let claimed = self.claimed(job, worker_id, now)?;
            let swapped = self
                .jobs
                .compare_and_swap(&key, Some(&bytes), Some(claimed.to_bytes()?))?;
            if swapped.is_ok() {
                tracing::debug!(
                    definition_id,
                    job_id = claimed.id,
                    worker_id,
                    "claimed migration job"
                );
                return Ok(Some(claimed));
            }
        }

        Ok(None)
    }

    /// Claim one specific job if it is still claimable.
    pub fn claim_job(
        &self,
        key: JobKey,
        worker_id: &str,
    ) -> Result<Option<MigrationJob>, MigrationError> {
        let now = current_timestamp();
        let bytes = match self.jobs.get(key.encode())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let job = MigrationJob::from_bytes(&bytes)?;
        if job.status != JobStatus::Pending || job.not_before > now {
            return Ok(None);
        }

        let claimed = self.claimed(job, worker_id, now)?;
        let swapped = self.jobs.compare_and_swap(
            key.encode(),
            Some(&bytes),
            Some(claimed.to_bytes()?),
        )?;
        Ok(swapped.ok().map(|_| claimed))
    }

    fn claimed(
        &self,
        mut job: MigrationJob,
        worker_id: &str,
        now: u64,
    ) -> Result<MigrationJob, MigrationError> {
        job.status = JobStatus::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.claim_token = Some(self.db.generate_id()?);
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.finished_at = None;
        Ok(job)
    }

    /// Take over a running job whose worker stopped heartbeating.
    ///
    /// The lost execution counts as a failed attempt.
    fn reclaim_stale(
        &self,
        seen: &MigrationJob,
        worker_id: &str,
    ) -> Result<Option<MigrationJob>, MigrationError> {
        let now = current_timestamp();
        let token = self.db.generate_id()?;
        let key = seen.key();

        let outcome = run_tx((&self.definitions, &self.jobs), |(defs, jobs)| {
            let mut job = MigrationJob::load_tx(jobs, key)?;
            if job.status != JobStatus::Running || job.claim_token != seen.claim_token {
                return Ok(None);
            }

            let mut def = MigrationDefinition::load_tx(defs, key.definition_id)?;
            job.attempts += 1;
            job.error = Some(format!(
                "worker {} stopped heartbeating",
                job.claimed_by.as_deref().unwrap_or("?")
            ));

            if job.attempts >= def.max_attempts {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.claim_token = None;
                job.store_tx(jobs)?;
                fail_definition(&mut def, job.error.clone())?;
                def.store_tx(defs)?;
                return Ok(Some(None));
            }

            job.status = JobStatus::Running;
            job.claimed_by = Some(worker_id.to_string());
            job.claim_token = Some(token);
            job.started_at = Some(now);
            job.heartbeat_at = Some(now);
            job.store_tx(jobs)?;
            Ok(Some(Some(job)))
        })?;

        match outcome {
            Some(Some(job)) => {
                tracing::warn!(
                    definition_id = key.definition_id,
                    job_id = key.job_id,
                    worker_id,
                    attempts = job.attempts,
                    "reclaimed stale migration job"
                );
                Ok(Some(job))
            }
            Some(None) => {
                tracing::error!(
                    definition_id = key.definition_id,
                    job_id = key.job_id,
                    "stale migration job exhausted its attempts"
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Refresh the heartbeat of a running job.
    ///
    /// Fails with `ClaimSuperseded` when the claim was taken over.
    pub fn heartbeat(&self, key: JobKey, token: u64) -> Result<(), MigrationError> {
        run_tx(&self.jobs, |jobs| {
            let mut job = MigrationJob::load_tx(jobs, key)?;
            if job.status != JobStatus::Running || job.claim_token != Some(token) {
                return Err(MigrationError::ClaimSuperseded { job_id: key.job_id });
            }
            job.heartbeat_at = Some(current_timestamp());
            job.store_tx(jobs)
        })
    }

    /// Record the outcome of a claimed job.
    pub fn record_outcome(
        &self,
        key: JobKey,
        token: u64,
        outcome: JobOutcome,
    ) -> Result<Recorded, MigrationError> {
        let now = current_timestamp();

        let recorded = run_tx((&self.definitions, &self.jobs), |(defs, jobs)| {
            let mut job = MigrationJob::load_tx(jobs, key)?;
            if job.status != JobStatus::Running || job.claim_token != Some(token) {
                return Err(MigrationError::ClaimSuperseded { job_id: key.job_id });
            }

            match &outcome {
                JobOutcome::Succeeded { rows } => {
                    job.status = JobStatus::Succeeded;
                    job.rows_processed = *rows;
                    job.finished_at = Some(now);
                    job.claim_token = None;
                    job.error = None;
                    job.store_tx(jobs)?;
                    Ok(Recorded::Succeeded)
                }
                JobOutcome::Failed { error, transient } => {
                    let mut def = MigrationDefinition::load_tx(defs, key.definition_id)?;
                    job.attempts += 1;
                    job.error = Some(error.clone());
                    job.claim_token = None;

                    if *transient && job.attempts < def.max_attempts {
                        let backoff = self.config.backoff_for(job.attempts).as_micros() as u64;
                        job.status = JobStatus::Pending;
                        job.claimed_by = None;
                        job.not_before = now.saturating_add(backoff);
                        job.store_tx(jobs)?;
                        return Ok(Recorded::Retrying {
                            attempts: job.attempts,
                            not_before: job.not_before,
                        });
                    }

                    job.status = JobStatus::Failed;
                    job.finished_at = Some(now);
                    job.store_tx(jobs)?;
                    fail_definition(&mut def, Some(error.clone()))?;
                    def.store_tx(defs)?;
                    Ok(Recorded::Failed)
                }
            }
        })?;

        if recorded == Recorded::Succeeded {
            self.advance_high_water(key.definition_id)?;
        }
        Ok(recorded)
    }

    /// Recompute `completed_through` from the contiguous succeeded prefix.
    ///
    /// The stored value only moves forward, so concurrent callers converge.
    pub fn advance_high_water(&self, definition_id: u64) -> Result<(), MigrationError> {
        let mut through = None;
        for job in self.jobs_for(definition_id)? {
            if job.status != JobStatus::Succeeded {
                break;
            }
            through = Some(job.range.max);
        }
        let through = match through {
            Some(cursor) => cursor,
            None => return Ok(()),
        };

        run_tx(&self.definitions, |defs| {
            let mut def = MigrationDefinition::load_tx(defs, definition_id)?;
            if def.completed_through.as_ref().map_or(true, |c| *c < through) {
                def.completed_through = Some(through.clone());
                def.store_tx(defs)?;
            }
            Ok(())
        })
    }

    /// Delete tracking records of a definition with the given statuses.
    ///
    /// Returns the number of records removed.
    pub fn delete_tracking(
        &self,
        definition_id: u64,
        statuses: &[JobStatus],
    ) -> Result<u64, MigrationError> {
        let mut removed = 0;
        for job in self.jobs_for(definition_id)? {
            if statuses.contains(&job.status) {
                self.jobs.remove(job.key().encode())?;
                removed += 1;
            }
        }
        tracing::info!(definition_id, removed, "deleted job tracking records");
        Ok(removed)
    }

    /// Remove every job of a definition.
    pub fn delete_all(&self, definition_id: u64) -> Result<u64, MigrationError> {
        let mut removed = 0;
        for entry in self.jobs.scan_prefix(definition_id.to_be_bytes()) {
            let (key, _) = entry?;
            self.jobs.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Return failed jobs to pending with a fresh attempt budget.
    pub fn reset_failed(&self, definition_id: u64) -> Result<u64, MigrationError> {
        let mut reset = 0;
        for job in self.jobs_for(definition_id)? {
            if job.status != JobStatus::Failed {
                continue;
            }
            let key = job.key();
            run_tx(&self.jobs, |jobs| {
                let mut job = MigrationJob::load_tx(jobs, key)?;
                if job.status != JobStatus::Failed {
                    return Ok(());
                }
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.not_before = 0;
                job.claimed_by = None;
                job.claim_token = None;
                job.finished_at = None;
                job.store_tx(jobs)
            })?;
            reset += 1;
        }
        Ok(reset)
    }
}

fn check_range(def: &MigrationDefinition, range: &KeyRange) -> Result<(), MigrationError> {
    let anomaly = |message: String| MigrationError::RangeAnomaly {
        definition_id: def.id,
        message,
    };

    if !range.is_valid() {
        return Err(anomaly(format!("range {} is inverted", range)));
    }
    if let Some(last) = &def.last_scheduled {
        if range.min <= *last {
            return Err(anomaly(format!(
                "range {} overlaps already scheduled keys up to {}",
                range, last
            )));
        }
    }
    match &def.bounds {
        Some(bounds) if range.min < bounds.min || range.max > bounds.max => Err(anomaly(
            format!("range {} lies outside bounds {}", range, bounds),
        )),
        None => Err(anomaly("migration has no key bounds".to_string())),
        _ => Ok(()),
    }
}

fn fail_definition(
    def: &mut MigrationDefinition,
    error: Option<String>,
) -> Result<(), MigrationError> {
    if def.status != MigrationStatus::Failed {
        apply_transition(def, MigrationStatus::Failed)?;
    }
    def.error = error;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::registry::tests::sample_definition;
    use crate::value::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: MigrationRegistry,
        tracker: JobTracker,
        def: MigrationDefinition,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let registry = MigrationRegistry::open(&db).unwrap();
        let mut def = sample_definition();
        def.max_attempts = config.max_attempts;
        let tracker = JobTracker::open(&db, config).unwrap();
        let def = registry.create(def).unwrap().into_definition();
        Fixture {
            _dir: dir,
            registry,
            tracker,
            def,
        }
    }

    #[test]
    fn test_create_job_advances_last_scheduled() {
        let f = fixture(EngineConfig::immediate());
        f.tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();

        let def = f.registry.require(f.def.id).unwrap();
        assert_eq!(def.last_scheduled, Some(Cursor::scalar(100)));

        // Stale expectation loses the race.
        assert!(matches!(
            f.tracker.create_job(f.def.id, None, KeyRange::new(101, 200)),
            Err(MigrationError::ScheduleRace { .. })
        ));
    }

    #[test]
    fn test_create_job_rejects_overlap_and_out_of_bounds() {
        let f = fixture(EngineConfig::immediate());
        let last = Cursor::scalar(100);
        f.tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();

        assert!(matches!(
            f.tracker.create_job(f.def.id, Some(&last), KeyRange::new(50, 150)),
            Err(MigrationError::RangeAnomaly { .. })
        ));
        assert!(matches!(
            f.tracker.create_job(f.def.id, Some(&last), KeyRange::new(101, 300)),
            Err(MigrationError::RangeAnomaly { .. })
        ));
    }

    #[test]
    fn test_concurrent_claims_are_exclusive() {
        let f = fixture(EngineConfig::immediate());
        let mut last = None;
        for (min, max) in [(1, 50), (51, 100), (101, 150), (151, 200)] {
            let job = f
                .tracker
                .create_job(f.def.id, last.as_ref(), KeyRange::new(min, max))
                .unwrap();
            last = Some(job.range.max);
        }

        let tracker = Arc::new(f.tracker);
        let def_id = f.def.id;
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(job) = tracker.claim_next(def_id, &format!("w{}", n)).unwrap() {
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut claimed: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        claimed.sort();
        let before = claimed.len();
        claimed.dedup();

        assert_eq!(before, 4);
        assert_eq!(claimed.len(), 4);
    }

    #[test]
    fn test_transient_failure_retries_then_fails_definition() {
        let f = fixture(EngineConfig::immediate().with_max_attempts(2));
        f.tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();

        let job = f.tracker.claim_next(f.def.id, "w").unwrap().unwrap();
        let recorded = f
            .tracker
            .record_outcome(
                job.key(),
                job.claim_token.unwrap(),
                JobOutcome::Failed {
                    error: "lock timeout".into(),
                    transient: true,
                },
            )
            .unwrap();
        assert!(matches!(recorded, Recorded::Retrying { attempts: 1, .. }));

        let job = f.tracker.claim_next(f.def.id, "w").unwrap().unwrap();
        let recorded = f
            .tracker
            .record_outcome(
                job.key(),
                job.claim_token.unwrap(),
                JobOutcome::Failed {
                    error: "lock timeout".into(),
                    transient: true,
                },
            )
            .unwrap();
        assert_eq!(recorded, Recorded::Failed);

        let def = f.registry.require(f.def.id).unwrap();
        assert_eq!(def.status, MigrationStatus::Failed);
        assert_eq!(def.error.as_deref(), Some("lock timeout"));
        assert_eq!(f.tracker.job_counts(f.def.id).unwrap().failed, 1);
    }

    #[test]
    fn test_structural_failure_is_terminal() {
        let f = fixture(EngineConfig::immediate());
        f.tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();
        let job = f.tracker.claim_next(f.def.id, "w").unwrap().unwrap();

        let recorded = f
            .tracker
            .record_outcome(
                job.key(),
                job.claim_token.unwrap(),
                JobOutcome::Failed {
                    error: "constraint violation".into(),
                    transient: false,
                },
            )
            .unwrap();
        assert_eq!(recorded, Recorded::Failed);
        assert_eq!(
            f.registry.require(f.def.id).unwrap().status,
            MigrationStatus::Failed
        );

        assert_eq!(f.tracker.reset_failed(f.def.id).unwrap(), 1);
        let job = f.tracker.jobs_for(f.def.id).unwrap().remove(0);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_stale_claim_is_reclaimed_and_superseded() {
        let config = EngineConfig::immediate().with_stale_job_timeout(Duration::ZERO);
        let f = fixture(config);
        f.tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();

        let first = f.tracker.claim_next(f.def.id, "dead").unwrap().unwrap();
        let second = f.tracker.claim_next(f.def.id, "alive").unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 1);
        assert_eq!(second.claimed_by.as_deref(), Some("alive"));

        let stale = f.tracker.record_outcome(
            first.key(),
            first.claim_token.unwrap(),
            JobOutcome::Succeeded { rows: 10 },
        );
        assert!(matches!(stale, Err(MigrationError::ClaimSuperseded { .. })));
        assert!(matches!(
            f.tracker.heartbeat(first.key(), first.claim_token.unwrap()),
            Err(MigrationError::ClaimSuperseded { .. })
        ));

        f.tracker
            .record_outcome(
                second.key(),
                second.claim_token.unwrap(),
                JobOutcome::Succeeded { rows: 10 },
            )
            .unwrap();
        let job = f.tracker.get(second.key()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[test]
    fn test_high_water_follows_contiguous_prefix() {
        let f = fixture(EngineConfig::immediate());
        let a = f
            .tracker
            .create_job(f.def.id, None, KeyRange::new(1, 100))
            .unwrap();
        let b = f
            .tracker
            .create_job(f.def.id, Some(&a.range.max), KeyRange::new(101, 200))
            .unwrap();

        let claimed_a = f.tracker.claim_job(a.key(), "w1").unwrap().unwrap();
        let claimed_b = f.tracker.claim_job(b.key(), "w2").unwrap().unwrap();
        assert!(f.tracker.claim_job(b.key(), "w3").unwrap().is_none());

        f.tracker
            .record_outcome(b.key(), claimed_b.claim_token.unwrap(), JobOutcome::Succeeded { rows: 1 })
            .unwrap();
        assert_eq!(f.registry.require(f.def.id).unwrap().completed_through, None);

        f.tracker
            .record_outcome(a.key(), claimed_a.claim_token.unwrap(), JobOutcome::Succeeded { rows: 1 })
            .unwrap();
        assert_eq!(
            f.registry.require(f.def.id).unwrap().completed_through,
            Some(Cursor::scalar(200))
        );

        let counts = f.tracker.job_counts(f.def.id).unwrap();
        assert_eq!(counts.succeeded, 2);
        assert_eq!(counts.rows_processed, 2);

        assert_eq!(
            f.tracker
                .delete_tracking(f.def.id, &[JobStatus::Succeeded])
                .unwrap(),
            2
        );
        assert!(f.tracker.jobs_for(f.def.id).unwrap().is_empty());
    }
}
