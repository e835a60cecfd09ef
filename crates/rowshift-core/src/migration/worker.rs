//! Background worker threads driving the scheduler.
//!
//! Workers share nothing but a shutdown flag. Job ownership is decided by
//! the job tracker, so a pool can be stopped at any point and another pool,
//! in this process or another one, picks up where it left off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::config::WorkerPoolConfig;
use super::scheduler::{Scheduler, TickOutcome};

/// A pool of OS threads polling the scheduler.
pub struct WorkerPool {
    /// Shutdown signal.
    shutdown: Arc<AtomicBool>,
    /// Worker thread handles.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Start `config.workers` threads.
    pub fn start(scheduler: Arc<Scheduler>, config: WorkerPoolConfig) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let pid = std::process::id();

        let handles = (0..config.workers)
            .map(|n| {
                let worker_id = format!("worker-{}-{}", pid, n);
                let scheduler = scheduler.clone();
                let shutdown = shutdown.clone();
                let config = config.clone();
                thread::spawn(move || Self::worker_loop(&worker_id, &scheduler, &config, &shutdown))
            })
            .collect();

        tracing::info!(workers = config.workers, "started migration workers");
        Self {
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Signal shutdown and wait for every thread to finish its current job.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("stopped migration workers");
    }

    /// Whether any worker thread is still running.
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    fn worker_loop(
        worker_id: &str,
        scheduler: &Scheduler,
        config: &WorkerPoolConfig,
        shutdown: &AtomicBool,
    ) {
        tracing::debug!(worker_id, "migration worker started");

        while !shutdown.load(Ordering::SeqCst) {
            match scheduler.run_once(worker_id) {
                Ok(TickOutcome::Idle) => thread::sleep(config.poll_interval),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        worker_id,
                        error = ?e,
                        "migration worker step failed"
                    );
                    thread::sleep(config.poll_interval);
                }
            }
        }

        tracing::debug!(worker_id, "migration worker stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::config::EngineConfig;
    use crate::migration::registry::MigrationStatus;
    use crate::migration::scheduler::EnqueueRequest;
    use crate::migration::transform::TransformationRegistry;
    use crate::storage::{StorageConfig, TableStore};
    use crate::value::{Cursor, Row, Value};
    use std::time::{Duration, Instant};

    #[test]
    fn test_pool_completes_migration() {
        let store = TableStore::open(StorageConfig::temporary()).unwrap();
        store.create_table("events", &["id"]).unwrap();
        for id in 1..=500 {
            store
                .insert("events", Row::new().with("id", id).with("amount", id))
                .unwrap();
        }
        let scheduler = Arc::new(
            Scheduler::new(
                Arc::new(store),
                Arc::new(TransformationRegistry::with_builtins()),
                EngineConfig::immediate(),
            )
            .unwrap(),
        );
        let def = scheduler
            .enqueue(
                EnqueueRequest::new("copy_column", "events", "id")
                    .with_arguments(vec![Value::from("amount"), Value::from("amount_v2")])
                    .with_batch_sizes(50, 20),
            )
            .unwrap();

        let pool = WorkerPool::start(
            scheduler.clone(),
            WorkerPoolConfig::default()
                .with_workers(4)
                .with_poll_interval(Duration::from_millis(5)),
        );
        assert!(pool.is_running());

        let deadline = Instant::now() + Duration::from_secs(30);
        while scheduler.registry().require(def.id).unwrap().status != MigrationStatus::Finished {
            assert!(Instant::now() < deadline, "migration did not finish");
            thread::sleep(Duration::from_millis(10));
        }
        pool.stop();
        assert!(!pool.is_running());

        let counts = scheduler.tracker().job_counts(def.id).unwrap();
        assert_eq!(counts.succeeded, 10);
        assert_eq!(counts.rows_processed, 500);
        for id in [1, 250, 500] {
            let row = scheduler
                .store()
                .get("events", &Cursor::scalar(id))
                .unwrap()
                .unwrap();
            assert_eq!(row.get("amount_v2"), Some(&Value::Int64(id)));
        }
    }
}
