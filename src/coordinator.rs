use crate::config::Config;
use crate::db::{self, DbError, FileState, JobRow, JobState};
use crate::services::monitor::Monitor;
use crate::services::scanner::{self, ScanError};
use crate::services::store::{ErrorKind, ObjectStore};
use crate::services::worker::{Completion, FileTask, WorkerPool};
use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upload job '{0}' already exists")]
    JobExists(String),
    #[error("upload job '{0}' not found")]
    JobNotFound(String),
    #[error("source folder does not exist: {0}")]
    SourceMissing(String),
    #[error(transparent)]
    InvalidPattern(#[from] ScanError),
    #[error(transparent)]
    Db(DbError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::JobExists(id) => Self::JobExists(id),
            other => Self::Db(other),
        }
    }
}

/// Boundary payload for job submission. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewJob {
    pub id: Option<String>,
    pub source_folder: String,
    pub destination_bucket: String,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub progress: f64,
    pub total_files: i64,
    pub completed_files: i64,
    pub failed_files: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl JobStatus {
    fn new(job: JobRow, summary: db::JobSummary) -> Self {
        Self {
            id: job.id,
            state: job.state,
            progress: summary.progress(),
            total_files: summary.total,
            completed_files: summary.uploaded,
            failed_files: summary.failed,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    pub path: String,
    pub state: FileState,
    pub size: i64,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Drives jobs from submission to a terminal state: expands a job into file
/// rows, feeds the worker pool through a bounded queue, aggregates worker
/// completions into job-level transitions, and recovers interrupted work on
/// startup. Also hosts the monitor loop.
#[derive(Clone)]
pub struct Coordinator {
    config: Config,
    conn: Arc<Mutex<Connection>>,
    store: Arc<dyn ObjectStore>,
    cancel: Arc<AtomicBool>,
    task_tx: mpsc::Sender<FileTask>,
    completion_tx: mpsc::Sender<Completion>,
    task_rx: Arc<Mutex<Option<mpsc::Receiver<FileTask>>>>,
    completion_rx: Arc<Mutex<Option<mpsc::Receiver<Completion>>>>,
    pool: Arc<Mutex<Option<WorkerPool>>>,
}

impl Coordinator {
    pub fn new(config: Config, conn: Arc<Mutex<Connection>>, store: Arc<dyn ObjectStore>) -> Self {
        let capacity = config.queue_capacity();
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (completion_tx, completion_rx) = mpsc::channel(capacity.max(16));
        Self {
            config,
            conn,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
            task_tx,
            completion_tx,
            task_rx: Arc::new(Mutex::new(Some(task_rx))),
            completion_rx: Arc::new(Mutex::new(Some(completion_rx))),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the recovery pass, then bring up the worker pool, the completion
    /// loop, and the monitor. Interrupted jobs are re-processed.
    pub async fn start(&self) -> anyhow::Result<()> {
        let task_rx = self
            .task_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("engine startup state poisoned"))?
            .take()
            .context("engine already started")?;
        let completion_rx = self
            .completion_rx
            .lock()
            .map_err(|_| anyhow::anyhow!("engine startup state poisoned"))?
            .take()
            .context("engine already started")?;

        // The reset runs before any worker consumes, so no row has a
        // contending owner.
        let recovered = self.recover().await?;

        let pool = WorkerPool::spawn(
            self.conn.clone(),
            self.store.clone(),
            self.config.clone(),
            task_rx,
            self.completion_tx.clone(),
            self.cancel.clone(),
        );
        *self
            .pool
            .lock()
            .map_err(|_| anyhow::anyhow!("engine startup state poisoned"))? = Some(pool);

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.completion_loop(completion_rx).await });

        if self.config.monitor_interval_secs > 0 {
            let monitor = Monitor::new(
                self.conn.clone(),
                self.config.clone(),
                self.task_tx.clone(),
                self.cancel.clone(),
            );
            tokio::spawn(monitor.run());
        }

        for job_id in recovered {
            self.spawn_process_job(job_id);
        }
        Ok(())
    }

    /// Signal every worker and the monitor to stop, then wait for the pool
    /// to drain. In-flight files stay IN_PROGRESS for the next start.
    pub async fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let pool = match self.pool.lock() {
            Ok(mut pool) => pool.take(),
            Err(_) => None,
        };
        if let Some(pool) = pool {
            pool.join().await;
        }
        info!("Engine stopped");
    }

    /// Insert the job and return immediately; expansion happens in the
    /// background.
    pub fn submit_job(&self, new_job: NewJob) -> Result<JobRow, EngineError> {
        if !Path::new(&new_job.source_folder).is_dir() {
            return Err(EngineError::SourceMissing(new_job.source_folder));
        }
        if let Some(pattern) = new_job.pattern.as_deref() {
            glob::Pattern::new(pattern).map_err(|source| ScanError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        }

        let id = new_job.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = {
            let conn = db::lock_conn(&self.conn)?;
            db::create_job(
                &conn,
                &id,
                &new_job.source_folder,
                &new_job.destination_bucket,
                new_job.pattern.as_deref(),
            )?
        };
        info!(
            "Accepted upload job {} ({} -> s3://{})",
            job.id, job.source_folder, job.destination_bucket
        );
        self.spawn_process_job(job.id.clone());
        Ok(job)
    }

    /// Re-enqueue every failed file of the job and run expansion again.
    pub fn retry_job(&self, job_id: &str) -> Result<(), EngineError> {
        {
            let conn = db::lock_conn(&self.conn)?;
            if db::get_job(&conn, job_id)?.is_none() {
                return Err(EngineError::JobNotFound(job_id.to_string()));
            }
            let reset = db::reset_failed_files(&conn, job_id)?;
            if reset > 0 {
                info!("Retrying {} failed files of job {}", reset, job_id);
            }
        }
        self.spawn_process_job(job_id.to_string());
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        let conn = db::lock_conn(&self.conn)?;
        let job = db::get_job(&conn, job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let summary = db::summarize_job(&conn, job_id)?;
        Ok(JobStatus::new(job, summary))
    }

    pub fn list_jobs(&self) -> Result<Vec<JobStatus>, EngineError> {
        let conn = db::lock_conn(&self.conn)?;
        let mut statuses = Vec::new();
        for job in db::list_jobs(&conn)? {
            let summary = db::summarize_job(&conn, &job.id)?;
            statuses.push(JobStatus::new(job, summary));
        }
        Ok(statuses)
    }

    pub fn list_files(&self, job_id: &str) -> Result<Vec<FileStatus>, EngineError> {
        let conn = db::lock_conn(&self.conn)?;
        if db::get_job(&conn, job_id)?.is_none() {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        let files = db::list_files(&conn, job_id)?
            .into_iter()
            .map(|f| FileStatus {
                path: f.path,
                state: f.state,
                size: f.size,
                failure_reason: f.failure_reason,
                created_at: f.created_at,
                updated_at: f.updated_at,
            })
            .collect();
        Ok(files)
    }

    fn spawn_process_job(&self, job_id: String) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.expand_job(&job_id).await {
                error!("Expansion failed for job {}: {:#}", job_id, e);
                let marked = || -> anyhow::Result<()> {
                    let conn = db::lock_conn(&coordinator.conn)?;
                    db::set_job_state(&conn, &job_id, JobState::Failed)?;
                    Ok(())
                }();
                if let Err(e) = marked {
                    error!("Failed to mark job {} as failed: {:#}", job_id, e);
                }
            }
        });
    }

    /// Walk the source, materialize file rows, and queue every pending file.
    /// Idempotent: re-running over an already-expanded job inserts nothing
    /// and re-queues only what is still pending.
    async fn expand_job(&self, job_id: &str) -> anyhow::Result<()> {
        let job = {
            let conn = db::lock_conn(&self.conn)?;
            db::get_job(&conn, job_id)?.context("job vanished before expansion")?
        };
        {
            let conn = db::lock_conn(&self.conn)?;
            db::set_job_state(&conn, job_id, JobState::InProgress)?;
        }

        let scanned =
            scanner::walk_source(Path::new(&job.source_folder), job.pattern.as_deref()).await?;
        info!(
            "Expansion found {} matching files for job {}",
            scanned.len(),
            job_id
        );

        let pending = {
            let conn = db::lock_conn(&self.conn)?;
            let inserted = db::create_files_bulk(&conn, job_id, &scanned)?;
            if inserted > 0 {
                debug!("Inserted {} new file rows for job {}", inserted, job_id);
            }
            db::list_files_by_state(&conn, job_id, FileState::Pending)?
        };

        if pending.is_empty() {
            // Nothing left to schedule; the job may already be decidable.
            let conn = db::lock_conn(&self.conn)?;
            self.finalize_job(&conn, job_id)?;
            return Ok(());
        }

        for _ in 0..pending.len() {
            self.task_tx
                .send(FileTask {
                    job_id: job_id.to_string(),
                })
                .await
                .context("worker queue closed")?;
        }
        Ok(())
    }

    /// Move the job to a terminal state once no file can change on its own.
    /// The store summary is authoritative; in-memory bookkeeping is not.
    fn finalize_job(&self, conn: &Connection, job_id: &str) -> Result<(), DbError> {
        let summary = db::summarize_job(conn, job_id)?;
        if !summary.settled() {
            return Ok(());
        }
        let state = if summary.failed > 0 {
            JobState::Failed
        } else {
            JobState::Completed
        };
        if db::set_job_state(conn, job_id, state)? {
            info!(
                "Job {} finished as {} ({}/{} uploaded, {} failed)",
                job_id,
                state.as_str(),
                summary.uploaded,
                summary.total,
                summary.failed
            );
        }
        Ok(())
    }

    async fn completion_loop(self, mut completion_rx: mpsc::Receiver<Completion>) {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let completion =
                match tokio::time::timeout(Duration::from_millis(500), completion_rx.recv()).await
                {
                    Ok(Some(completion)) => completion,
                    Ok(None) => break,
                    Err(_) => continue,
                };
            debug!(
                "File {} of job {} finished: {:?}",
                completion.file_id, completion.job_id, completion.outcome
            );
            let reconciled = || -> anyhow::Result<()> {
                let conn = db::lock_conn(&self.conn)?;
                self.finalize_job(&conn, &completion.job_id)?;
                Ok(())
            }();
            if let Err(e) = reconciled {
                error!(
                    "Failed to reconcile job {} after completion: {:#}",
                    completion.job_id, e
                );
            }
        }
        debug!("Completion loop stopped");
    }

    /// Startup recovery over every non-terminal job: files left IN_PROGRESS
    /// by a dead run go back to PENDING, and (optionally) uploaded files are
    /// re-verified against the bucket. Returns the jobs to re-process.
    async fn recover(&self) -> anyhow::Result<Vec<String>> {
        let jobs = {
            let conn = db::lock_conn(&self.conn)?;
            db::list_jobs_by_state(&conn, &[JobState::Pending, JobState::InProgress])?
        };
        if jobs.is_empty() {
            info!("No interrupted jobs to recover");
            return Ok(Vec::new());
        }
        info!("Recovering {} interrupted jobs", jobs.len());

        for job in &jobs {
            let reset = {
                let conn = db::lock_conn(&self.conn)?;
                db::reset_in_progress_files(&conn, &job.id)?
            };
            if reset > 0 {
                info!(
                    "Reset {} in-flight files of job {} back to pending",
                    reset, job.id
                );
            }
            if self.config.verify_uploaded_on_recovery {
                self.verify_uploaded(job).await?;
            }
        }
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    async fn verify_uploaded(&self, job: &JobRow) -> anyhow::Result<()> {
        let uploaded = {
            let conn = db::lock_conn(&self.conn)?;
            db::list_files_by_state(&conn, &job.id, FileState::Uploaded)?
        };
        for file in uploaded {
            let key = format!("{}/{}", job.id, file.path);
            let checked = match tokio::time::timeout(
                self.config.part_timeout(),
                self.store.head_object(&job.destination_bucket, &key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    warn!("Timed out verifying object {}, leaving it as uploaded", key);
                    continue;
                }
            };
            match checked {
                Ok(stat) if stat.size == file.size => {}
                Ok(stat) => {
                    warn!(
                        "Object {} has size {} but {} is recorded, re-queueing",
                        key, stat.size, file.size
                    );
                    let conn = db::lock_conn(&self.conn)?;
                    db::update_file_stat(&conn, file.id, file.mtime, file.size)?;
                }
                Err(e) if e.kind == ErrorKind::NotFound => {
                    warn!("Object {} missing from bucket, re-queueing", key);
                    let conn = db::lock_conn(&self.conn)?;
                    db::update_file_stat(&conn, file.id, file.mtime, file.size)?;
                }
                Err(e) => warn!("Could not verify object {}: {}", key, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::scanner::ScannedFile;
    use crate::services::store::MemoryStore;

    fn scanned(path: &str) -> ScannedFile {
        ScannedFile {
            path: path.to_string(),
            mtime: 1,
            size: 1,
        }
    }

    fn setup() -> (Coordinator, Arc<Mutex<Connection>>) {
        let conn = Arc::new(Mutex::new(db::open_in_memory().unwrap()));
        let store = Arc::new(MemoryStore::new());
        let coordinator = Coordinator::new(Config::default(), conn.clone(), store);
        (coordinator, conn)
    }

    #[tokio::test]
    async fn test_submit_rejects_missing_source() {
        let (coordinator, _conn) = setup();
        let err = coordinator
            .submit_job(NewJob {
                id: None,
                source_folder: "/definitely/not/here".to_string(),
                destination_bucket: "bucket".to_string(),
                pattern: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_pattern() {
        let dir = tempfile::TempDir::new().unwrap();
        let (coordinator, _conn) = setup();
        let err = coordinator
            .submit_job(NewJob {
                id: None,
                source_folder: dir.path().to_string_lossy().to_string(),
                destination_bucket: "bucket".to_string(),
                pattern: Some("[".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn test_get_job_reports_not_found() {
        let (coordinator, _conn) = setup();
        let err = coordinator.get_job("nope").unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_finalize_requires_settled_summary() {
        let (coordinator, conn) = setup();
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", "/data", "bucket", None).unwrap();
            db::set_job_state(&c, "job-1", JobState::InProgress).unwrap();
            db::create_files_bulk(&c, "job-1", &[scanned("a"), scanned("b")]).unwrap();
        }

        {
            let c = conn.lock().unwrap();
            coordinator.finalize_job(&c, "job-1").unwrap();
            assert_eq!(
                db::get_job(&c, "job-1").unwrap().unwrap().state,
                JobState::InProgress
            );
        }

        {
            let c = conn.lock().unwrap();
            for _ in 0..2 {
                let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
                db::mark_file(&c, file.id, FileState::Uploaded, None).unwrap();
            }
            coordinator.finalize_job(&c, "job-1").unwrap();
            assert_eq!(
                db::get_job(&c, "job-1").unwrap().unwrap().state,
                JobState::Completed
            );
        }
    }

    #[tokio::test]
    async fn test_finalize_prefers_failed_over_completed() {
        let (coordinator, conn) = setup();
        let c = conn.lock().unwrap();
        db::create_job(&c, "job-1", "/data", "bucket", None).unwrap();
        db::set_job_state(&c, "job-1", JobState::InProgress).unwrap();
        db::create_files_bulk(&c, "job-1", &[scanned("a"), scanned("b")]).unwrap();
        let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
        db::mark_file(&c, file.id, FileState::Uploaded, None).unwrap();
        let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
        db::mark_file(&c, file.id, FileState::Failed, Some("boom")).unwrap();

        coordinator.finalize_job(&c, "job-1").unwrap();
        assert_eq!(
            db::get_job(&c, "job-1").unwrap().unwrap().state,
            JobState::Failed
        );
    }

    #[tokio::test]
    async fn test_status_progress_derives_from_counts() {
        let (coordinator, conn) = setup();
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", "/data", "bucket", None).unwrap();
            db::create_files_bulk(
                &c,
                "job-1",
                &[scanned("a"), scanned("b"), scanned("c"), scanned("d")],
            )
            .unwrap();
            let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
            db::mark_file(&c, file.id, FileState::Uploaded, None).unwrap();
        }

        let status = coordinator.get_job("job-1").unwrap();
        assert_eq!(status.total_files, 4);
        assert_eq!(status.completed_files, 1);
        assert!((status.progress - 0.25).abs() < f64::EPSILON);
    }
}
