use crate::config::Config;
use crate::db::{self, FileState, JobState};
use crate::services::scanner::{self, ScannedFile};
use crate::services::worker::FileTask;
use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Periodically re-walks the sources of settled and running jobs and feeds
/// new or modified files back into the upload queue. Only ever touches rows
/// the queue owns; a row a worker holds is left alone.
pub struct Monitor {
    conn: Arc<Mutex<Connection>>,
    config: Config,
    task_tx: mpsc::Sender<FileTask>,
    cancel: Arc<AtomicBool>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Monitor {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        config: Config,
        task_tx: mpsc::Sender<FileTask>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            conn,
            config,
            task_tx,
            cancel,
        }
    }

    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.monitor_interval_secs);
        if interval.is_zero() {
            return;
        }
        info!(
            "File monitor started ({}s interval, {}s stability threshold)",
            self.config.monitor_interval_secs, self.config.stability_threshold_secs
        );
        loop {
            let deadline = tokio::time::Instant::now() + interval;
            while tokio::time::Instant::now() < deadline {
                if self.cancel.load(Ordering::Relaxed) {
                    info!("File monitor stopped");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            if let Err(e) = self.tick().await {
                error!("Monitor pass failed: {:#}", e);
            }
        }
    }

    /// One monitoring pass over every job whose source may still change
    /// something: completed jobs (re-upload on modification), running jobs
    /// (pick up files created mid-flight), and failed jobs (a fixed source
    /// supersedes the failure).
    pub async fn tick(&self) -> Result<()> {
        let jobs = {
            let conn = db::lock_conn(&self.conn)?;
            db::list_jobs_by_state(
                &conn,
                &[JobState::Completed, JobState::InProgress, JobState::Failed],
            )?
        };
        let now = unix_now();

        for job in jobs {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(());
            }
            let scanned = match scanner::walk_source(
                Path::new(&job.source_folder),
                job.pattern.as_deref(),
            )
            .await
            {
                Ok(scanned) => scanned,
                Err(e) => {
                    error!("Monitor cannot scan job {}: {}", job.id, e);
                    continue;
                }
            };

            for found in &scanned {
                // A file still being written would be captured half-done;
                // wait until its mtime has settled.
                if now - found.mtime < self.config.stability_threshold_secs as i64 {
                    debug!(
                        "File {} of job {} modified too recently, skipping this pass",
                        found.path, job.id
                    );
                    continue;
                }
                let enqueued = {
                    let conn = db::lock_conn(&self.conn)?;
                    self.reconcile_file(&conn, &job.id, job.state, found)?
                };
                if enqueued {
                    let _ = self
                        .task_tx
                        .send(FileTask {
                            job_id: job.id.clone(),
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Returns whether a task should be queued for this file.
    fn reconcile_file(
        &self,
        conn: &Connection,
        job_id: &str,
        job_state: JobState,
        found: &ScannedFile,
    ) -> Result<bool> {
        match db::get_file_by_path(conn, job_id, &found.path)? {
            None => {
                db::create_files_bulk(conn, job_id, std::slice::from_ref(found))?;
                info!("New file {} found for job {}", found.path, job_id);
                if job_state.is_terminal() {
                    db::set_job_state(conn, job_id, JobState::InProgress)?;
                }
                Ok(true)
            }
            Some(existing)
                if existing.state != FileState::InProgress
                    && (existing.mtime != found.mtime || existing.size != found.size) =>
            {
                if !db::update_file_stat(conn, existing.id, found.mtime, found.size)? {
                    return Ok(false);
                }
                info!(
                    "File {} of job {} changed on disk, re-queueing for upload",
                    found.path, job_id
                );
                if job_state.is_terminal() {
                    db::set_job_state(conn, job_id, JobState::InProgress)?;
                }
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileRow;
    use tempfile::TempDir;

    fn setup(
        monitor_interval: u64,
        stability: u64,
    ) -> (Monitor, Arc<Mutex<Connection>>, mpsc::Receiver<FileTask>) {
        let conn = Arc::new(Mutex::new(db::open_in_memory().unwrap()));
        let config = Config {
            monitor_interval_secs: monitor_interval,
            stability_threshold_secs: stability,
            ..Config::default()
        };
        let (task_tx, task_rx) = mpsc::channel(16);
        let monitor = Monitor::new(
            conn.clone(),
            config,
            task_tx,
            Arc::new(AtomicBool::new(false)),
        );
        (monitor, conn, task_rx)
    }

    fn snapshot(conn: &Arc<Mutex<Connection>>, job_id: &str) -> Vec<FileRow> {
        let conn = conn.lock().unwrap();
        db::list_files(&conn, job_id).unwrap()
    }

    #[tokio::test]
    async fn test_tick_over_unchanged_source_mutates_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let (monitor, conn, mut task_rx) = setup(60, 0);
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", dir.path().to_str().unwrap(), "bucket", None).unwrap();
            let scanned = scan_all(dir.path()).await;
            db::create_files_bulk(&c, "job-1", &scanned).unwrap();
            let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
            db::mark_file(&c, file.id, FileState::Uploaded, None).unwrap();
            db::set_job_state(&c, "job-1", JobState::Completed).unwrap();
        }

        let before = snapshot(&conn, "job-1");
        monitor.tick().await.unwrap();
        let after = snapshot(&conn, "job-1");

        assert_eq!(before, after);
        assert!(task_rx.try_recv().is_err());
        let c = conn.lock().unwrap();
        assert_eq!(
            db::get_job(&c, "job-1").unwrap().unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_tick_requeues_changed_file_and_reopens_job() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let (monitor, conn, mut task_rx) = setup(60, 0);
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", dir.path().to_str().unwrap(), "bucket", None).unwrap();
            // Stored stat differs from disk, as if the file changed after upload.
            db::create_files_bulk(
                &c,
                "job-1",
                &[ScannedFile {
                    path: "a.txt".to_string(),
                    mtime: 1,
                    size: 1,
                }],
            )
            .unwrap();
            let file = db::claim_next_pending_file(&c, "job-1").unwrap().unwrap();
            db::mark_file(&c, file.id, FileState::Uploaded, None).unwrap();
            db::set_job_state(&c, "job-1", JobState::Completed).unwrap();
        }

        monitor.tick().await.unwrap();

        let files = snapshot(&conn, "job-1");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].state, FileState::Pending);
        assert_eq!(files[0].size, 5);
        assert!(task_rx.try_recv().is_ok());
        let c = conn.lock().unwrap();
        assert_eq!(
            db::get_job(&c, "job-1").unwrap().unwrap().state,
            JobState::InProgress
        );
    }

    #[tokio::test]
    async fn test_tick_skips_files_inside_stability_window() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fresh.txt"), b"just written").unwrap();

        let (monitor, conn, mut task_rx) = setup(60, 3600);
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", dir.path().to_str().unwrap(), "bucket", None).unwrap();
            db::set_job_state(&c, "job-1", JobState::Completed).unwrap();
        }

        monitor.tick().await.unwrap();

        assert!(snapshot(&conn, "job-1").is_empty());
        assert!(task_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tick_tracks_new_files_in_completed_job() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("late.txt"), b"arrived later").unwrap();

        let (monitor, conn, mut task_rx) = setup(60, 0);
        {
            let c = conn.lock().unwrap();
            db::create_job(&c, "job-1", dir.path().to_str().unwrap(), "bucket", None).unwrap();
            db::set_job_state(&c, "job-1", JobState::Completed).unwrap();
        }

        monitor.tick().await.unwrap();

        let files = snapshot(&conn, "job-1");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "late.txt");
        assert_eq!(files[0].state, FileState::Pending);
        assert!(task_rx.try_recv().is_ok());
    }

    async fn scan_all(path: &std::path::Path) -> Vec<ScannedFile> {
        scanner::walk_source(path, None).await.unwrap()
    }
}
