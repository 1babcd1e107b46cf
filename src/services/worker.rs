use crate::config::Config;
use crate::db::{self, FileRow, FileState, JobRow};
use crate::services::scanner;
use crate::services::store::{ObjectStore, StoreError};
use anyhow::Result;
use rusqlite::Connection;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A unit of queued work: some pending file of this job wants uploading.
/// Workers resolve it to a concrete row by claiming atomically, so a stale
/// task (the file was already taken or re-stated) is simply a no-op.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub job_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub job_id: String,
    pub file_id: i64,
    pub outcome: UploadOutcome,
}

/// Exponential backoff for transient object store errors: 0.5s, 1s, 2s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2_u64.pow(attempt))
}

pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        conn: Arc<Mutex<Connection>>,
        store: Arc<dyn ObjectStore>,
        config: Config,
        task_rx: mpsc::Receiver<FileTask>,
        completion_tx: mpsc::Sender<Completion>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let mut handles = Vec::with_capacity(config.worker_concurrency);
        for worker_id in 0..config.worker_concurrency {
            let worker = Worker {
                worker_id,
                conn: conn.clone(),
                store: store.clone(),
                config: config.clone(),
                completion_tx: completion_tx.clone(),
                cancel: cancel.clone(),
            };
            let rx = task_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        Self { handles }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

enum Verdict {
    Uploaded,
    Failed,
    Cancelled,
}

enum UploadError {
    Cancelled,
    Failed(String),
}

struct Worker {
    worker_id: usize,
    conn: Arc<Mutex<Connection>>,
    store: Arc<dyn ObjectStore>,
    config: Config,
    completion_tx: mpsc::Sender<Completion>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FileTask>>>) {
        debug!("Worker {} started", self.worker_id);
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let task = {
                let mut rx = task_rx.lock().await;
                match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            };
            if let Err(e) = self.process_task(&task).await {
                // A state store we cannot write to makes every guarantee
                // void; stop the whole engine and let recovery sort it out.
                error!(
                    "Worker {}: state store failure, stopping engine: {:#}",
                    self.worker_id, e
                );
                self.cancel.store(true, Ordering::Relaxed);
                break;
            }
        }
        debug!("Worker {} stopped", self.worker_id);
    }

    async fn process_task(&self, task: &FileTask) -> Result<()> {
        let claimed = {
            let conn = db::lock_conn(&self.conn)?;
            let Some(job) = db::get_job(&conn, &task.job_id)? else {
                warn!("Job {} vanished before upload", task.job_id);
                return Ok(());
            };
            db::claim_next_pending_file(&conn, &task.job_id)?.map(|file| (job, file))
        };
        let Some((job, file)) = claimed else {
            return Ok(());
        };
        debug!(
            "Worker {} claimed file {} ({}) of job {}",
            self.worker_id, file.id, file.path, job.id
        );

        let verdict = self.upload_file(&job, &file).await?;
        let outcome = match verdict {
            Verdict::Uploaded => UploadOutcome::Uploaded,
            Verdict::Failed => UploadOutcome::Failed,
            // Row stays IN_PROGRESS; the recovery pass will re-enqueue it.
            Verdict::Cancelled => return Ok(()),
        };
        let _ = self
            .completion_tx
            .send(Completion {
                job_id: job.id,
                file_id: file.id,
                outcome,
            })
            .await;
        Ok(())
    }

    async fn upload_file(&self, job: &JobRow, file: &FileRow) -> Result<Verdict> {
        let local_path = Path::new(&job.source_folder).join(&file.path);
        let metadata = match tokio::fs::metadata(&local_path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                return self.fail_file(
                    file,
                    &format!("source missing: {}", local_path.display()),
                );
            }
        };

        // The stat observed now is the canonical record for this upload.
        let size = metadata.len();
        let mtime = scanner::unix_mtime(&metadata);
        if mtime != file.mtime || size as i64 != file.size {
            let conn = db::lock_conn(&self.conn)?;
            db::refresh_file_stat(&conn, file.id, mtime, size as i64)?;
        }

        let bucket = job.destination_bucket.as_str();
        let key = format!("{}/{}", job.id, file.path);

        let upload = if size <= self.config.chunk_size {
            self.single_shot(&local_path, bucket, &key).await
        } else {
            self.multipart(&local_path, bucket, &key, size).await
        };
        match upload {
            Ok(()) => {}
            Err(UploadError::Cancelled) => {
                info!("Upload of {} cancelled, leaving it for recovery", file.path);
                return Ok(Verdict::Cancelled);
            }
            Err(UploadError::Failed(reason)) => return self.fail_file(file, &reason),
        }

        // Never trust a write we have not read back.
        match self.timed(self.store.head_object(bucket, &key)).await {
            Ok(stat) if stat.size == size as i64 => {}
            Ok(stat) => {
                warn!(
                    "Object {} has size {} but {} was uploaded, deleting it",
                    key, stat.size, size
                );
                if let Err(e) = self.timed(self.store.delete_object(bucket, &key)).await {
                    warn!("Failed to delete mismatched object {}: {}", key, e);
                }
                return self.fail_file(file, "size mismatch after upload");
            }
            Err(e) => {
                return self.fail_file(file, &format!("upload verification failed: {e}"));
            }
        }

        {
            let conn = db::lock_conn(&self.conn)?;
            db::mark_file(&conn, file.id, FileState::Uploaded, None)?;
        }
        info!(
            "Uploaded {} ({} bytes) to s3://{}/{}",
            file.path, size, bucket, key
        );
        Ok(Verdict::Uploaded)
    }

    fn fail_file(&self, file: &FileRow, reason: &str) -> Result<Verdict> {
        warn!("File {} failed: {}", file.path, reason);
        let conn = db::lock_conn(&self.conn)?;
        db::mark_file(&conn, file.id, FileState::Failed, Some(reason))?;
        Ok(Verdict::Failed)
    }

    async fn single_shot(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
    ) -> Result<(), UploadError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::Failed(format!("source read failed: {e}")))?;
        self.retry_store("put_object", || {
            self.timed(self.store.put_object(bucket, key, &body))
        })
        .await
        .map_err(|e| UploadError::Failed(format!("put_object failed: {e}")))?;
        Ok(())
    }

    async fn multipart(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        size: u64,
    ) -> Result<(), UploadError> {
        let upload_id = self
            .retry_store("create_multipart_upload", || {
                self.timed(self.store.initiate_multipart(bucket, key))
            })
            .await
            .map_err(|e| UploadError::Failed(format!("initiate multipart failed: {e}")))?;
        debug!(
            "Started multipart upload {} for {} ({} parts)",
            upload_id,
            key,
            size.div_ceil(self.config.chunk_size)
        );

        let result = self.upload_parts(path, bucket, key, &upload_id, size).await;
        if let Err(err) = result {
            if let Err(abort_err) = self
                .timed(self.store.abort_multipart(bucket, key, &upload_id))
                .await
            {
                warn!(
                    "Failed to abort multipart upload {} for {}: {}",
                    upload_id, key, abort_err
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn upload_parts(
        &self,
        path: &Path,
        bucket: &str,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<(), UploadError> {
        let chunk_size = self.config.chunk_size as usize;
        let mut file = File::open(path)
            .await
            .map_err(|e| UploadError::Failed(format!("source read failed: {e}")))?;

        // One reused buffer bounds this worker to a single chunk in memory.
        let mut buffer = vec![0u8; chunk_size];
        let mut parts: Vec<(i32, String)> = Vec::new();
        let mut remaining = size;
        let mut part_number: i32 = 1;

        while remaining > 0 {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(UploadError::Cancelled);
            }

            let want = remaining.min(chunk_size as u64) as usize;
            let mut filled = 0;
            while filled < want {
                let n = file
                    .read(&mut buffer[filled..want])
                    .await
                    .map_err(|e| UploadError::Failed(format!("source read failed: {e}")))?;
                if n == 0 {
                    return Err(UploadError::Failed(
                        "source truncated during upload".to_string(),
                    ));
                }
                filled += n;
            }

            let etag = self
                .retry_store("upload_part", || {
                    self.timed(self.store.put_part(
                        bucket,
                        key,
                        upload_id,
                        part_number,
                        &buffer[..want],
                    ))
                })
                .await
                .map_err(|e| UploadError::Failed(format!("part {part_number} failed: {e}")))?;
            parts.push((part_number, etag));
            remaining -= want as u64;
            part_number += 1;
        }

        self.retry_store("complete_multipart_upload", || {
            self.timed(self.store.complete_multipart(bucket, key, upload_id, &parts))
        })
        .await
        .map_err(|e| UploadError::Failed(format!("complete multipart failed: {e}")))?;
        Ok(())
    }

    async fn retry_store<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.part_retry_attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "{} hit a transient error (attempt {}): {}; retrying in {:?}",
                        op,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.part_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transient("object store call timed out")),
        }
    }
}
