use crate::services::scanner::ScannedFile;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("upload job '{0}' already exists")]
    JobExists(String),
    #[error("connection lock poisoned, a writer panicked mid-transition")]
    LockPoisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Take the shared connection lock. A poisoned lock means some writer
/// panicked while it held the store, so surface it as a store error.
pub fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, DbError> {
    conn.lock().map_err(|_| DbError::LockPoisoned)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileState {
    Pending,
    InProgress,
    Uploaded,
    Failed,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Uploaded => "UPLOADED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "UPLOADED" => Some(Self::Uploaded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub source_folder: String,
    pub destination_bucket: String,
    pub pattern: Option<String>,
    pub state: JobState,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub id: i64,
    pub upload_job_id: String,
    pub path: String,
    pub state: FileState,
    pub failure_reason: Option<String>,
    pub mtime: i64,
    pub size: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-state file counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub uploaded: i64,
    pub failed: i64,
}

impl JobSummary {
    /// No file can still change state without outside intervention.
    pub fn settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.uploaded as f64 / self.total as f64
        }
    }
}

pub fn init_db(path: &Path) -> Result<Connection, DbError> {
    debug!("Opening database at {:?}", path);
    let conn = Connection::open(path)?;
    apply_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, DbError> {
    let conn = Connection::open_in_memory()?;
    apply_schema(&conn)?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS upload_jobs (
            id TEXT PRIMARY KEY,
            source_folder TEXT NOT NULL,
            destination_bucket TEXT NOT NULL,
            pattern TEXT,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            upload_job_id TEXT NOT NULL,
            path TEXT NOT NULL,
            state TEXT NOT NULL,
            failure_reason TEXT,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(upload_job_id, path),
            FOREIGN KEY(upload_job_id) REFERENCES upload_jobs(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_files_job_state
            ON files(upload_job_id, state);
        CREATE INDEX IF NOT EXISTS idx_jobs_state
            ON upload_jobs(state);
        ",
    )?;
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

pub const JOB_COLUMNS: &str =
    "id, source_folder, destination_bucket, pattern, state, created_at, updated_at";

pub const FILE_COLUMNS: &str =
    "id, upload_job_id, path, state, failure_reason, mtime, size, created_at, updated_at";

fn parse_job_state(raw: &str) -> rusqlite::Result<JobState> {
    JobState::from_str(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown job state '{raw}'").into(),
        )
    })
}

fn parse_file_state(raw: &str) -> rusqlite::Result<FileState> {
    FileState::from_str(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown file state '{raw}'").into(),
        )
    })
}

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
    let state: String = row.get(4)?;
    Ok(JobRow {
        id: row.get(0)?,
        source_folder: row.get(1)?,
        destination_bucket: row.get(2)?,
        pattern: row.get(3)?,
        state: parse_job_state(&state)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_file_row(row: &rusqlite::Row) -> rusqlite::Result<FileRow> {
    let state: String = row.get(3)?;
    Ok(FileRow {
        id: row.get(0)?,
        upload_job_id: row.get(1)?,
        path: row.get(2)?,
        state: parse_file_state(&state)?,
        failure_reason: row.get(4)?,
        mtime: row.get(5)?,
        size: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

// --- Job operations ---

pub fn create_job(
    conn: &Connection,
    id: &str,
    source_folder: &str,
    destination_bucket: &str,
    pattern: Option<&str>,
) -> Result<JobRow, DbError> {
    let now = now();
    let result = conn.execute(
        "INSERT INTO upload_jobs (id, source_folder, destination_bucket, pattern, state, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            source_folder,
            destination_bucket,
            pattern,
            JobState::Pending.as_str(),
            now,
            now
        ],
    );
    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(DbError::JobExists(id.to_string()));
        }
        Err(e) => return Err(e.into()),
    }
    debug!("Created upload job {} for {}", id, source_folder);
    Ok(JobRow {
        id: id.to_string(),
        source_folder: source_folder.to_string(),
        destination_bucket: destination_bucket.to_string(),
        pattern: pattern.map(str::to_string),
        state: JobState::Pending,
        created_at: now.clone(),
        updated_at: now,
    })
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<JobRow>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM upload_jobs WHERE id = ?",
        JOB_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![id], map_job_row)?;
    if let Some(row) = rows.next() {
        Ok(Some(row?))
    } else {
        Ok(None)
    }
}

pub fn list_jobs(conn: &Connection) -> Result<Vec<JobRow>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM upload_jobs ORDER BY created_at ASC, id ASC",
        JOB_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], map_job_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_jobs_by_state(
    conn: &Connection,
    states: &[JobState],
) -> Result<Vec<JobRow>, DbError> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; states.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM upload_jobs WHERE state IN ({}) ORDER BY created_at ASC, id ASC",
        JOB_COLUMNS, placeholders
    ))?;
    let rows = stmt
        .query_map(
            params_from_iter(states.iter().map(|s| s.as_str())),
            map_job_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Idempotent; returns whether the row actually changed.
pub fn set_job_state(conn: &Connection, id: &str, state: JobState) -> Result<bool, DbError> {
    let changed = conn.execute(
        "UPDATE upload_jobs SET state = ?, updated_at = ? WHERE id = ? AND state != ?",
        params![state.as_str(), now(), id, state.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn delete_job(conn: &Connection, id: &str) -> Result<(), DbError> {
    conn.execute("DELETE FROM upload_jobs WHERE id = ?", params![id])?;
    Ok(())
}

// --- File operations ---

/// Bulk insert; rows whose (job, path) already exists are skipped.
/// Returns the number of rows actually inserted.
pub fn create_files_bulk(
    conn: &Connection,
    job_id: &str,
    entries: &[ScannedFile],
) -> Result<usize, DbError> {
    let tx = conn.unchecked_transaction()?;
    let now = now();
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO files (upload_job_id, path, state, mtime, size, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )?;
        for entry in entries {
            inserted += stmt.execute(params![
                job_id,
                entry.path,
                FileState::Pending.as_str(),
                entry.mtime,
                entry.size,
                now,
                now
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Atomically claim one pending file of the job for exclusive processing.
/// The update is guarded on the current state so concurrent claimers can
/// never own the same row.
pub fn claim_next_pending_file(
    conn: &Connection,
    job_id: &str,
) -> Result<Option<FileRow>, DbError> {
    loop {
        let candidate: Option<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM files WHERE upload_job_id = ? AND state = ? ORDER BY id ASC LIMIT 1",
            )?;
            let mut rows = stmt.query(params![job_id, FileState::Pending.as_str()])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(file_id) = candidate else {
            return Ok(None);
        };
        let changed = conn.execute(
            "UPDATE files SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
            params![
                FileState::InProgress.as_str(),
                now(),
                file_id,
                FileState::Pending.as_str()
            ],
        )?;
        if changed == 1 {
            return get_file(conn, file_id);
        }
        // Lost the race for that row; try the next candidate.
    }
}

pub fn get_file(conn: &Connection, file_id: i64) -> Result<Option<FileRow>, DbError> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS))?;
    let mut rows = stmt.query_map(params![file_id], map_file_row)?;
    if let Some(row) = rows.next() {
        Ok(Some(row?))
    } else {
        Ok(None)
    }
}

pub fn get_file_by_path(
    conn: &Connection,
    job_id: &str,
    path: &str,
) -> Result<Option<FileRow>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM files WHERE upload_job_id = ? AND path = ?",
        FILE_COLUMNS
    ))?;
    let mut rows = stmt.query_map(params![job_id, path], map_file_row)?;
    if let Some(row) = rows.next() {
        Ok(Some(row?))
    } else {
        Ok(None)
    }
}

pub fn list_files(conn: &Connection, job_id: &str) -> Result<Vec<FileRow>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM files WHERE upload_job_id = ? ORDER BY path ASC",
        FILE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![job_id], map_file_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_files_by_state(
    conn: &Connection,
    job_id: &str,
    state: FileState,
) -> Result<Vec<FileRow>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM files WHERE upload_job_id = ? AND state = ? ORDER BY id ASC",
        FILE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![job_id, state.as_str()], map_file_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_file(
    conn: &Connection,
    file_id: i64,
    state: FileState,
    failure_reason: Option<&str>,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE files SET state = ?, failure_reason = ?, updated_at = ? WHERE id = ?",
        params![state.as_str(), failure_reason, now(), file_id],
    )?;
    Ok(())
}

/// Record a fresh stat observation without changing ownership.
/// Used by a worker just before it starts reading the source.
pub fn refresh_file_stat(
    conn: &Connection,
    file_id: i64,
    mtime: i64,
    size: i64,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE files SET mtime = ?, size = ?, updated_at = ? WHERE id = ?",
        params![mtime, size, now(), file_id],
    )?;
    Ok(())
}

/// Re-enqueue a file with a new stat. Guarded so a row a worker currently
/// owns is never touched; returns whether the update landed.
pub fn update_file_stat(
    conn: &Connection,
    file_id: i64,
    mtime: i64,
    size: i64,
) -> Result<bool, DbError> {
    let changed = conn.execute(
        "UPDATE files SET mtime = ?, size = ?, state = ?, failure_reason = NULL, updated_at = ?
         WHERE id = ? AND state != ?",
        params![
            mtime,
            size,
            FileState::Pending.as_str(),
            now(),
            file_id,
            FileState::InProgress.as_str()
        ],
    )?;
    Ok(changed == 1)
}

/// Startup recovery: any file left in-flight by a previous run goes back
/// to the queue-owned state.
pub fn reset_in_progress_files(conn: &Connection, job_id: &str) -> Result<usize, DbError> {
    let changed = conn.execute(
        "UPDATE files SET state = ?, updated_at = ? WHERE upload_job_id = ? AND state = ?",
        params![
            FileState::Pending.as_str(),
            now(),
            job_id,
            FileState::InProgress.as_str()
        ],
    )?;
    Ok(changed)
}

pub fn reset_failed_files(conn: &Connection, job_id: &str) -> Result<usize, DbError> {
    let changed = conn.execute(
        "UPDATE files SET state = ?, failure_reason = NULL, updated_at = ?
         WHERE upload_job_id = ? AND state = ?",
        params![
            FileState::Pending.as_str(),
            now(),
            job_id,
            FileState::Failed.as_str()
        ],
    )?;
    Ok(changed)
}

pub fn summarize_job(conn: &Connection, job_id: &str) -> Result<JobSummary, DbError> {
    let mut stmt =
        conn.prepare("SELECT state, COUNT(*) FROM files WHERE upload_job_id = ? GROUP BY state")?;
    let mut rows = stmt.query(params![job_id])?;
    let mut summary = JobSummary::default();
    while let Some(row) = rows.next()? {
        let state: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        match FileState::from_str(&state) {
            Some(FileState::Pending) => summary.pending = count,
            Some(FileState::InProgress) => summary.in_progress = count,
            Some(FileState::Uploaded) => summary.uploaded = count,
            Some(FileState::Failed) => summary.failed = count,
            None => {}
        }
        summary.total += count;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(path: &str, mtime: i64, size: i64) -> ScannedFile {
        ScannedFile {
            path: path.to_string(),
            mtime,
            size,
        }
    }

    fn setup() -> Connection {
        open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_state_round_trips() {
        for state in [
            JobState::Pending,
            JobState::InProgress,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_str(state.as_str()), Some(state));
        }
        for state in [
            FileState::Pending,
            FileState::InProgress,
            FileState::Uploaded,
            FileState::Failed,
        ] {
            assert_eq!(FileState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(JobState::from_str("BOGUS"), None);
    }

    #[test]
    fn test_create_job_rejects_duplicate_id() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        let err = create_job(&conn, "job-1", "/other", "bucket", None).unwrap_err();
        assert!(matches!(err, DbError::JobExists(id) if id == "job-1"));
    }

    #[test]
    fn test_get_job_round_trip() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", Some("*.log")).unwrap();
        let job = get_job(&conn, "job-1").unwrap().expect("job");
        assert_eq!(job.source_folder, "/data");
        assert_eq!(job.destination_bucket, "bucket");
        assert_eq!(job.pattern.as_deref(), Some("*.log"));
        assert_eq!(job.state, JobState::Pending);
        assert!(get_job(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_set_job_state_is_idempotent() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        assert!(set_job_state(&conn, "job-1", JobState::InProgress).unwrap());
        assert!(!set_job_state(&conn, "job-1", JobState::InProgress).unwrap());
        let job = get_job(&conn, "job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::InProgress);
    }

    #[test]
    fn test_create_files_bulk_skips_existing_rows() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        let entries = vec![scanned("a.txt", 100, 1), scanned("sub/b.txt", 100, 2)];
        assert_eq!(create_files_bulk(&conn, "job-1", &entries).unwrap(), 2);
        // Re-running expansion over the same tree inserts nothing.
        assert_eq!(create_files_bulk(&conn, "job-1", &entries).unwrap(), 0);
        assert_eq!(list_files(&conn, "job-1").unwrap().len(), 2);
    }

    #[test]
    fn test_path_unique_per_job_not_globally() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_job(&conn, "job-2", "/data", "bucket", None).unwrap();
        assert_eq!(
            create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1)]).unwrap(),
            1
        );
        assert_eq!(
            create_files_bulk(&conn, "job-2", &[scanned("a.txt", 1, 1)]).unwrap(),
            1
        );
    }

    #[test]
    fn test_claim_is_exclusive() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1), scanned("b.txt", 1, 1)])
            .unwrap();

        let first = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();
        assert_eq!(first.state, FileState::InProgress);
        let second = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(claim_next_pending_file(&conn, "job-1").unwrap().is_none());
    }

    #[test]
    fn test_mark_file_records_failure_reason() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1)]).unwrap();
        let file = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();

        mark_file(&conn, file.id, FileState::Failed, Some("source missing")).unwrap();
        let file = get_file(&conn, file.id).unwrap().unwrap();
        assert_eq!(file.state, FileState::Failed);
        assert_eq!(file.failure_reason.as_deref(), Some("source missing"));

        mark_file(&conn, file.id, FileState::Uploaded, None).unwrap();
        let file = get_file(&conn, file.id).unwrap().unwrap();
        assert_eq!(file.failure_reason, None);
    }

    #[test]
    fn test_update_file_stat_never_touches_in_progress() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1)]).unwrap();
        let file = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();

        assert!(!update_file_stat(&conn, file.id, 99, 99).unwrap());
        let untouched = get_file(&conn, file.id).unwrap().unwrap();
        assert_eq!(untouched.state, FileState::InProgress);
        assert_eq!(untouched.mtime, 1);

        mark_file(&conn, file.id, FileState::Uploaded, None).unwrap();
        assert!(update_file_stat(&conn, file.id, 99, 99).unwrap());
        let updated = get_file(&conn, file.id).unwrap().unwrap();
        assert_eq!(updated.state, FileState::Pending);
        assert_eq!(updated.mtime, 99);
        assert_eq!(updated.size, 99);
    }

    #[test]
    fn test_reset_in_progress_is_idempotent() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1), scanned("b.txt", 1, 1)])
            .unwrap();
        claim_next_pending_file(&conn, "job-1").unwrap().unwrap();

        assert_eq!(reset_in_progress_files(&conn, "job-1").unwrap(), 1);
        let before = list_files(&conn, "job-1").unwrap();
        assert_eq!(reset_in_progress_files(&conn, "job-1").unwrap(), 0);
        let after = list_files(&conn, "job-1").unwrap();
        // Running recovery twice in a row changes nothing.
        assert_eq!(
            before.iter().map(|f| (f.id, f.state)).collect::<Vec<_>>(),
            after.iter().map(|f| (f.id, f.state)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_summarize_counts_per_state() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(
            &conn,
            "job-1",
            &[
                scanned("a.txt", 1, 1),
                scanned("b.txt", 1, 1),
                scanned("c.txt", 1, 1),
            ],
        )
        .unwrap();
        let claimed = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();
        mark_file(&conn, claimed.id, FileState::Uploaded, None).unwrap();
        let claimed = claim_next_pending_file(&conn, "job-1").unwrap().unwrap();
        mark_file(&conn, claimed.id, FileState::Failed, Some("boom")).unwrap();

        let summary = summarize_job(&conn, "job-1").unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.in_progress, 0);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.settled());
    }

    #[test]
    fn test_progress_of_empty_job_is_complete() {
        let summary = JobSummary::default();
        assert!((summary.progress() - 1.0).abs() < f64::EPSILON);
        let summary = JobSummary {
            total: 4,
            uploaded: 1,
            ..JobSummary::default()
        };
        assert!((summary.progress() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delete_job_cascades_to_files() {
        let conn = setup();
        create_job(&conn, "job-1", "/data", "bucket", None).unwrap();
        create_files_bulk(&conn, "job-1", &[scanned("a.txt", 1, 1)]).unwrap();

        delete_job(&conn, "job-1").unwrap();
        assert!(get_job(&conn, "job-1").unwrap().is_none());
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }
}
