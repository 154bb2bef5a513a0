//! SQLite job store

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};

use super::{
    BatchRecord, JobRecord, JobStore, StorageError, StorageResult, StoredResult, StoredState,
};
use crate::models::{BatchId, Environ, JobId, JobState};

/// SQLite-backed [`JobStore`] (WAL mode)
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self { conn };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// In-memory database (tests)
    pub fn open_in_memory() -> StorageResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS batches (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    cancelled INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    seq INTEGER NOT NULL,
                    batch_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    parameters TEXT NOT NULL,
                    state TEXT NOT NULL,
                    retries INTEGER NOT NULL DEFAULT 0,
                    result TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs(batch_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_seq ON jobs(seq);
                "#,
        )?;
        Ok(())
    }

    fn insert_job(tx: &Transaction<'_>, job: &JobRecord, now: &str) -> StorageResult<()> {
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            r#"
                INSERT INTO jobs (id, seq, batch_id, kind, parameters, state, retries, result, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            params![
                job.id.to_string(),
                job.seq as i64,
                job.batch_id.to_string(),
                job.kind,
                serde_json::to_string(&job.parameters)?,
                job.state.as_str(),
                i64::from(job.retries),
                result,
                now,
            ],
        )?;
        Ok(())
    }

    fn load(&self) -> StorageResult<StoredState> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, created_at, cancelled FROM batches ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;

        let mut batches = Vec::new();
        for row in rows {
            let (id, created_at, cancelled) = row?;
            batches.push(BatchRecord {
                id: parse_id(&id)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| StorageError::Corrupt(format!("batch {id} created_at: {e}")))?,
                cancelled,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, seq, batch_id, kind, parameters, state, retries, result
             FROM jobs ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, seq, batch_id, kind, parameters, state, retries, result) = row?;
            let parameters: Environ = serde_json::from_str(&parameters)?;
            let result: Option<StoredResult> =
                result.as_deref().map(serde_json::from_str).transpose()?;
            jobs.push(JobRecord {
                id: parse_id(&id)?,
                seq: u64::try_from(seq)
                    .map_err(|_| StorageError::Corrupt(format!("job {id} has negative seq")))?,
                batch_id: parse_id(&batch_id)?,
                kind,
                parameters,
                state: state
                    .parse::<JobState>()
                    .map_err(StorageError::Corrupt)?,
                retries: u32::try_from(retries)
                    .map_err(|_| StorageError::Corrupt(format!("job {id} retries out of range")))?,
                result,
            });
        }

        Ok(StoredState { batches, jobs })
    }
}

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(raw: &str) -> StorageResult<T> {
    raw.parse()
        .map_err(|e| StorageError::Corrupt(format!("bad id '{raw}': {e}")))
}

impl JobStore for SqliteJobStore {
    fn insert_batch(&mut self, batch: &BatchRecord, jobs: &[JobRecord]) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO batches (id, created_at, cancelled) VALUES (?1, ?2, ?3)",
            params![
                batch.id.to_string(),
                batch.created_at.to_rfc3339(),
                batch.cancelled
            ],
        )?;
        for job in jobs {
            Self::insert_job(&tx, job, &now)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_job(&mut self, job: &JobRecord) -> StorageResult<()> {
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let updated = self.conn.execute(
            "UPDATE jobs SET state = ?2, retries = ?3, result = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                job.id.to_string(),
                job.state.as_str(),
                i64::from(job.retries),
                result,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::Corrupt(format!("job {} is not stored", job.id)));
        }
        Ok(())
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM jobs WHERE id = ?1")?;
            for id in ids {
                stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_batch_cancelled(&mut self, batch: BatchId) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE batches SET cancelled = 1 WHERE id = ?1",
            params![batch.to_string()],
        )?;
        Ok(())
    }

    fn archive_batch(&mut self, batch: BatchId) -> StorageResult<()> {
        let id = batch.to_string();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM jobs WHERE batch_id = ?1", params![id])?;
        tx.execute("DELETE FROM batches WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn recover(&mut self) -> StorageResult<StoredState> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let purged = tx.execute(
            "DELETE FROM jobs WHERE batch_id IN (SELECT id FROM batches WHERE cancelled = 1)",
            [],
        )?;
        tx.execute("DELETE FROM batches WHERE cancelled = 1", [])?;
        tx.execute(
            "DELETE FROM batches WHERE id NOT IN (SELECT DISTINCT batch_id FROM jobs)",
            [],
        )?;
        let requeued = tx.execute(
            "UPDATE jobs SET state = 'queued', updated_at = ?1 WHERE state IN ('assigned', 'running')",
            params![now],
        )?;
        tx.commit()?;

        let state = self.load()?;
        tracing::info!(
            batches = state.batches.len(),
            jobs = state.jobs.len(),
            requeued,
            purged,
            "Job store recovered"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobOutcome, OK_CODE};
    use tempfile::TempDir;

    fn batch_with_jobs(n: usize, first_seq: u64) -> (BatchRecord, Vec<JobRecord>) {
        let batch = BatchRecord {
            id: BatchId::new(),
            created_at: Utc::now(),
            cancelled: false,
        };
        let jobs = (0..n)
            .map(|i| JobRecord {
                id: JobId::new(),
                seq: first_seq + i as u64,
                batch_id: batch.id,
                kind: "ping".to_string(),
                parameters: Environ::new().with("ping", format!("p{i}")),
                state: JobState::Queued,
                retries: 0,
                result: None,
            })
            .collect();
        (batch, jobs)
    }

    #[test]
    fn test_insert_and_recover() {
        let mut store = SqliteJobStore::open_in_memory().unwrap();
        let (batch, jobs) = batch_with_jobs(3, 0);
        store.insert_batch(&batch, &jobs).unwrap();

        let state = store.recover().unwrap();
        assert_eq!(state.batches, vec![batch]);
        assert_eq!(state.jobs, jobs);
    }

    #[test]
    fn test_recover_requeues_in_flight_jobs() {
        let mut store = SqliteJobStore::open_in_memory().unwrap();
        let (batch, mut jobs) = batch_with_jobs(3, 0);
        store.insert_batch(&batch, &jobs).unwrap();

        jobs[0].state = JobState::Running;
        jobs[0].retries = 1;
        store.update_job(&jobs[0]).unwrap();
        jobs[1].state = JobState::Done;
        jobs[1].result = Some(StoredResult {
            outcome: JobOutcome::from_result(true, &Environ::new()),
            parameters: Environ::new().with("ping", "pong"),
        });
        store.update_job(&jobs[1]).unwrap();

        let state = store.recover().unwrap();
        assert_eq!(state.jobs[0].state, JobState::Queued);
        assert_eq!(state.jobs[0].retries, 1);
        assert_eq!(state.jobs[1].state, JobState::Done);
        assert_eq!(
            state.jobs[1].result.as_ref().unwrap().outcome.result_code,
            OK_CODE
        );
    }

    #[test]
    fn test_cancelled_batches_are_purged() {
        let mut store = SqliteJobStore::open_in_memory().unwrap();
        let (kept, kept_jobs) = batch_with_jobs(1, 0);
        let (cancelled, cancelled_jobs) = batch_with_jobs(2, 1);
        store.insert_batch(&kept, &kept_jobs).unwrap();
        store.insert_batch(&cancelled, &cancelled_jobs).unwrap();
        store.mark_batch_cancelled(cancelled.id).unwrap();

        let state = store.recover().unwrap();
        assert_eq!(state.batches.len(), 1);
        assert_eq!(state.batches[0].id, kept.id);
        assert_eq!(state.jobs.len(), 1);
    }

    #[test]
    fn test_archive_and_delete() {
        let mut store = SqliteJobStore::open_in_memory().unwrap();
        let (a, a_jobs) = batch_with_jobs(2, 0);
        let (b, b_jobs) = batch_with_jobs(2, 2);
        store.insert_batch(&a, &a_jobs).unwrap();
        store.insert_batch(&b, &b_jobs).unwrap();

        store.archive_batch(a.id).unwrap();
        store.delete_jobs(&[b_jobs[0].id]).unwrap();

        let state = store.recover().unwrap();
        assert_eq!(state.batches.len(), 1);
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.jobs[0].id, b_jobs[1].id);
    }

    #[test]
    fn test_update_unknown_job_is_an_error() {
        let mut store = SqliteJobStore::open_in_memory().unwrap();
        let (_, jobs) = batch_with_jobs(1, 0);
        assert!(matches!(
            store.update_job(&jobs[0]),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("judge.db");
        let (batch, jobs) = batch_with_jobs(2, 0);

        {
            let mut store = SqliteJobStore::open(&path).unwrap();
            store.insert_batch(&batch, &jobs).unwrap();
        }

        let mut store = SqliteJobStore::open(&path).unwrap();
        let state = store.recover().unwrap();
        assert_eq!(state.jobs.len(), 2);
        assert_eq!(state.jobs_of(batch.id).count(), 2);
    }
}
