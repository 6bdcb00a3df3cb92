//! SQLite persistence for the waitlist job queue and aggregate stats.
//!
//! The `waitlist` table doubles as the job queue and the result store: one
//! row per user, claimed oldest-first per mode. The connection mutex makes
//! each operation atomic in-process; `claim_next` additionally re-checks the
//! status in its UPDATE so a raced claim returns None instead of handing the
//! same job to two callers.

use rusqlite::{Connection, Result as SqliteResult};
use std::sync::Mutex;
use wrapped_types::{Job, JobMode, JobStatus, QueuePosition, WrappedStats};

pub struct Db {
    conn: Mutex<Connection>,
}

const JOB_COLUMNS: &str = "id, user_id, platform_user_id, credential, status, mode, \
                           enqueued_at, github_handle, result_json, global_stats_id";

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS waitlist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL UNIQUE,
                platform_user_id TEXT NOT NULL,
                credential TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                mode TEXT NOT NULL DEFAULT 'default',
                enqueued_at TEXT NOT NULL,
                github_handle TEXT,
                result_json TEXT,
                global_stats_id TEXT,
                upload_secret TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_waitlist_claim ON waitlist(status, mode, enqueued_at ASC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS global_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin_id TEXT NOT NULL UNIQUE,
                message_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Queue Operations
    // =====================================================

    /// Add a user to the waitlist. No-op (returns false) if a job for this
    /// user already exists, whatever its status.
    pub fn enqueue(
        &self,
        user_id: &str,
        platform_user_id: &str,
        credential: &str,
        mode: JobMode,
        github_handle: Option<&str>,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO waitlist (user_id, platform_user_id, credential, status, mode, enqueued_at, github_handle)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            rusqlite::params![user_id, platform_user_id, credential, mode.as_str(), now, github_handle],
        )?;
        Ok(rows > 0)
    }

    /// Claim the oldest pending job, optionally filtered by mode, flipping
    /// it to `processing`. Returns None when the queue (for that mode) is
    /// empty or the selected row was claimed by a racing caller first.
    pub fn claim_next(&self, mode: Option<JobMode>) -> SqliteResult<Option<Job>> {
        let conn = self.conn.lock().unwrap();

        let job = match mode {
            Some(m) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM waitlist
                     WHERE status = 'pending' AND mode = ?1
                     ORDER BY enqueued_at ASC, id ASC LIMIT 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query_map([m.as_str()], row_to_job)?;
                rows.next().and_then(|r| r.ok())
            }
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM waitlist
                     WHERE status = 'pending'
                     ORDER BY enqueued_at ASC, id ASC LIMIT 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query_map([], row_to_job)?;
                rows.next().and_then(|r| r.ok())
            }
        };

        let Some(mut job) = job else {
            return Ok(None);
        };

        let updated = conn.execute(
            "UPDATE waitlist SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
            [job.id],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        job.status = JobStatus::Processing;
        Ok(Some(job))
    }

    /// Reset jobs left in `processing` by a crashed or failed run back to
    /// `pending`. Idempotent; returns the number of jobs recovered.
    pub fn recover_stuck(&self) -> SqliteResult<usize> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE waitlist SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        Ok(rows)
    }

    /// Mark a job completed, attach the result if given, and clear the
    /// stored credential so it cannot be reused or leaked afterwards.
    pub fn complete(&self, user_id: &str, result: Option<&WrappedStats>) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let result_json = result.and_then(|r| serde_json::to_string(r).ok());
        let rows = match result_json {
            Some(json) => conn.execute(
                "UPDATE waitlist SET status = 'completed', credential = '', result_json = ?1 WHERE user_id = ?2",
                rusqlite::params![json, user_id],
            )?,
            None => conn.execute(
                "UPDATE waitlist SET status = 'completed', credential = '' WHERE user_id = ?1",
                [user_id],
            )?,
        };
        Ok(rows > 0)
    }

    pub fn get_job(&self, user_id: &str) -> SqliteResult<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        job_by_user(&conn, user_id)
    }

    /// Queue position for a user: 0 when processing/completed/awaiting
    /// upload, else the count of older pending jobs in the same mode + 1.
    pub fn position(&self, user_id: &str) -> SqliteResult<Option<QueuePosition>> {
        let conn = self.conn.lock().unwrap();
        let Some(job) = job_by_user(&conn, user_id)? else {
            return Ok(None);
        };

        let position = match job.status {
            JobStatus::Pending => {
                let older: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM waitlist
                     WHERE status = 'pending' AND mode = ?1
                       AND (enqueued_at < ?2 OR (enqueued_at = ?2 AND id < ?3))",
                    rusqlite::params![job.mode.as_str(), job.enqueued_at, job.id],
                    |row| row.get(0),
                )?;
                older + 1
            }
            _ => 0,
        };

        Ok(Some(QueuePosition {
            status: job.status,
            position,
        }))
    }

    /// Count of pending jobs, optionally for one mode.
    pub fn size(&self, mode: Option<JobMode>) -> SqliteResult<i64> {
        let conn = self.conn.lock().unwrap();
        match mode {
            Some(m) => conn.query_row(
                "SELECT COUNT(*) FROM waitlist WHERE status = 'pending' AND mode = ?1",
                [m.as_str()],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM waitlist WHERE status = 'pending'",
                [],
                |row| row.get(0),
            ),
        }
    }

    pub fn completed_count(&self) -> SqliteResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM waitlist WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )
    }

    /// Delete a user's job and their anonymized aggregate record.
    pub fn remove_user(&self, user_id: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let Some(job) = job_by_user(&conn, user_id)? else {
            return Ok(false);
        };
        conn.execute("DELETE FROM waitlist WHERE id = ?1", [job.id])?;
        if let Some(origin_id) = job.global_stats_id {
            conn.execute("DELETE FROM global_stats WHERE origin_id = ?1", [origin_id])?;
        }
        Ok(true)
    }

    // =====================================================
    // Upload Path
    // =====================================================

    /// Issue a one-shot upload secret for a user. Creates a placeholder row
    /// in `pending_upload` when none exists; the worker never claims those.
    pub fn generate_upload_secret(&self, user_id: &str) -> SqliteResult<String> {
        let conn = self.conn.lock().unwrap();
        let secret = uuid::Uuid::new_v4().simple().to_string();

        if job_by_user(&conn, user_id)?.is_some() {
            conn.execute(
                "UPDATE waitlist SET upload_secret = ?1 WHERE user_id = ?2",
                rusqlite::params![secret, user_id],
            )?;
        } else {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO waitlist (user_id, platform_user_id, credential, status, mode, enqueued_at, upload_secret)
                 VALUES (?1, ?1, '', 'pending_upload', 'default', ?2, ?3)",
                rusqlite::params![user_id, now, secret],
            )?;
        }
        Ok(secret)
    }

    /// Consume an upload secret: attach the pre-computed stats and complete
    /// the job, bypassing the worker. Returns false for an unknown secret.
    pub fn complete_upload(
        &self,
        secret: &str,
        stats: &WrappedStats,
        github_handle: Option<&str>,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let result_json = serde_json::to_string(stats).ok();
        let rows = conn.execute(
            "UPDATE waitlist SET status = 'completed', credential = '', result_json = ?1,
                    upload_secret = NULL, github_handle = COALESCE(?2, github_handle)
             WHERE upload_secret = ?3",
            rusqlite::params![result_json, github_handle, secret],
        )?;
        Ok(rows > 0)
    }

    // =====================================================
    // Global Stats
    // =====================================================

    /// Record an anonymized message count for a user, create-if-absent. The
    /// only link back to the user is an opaque id stored on their job, so
    /// deleting the job severs the association.
    pub fn update_global_stats(&self, user_id: &str, message_count: u64) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let Some(job) = job_by_user(&conn, user_id)? else {
            return Ok(());
        };

        let origin_id = match job.global_stats_id {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                conn.execute(
                    "UPDATE waitlist SET global_stats_id = ?1 WHERE id = ?2",
                    rusqlite::params![id, job.id],
                )?;
                id
            }
        };

        conn.execute(
            "INSERT OR IGNORE INTO global_stats (origin_id, message_count) VALUES (?1, ?2)",
            rusqlite::params![origin_id, message_count as i64],
        )?;
        Ok(())
    }
}

fn job_by_user(conn: &Connection, user_id: &str) -> SqliteResult<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM waitlist WHERE user_id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map([user_id], row_to_job)?;
    Ok(rows.next().and_then(|r| r.ok()))
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status: String = row.get(4)?;
    let mode: String = row.get(5)?;
    Ok(Job {
        id: row.get(0)?,
        user_id: row.get(1)?,
        platform_user_id: row.get(2)?,
        credential: row.get(3)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        mode: JobMode::parse(&mode).unwrap_or(JobMode::Default),
        enqueued_at: row.get(6)?,
        github_handle: row.get(7)?,
        result_json: row.get(8)?,
        global_stats_id: row.get(9)?,
    })
}
