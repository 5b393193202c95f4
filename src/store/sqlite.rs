use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::job::{Job, JobId, JobStatus};

use super::{JobStore, Result, StoreError};

fn parse_timestamp(id: &str, column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            job_id: JobId(id.to_string()),
            reason: format!("bad {column} column: {e}"),
        })
}

/// SQLite-backed job store.
///
/// Runs in WAL mode so a committed save survives an immediate crash and
/// writers to different jobs do not block each other.
pub struct SqliteJobStore {
    pub pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. Pinned to one connection because every
    /// SQLite `:memory:` connection is its own database.
    pub async fn in_memory() -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.configure().await?;
        store.migrate().await?;
        Ok(store)
    }

    async fn configure(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                phase TEXT,
                error TEXT,
                options TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_owner_created ON jobs(owner_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_job(&self, row: sqlx::sqlite::SqliteRow) -> Result<Job> {
        let id: String = row.get("id");
        let owner_id: String = row.get("owner_id");
        let subject_id: String = row.get("subject_id");
        let status_str: String = row.get("status");
        let progress: i32 = row.get("progress");
        let phase: Option<String> = row.get("phase");
        let error: Option<String> = row.get("error");
        let options_json: String = row.get("options");
        let created_at_str: String = row.get("created_at");
        let started_at_str: Option<String> = row.get("started_at");
        let completed_at_str: Option<String> = row.get("completed_at");
        let version: i64 = row.get("version");

        let options = serde_json::from_str(&options_json).map_err(|e| StoreError::Corrupt {
            job_id: JobId(id.clone()),
            reason: format!("bad options column: {}", e),
        })?;

        let created_at = parse_timestamp(&id, "created_at", &created_at_str)?;

        let started_at = started_at_str
            .as_deref()
            .map(|s| parse_timestamp(&id, "started_at", s))
            .transpose()?;

        let completed_at = completed_at_str
            .as_deref()
            .map(|s| parse_timestamp(&id, "completed_at", s))
            .transpose()?;

        Ok(Job {
            id: JobId(id),
            owner_id,
            subject_id,
            status: JobStatus::from_db(&status_str),
            progress: progress.clamp(0, 100) as u8,
            phase,
            error,
            options,
            created_at,
            started_at,
            completed_at,
            version,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save_job(&self, job: &Job) -> Result<i64> {
        let options_json = serde_json::to_string(&job.options).map_err(|e| StoreError::Corrupt {
            job_id: job.id.clone(),
            reason: format!("unserializable options: {}", e),
        })?;

        if job.version == 0 {
            let new_version = 1i64;
            sqlx::query(
                r#"
                INSERT INTO jobs (id, owner_id, subject_id, status, progress, phase, error,
                                  options, created_at, started_at, completed_at, version)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id.0)
            .bind(&job.owner_id)
            .bind(&job.subject_id)
            .bind(job.status.as_str())
            .bind(job.progress as i32)
            .bind(&job.phase)
            .bind(&job.error)
            .bind(&options_json)
            .bind(job.created_at.to_rfc3339())
            .bind(job.started_at.map(|dt| dt.to_rfc3339()))
            .bind(job.completed_at.map(|dt| dt.to_rfc3339()))
            .bind(new_version)
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                // A duplicate id means the row was created behind our back.
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    StoreError::Conflict {
                        job_id: job.id.clone(),
                        expected_version: 0,
                    }
                }
                other => StoreError::Database(other),
            })?;

            return Ok(new_version);
        }

        // Compare-and-set on the version token
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET owner_id = ?, subject_id = ?, status = ?, progress = ?, phase = ?,
                error = ?, options = ?, started_at = ?, completed_at = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&job.owner_id)
        .bind(&job.subject_id)
        .bind(job.status.as_str())
        .bind(job.progress as i32)
        .bind(&job.phase)
        .bind(&job.error)
        .bind(&options_json)
        .bind(job.started_at.map(|dt| dt.to_rfc3339()))
        .bind(job.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(&job.id.0)
        .bind(job.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM jobs WHERE id = ?")
                .bind(&job.id.0)
                .fetch_optional(&self.pool)
                .await?;

            return match exists {
                Some(_) => Err(StoreError::Conflict {
                    job_id: job.id.clone(),
                    expected_version: job.version,
                }),
                None => Err(StoreError::NotFound(job.id.clone())),
            };
        }

        Ok(job.version + 1)
    }

    async fn load_job(&self, id: &JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_job(row),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn query_jobs(
        &self,
        owner_id: Option<&str>,
        status: Option<JobStatus>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if owner_id.is_some() {
            sql.push_str(" AND owner_id = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if older_than.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(owner) = owner_id {
            query = query.bind(owner);
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        if let Some(cutoff) = older_than {
            query = query.bind(cutoff.to_rfc3339());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(|row| self.row_to_job(row)).collect()
    }

    async fn count_pending_through(
        &self,
        owner_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE owner_id = ?
              AND status IN ('created', 'queued')
              AND created_at <= ?
            "#,
        )
        .bind(owner_id)
        .bind(created_at.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn delete_expired(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            "#,
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
