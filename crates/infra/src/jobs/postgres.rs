//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Storage` otherwise |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//!
//! ## Claim exclusivity
//!
//! Every phase runs in one transaction. Candidate rows are locked with
//! `FOR UPDATE`; dequeue adds `SKIP LOCKED` so coordinators in other processes
//! never block on, or claim, a row another coordinator is claiming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use jobforge_core::{JobId, JobRecord, JobStatus};

use super::store::{JobStats, JobStore, JobStoreError, Reconcile};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS job_records (
        id            UUID PRIMARY KEY,
        name          TEXT NOT NULL,
        job_type      TEXT NOT NULL,
        data          JSONB NOT NULL,
        status        TEXT NOT NULL,
        exception     TEXT,
        queue_date    TIMESTAMPTZ NOT NULL,
        start_date    TIMESTAMPTZ,
        finish_date   TIMESTAMPTZ,
        schedule_name TEXT,
        retry_count   INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS job_records_dequeue_idx ON job_records (status, queue_date)",
    "CREATE INDEX IF NOT EXISTS job_records_schedule_idx ON job_records (schedule_name, queue_date)",
];

const COLUMNS: &str = "id, name, job_type, data, status, exception, queue_date, start_date, \
                       finish_date, schedule_name, retry_count";

/// Postgres-backed job store.
///
/// The `JobStore` trait is synchronous while sqlx is async: every trait call
/// is driven to completion on the captured runtime handle. Trait methods must
/// therefore be called from a plain thread (the coordinator thread), never
/// from inside an async task on that runtime.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Open a connection pool and make sure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self::new(pool, Handle::current());
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    #[instrument(
        skip(self, record),
        fields(job_type = %record.job_type, job_id = tracing::field::Empty),
        err
    )]
    pub async fn insert_job(&self, mut record: JobRecord) -> Result<JobRecord, JobStoreError> {
        if let Some(id) = record.id {
            return Err(JobStoreError::AlreadyExists(id));
        }
        if record.status != JobStatus::Queued {
            return Err(JobStoreError::Invalid(format!(
                "new records must be queued, got {}",
                record.status
            )));
        }
        record
            .validate()
            .map_err(|e| JobStoreError::Invalid(e.to_string()))?;

        let id = JobId::new();
        record.id = Some(id);
        Span::current().record("job_id", tracing::field::display(id));

        sqlx::query(
            r#"
            INSERT INTO job_records (
                id, name, job_type, data, status, exception,
                queue_date, start_date, finish_date, schedule_name, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&record.name)
        .bind(&record.job_type)
        .bind(&record.data)
        .bind(record.status.as_str())
        .bind(&record.exception)
        .bind(record.queue_date)
        .bind(record.start_date)
        .bind(record.finish_date)
        .bind(&record.schedule_name)
        .bind(record.retry_count as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(record)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_records WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self, claim), fields(claimed = tracing::field::Empty), err)]
    pub async fn claim_jobs(
        &self,
        max: usize,
        now: DateTime<Utc>,
        claim: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE status = $1 AND queue_date <= $2 \
             ORDER BY queue_date ASC, id ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(JobStatus::Queued.as_str())
        .bind(now)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_jobs", e))?;

        let candidates = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        let claimed = apply_and_write(&mut tx, candidates, claim).await?;
        commit(tx).await?;

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, active, reconcile), fields(status = %status, active = active.len()), err)]
    pub async fn reconcile_active(
        &self,
        status: JobStatus,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if active.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<uuid::Uuid> = active.iter().map(|id| *id.as_uuid()).collect();

        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE status = $1 AND id = ANY($2) \
             ORDER BY queue_date ASC \
             FOR UPDATE"
        ))
        .bind(status.as_str())
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reconcile_active", e))?;

        let candidates = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        let changed = apply_and_write(&mut tx, candidates, reconcile).await?;
        commit(tx).await?;
        Ok(changed)
    }

    #[instrument(skip(self, records, mutate), fields(records = records.len()), err)]
    pub async fn write_jobs(
        &self,
        records: Vec<JobRecord>,
        mutate: Option<Reconcile<'_>>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut tx = self.begin().await?;

        let mut current = Vec::with_capacity(records.len());
        for record in &records {
            let id = record
                .id
                .ok_or_else(|| JobStoreError::Invalid("record has no id".to_string()))?;
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM job_records WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("write_jobs", e))?;

            // Dropping the transaction rolls it back.
            let row = row.ok_or(JobStoreError::NotFound(id))?;
            current.push(decode_row(&row)?);
        }

        let changed = match mutate {
            Some(mutate) => apply_and_write(&mut tx, current, mutate).await?,
            None => apply_and_write(&mut tx, records, &mut |_| true).await?,
        };
        commit(tx).await?;
        Ok(changed)
    }

    #[instrument(skip(self, job_ids), fields(count = job_ids.len()), err)]
    pub async fn remove_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<uuid::Uuid> = job_ids.iter().map(|id| *id.as_uuid()).collect();

        let result = sqlx::query("DELETE FROM job_records WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_jobs", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_latest_scheduled(
        &self,
        schedule_name: &str,
    ) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE schedule_name = $1 \
             ORDER BY queue_date DESC, id DESC \
             LIMIT 1"
        ))
        .bind(schedule_name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_latest_scheduled", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_records \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY queue_date ASC, id ASC \
             LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_jobs", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM job_records GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: jobforge_core::DomainError| JobStoreError::Storage(e.to_string()))?;
            stats.add(status, usize::try_from(total).unwrap_or_default());
        }
        Ok(stats)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

/// Run `reconcile` over `records`; validate and write the ones it keeps.
async fn apply_and_write(
    tx: &mut Transaction<'static, Postgres>,
    records: Vec<JobRecord>,
    reconcile: Reconcile<'_>,
) -> Result<Vec<JobRecord>, JobStoreError> {
    let mut changed = Vec::with_capacity(records.len());
    for mut record in records {
        if !reconcile(&mut record) {
            continue;
        }
        record
            .validate()
            .map_err(|e| JobStoreError::Invalid(e.to_string()))?;
        write_row(tx, &record).await?;
        changed.push(record);
    }
    Ok(changed)
}

async fn write_row(
    tx: &mut Transaction<'static, Postgres>,
    record: &JobRecord,
) -> Result<(), JobStoreError> {
    let id = record
        .id
        .ok_or_else(|| JobStoreError::Invalid("record has no id".to_string()))?;

    let result = sqlx::query(
        r#"
        UPDATE job_records
        SET name = $2, job_type = $3, data = $4, status = $5, exception = $6,
            queue_date = $7, start_date = $8, finish_date = $9,
            schedule_name = $10, retry_count = $11
        WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .bind(&record.name)
    .bind(&record.job_type)
    .bind(&record.data)
    .bind(record.status.as_str())
    .bind(&record.exception)
    .bind(record.queue_date)
    .bind(record.start_date)
    .bind(record.finish_date)
    .bind(&record.schedule_name)
    .bind(record.retry_count as i32)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_row", e))?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::NotFound(id));
    }
    Ok(())
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), JobStoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Invalid(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct JobRecordRow {
    id: uuid::Uuid,
    name: String,
    job_type: String,
    data: serde_json::Value,
    status: String,
    exception: Option<String>,
    queue_date: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    finish_date: Option<DateTime<Utc>>,
    schedule_name: Option<String>,
    retry_count: i32,
}

impl<'r> FromRow<'r, PgRow> for JobRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRecordRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            job_type: row.try_get("job_type")?,
            data: row.try_get("data")?,
            status: row.try_get("status")?,
            exception: row.try_get("exception")?,
            queue_date: row.try_get("queue_date")?,
            start_date: row.try_get("start_date")?,
            finish_date: row.try_get("finish_date")?,
            schedule_name: row.try_get("schedule_name")?,
            retry_count: row.try_get("retry_count")?,
        })
    }
}

impl TryFrom<JobRecordRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: jobforge_core::DomainError| JobStoreError::Storage(e.to_string()))?;
        Ok(JobRecord {
            id: Some(JobId::from_uuid(row.id)),
            name: row.name,
            job_type: row.job_type,
            data: row.data,
            status,
            exception: row.exception,
            queue_date: row.queue_date,
            start_date: row.start_date,
            finish_date: row.finish_date,
            schedule_name: row.schedule_name,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
        })
    }
}

fn decode_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let row = JobRecordRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))?;
    row.try_into()
}

impl JobStore for PostgresJobStore {
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        self.runtime.block_on(self.insert_job(record))
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.fetch_job(job_id))
    }

    fn dequeue_jobs(
        &self,
        max: usize,
        now: DateTime<Utc>,
        claim: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.claim_jobs(max, now, claim))
    }

    fn canceling_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime
            .block_on(self.reconcile_active(JobStatus::Canceling, active, reconcile))
    }

    fn running_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime
            .block_on(self.reconcile_active(JobStatus::Started, active, reconcile))
    }

    fn update_jobs(
        &self,
        records: Vec<JobRecord>,
        mutate: Option<Reconcile<'_>>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.write_jobs(records, mutate))
    }

    fn delete_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError> {
        self.runtime.block_on(self.remove_jobs(job_ids))
    }

    fn latest_scheduled_job(&self, schedule_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        self.runtime
            .block_on(self.fetch_latest_scheduled(schedule_name))
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.runtime.block_on(self.fetch_jobs(status, limit))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.runtime.block_on(self.count_by_status())
    }
}
