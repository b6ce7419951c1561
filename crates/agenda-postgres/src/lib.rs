//! PostgreSQL-backed [`JobRepository`] for `agenda-core`.
//!
//! The atomic claim operation is the crux of the whole processor's
//! correctness (I1): `get_next_job_to_run` and `lock_job` both use a
//! `FOR UPDATE SKIP LOCKED` CTE so concurrent workers racing the same row
//! never both win it.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     data JSONB NOT NULL,
//!     job_type TEXT NOT NULL DEFAULT 'normal',
//!     priority INTEGER NOT NULL DEFAULT 0,
//!
//!     next_run_at TIMESTAMPTZ,
//!     locked_at TIMESTAMPTZ,
//!
//!     last_run_at TIMESTAMPTZ,
//!     last_finished_at TIMESTAMPTZ,
//!     failed_at TIMESTAMPTZ,
//!     fail_count INTEGER NOT NULL DEFAULT 0,
//!     fail_reason TEXT,
//!
//!     repeat_interval TEXT,
//!     repeat_at TEXT,
//!     repeat_timezone TEXT,
//!     start_date TIMESTAMPTZ,
//!     end_date TIMESTAMPTZ,
//!     skip_days TEXT,
//!
//!     disabled BOOLEAN NOT NULL DEFAULT FALSE,
//!     unique_key JSONB,
//!     unique_insert_only BOOLEAN,
//!     progress DOUBLE PRECISION
//! );
//!
//! CREATE INDEX idx_jobs_due ON jobs (name, next_run_at)
//!     WHERE disabled = FALSE AND locked_at IS NULL;
//! CREATE INDEX idx_jobs_locked ON jobs (locked_at)
//!     WHERE locked_at IS NOT NULL;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use agenda_postgres::PgJobRepository;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let repo = std::sync::Arc::new(PgJobRepository::new(pool));
//! let agenda = agenda_core::Agenda::new(repo, agenda_core::AgendaConfig::default());
//! ```

use agenda_core::{
    Job, JobPage, JobQuery, JobRepository, JobStateDelta, JobType, Priority, RepositoryError,
    UniqueOpts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        PgJobRepository { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(err.to_string())
}

fn row_to_job(row: PgRow) -> Result<Job, RepositoryError> {
    let job_type_raw: String = row.try_get("job_type").map_err(map_err)?;
    let unique_opts = row
        .try_get::<Option<bool>, _>("unique_insert_only")
        .map_err(map_err)?
        .map(|insert_only| UniqueOpts { insert_only });

    Ok(Job {
        id: row.try_get("id").map_err(map_err)?,
        name: row.try_get("name").map_err(map_err)?,
        data: row.try_get("data").map_err(map_err)?,
        job_type: if job_type_raw == "single" {
            JobType::Single
        } else {
            JobType::Normal
        },
        priority: Priority(row.try_get("priority").map_err(map_err)?),
        next_run_at: row.try_get("next_run_at").map_err(map_err)?,
        locked_at: row.try_get("locked_at").map_err(map_err)?,
        last_run_at: row.try_get("last_run_at").map_err(map_err)?,
        last_finished_at: row.try_get("last_finished_at").map_err(map_err)?,
        failed_at: row.try_get("failed_at").map_err(map_err)?,
        fail_count: row.try_get::<i32, _>("fail_count").map_err(map_err)? as u32,
        fail_reason: row.try_get("fail_reason").map_err(map_err)?,
        repeat_interval: row.try_get("repeat_interval").map_err(map_err)?,
        repeat_at: row.try_get("repeat_at").map_err(map_err)?,
        repeat_timezone: row.try_get("repeat_timezone").map_err(map_err)?,
        start_date: row.try_get("start_date").map_err(map_err)?,
        end_date: row.try_get("end_date").map_err(map_err)?,
        skip_days: row.try_get("skip_days").map_err(map_err)?,
        disabled: row.try_get("disabled").map_err(map_err)?,
        unique: row.try_get("unique_key").map_err(map_err)?,
        unique_opts,
        progress: row.try_get("progress").map_err(map_err)?,
    })
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn connect(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn save_job(&self, job: Job) -> Result<Job, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // §6.1: only a `single`-type match preserves the existing
        // `next_run_at` on update; a `unique`-key match overwrites it like
        // any other field.
        let (existing_id, preserve_next_run_at): (Option<Uuid>, bool) = if let Some(unique) = &job.unique {
            let id = sqlx::query_scalar("SELECT id FROM jobs WHERE name = $1 AND unique_key = $2 FOR UPDATE")
                .bind(&job.name)
                .bind(unique)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?;
            (id, false)
        } else if job.job_type == JobType::Single {
            let id = sqlx::query_scalar("SELECT id FROM jobs WHERE name = $1 FOR UPDATE")
                .bind(&job.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_err)?;
            (id, true)
        } else {
            (None, false)
        };

        let job_type_str = match job.job_type {
            JobType::Normal => "normal",
            JobType::Single => "single",
        };

        if let Some(existing_id) = existing_id {
            if job.unique_opts.map(|o| o.insert_only).unwrap_or(false) {
                let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
                    .bind(existing_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(map_err)?;
                tx.commit().await.map_err(map_err)?;
                return row_to_job(row);
            }

            let row = sqlx::query(
                r#"
                UPDATE jobs SET
                    data = $2, job_type = $3, priority = $4,
                    next_run_at = CASE WHEN $15 THEN next_run_at ELSE $5 END,
                    repeat_interval = $6, repeat_at = $7,
                    repeat_timezone = $8, start_date = $9, end_date = $10,
                    skip_days = $11, disabled = $12,
                    unique_key = $13, unique_insert_only = $14
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(existing_id)
            .bind(&job.data)
            .bind(job_type_str)
            .bind(job.priority.0)
            .bind(job.next_run_at)
            .bind(&job.repeat_interval)
            .bind(&job.repeat_at)
            .bind(&job.repeat_timezone)
            .bind(job.start_date)
            .bind(job.end_date)
            .bind(&job.skip_days)
            .bind(job.disabled)
            .bind(&job.unique)
            .bind(job.unique_opts.map(|o| o.insert_only))
            .bind(preserve_next_run_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
            tx.commit().await.map_err(map_err)?;
            return row_to_job(row);
        }

        let id = job.id.unwrap_or_else(Uuid::new_v4);
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, data, job_type, priority,
                next_run_at, locked_at,
                last_run_at, last_finished_at, failed_at, fail_count, fail_reason,
                repeat_interval, repeat_at, repeat_timezone,
                start_date, end_date, skip_days,
                disabled, unique_key, unique_insert_only, progress
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15,
                $16, $17, $18,
                $19, $20, $21, $22
            )
            ON CONFLICT (id) DO UPDATE SET
                data = EXCLUDED.data, job_type = EXCLUDED.job_type, priority = EXCLUDED.priority,
                next_run_at = EXCLUDED.next_run_at, disabled = EXCLUDED.disabled
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&job.name)
        .bind(&job.data)
        .bind(job_type_str)
        .bind(job.priority.0)
        .bind(job.next_run_at)
        .bind(job.locked_at)
        .bind(job.last_run_at)
        .bind(job.last_finished_at)
        .bind(job.failed_at)
        .bind(job.fail_count as i32)
        .bind(&job.fail_reason)
        .bind(&job.repeat_interval)
        .bind(&job.repeat_at)
        .bind(&job.repeat_timezone)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(&job.skip_days)
        .bind(job.disabled)
        .bind(&job.unique)
        .bind(job.unique_opts.map(|o| o.insert_only))
        .bind(job.progress)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        row_to_job(row)
    }

    /// Claims one due, unlocked-or-abandoned job for `name` (I1, §4.E).
    async fn get_next_job_to_run(
        &self,
        name: &str,
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM jobs
                WHERE name = $1
                  AND disabled = FALSE
                  AND next_run_at IS NOT NULL
                  AND next_run_at <= $2
                  AND (locked_at IS NULL OR locked_at <= $3)
                ORDER BY next_run_at ASC, priority DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET locked_at = $4
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(scan_horizon)
        .bind(lock_deadline)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.map(row_to_job).transpose()
    }

    async fn lock_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET locked_at = $2
            WHERE id = $1 AND disabled = FALSE AND locked_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.map(row_to_job).transpose()
    }

    async fn unlock_job(&self, id: Uuid) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE jobs SET locked_at = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn unlock_jobs(&self, ids: &[Uuid]) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE jobs SET locked_at = NULL WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn save_job_state(&self, id: Uuid, delta: JobStateDelta) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                last_run_at = COALESCE($2, last_run_at),
                last_finished_at = COALESCE($3, last_finished_at),
                failed_at = COALESCE($4, failed_at),
                fail_count = COALESCE($5, fail_count),
                fail_reason = CASE WHEN $6 THEN $7 ELSE fail_reason END,
                next_run_at = CASE WHEN $8 THEN $9 ELSE next_run_at END,
                locked_at = CASE WHEN $10 THEN $11 ELSE locked_at END,
                progress = CASE WHEN $12 THEN $13 ELSE progress END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(delta.last_run_at)
        .bind(delta.last_finished_at)
        .bind(delta.failed_at)
        .bind(delta.fail_count.map(|v| v as i32))
        .bind(delta.fail_reason.is_some())
        .bind(delta.fail_reason.flatten())
        .bind(delta.next_run_at.is_some())
        .bind(delta.next_run_at.flatten())
        .bind(delta.locked_at.is_some())
        .bind(delta.locked_at.flatten())
        .bind(delta.progress.is_some())
        .bind(delta.progress.flatten())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn remove_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let (clause, binds) = build_where(query);
        let sql = format!("DELETE FROM jobs WHERE {clause}");
        let mut q = sqlx::query(&sql);
        for filter in &binds {
            q = bind_one(q, filter);
        }
        let result = q.execute(&self.pool).await.map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<JobPage, RepositoryError> {
        let (clause, binds) = build_where(query);
        let sort = query.sort.unwrap_or_default();
        let order = format!(
            "next_run_at {}, priority {}",
            if sort.next_run_at_ascending { "ASC" } else { "DESC" },
            if sort.priority_descending { "DESC" } else { "ASC" },
        );

        let count_sql = format!("SELECT COUNT(*) FROM jobs WHERE {clause}");
        let mut count_q = sqlx::query_scalar(&count_sql);
        for filter in &binds {
            count_q = bind_one_scalar(count_q, filter);
        }
        let total: i64 = count_q.fetch_one(&self.pool).await.map_err(map_err)?;

        let mut sql = format!("SELECT * FROM jobs WHERE {clause} ORDER BY {order}");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(skip) = query.skip {
            sql.push_str(&format!(" OFFSET {skip}"));
        }

        let mut select_q = sqlx::query(&sql);
        for filter in &binds {
            select_q = bind_one(select_q, filter);
        }
        let rows = select_q.fetch_all(&self.pool).await.map_err(map_err)?;
        let records = rows.into_iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage { records, total })
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(row_to_job).transpose()
    }

    async fn get_queue_size(&self) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE disabled = FALSE AND next_run_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(count as u64)
    }

    async fn disable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let (clause, binds) = build_where(query);
        let sql = format!("UPDATE jobs SET disabled = TRUE WHERE {clause}");
        let mut q = sqlx::query(&sql);
        for filter in &binds {
            q = bind_one(q, filter);
        }
        let result = q.execute(&self.pool).await.map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn enable_jobs(&self, query: &JobQuery) -> Result<u64, RepositoryError> {
        let (clause, binds) = build_where(query);
        let sql = format!("UPDATE jobs SET disabled = FALSE WHERE {clause}");
        let mut q = sqlx::query(&sql);
        for filter in &binds {
            q = bind_one(q, filter);
        }
        let result = q.execute(&self.pool).await.map_err(map_err)?;
        Ok(result.rows_affected())
    }

    async fn get_distinct_job_names(&self) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT DISTINCT name FROM jobs ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(rows)
    }
}

/// One `JobQuery` field rendered to a placeholder plus its bound value.
enum Filter {
    Name(String),
    NamesNotIn(Vec<String>),
    Id(Uuid),
    Disabled(bool),
}

/// Builds a `WHERE` clause plus ordered bind values for the handful of
/// filter shapes `JobQuery` supports. Kept separate from query/sqlx types so
/// it stays pure and easy to reason about independent of row mapping.
fn build_where(query: &JobQuery) -> (String, Vec<Filter>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    let mut n = 1;

    if let Some(name) = &query.name {
        clauses.push(format!("name = ${n}"));
        binds.push(Filter::Name(name.clone()));
        n += 1;
    }
    if let Some(names_not_in) = &query.names_not_in {
        clauses.push(format!("NOT (name = ANY(${n}))"));
        binds.push(Filter::NamesNotIn(names_not_in.clone()));
        n += 1;
    }
    if let Some(id) = query.id {
        clauses.push(format!("id = ${n}"));
        binds.push(Filter::Id(id));
        n += 1;
    }
    if let Some(disabled) = query.disabled {
        clauses.push(format!("disabled = ${n}"));
        binds.push(Filter::Disabled(disabled));
    }

    if clauses.is_empty() {
        ("TRUE".to_string(), binds)
    } else {
        (clauses.join(" AND "), binds)
    }
}

fn bind_one<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    filter: &'q Filter,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match filter {
        Filter::Name(v) => query.bind(v),
        Filter::NamesNotIn(v) => query.bind(v),
        Filter::Id(v) => query.bind(v),
        Filter::Disabled(v) => query.bind(v),
    }
}

fn bind_one_scalar<'q, O>(
    query: sqlx::query_scalar::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    filter: &'q Filter,
) -> sqlx::query_scalar::QueryScalar<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    match filter {
        Filter::Name(v) => query.bind(v),
        Filter::NamesNotIn(v) => query.bind(v),
        Filter::Id(v) => query.bind(v),
        Filter::Disabled(v) => query.bind(v),
    }
}
