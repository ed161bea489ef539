//! Embedded-relational backend: a single SQLite file, one table
//! `bazel_query_jobs`. SQLite's single-writer model gives us serializable
//! isolation for free; `BEGIN IMMEDIATE` takes the write lock up front so a
//! transaction that starts with a read and later writes can't be starved by
//! another writer that slipped in between.

use std::str::FromStr;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{BackendError, QueueError};
use crate::types::{format_timestamp, parse_timestamp, JobRecord, JobStatus, Triple};

use super::{StorageBackend, StorageTransaction, TransactionOp};

const TABLE: &str = "bazel_query_jobs";

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn connect(path: &str) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|source| BackendError::Sql { operation: "sqlite::connect_options", source })?
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // This bounds how many *readers* can be in flight, not writers:
            // every transaction here starts with `BEGIN IMMEDIATE`, which
            // takes SQLite's single file-level write lock up front, so
            // writer concurrency is pinned to one regardless of how many
            // pooled connections we hand out (SPEC_FULL.md §4.1). A
            // transaction that needs the write lock simply blocks (up to
            // `busy_timeout`) until the current writer commits or rolls
            // back.
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|source| BackendError::Pool { operation: "sqlite::connect", source })?;

        Ok(SqliteBackend { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

struct SqliteTx<'c> {
    tx: Transaction<'c, Sqlite>,
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, QueueError> {
    let id: String = row.try_get("id").map_err(sql_err("decode id"))?;
    let status_raw: String = row.try_get("status").map_err(sql_err("decode status"))?;
    let queue_time_raw: String = row.try_get("queue_time").map_err(sql_err("decode queue_time"))?;
    let start_time_raw: Option<String> = row.try_get("start_time").map_err(sql_err("decode start_time"))?;
    let finish_time_raw: Option<String> = row.try_get("finish_time").map_err(sql_err("decode finish_time"))?;

    Ok(JobRecord {
        id: Uuid::parse_str(&id).map_err(|_| QueueError::Backend(BackendError::Sql {
            operation: "decode id",
            source: sqlx::Error::Decode("invalid uuid in id column".into()),
        }))?,
        repository: row.try_get("repository").map_err(sql_err("decode repository"))?,
        commit: row.try_get("commit_hash").map_err(sql_err("decode commit_hash"))?,
        query: row.try_get("query_string").map_err(sql_err("decode query_string"))?,
        status: JobStatus::parse(&status_raw).ok_or_else(|| QueueError::Backend(BackendError::Sql {
            operation: "decode status",
            source: sqlx::Error::Decode(format!("unknown status {status_raw}").into()),
        }))?,
        worker: row.try_get("worker").map_err(sql_err("decode worker"))?,
        queue_time: parse_timestamp(&queue_time_raw).ok_or_else(|| QueueError::Backend(BackendError::Sql {
            operation: "decode queue_time",
            source: sqlx::Error::Decode("invalid timestamp".into()),
        }))?,
        start_time: start_time_raw.as_deref().and_then(parse_timestamp),
        finish_time: finish_time_raw.as_deref().and_then(parse_timestamp),
        result_url: row.try_get("result_url").map_err(sql_err("decode result_url"))?,
        result_error: row.try_get("result_error").map_err(sql_err("decode result_error"))?,
    })
}

fn sql_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |source| QueueError::Backend(BackendError::Sql { operation, source })
}

fn is_conflict(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        // SQLITE_BUSY == 5, SQLITE_LOCKED == 6.
        matches!(db_err.code().as_deref(), Some("5") | Some("6"))
    } else {
        false
    }
}

fn map_sql_error(operation: &'static str, err: sqlx::Error) -> QueueError {
    if is_conflict(&err) {
        QueueError::ConcurrentTransaction
    } else {
        QueueError::Backend(BackendError::Sql { operation, source: err })
    }
}

impl<'c> StorageTransaction for SqliteTx<'c> {
    fn find_by_triple_nonfailed<'a>(
        &'a mut self,
        triple: &'a Triple,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT * FROM {TABLE} WHERE repository = ? AND commit_hash = ? AND query_string = ? AND status != 'FAILED'"
            );
            let row = sqlx::query(&sql)
                .bind(&triple.repository)
                .bind(&triple.commit)
                .bind(&triple.query)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sql_error("find_by_triple_nonfailed", e))?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    fn find_by_id<'a>(
        &'a mut self,
        id: Uuid,
    ) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>> {
        Box::pin(async move {
            let sql = format!("SELECT * FROM {TABLE} WHERE id = ?");
            let row = sqlx::query(&sql)
                .bind(id.to_string())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sql_error("find_by_id", e))?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    fn find_oldest_pending<'a>(&'a mut self) -> BoxFuture<'a, Result<Option<JobRecord>, QueueError>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT * FROM {TABLE} WHERE status = 'PENDING' ORDER BY queue_time ASC LIMIT 1"
            );
            let row = sqlx::query(&sql)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| map_sql_error("find_oldest_pending", e))?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    fn insert<'a>(&'a mut self, record: &'a JobRecord) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {TABLE} (id, repository, commit_hash, query_string, status, worker, queue_time, start_time, finish_time, result_url, result_error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            sqlx::query(&sql)
                .bind(record.id.to_string())
                .bind(&record.repository)
                .bind(&record.commit)
                .bind(&record.query)
                .bind(record.status.as_str())
                .bind(&record.worker)
                .bind(format_timestamp(&record.queue_time))
                .bind(record.start_time.as_ref().map(format_timestamp))
                .bind(record.finish_time.as_ref().map(format_timestamp))
                .bind(&record.result_url)
                .bind(&record.result_error)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sql_error("insert", e))?;
            Ok(())
        })
    }

    fn update<'a>(&'a mut self, record: &'a JobRecord) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {TABLE} SET status = ?, worker = ?, start_time = ?, finish_time = ?, result_url = ?, result_error = ? WHERE id = ?"
            );
            let result = sqlx::query(&sql)
                .bind(record.status.as_str())
                .bind(&record.worker)
                .bind(record.start_time.as_ref().map(format_timestamp))
                .bind(record.finish_time.as_ref().map(format_timestamp))
                .bind(&record.result_url)
                .bind(&record.result_error)
                .bind(record.id.to_string())
                .execute(&mut *self.tx)
                .await
                .map_err(|e| map_sql_error("update", e))?;
            if result.rows_affected() == 0 {
                return Err(QueueError::NotFound(record.id));
            }
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for SqliteBackend {
    async fn run_in_transaction(&self, op: TransactionOp<JobRecord>) -> Result<JobRecord, QueueError> {
        run_in_transaction_impl(&self.pool, op).await
    }

    async fn run_in_transaction_unit(&self, op: TransactionOp<()>) -> Result<(), QueueError> {
        run_in_transaction_impl(&self.pool, op).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let sql = format!("SELECT * FROM {TABLE} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sql_error("get_by_id", e))?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        let sql = include_str!("../../../migrations/sqlite/0001_init.sql");
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sql_error("run_migrations", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn run_in_transaction_impl<T: Send>(
    pool: &SqlitePool,
    op: TransactionOp<T>,
) -> Result<T, QueueError> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|source| QueueError::Backend(BackendError::Pool { operation: "acquire", source }))?;
    let tx = conn
        .begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| map_sql_error("begin_immediate", e))?;
    let mut wrapper = SqliteTx { tx };

    let result = op(&mut wrapper).await;

    match result {
        Ok(value) => {
            wrapper
                .tx
                .commit()
                .await
                .map_err(|e| map_sql_error("commit", e))?;
            Ok(value)
        }
        Err(e) => {
            let _ = wrapper.tx.rollback().await;
            Err(e)
        }
    }
}
