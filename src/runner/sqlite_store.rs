//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::store::{NewTask, RecordedError, RunFilter, StoreError, StoredTask, TaskId, TaskStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offqueue_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    manually_run INTEGER NOT NULL DEFAULT 0,
    group_id TEXT,
    data_id TEXT,
    tag TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_offqueue_tasks_identity
ON offqueue_tasks(tag, data_id) WHERE group_id IS NULL;

CREATE INDEX IF NOT EXISTS idx_offqueue_tasks_group
ON offqueue_tasks(group_id, created_at);

CREATE INDEX IF NOT EXISTS idx_offqueue_tasks_runnable
ON offqueue_tasks(manually_run, created_at);

CREATE TABLE IF NOT EXISTS offqueue_task_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL UNIQUE REFERENCES offqueue_tasks(id) ON DELETE CASCADE,
    created_at INTEGER NOT NULL,
    error_message TEXT,
    error_id TEXT
);

CREATE TABLE IF NOT EXISTS offqueue_flags (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
)
"#;

const TASK_COLUMNS: &str = "id, created_at, manually_run, group_id, data_id, tag";

const RERUN_FLAG_KEY: &str = "rerun_current_task";

type TaskRow = (i64, i64, bool, Option<String>, Option<String>, String);

type ErrorRow = (i64, i64, Option<String>, Option<String>);

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn timestamp(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {micros}")))
}

fn into_task(row: TaskRow) -> Result<StoredTask, StoreError> {
    let (id, created_at, manually_run, group_id, data_id, tag) = row;
    Ok(StoredTask {
        id: TaskId(id),
        tag,
        data_id,
        group_id,
        manually_run,
        created_at: timestamp(created_at)?,
    })
}

fn into_error(row: ErrorRow) -> Result<RecordedError, StoreError> {
    let (task_id, created_at, message, error_id) = row;
    Ok(RecordedError {
        task_id: TaskId(task_id),
        created_at: timestamp(created_at)?,
        message,
        error_id,
    })
}

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<StoredTask>, StoreError> {
    rows.into_iter().map(into_task).collect()
}

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the task, error, and flag tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        Ok(())
    }

    async fn fetch_one_task(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Option<StoredTask>, StoreError> {
        let mut query = sqlx::query_as::<_, TaskRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(into_task)
            .transpose()
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(
        &self,
        task: &NewTask,
        created_at: DateTime<Utc>,
    ) -> Result<StoredTask, StoreError> {
        let sql = format!(
            "INSERT INTO offqueue_tasks (created_at, manually_run, group_id, data_id, tag) \
             VALUES (?, ?, ?, ?, ?) RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(created_at.timestamp_micros())
            .bind(task.manually_run)
            .bind(task.group_id.as_deref())
            .bind(task.data_id.as_deref())
            .bind(task.tag.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;

        into_task(row)
    }

    async fn replace_by_identity(
        &self,
        task: &NewTask,
        created_at: DateTime<Utc>,
    ) -> Result<StoredTask, StoreError> {
        // Delete and insert in one transaction so nobody sees the identity vanish.
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(
            r#"
            DELETE FROM offqueue_task_errors
            WHERE task_id IN (
                SELECT id FROM offqueue_tasks WHERE tag = ? AND data_id IS ?
            )
            "#,
        )
        .bind(task.tag.as_str())
        .bind(task.data_id.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query("DELETE FROM offqueue_tasks WHERE tag = ? AND data_id IS ?")
            .bind(task.tag.as_str())
            .bind(task.data_id.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let sql = format!(
            "INSERT INTO offqueue_tasks (created_at, manually_run, group_id, data_id, tag) \
             VALUES (?, ?, ?, ?, ?) RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(created_at.timestamp_micros())
            .bind(task.manually_run)
            .bind(task.group_id.as_deref())
            .bind(task.data_id.as_deref())
            .bind(task.tag.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        into_task(row)
    }

    async fn get(&self, id: TaskId) -> Result<Option<StoredTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM offqueue_tasks WHERE id = ?");
        sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(into_task)
            .transpose()
    }

    async fn find_by_identity(
        &self,
        tag: &str,
        data_id: Option<&str>,
    ) -> Result<Vec<StoredTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offqueue_tasks \
             WHERE tag = ? AND data_id IS ? ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(tag)
            .bind(data_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        into_tasks(rows)
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<StoredTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM offqueue_tasks WHERE tag = ? LIMIT 1");
        self.fetch_one_task(&sql, &[tag]).await
    }

    async fn group_head(&self, group_id: &str) -> Result<Option<StoredTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offqueue_tasks \
             WHERE group_id = ? ORDER BY created_at, id LIMIT 1"
        );
        self.fetch_one_task(&sql, &[group_id]).await
    }

    async fn group_tail(&self, group_id: &str) -> Result<Option<StoredTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offqueue_tasks \
             WHERE group_id = ? ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        self.fetch_one_task(&sql, &[group_id]).await
    }

    async fn runnable_in_group(&self, group_id: &str) -> Result<Vec<StoredTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM offqueue_tasks \
             WHERE group_id = ? AND manually_run = 0 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        into_tasks(rows)
    }

    async fn next_eligible(
        &self,
        after: TaskId,
        excluded_groups: &[String],
        filter: &RunFilter,
    ) -> Result<Option<StoredTask>, StoreError> {
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM offqueue_tasks WHERE id > ? AND manually_run = 0"
        );

        // NOT IN on its own would drop ungrouped rows, since NULL NOT IN (...) is NULL.
        if !excluded_groups.is_empty() {
            let placeholders: Vec<&str> = excluded_groups.iter().map(|_| "?").collect();
            sql.push_str(&format!(
                " AND (group_id IS NULL OR group_id NOT IN ({}))",
                placeholders.join(",")
            ));
        }
        if filter.group_id.is_some() {
            sql.push_str(" AND group_id = ?");
        }
        sql.push_str(" ORDER BY created_at, id LIMIT 1");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(after.0);
        for group_id in excluded_groups {
            query = query.bind(group_id.as_str());
        }
        if let Some(group_id) = &filter.group_id {
            query = query.bind(group_id.as_str());
        }

        query
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(into_task)
            .transpose()
    }

    async fn count_eligible(&self, filter: &RunFilter) -> Result<usize, StoreError> {
        let count: i64 = match &filter.group_id {
            Some(group_id) => sqlx::query_scalar(
                "SELECT COUNT(*) FROM offqueue_tasks WHERE manually_run = 0 AND group_id = ?",
            )
            .bind(group_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM offqueue_tasks WHERE manually_run = 0")
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?,
        };

        Ok(count as usize)
    }

    async fn all_tasks(&self) -> Result<Vec<StoredTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM offqueue_tasks ORDER BY created_at, id");
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        into_tasks(rows)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        // Delete strictly by id: a row replaced since it was read has a new id
        // and must survive.
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("DELETE FROM offqueue_task_errors WHERE task_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let result = sqlx::query("DELETE FROM offqueue_tasks WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn error_for(&self, task_id: TaskId) -> Result<Option<RecordedError>, StoreError> {
        sqlx::query_as::<_, ErrorRow>(
            r#"
            SELECT task_id, created_at, error_message, error_id
            FROM offqueue_task_errors
            WHERE task_id = ?
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .map(into_error)
        .transpose()
    }

    async fn upsert_error(
        &self,
        task_id: TaskId,
        message: Option<&str>,
        error_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<RecordedError, StoreError> {
        let row = sqlx::query_as::<_, ErrorRow>(
            r#"
            INSERT INTO offqueue_task_errors (task_id, created_at, error_message, error_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                created_at = excluded.created_at,
                error_message = excluded.error_message,
                error_id = excluded.error_id
            RETURNING task_id, created_at, error_message, error_id
            "#,
        )
        .bind(task_id.0)
        .bind(created_at.timestamp_micros())
        .bind(message)
        .bind(error_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        into_error(row)
    }

    async fn delete_error(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM offqueue_task_errors WHERE task_id = ?")
            .bind(task_id.0)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        Ok(result.rows_affected() > 0)
    }

    async fn all_errors(&self) -> Result<Vec<RecordedError>, StoreError> {
        let rows = sqlx::query_as::<_, ErrorRow>(
            r#"
            SELECT task_id, created_at, error_message, error_id
            FROM offqueue_task_errors
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.into_iter().map(into_error).collect()
    }

    async fn rerun_flag(&self) -> Result<bool, StoreError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM offqueue_flags WHERE key = ?")
            .bind(RERUN_FLAG_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

        Ok(value.unwrap_or(0) != 0)
    }

    async fn set_rerun_flag(&self, rerun: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO offqueue_flags (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(RERUN_FLAG_KEY)
        .bind(i64::from(rerun))
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        for table in ["offqueue_task_errors", "offqueue_tasks", "offqueue_flags"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;

        Ok(())
    }
}
