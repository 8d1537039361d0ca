//! PostgreSQL implementation of TaskStore
//!
//! Production persistence with:
//! - Conditional status updates for safe concurrent transitions
//! - One transaction per lifecycle change (row update + execution record)
//! - Atomic workflow inserts

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::breaker::CircuitState;
use crate::retry::RetryStrategy;
use crate::task::{
    is_valid_transition, DependencyKind, DlqEntry, ExecutionRecord, Task, TaskDescriptor,
    TaskStatus, WorkerRecord, WorkerState,
};

/// PostgreSQL implementation of TaskStore
///
/// Uses a connection pool for efficient access; safe to clone and share.
///
/// # Example
///
/// ```ignore
/// use taskflow_core::store::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/taskflow").await?;
/// let store = PostgresStore::new(pool);
/// store.run_migrations().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

const INSERT_TASK_SQL: &str = r#"
    INSERT INTO tasks (
        id, name, args, kwargs, priority, status,
        retry_count, max_retries, retry_strategy,
        backoff_base_seconds, max_backoff_seconds, next_retry_at,
        timeout_seconds, depends_on, dependency_kind,
        parent_task_id, workflow_id, scheduled_at, cron_expression, is_recurring,
        skipped, cancel_requested, worker_id, error_message, result,
        created_at, queued_at, started_at, completed_at, failed_at, updated_at
    )
    VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
        $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31
    )
"#;

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn bind_task<'q>(
        task: &'q Task,
        args: serde_json::Value,
        kwargs: serde_json::Value,
        depends_on: serde_json::Value,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        let d = &task.descriptor;
        sqlx::query(INSERT_TASK_SQL)
            .bind(task.id)
            .bind(&d.name)
            .bind(args)
            .bind(kwargs)
            .bind(d.priority)
            .bind(task.status.to_string())
            .bind(task.retry_count as i32)
            .bind(d.max_retries as i32)
            .bind(d.retry_strategy.to_string())
            .bind(d.backoff_base_seconds as i64)
            .bind(d.max_backoff_seconds as i64)
            .bind(task.next_retry_at)
            .bind(d.timeout_seconds as i64)
            .bind(depends_on)
            .bind(dependency_kind_str(d.dependency_kind))
            .bind(d.parent_task_id)
            .bind(d.workflow_id)
            .bind(d.scheduled_at)
            .bind(&d.cron_expression)
            .bind(d.is_recurring)
            .bind(task.skipped)
            .bind(task.cancel_requested)
            .bind(task.worker_id)
            .bind(&task.error_message)
            .bind(&task.result)
            .bind(task.created_at)
            .bind(task.queued_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.failed_at)
            .bind(task.updated_at)
    }

    fn descriptor_json(
        task: &Task,
    ) -> Result<(serde_json::Value, serde_json::Value, serde_json::Value), StoreError> {
        let args = serde_json::to_value(&task.descriptor.args)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let kwargs = serde_json::to_value(&task.descriptor.kwargs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let depends_on = serde_json::to_value(&task.descriptor.depends_on)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok((args, kwargs, depends_on))
    }

    async fn fetch_tasks(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            error!("Failed to fetch tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let (args, kwargs, depends_on) = Self::descriptor_json(task)?;
        Self::bind_task(task, args, kwargs, depends_on)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to insert task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%task.id, name = %task.descriptor.name, "inserted task");
        Ok(())
    }

    #[instrument(skip(self, tasks))]
    async fn insert_workflow(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for task in tasks {
            let (args, kwargs, depends_on) = Self::descriptor_json(task)?;
            Self::bind_task(task, args, kwargs, depends_on)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(count = tasks.len(), "inserted workflow tasks");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self, change), fields(next_status = %change.target()))]
    async fn transition(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        change: StatusChange,
    ) -> Result<Task, StoreError> {
        let target = change.target();
        if !is_valid_transition(expected, target) {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: expected,
                to: target,
            });
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = match &change {
            StatusChange::Queued => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'queued', queued_at = NOW(), worker_id = NULL,
                        next_retry_at = NULL, updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .fetch_optional(&mut *tx)
                .await
            }
            StatusChange::Running { worker_id } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'running', started_at = NOW(), worker_id = $3,
                        updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .bind(worker_id)
                .fetch_optional(&mut *tx)
                .await
            }
            StatusChange::Completed { result } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'completed', completed_at = NOW(), result = $3,
                        updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .bind(result)
                .fetch_optional(&mut *tx)
                .await
            }
            StatusChange::Failed { error } | StatusChange::TimedOut { error } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = $3, failed_at = NOW(), error_message = $4,
                        updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .bind(target.to_string())
                .bind(error)
                .fetch_optional(&mut *tx)
                .await
            }
            StatusChange::Retrying { next_retry_at } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'retrying', retry_count = retry_count + 1,
                        next_retry_at = $3, updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .bind(next_retry_at)
                .fetch_optional(&mut *tx)
                .await
            }
            StatusChange::Cancelled => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    RETURNING *
                    "#,
                )
                .bind(task_id)
                .bind(expected.to_string())
                .fetch_optional(&mut *tx)
                .await
            }
        }
        .map_err(|e| {
            error!("Failed to transition task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            // The conditional update matched nothing: stale expectation or no row.
            let current = sqlx::query("SELECT status FROM tasks WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            return match current {
                Some(row) => {
                    let status: String = row.get("status");
                    let from = TaskStatus::from_str(&status)
                        .map_err(StoreError::Serialization)?;
                    Err(StoreError::InvalidTransition {
                        task_id,
                        from,
                        to: target,
                    })
                }
                None => Err(StoreError::TaskNotFound(task_id)),
            };
        };

        let task = task_from_row(&row)?;

        let ends_attempt = matches!(
            change,
            StatusChange::Completed { .. }
                | StatusChange::Failed { .. }
                | StatusChange::TimedOut { .. }
        ) || (matches!(change, StatusChange::Cancelled)
            && expected == TaskStatus::Running);

        if ends_attempt {
            sqlx::query(
                r#"
                INSERT INTO task_executions (
                    id, task_id, worker_id, attempt_number,
                    started_at, completed_at, status, error_message
                )
                VALUES ($1, $2, $3, $4, $5, NOW(), $6, $7)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(task_id)
            .bind(task.worker_id)
            .bind(task.attempt_number() as i32)
            .bind(task.started_at)
            .bind(task.status.to_string())
            .bind(&task.error_message)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%task_id, from = %expected, to = %target, "transitioned task");
        Ok(task)
    }

    #[instrument(skip(self, error))]
    async fn propagate_failure(&self, task_id: Uuid, error: String) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', failed_at = NOW(), error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(&error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::InvalidTransition {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Failed,
        })?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn skip(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', skipped = TRUE, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::InvalidTransition {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Completed,
        })?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self, filter, pagination))]
    async fn list_tasks(
        &self,
        filter: TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::int IS NULL OR priority = $2)
              AND ($3::uuid IS NULL OR worker_id = $3)
              AND ($4::uuid IS NULL OR workflow_id = $4)
              AND ($5::text IS NULL OR name = $5)
            ORDER BY created_at DESC
            OFFSET $6
            LIMIT $7
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.priority)
        .bind(filter.worker_id)
        .bind(filter.workflow_id)
        .bind(filter.name)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64);

        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let query = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'pending' AND scheduled_at IS NOT NULL AND scheduled_at <= $1",
        )
        .bind(now);
        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let query = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'retrying' AND next_retry_at IS NOT NULL AND next_retry_at <= $1",
        )
        .bind(now);
        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let query =
            sqlx::query("SELECT * FROM tasks WHERE status = 'running' AND worker_id = $1")
                .bind(worker_id);
        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn stale_running(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        let query = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'running'
              AND started_at IS NOT NULL
              AND started_at + make_interval(secs => (timeout_seconds + $2)::double precision) < $1
            "#,
        )
        .bind(now)
        .bind(grace.as_secs() as i64);
        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn pending_children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let query =
            sqlx::query("SELECT * FROM tasks WHERE status = 'pending' AND depends_on @> $1")
                .bind(serde_json::json!([parent_id]));
        self.fetch_tasks(query).await
    }

    #[instrument(skip(self))]
    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, worker_id, attempt_number,
                   started_at, completed_at, status, error_message
            FROM task_executions
            WHERE task_id = $1
            ORDER BY completed_at
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(ExecutionRecord {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    worker_id: row.get("worker_id"),
                    attempt_number: row.get::<i32, _>("attempt_number") as u32,
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    status: TaskStatus::from_str(&status).map_err(StoreError::Serialization)?,
                    error_message: row.get("error_message"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workers (
                id, hostname, status, capacity, current_load,
                last_heartbeat, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                status = EXCLUDED.status,
                capacity = EXCLUDED.capacity,
                current_load = EXCLUDED.current_load,
                last_heartbeat = EXCLUDED.last_heartbeat,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(worker.id)
        .bind(&worker.hostname)
        .bind(worker.status.to_string())
        .bind(worker.capacity as i32)
        .bind(worker.current_load as i32)
        .bind(worker.last_heartbeat)
        .bind(worker.created_at)
        .bind(worker.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register worker: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(worker_id = %worker.id, "registered worker");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_worker(&self, worker_id: Uuid) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn worker_heartbeat(
        &self,
        worker_id: Uuid,
        current_load: u32,
    ) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat = NOW(),
                current_load = LEAST($2, capacity),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(current_load as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn set_worker_status(
        &self,
        worker_id: Uuid,
        status: WorkerState,
    ) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE workers SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(worker_id)
        .bind(status.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn set_worker_capacity(
        &self,
        worker_id: Uuid,
        capacity: u32,
    ) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workers
            SET capacity = GREATEST($2, 1), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(capacity as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker_from_row(&row)
    }

    #[instrument(skip(self, filter))]
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(filter.status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(worker_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn expired_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workers
            WHERE status IN ('active', 'idle', 'draining')
              AND COALESCE(last_heartbeat, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(worker_from_row).collect()
    }

    #[instrument(skip(self, entry), fields(task_id = %entry.task_id))]
    async fn insert_dlq(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        let descriptor = serde_json::to_value(&entry.descriptor)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO dead_letter_queue (task_id, reason, attempts, descriptor, dead_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.task_id)
        .bind(&entry.reason)
        .bind(entry.attempts as i32)
        .bind(descriptor)
        .bind(entry.dead_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert DLQ entry: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(task_id = %entry.task_id, "inserted DLQ entry");
        Ok(())
    }

    #[instrument(skip(self, pagination))]
    async fn list_dlq(&self, pagination: Pagination) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, reason, attempts, descriptor, dead_at
            FROM dead_letter_queue
            ORDER BY seq
            OFFSET $1
            LIMIT $2
            "#,
        )
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(dlq_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, reason, attempts, descriptor, dead_at FROM dead_letter_queue WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::DlqEntryNotFound(task_id))?;

        dlq_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn remove_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM dead_letter_queue
            WHERE task_id = $1
            RETURNING task_id, reason, attempts, descriptor, dead_at
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::DlqEntryNotFound(task_id))?;

        dlq_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_breaker(&self, name: &str) -> Result<Option<BreakerRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM circuit_breakers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(breaker_from_row).transpose()
    }

    #[instrument(skip(self, row), fields(name = %row.name))]
    async fn put_breaker(&self, row: &BreakerRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (name, state, failure_count, opened_at, probe_in_flight, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (name) DO UPDATE SET
                state = EXCLUDED.state,
                failure_count = EXCLUDED.failure_count,
                opened_at = EXCLUDED.opened_at,
                probe_in_flight = EXCLUDED.probe_in_flight,
                updated_at = NOW()
            "#,
        )
        .bind(&row.name)
        .bind(row.state.to_string())
        .bind(row.failure_count as i32)
        .bind(row.opened_at)
        .bind(row.probe_in_flight)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_probe(&self, name: &str, recovery: Duration) -> Result<bool, StoreError> {
        let eligible_before =
            Utc::now() - chrono::Duration::from_std(recovery).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE circuit_breakers
            SET state = 'half_open', probe_in_flight = TRUE, updated_at = NOW()
            WHERE name = $1 AND state = 'open' AND opened_at <= $2
            "#,
        )
        .bind(name)
        .bind(eligible_before)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// Row mapping helpers

fn dependency_kind_str(kind: DependencyKind) -> &'static str {
    match kind {
        DependencyKind::WaitForAll => "wait_for_all",
        DependencyKind::WaitForAny => "wait_for_any",
        DependencyKind::Sequential => "sequential",
    }
}

fn parse_dependency_kind(raw: &str) -> Result<DependencyKind, StoreError> {
    match raw {
        "wait_for_all" => Ok(DependencyKind::WaitForAll),
        "wait_for_any" => Ok(DependencyKind::WaitForAny),
        "sequential" => Ok(DependencyKind::Sequential),
        other => Err(StoreError::Serialization(format!(
            "unknown dependency kind: {other}"
        ))),
    }
}

fn parse_retry_strategy(raw: &str) -> Result<RetryStrategy, StoreError> {
    match raw {
        "immediate" => Ok(RetryStrategy::Immediate),
        "linear" => Ok(RetryStrategy::Linear),
        "exponential" => Ok(RetryStrategy::Exponential),
        "custom" => Ok(RetryStrategy::Custom),
        other => Err(StoreError::Serialization(format!(
            "unknown retry strategy: {other}"
        ))),
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    let strategy: String = row.get("retry_strategy");
    let kind: String = row.get("dependency_kind");

    let args: serde_json::Value = row.get("args");
    let args: Vec<serde_json::Value> =
        serde_json::from_value(args).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let kwargs: serde_json::Value = row.get("kwargs");
    let kwargs: serde_json::Map<String, serde_json::Value> =
        serde_json::from_value(kwargs).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let depends_on: serde_json::Value = row.get("depends_on");
    let depends_on: Vec<Uuid> = serde_json::from_value(depends_on)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Task {
        id: row.get("id"),
        descriptor: TaskDescriptor {
            name: row.get("name"),
            args,
            kwargs,
            priority: row.get("priority"),
            max_retries: row.get::<i32, _>("max_retries") as u32,
            retry_strategy: parse_retry_strategy(&strategy)?,
            backoff_base_seconds: row.get::<i64, _>("backoff_base_seconds") as u64,
            max_backoff_seconds: row.get::<i64, _>("max_backoff_seconds") as u64,
            timeout_seconds: row.get::<i64, _>("timeout_seconds") as u64,
            scheduled_at: row.get("scheduled_at"),
            cron_expression: row.get("cron_expression"),
            is_recurring: row.get("is_recurring"),
            depends_on,
            dependency_kind: parse_dependency_kind(&kind)?,
            parent_task_id: row.get("parent_task_id"),
            workflow_id: row.get("workflow_id"),
        },
        status: TaskStatus::from_str(&status).map_err(StoreError::Serialization)?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        next_retry_at: row.get("next_retry_at"),
        skipped: row.get("skipped"),
        cancel_requested: row.get("cancel_requested"),
        worker_id: row.get("worker_id"),
        error_message: row.get("error_message"),
        result: row.get("result"),
        created_at: row.get("created_at"),
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        failed_at: row.get("failed_at"),
        updated_at: row.get("updated_at"),
    })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRecord, StoreError> {
    let status: String = row.get("status");
    Ok(WorkerRecord {
        id: row.get("id"),
        hostname: row.get("hostname"),
        status: WorkerState::from_str(&status).map_err(StoreError::Serialization)?,
        capacity: row.get::<i32, _>("capacity") as u32,
        current_load: row.get::<i32, _>("current_load") as u32,
        last_heartbeat: row.get("last_heartbeat"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn dlq_from_row(row: &PgRow) -> Result<DlqEntry, StoreError> {
    let descriptor: serde_json::Value = row.get("descriptor");
    Ok(DlqEntry {
        task_id: row.get("task_id"),
        reason: row.get("reason"),
        attempts: row.get::<i32, _>("attempts") as u32,
        descriptor: serde_json::from_value(descriptor)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        dead_at: row.get("dead_at"),
    })
}

fn breaker_from_row(row: &PgRow) -> Result<BreakerRow, StoreError> {
    let state: String = row.get("state");
    Ok(BreakerRow {
        name: row.get("name"),
        state: CircuitState::from_str(&state).map_err(StoreError::Serialization)?,
        failure_count: row.get::<i32, _>("failure_count") as u32,
        opened_at: row.get("opened_at"),
        probe_in_flight: row.get("probe_in_flight"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    // Conditional-transition and claim semantics are covered against the
    // in-memory store; running these against PostgreSQL requires DATABASE_URL
    // and the embedded migrations.
}
