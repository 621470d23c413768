//! Postgres persistence adapter.
//!
//! The schema lives in `migrations/` and is applied through embedded SQLx
//! migrations. All cross-worker coordination happens through these tables;
//! every public operation here is a single transaction, and the claim path
//! uses `FOR UPDATE SKIP LOCKED` so competing workers never block each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::definition::Node;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Runnable,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runnable => "runnable",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(text: &str) -> StoreResult<Self> {
        match text {
            "runnable" => Ok(Self::Runnable),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Message(format!(
                "unknown instance status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(text: &str) -> StoreResult<Self> {
        match text {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Message(format!("unknown step status: {other}"))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored workflow definition.
#[derive(Clone, Debug)]
pub struct DefinitionRow {
    pub id: Uuid,
    pub name: String,
    pub definition_json: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored workflow instance.
#[derive(Clone, Debug)]
pub struct InstanceRow {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub status: InstanceStatus,
    pub blackboard: Value,
    /// Absent only for terminal instances.
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

/// One leaf execution record, keyed by `(instance_id, effective node id)`.
#[derive(Clone, Debug)]
pub struct StepRow {
    pub instance_id: Uuid,
    pub node_id: String,
    pub status: StepStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub output: Option<Value>,
}

/// Instance joined with its definition and step rows, for inspection APIs.
#[derive(Clone, Debug)]
pub struct InstanceDetail {
    pub instance: InstanceRow,
    pub definition: DefinitionRow,
    pub steps: Vec<StepRow>,
}

fn definition_from_row(row: &PgRow) -> DefinitionRow {
    DefinitionRow {
        id: row.get("id"),
        name: row.get("name"),
        definition_json: row.get("definition_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn instance_from_row(row: &PgRow) -> StoreResult<InstanceRow> {
    let status: String = row.get("status");
    Ok(InstanceRow {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        status: InstanceStatus::parse(&status)?,
        blackboard: row.get("blackboard"),
        next_run_at: row.get("next_run_at"),
        lease_owner: row.get("lease_owner"),
        lease_until: row.get("lease_until"),
    })
}

fn step_from_row(row: &PgRow) -> StoreResult<StepRow> {
    let status: String = row.get("status");
    Ok(StepRow {
        instance_id: row.get("instance_id"),
        node_id: row.get("node_id"),
        status: StepStatus::parse(&status)?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        output: row.get("output"),
    })
}

const INSTANCE_COLUMNS: &str =
    "id, definition_id, status, blackboard, next_run_at, lease_owner, lease_until";
const STEP_COLUMNS: &str = "instance_id, node_id, status, attempts, last_error, output";

/// The workflow store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(dsn)
            .await?;
        let store = Self::new(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQLx migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    /// Atomically claim one due runnable instance, stamping the lease.
    ///
    /// Competing workers skip locked rows instead of queueing behind them.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        lease: chrono::Duration,
    ) -> StoreResult<Option<InstanceRow>> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            r#"
            WITH claimed AS (
                SELECT id
                FROM workflow_instances
                WHERE status = 'runnable'
                  AND next_run_at <= $1
                  AND (lease_until IS NULL OR lease_until < $1)
                ORDER BY next_run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_instances AS wi
            SET lease_owner = $2, lease_until = $3, updated_at = $1
            FROM claimed
            WHERE wi.id = claimed.id
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(worker_id)
        .bind(now + lease)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    /// Ensure a step row exists for the effective node id.
    pub async fn get_or_create_step(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> StoreResult<StepRow> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_steps (instance_id, node_id)
            VALUES ($1, $2)
            ON CONFLICT (instance_id, node_id) DO UPDATE SET updated_at = NOW()
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(instance_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        step_from_row(&row)
    }

    /// Increment the attempt counter, returning the new value.
    pub async fn increment_step_attempts(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> StoreResult<i32> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET attempts = attempts + 1, updated_at = NOW()
            WHERE instance_id = $1 AND node_id = $2
            RETURNING attempts
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("attempts"))
    }

    pub async fn update_step_success(
        &self,
        instance_id: Uuid,
        node_id: &str,
        output: Option<Value>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'succeeded', last_error = NULL, output = $3, updated_at = NOW()
            WHERE instance_id = $1 AND node_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a retryable failure: the step stays `pending`, only
    /// `last_error` advances.
    pub async fn record_step_failure(
        &self,
        instance_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET last_error = $3, updated_at = NOW()
            WHERE instance_id = $1 AND node_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_step_failed(
        &self,
        instance_id: Uuid,
        node_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'failed', last_error = $3, updated_at = NOW()
            WHERE instance_id = $1 AND node_id = $2
            "#,
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_steps(&self, instance_id: Uuid) -> StoreResult<Vec<StepRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE instance_id = $1 ORDER BY created_at, node_id"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_from_row).collect()
    }

    pub async fn update_instance_blackboard(
        &self,
        instance_id: Uuid,
        blackboard: &Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE workflow_instances SET blackboard = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(instance_id)
        .bind(blackboard)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commit an instance status, clearing the lease.
    ///
    /// `next_run_at` may be omitted only for terminal statuses; a runnable
    /// instance always carries a schedule.
    pub async fn update_instance_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        debug_assert!(
            status != InstanceStatus::Runnable || next_run_at.is_some(),
            "runnable instances must carry a next_run_at"
        );
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2, next_run_at = $3,
                lease_owner = NULL, lease_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn release_instance_lease(&self, instance_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_owner = NULL, lease_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Earliest schedule over runnable instances, for idle pacing.
    pub async fn get_next_run_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(next_run_at) AS next FROM workflow_instances WHERE status = 'runnable'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("next"))
    }

    pub async fn kv_get(&self, store_name: &str, key: &str) -> StoreResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM workflow_kv WHERE store_name = $1 AND key = $2")
            .bind(store_name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    /// Last-writer-wins upsert on `(store_name, key)`.
    pub async fn kv_set(&self, store_name: &str, key: &str, value: &Value) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_kv (store_name, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (store_name, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(store_name)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register a definition by name. Re-registering under the same name
    /// replaces the stored tree.
    pub async fn upsert_definition(&self, name: &str, definition: &Node) -> StoreResult<Uuid> {
        let definition_json = serde_json::to_value(definition)?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (id, name, definition_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (name)
            DO UPDATE SET definition_json = EXCLUDED.definition_json, updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(&definition_json)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn get_definition(&self, definition_id: Uuid) -> StoreResult<Option<DefinitionRow>> {
        let row = sqlx::query(
            "SELECT id, name, definition_json, created_at, updated_at \
             FROM workflow_definitions WHERE id = $1",
        )
        .bind(definition_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(definition_from_row))
    }

    pub async fn get_definition_by_name(&self, name: &str) -> StoreResult<Option<DefinitionRow>> {
        let row = sqlx::query(
            "SELECT id, name, definition_json, created_at, updated_at \
             FROM workflow_definitions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(definition_from_row))
    }

    /// Create a runnable instance due immediately.
    pub async fn create_instance(
        &self,
        definition_id: Uuid,
        blackboard: Option<Value>,
    ) -> StoreResult<Uuid> {
        let blackboard = blackboard.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_instances (id, definition_id, blackboard)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(definition_id)
        .bind(&blackboard)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> StoreResult<Option<InstanceRow>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    /// Instance joined with its definition and step rows.
    pub async fn get_instance_detail(
        &self,
        instance_id: Uuid,
    ) -> StoreResult<Option<InstanceDetail>> {
        let Some(instance) = self.get_instance(instance_id).await? else {
            return Ok(None);
        };
        let Some(definition) = self.get_definition(instance.definition_id).await? else {
            return Err(StoreError::Message(format!(
                "definition {} missing for instance {instance_id}",
                instance.definition_id
            )));
        };
        let steps = self.list_steps(instance_id).await?;
        Ok(Some(InstanceDetail {
            instance,
            definition,
            steps,
        }))
    }

    pub async fn list_instances(&self, limit: i64, offset: i64) -> StoreResult<Vec<InstanceRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    pub async fn delete_instance(&self, instance_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Re-open an instance: runnable and due now, lease cleared, every step
    /// back to `pending` with a zeroed attempt counter.
    pub async fn reset_instance(&self, instance_id: Uuid) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'runnable', next_run_at = NOW(),
                lease_owner = NULL, lease_until = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = 'pending', attempts = 0, last_error = NULL, output = NULL,
                updated_at = NOW()
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            InstanceStatus::Runnable,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            StepStatus::Pending,
            StepStatus::Succeeded,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(InstanceStatus::parse("bogus").is_err());
        assert!(StepStatus::parse("bogus").is_err());
    }
}
