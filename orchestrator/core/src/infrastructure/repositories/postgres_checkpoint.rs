// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Checkpoint Repository
//!
//! `CheckpointRepository` backed by `execution_steps`, `recorded_activities`
//! and `idempotency_records`.
//!
//! A step and its activities are written in one transaction, and the step
//! insert is `ON CONFLICT (trace_id, step_index) DO NOTHING`: a second save of
//! the same key commits nothing and returns the stored row. Dedup claims use
//! a conditional upsert so that only a stale `in_progress` row can be taken
//! over.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::checkpoint::{
    ActivityResponse, ActivityType, DedupRecord, DedupStatus, ExecutionStep, NodeId, RecordedActivity, SaveOutcome,
    TraceSummary,
};
use crate::domain::execution::{StepStatus, TraceId};
use crate::domain::repository::{CheckpointRepository, RepositoryError};

pub struct PostgresCheckpointRepository {
    pool: PgPool,
}

impl PostgresCheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_step(&self, trace_id: TraceId, step_index: u32) -> Result<Option<ExecutionStep>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT trace_id, step_index, node_id, input_hash, output, next_node, status, attempts, created_at
            FROM execution_steps
            WHERE trace_id = $1 AND step_index = $2
            "#,
        )
        .bind(trace_id.0)
        .bind(step_index as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to load step: {}", e)))?;

        match row {
            Some(row) => {
                let activities = self.load_activities(trace_id, step_index).await?;
                Ok(Some(row_to_step(&row, activities)?))
            }
            None => Ok(None),
        }
    }
}

fn row_to_step(row: &PgRow, activities: Vec<RecordedActivity>) -> Result<ExecutionStep, RepositoryError> {
    let status_str: String = row.get("status");
    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown step status '{}'", status_str)))?;
    let step_index: i32 = row.get("step_index");
    let attempts: i32 = row.get("attempts");
    let next_node: Option<String> = row.get("next_node");
    Ok(ExecutionStep {
        trace_id: TraceId(row.get("trace_id")),
        step_index: step_index as u32,
        node_id: NodeId(row.get("node_id")),
        input_hash: row.get("input_hash"),
        output: row.get("output"),
        next_node: next_node.map(NodeId),
        activities,
        status,
        attempts: attempts as u32,
        timestamp: row.get("created_at"),
    })
}

fn row_to_activity(row: &PgRow) -> Result<RecordedActivity, RepositoryError> {
    let type_str: String = row.get("activity_type");
    let activity_type = ActivityType::parse(&type_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown activity type '{}'", type_str)))?;
    let response: ActivityResponse = serde_json::from_value(row.get("response"))?;
    let step_index: i32 = row.get("step_index");
    let sequence: i32 = row.get("sequence");
    Ok(RecordedActivity {
        trace_id: TraceId(row.get("trace_id")),
        step_index: step_index as u32,
        sequence: sequence as u32,
        activity_type,
        request_hash: row.get("request_hash"),
        response,
        timestamp: row.get("recorded_at"),
    })
}

fn row_to_dedup(row: &PgRow) -> Result<DedupRecord, RepositoryError> {
    let status_str: String = row.get("status");
    let status = DedupStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Serialization(format!("unknown dedup status '{}'", status_str)))?;
    let trace_id: Option<uuid::Uuid> = row.get("trace_id");
    Ok(DedupRecord {
        key: row.get("key"),
        status,
        trace_id: trace_id.map(TraceId),
        message_id: row.get("message_id"),
        response: row.get("response"),
        error: row.get("error"),
        claimed_at: row.get("claimed_at"),
        completed_at: row.get("completed_at"),
    })
}

const INSERT_ACTIVITY: &str = r#"
    INSERT INTO recorded_activities (
        trace_id, step_index, sequence, activity_type, request_hash, response, recorded_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (trace_id, step_index, sequence) DO NOTHING
"#;

#[async_trait]
impl CheckpointRepository for PostgresCheckpointRepository {
    async fn save_step(&self, step: &ExecutionStep) -> Result<SaveOutcome, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to open transaction: {}", e)))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO execution_steps (
                trace_id, step_index, node_id, input_hash, output, next_node, status, attempts, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (trace_id, step_index) DO NOTHING
            "#,
        )
        .bind(step.trace_id.0)
        .bind(step.step_index as i32)
        .bind(step.node_id.as_str())
        .bind(&step.input_hash)
        .bind(&step.output)
        .bind(step.next_node.as_ref().map(|n| n.as_str()))
        .bind(step.status.as_str())
        .bind(step.attempts as i32)
        .bind(step.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save step: {}", e)))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return match self.load_step(step.trace_id, step.step_index).await? {
                Some(existing) => Ok(SaveOutcome::AlreadyExists(existing)),
                None => Err(RepositoryError::Conflict(format!(
                    "step {}/{} conflicted but could not be read back",
                    step.trace_id, step.step_index
                ))),
            };
        }

        for activity in &step.activities {
            sqlx::query(INSERT_ACTIVITY)
                .bind(activity.trace_id.0)
                .bind(activity.step_index as i32)
                .bind(activity.sequence as i32)
                .bind(activity.activity_type.as_str())
                .bind(&activity.request_hash)
                .bind(serde_json::to_value(&activity.response)?)
                .bind(activity.timestamp)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Database(format!("Failed to record activity: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to commit step: {}", e)))?;
        Ok(SaveOutcome::Inserted)
    }

    async fn load_trace(&self, trace_id: TraceId) -> Result<Vec<ExecutionStep>, RepositoryError> {
        let activity_rows = sqlx::query(
            r#"
            SELECT trace_id, step_index, sequence, activity_type, request_hash, response, recorded_at
            FROM recorded_activities
            WHERE trace_id = $1
            ORDER BY step_index ASC, sequence ASC
            "#,
        )
        .bind(trace_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let mut by_step: BTreeMap<u32, Vec<RecordedActivity>> = BTreeMap::new();
        for row in &activity_rows {
            let activity = row_to_activity(row)?;
            by_step.entry(activity.step_index).or_default().push(activity);
        }

        let rows = sqlx::query(
            r#"
            SELECT trace_id, step_index, node_id, input_hash, output, next_node, status, attempts, created_at
            FROM execution_steps
            WHERE trace_id = $1
            ORDER BY step_index ASC
            "#,
        )
        .bind(trace_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let step_index: i32 = row.get("step_index");
                let activities = by_step.remove(&(step_index as u32)).unwrap_or_default();
                row_to_step(row, activities)
            })
            .collect()
    }

    async fn record_activity(&self, activity: &RecordedActivity) -> Result<(), RepositoryError> {
        sqlx::query(INSERT_ACTIVITY)
            .bind(activity.trace_id.0)
            .bind(activity.step_index as i32)
            .bind(activity.sequence as i32)
            .bind(activity.activity_type.as_str())
            .bind(&activity.request_hash)
            .bind(serde_json::to_value(&activity.response)?)
            .bind(activity.timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to record activity: {}", e)))?;
        Ok(())
    }

    async fn load_activities(
        &self,
        trace_id: TraceId,
        step_index: u32,
    ) -> Result<Vec<RecordedActivity>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT trace_id, step_index, sequence, activity_type, request_hash, response, recorded_at
            FROM recorded_activities
            WHERE trace_id = $1 AND step_index = $2
            ORDER BY sequence ASC
            "#,
        )
        .bind(trace_id.0)
        .bind(step_index as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.iter().map(row_to_activity).collect()
    }

    async fn list_traces(&self, limit: usize) -> Result<Vec<TraceSummary>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT DISTINCT ON (trace_id)
                    trace_id, node_id, next_node,
                    COUNT(*) OVER (PARTITION BY trace_id) AS steps,
                    MAX(created_at) OVER (PARTITION BY trace_id) AS last_step_at
                FROM execution_steps
                ORDER BY trace_id, step_index DESC
            ) latest
            ORDER BY last_step_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let steps: i64 = row.get("steps");
                let next_node: Option<String> = row.get("next_node");
                TraceSummary {
                    trace_id: TraceId(row.get("trace_id")),
                    steps: steps as u32,
                    last_node: NodeId(row.get("node_id")),
                    finished: next_node.is_none(),
                    last_step_at: row.get("last_step_at"),
                }
            })
            .collect())
    }

    async fn claim_dedup(
        &self,
        record: &DedupRecord,
        stale_after: Duration,
    ) -> Result<Option<DedupRecord>, RepositoryError> {
        let stale_before = record.claimed_at
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let claimed = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, status, trace_id, message_id, response, error, claimed_at, completed_at)
            VALUES ($1, $2, $3, $4, NULL, NULL, $5, NULL)
            ON CONFLICT (key) DO UPDATE SET
                status = EXCLUDED.status,
                trace_id = EXCLUDED.trace_id,
                message_id = EXCLUDED.message_id,
                response = NULL,
                error = NULL,
                claimed_at = EXCLUDED.claimed_at,
                completed_at = NULL
            WHERE idempotency_records.status = 'in_progress'
              AND idempotency_records.claimed_at < $6
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(record.status.as_str())
        .bind(record.trace_id.map(|t| t.0))
        .bind(&record.message_id)
        .bind(record.claimed_at)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to claim idempotency key: {}", e)))?;

        if claimed.is_some() {
            return Ok(None);
        }
        match self.find_dedup(&record.key).await? {
            Some(existing) => Ok(Some(existing)),
            None => Err(RepositoryError::Conflict(format!(
                "idempotency key '{}' conflicted but could not be read back",
                record.key
            ))),
        }
    }

    async fn complete_dedup(&self, record: &DedupRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, status, trace_id, message_id, response, error, claimed_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (key) DO UPDATE SET
                status = EXCLUDED.status,
                response = EXCLUDED.response,
                error = EXCLUDED.error,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&record.key)
        .bind(record.status.as_str())
        .bind(record.trace_id.map(|t| t.0))
        .bind(&record.message_id)
        .bind(&record.response)
        .bind(&record.error)
        .bind(record.claimed_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to complete idempotency record: {}", e)))?;
        Ok(())
    }

    async fn find_dedup(&self, key: &str) -> Result<Option<DedupRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT key, status, trace_id, message_id, response, error, claimed_at, completed_at
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.as_ref().map(row_to_dedup).transpose()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        // Traces are removed whole, once nothing in them is newer than the cutoff.
        let trace_rows: i64 = sqlx::query_scalar(
            r#"
            WITH expired AS (
                SELECT trace_id FROM (
                    SELECT trace_id, created_at AS touched_at FROM execution_steps
                    UNION ALL
                    SELECT trace_id, recorded_at AS touched_at FROM recorded_activities
                ) touched
                GROUP BY trace_id
                HAVING MAX(touched_at) < $1
            ),
            gone_activities AS (
                DELETE FROM recorded_activities
                WHERE trace_id IN (SELECT trace_id FROM expired)
                RETURNING 1
            ),
            gone_steps AS (
                DELETE FROM execution_steps
                WHERE trace_id IN (SELECT trace_id FROM expired)
                RETURNING 1
            )
            SELECT (SELECT COUNT(*) FROM gone_activities) + (SELECT COUNT(*) FROM gone_steps)
            "#,
        )
        .bind(cutoff)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to purge checkpoints: {}", e)))?;

        let dedup_rows = sqlx::query("DELETE FROM idempotency_records WHERE claimed_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to purge idempotency records: {}", e)))?
            .rows_affected();
        tx.commit().await?;
        Ok(trace_rows.max(0) as u64 + dedup_rows)
    }
}
