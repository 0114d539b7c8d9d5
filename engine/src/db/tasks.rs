/// Task persistence operations
///
/// This module persists tasks and their steps after lifecycle events.
/// All queries use parameterized queries for SQL injection prevention.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::workflow::types::{Step, Task};

/// Persisted task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub task_type: String,
    pub status: String,
    pub mode: String,
    pub complexity: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub total_tokens: i64,
    pub cost: f64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Persisted step row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub task_id: String,
    pub step_index: i64,
    pub step_id: String,
    pub role: String,
    pub status: String,
    pub instruction: String,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// Task repository for database operations
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    /// Create a new task repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update a task row from its in-memory state
    pub async fn upsert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tasks \
             (id, description, task_type, status, mode, complexity, result, error, \
              input_tokens, output_tokens, cache_tokens, cost, created_at, updated_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.description)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.workflow.mode.as_str())
        .bind(match task.workflow.complexity {
            crate::workflow::types::Complexity::Simple => "simple",
            crate::workflow::types::Complexity::Complex => "complex",
        })
        .bind(&task.result)
        .bind(&task.error)
        .bind(task.usage.input_tokens as i64)
        .bind(task.usage.output_tokens as i64)
        .bind(task.usage.cache_tokens as i64)
        .bind(task.usage.cost)
        .bind(task.created_at.timestamp())
        .bind(task.updated_at.timestamp())
        .bind(task.completed_at.map(|t| t.timestamp()))
        .execute(&self.pool)
        .await
        .context("Failed to upsert task")?;

        Ok(())
    }

    /// Insert or update one step row
    pub async fn record_step(&self, task_id: &str, step_index: i64, step: &Step) -> Result<()> {
        let dependencies = serde_json::to_string(&step.dependencies)
            .context("Failed to serialize step dependencies")?;

        sqlx::query(
            "INSERT OR REPLACE INTO task_steps \
             (task_id, step_index, step_id, role, status, instruction, constraints, \
              dependencies, optional, summary, error, input_tokens, output_tokens, cache_tokens, cost) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(step_index)
        .bind(&step.id)
        .bind(step.role.as_str())
        .bind(step.status.as_str())
        .bind(&step.instruction)
        .bind(&step.constraints)
        .bind(dependencies)
        .bind(step.optional)
        .bind(step.context.as_ref().map(|c| c.summary.clone()))
        .bind(&step.error)
        .bind(step.usage.input_tokens as i64)
        .bind(step.usage.output_tokens as i64)
        .bind(step.usage.cache_tokens as i64)
        .bind(step.usage.cost)
        .execute(&self.pool)
        .await
        .context("Failed to record task step")?;

        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query(
            "SELECT id, description, task_type, status, mode, complexity, result, error, \
             input_tokens + output_tokens + cache_tokens AS total_tokens, cost, \
             created_at, completed_at FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch task")?;

        Ok(row.map(|r| task_record_from_row(&r)))
    }

    /// Get recent tasks (last N tasks)
    pub async fn recent_tasks(&self, limit: i64) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(
            "SELECT id, description, task_type, status, mode, complexity, result, error, \
             input_tokens + output_tokens + cache_tokens AS total_tokens, cost, \
             created_at, completed_at FROM tasks ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent tasks")?;

        Ok(rows.iter().map(task_record_from_row).collect())
    }

    /// Get all steps for a task, in declared order
    pub async fn get_task_steps(&self, task_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            "SELECT task_id, step_index, step_id, role, status, instruction, summary, error \
             FROM task_steps WHERE task_id = ? ORDER BY step_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch task steps")?;

        Ok(rows
            .into_iter()
            .map(|r| StepRecord {
                task_id: r.get("task_id"),
                step_index: r.get("step_index"),
                step_id: r.get("step_id"),
                role: r.get("role"),
                status: r.get("status"),
                instruction: r.get("instruction"),
                summary: r.get("summary"),
                error: r.get("error"),
            })
            .collect())
    }

    /// Delete old tasks (cleanup)
    pub async fn delete_old_tasks(&self, older_than_secs: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - older_than_secs;

        let result = sqlx::query("DELETE FROM tasks WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to delete old tasks")?;

        Ok(result.rows_affected())
    }
}

fn task_record_from_row(r: &sqlx::sqlite::SqliteRow) -> TaskRecord {
    TaskRecord {
        id: r.get("id"),
        description: r.get("description"),
        task_type: r.get("task_type"),
        status: r.get("status"),
        mode: r.get("mode"),
        complexity: r.get("complexity"),
        result: r.get("result"),
        error: r.get("error"),
        total_tokens: r.get("total_tokens"),
        cost: r.get("cost"),
        created_at: r.get("created_at"),
        completed_at: r.get("completed_at"),
    }
}
