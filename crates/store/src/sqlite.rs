//! SQLite-backed store

use agentflow_common::{
    error::{Error, Result},
    types::{
        AgentId, AgentKind, AgentRecord, DagDefinition, DagTemplate, NewTaskInstance,
        NewWorkflowInstance, TaskInstance, TaskInstanceId, TaskOutcome, TaskStatus, TemplateId,
        WorkflowId, WorkflowInstance, WorkflowStatus,
    },
};
use agentflow_core::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::str::FromStr;
use tracing::info;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_type TEXT NOT NULL,
    source_reference TEXT NOT NULL,
    input_schema TEXT,
    output_schema TEXT
);

CREATE TABLE IF NOT EXISTS dag_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dag_definition TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    template_id INTEGER,
    dag_definition TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    inputs TEXT,
    outputs TEXT,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS task_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow_instance_id INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    agent_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    input_params TEXT NOT NULL,
    outputs TEXT,
    logs TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (workflow_instance_id, node_id)
);

CREATE INDEX IF NOT EXISTS idx_task_instances_workflow
    ON task_instances (workflow_instance_id, status);
";

fn store_err(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn parse_json(text: String) -> Result<Value> {
    Ok(serde_json::from_str(&text)?)
}

fn parse_opt_json(text: Option<String>) -> Result<Option<Value>> {
    text.map(parse_json).transpose()
}

fn parse_timestamp(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Store(format!("invalid timestamp '{t}': {e}")))
    })
    .transpose()
}

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

/// Placeholder list `?,?,?` for dynamic IN clauses
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// `Store` implementation over a SQLite database.
///
/// JSON columns are stored as TEXT; timestamps as RFC 3339 TEXT. The
/// `(workflow_instance_id, node_id)` unique constraint backs the
/// double-dispatch guard, and status transitions are guarded UPDATEs so
/// terminal states stay absorbing under concurrent consumers.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and apply the schema. Accepts `sqlite:` URLs, creating the
    /// database file if missing.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(store_err)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(store_err)?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await.map_err(store_err)?;
        }

        info!(url, "connected to sqlite store");
        Ok(Self { pool })
    }

    fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord> {
        let kind: String = row.get("agent_type");
        Ok(AgentRecord {
            id: row.get("id"),
            kind: kind.parse()?,
            source_reference: row.get("source_reference"),
            input_schema: parse_opt_json(row.get("input_schema"))?,
            output_schema: parse_opt_json(row.get("output_schema"))?,
        })
    }

    fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowInstance> {
        let status: String = row.get("status");
        let dag: String = row.get("dag_definition");
        Ok(WorkflowInstance {
            id: row.get("id"),
            template_id: row.get("template_id"),
            dag_definition: serde_json::from_str(&dag)?,
            status: status.parse()?,
            priority: row.get("priority"),
            inputs: parse_opt_json(row.get("inputs"))?,
            outputs: parse_opt_json(row.get("outputs"))?,
            started_at: parse_timestamp(row.get("started_at"))?,
            completed_at: parse_timestamp(row.get("completed_at"))?,
        })
    }

    fn task_from_row(row: &SqliteRow) -> Result<TaskInstance> {
        let status: String = row.get("status");
        Ok(TaskInstance {
            id: row.get("id"),
            workflow_instance_id: row.get("workflow_instance_id"),
            node_id: row.get("node_id"),
            agent_id: row.get("agent_id"),
            status: status.parse()?,
            input_params: parse_json(row.get("input_params"))?,
            outputs: parse_opt_json(row.get("outputs"))?,
            logs: row.get("logs"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            started_at: parse_timestamp(row.get("started_at"))?,
            completed_at: parse_timestamp(row.get("completed_at"))?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_agent(
        &self,
        kind: AgentKind,
        source_reference: &str,
        input_schema: Option<Value>,
        output_schema: Option<Value>,
    ) -> Result<AgentRecord> {
        let result = sqlx::query(
            "INSERT INTO agents (agent_type, source_reference, input_schema, output_schema) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(kind.as_str())
        .bind(source_reference)
        .bind(input_schema.as_ref().map(|v| v.to_string()))
        .bind(output_schema.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(AgentRecord {
            id: result.last_insert_rowid(),
            kind,
            source_reference: source_reference.to_string(),
            input_schema,
            output_schema,
        })
    }

    async fn agent(&self, id: AgentId) -> Result<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::agent_from_row).transpose()
    }

    async fn create_template(&self, dag_definition: &DagDefinition) -> Result<DagTemplate> {
        let result = sqlx::query("INSERT INTO dag_templates (dag_definition) VALUES (?1)")
            .bind(serde_json::to_string(dag_definition)?)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(DagTemplate {
            id: result.last_insert_rowid(),
            dag_definition: dag_definition.clone(),
        })
    }

    async fn template(&self, id: TemplateId) -> Result<Option<DagTemplate>> {
        let row = sqlx::query("SELECT * FROM dag_templates WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|row| {
            let dag: String = row.get("dag_definition");
            Ok(DagTemplate {
                id: row.get("id"),
                dag_definition: serde_json::from_str(&dag)?,
            })
        })
        .transpose()
    }

    async fn create_workflow(&self, new: NewWorkflowInstance) -> Result<WorkflowInstance> {
        let result = sqlx::query(
            "INSERT INTO workflow_instances \
             (template_id, dag_definition, status, priority, inputs) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(new.template_id)
        .bind(serde_json::to_string(&new.dag_definition)?)
        .bind(WorkflowStatus::Queued.as_str())
        .bind(new.priority)
        .bind(new.inputs.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(WorkflowInstance {
            id: result.last_insert_rowid(),
            template_id: new.template_id,
            dag_definition: new.dag_definition,
            status: WorkflowStatus::Queued,
            priority: new.priority,
            inputs: new.inputs,
            outputs: None,
            started_at: None,
            completed_at: None,
        })
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::workflow_from_row).transpose()
    }

    async fn mark_workflow_running(&self, id: WorkflowId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET status = 'RUNNING', started_at = ?1 \
             WHERE id = ?2 AND status = 'QUEUED'",
        )
        .bind(now_text())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_workflow(&self, id: WorkflowId, status: WorkflowStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::Internal(format!(
                "finish_workflow called with non-terminal status {status}"
            )));
        }
        let result = sqlx::query(
            "UPDATE workflow_instances SET status = ?1, completed_at = ?2 \
             WHERE id = ?3 AND status IN ('QUEUED', 'RUNNING')",
        )
        .bind(status.as_str())
        .bind(now_text())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_task(&self, new: NewTaskInstance) -> Result<TaskInstance> {
        let result = sqlx::query(
            "INSERT INTO task_instances \
             (workflow_instance_id, node_id, agent_id, status, input_params) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(new.workflow_instance_id)
        .bind(&new.node_id)
        .bind(new.agent_id)
        .bind(TaskStatus::Pending.as_str())
        .bind(new.input_params.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
                    return Error::Conflict(format!(
                        "task for workflow {} node '{}' already exists",
                        new.workflow_instance_id, new.node_id
                    ));
                }
            }
            store_err(e)
        })?;

        Ok(TaskInstance {
            id: result.last_insert_rowid(),
            workflow_instance_id: new.workflow_instance_id,
            node_id: new.node_id,
            agent_id: new.agent_id,
            status: TaskStatus::Pending,
            input_params: new.input_params,
            outputs: None,
            logs: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
        })
    }

    async fn task(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>> {
        let row = sqlx::query("SELECT * FROM task_instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn task_for_node(
        &self,
        workflow_id: WorkflowId,
        node_id: &str,
    ) -> Result<Option<TaskInstance>> {
        let row = sqlx::query(
            "SELECT * FROM task_instances WHERE workflow_instance_id = ?1 AND node_id = ?2",
        )
        .bind(workflow_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn mark_tasks_queued(&self, ids: &[TaskInstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE task_instances SET status = 'QUEUED' \
             WHERE status = 'PENDING' AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn mark_tasks_running(&self, ids: &[TaskInstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE task_instances SET status = 'RUNNING', started_at = ?1 \
             WHERE status NOT IN ('COMPLETED', 'FAILED') AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(now_text());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn record_task_outcome(
        &self,
        id: TaskInstanceId,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        let (status, outputs, logs) = match outcome {
            TaskOutcome::Success { output } => {
                (TaskStatus::Completed, Some(output.to_string()), None)
            }
            TaskOutcome::Failure { error } => (TaskStatus::Failed, None, Some(error.clone())),
        };
        sqlx::query(
            "UPDATE task_instances \
             SET status = ?1, outputs = ?2, logs = ?3, completed_at = ?4 \
             WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(outputs)
        .bind(logs)
        .bind(now_text())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn fail_tasks(&self, ids: &[TaskInstanceId], error: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE task_instances SET status = 'FAILED', logs = ?1, completed_at = ?2 \
             WHERE status NOT IN ('COMPLETED', 'FAILED') AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(error).bind(now_text());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await.map_err(store_err)?;
        Ok(())
    }

    async fn count_completed(&self, workflow_id: WorkflowId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM task_instances \
             WHERE workflow_instance_id = ?1 AND status = 'COMPLETED'",
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(count as u64)
    }

    async fn count_completed_in(
        &self,
        workflow_id: WorkflowId,
        node_ids: &[String],
    ) -> Result<u64> {
        if node_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM task_instances \
             WHERE workflow_instance_id = ?1 AND status = 'COMPLETED' AND node_id IN ({})",
            placeholders(node_ids.len())
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(workflow_id);
        for node_id in node_ids {
            query = query.bind(node_id);
        }
        let count = query.fetch_one(&self.pool).await.map_err(store_err)?;
        Ok(count as u64)
    }

    async fn tasks_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<TaskInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM task_instances WHERE workflow_instance_id = ?1 ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(Self::task_from_row).collect()
    }
}
