//! 任务记录持久化
//!
//! 每轮续写后都会保存一次快照，保证 category / status / iteration_count /
//! accumulated_outputs（有序）/ 时间戳在迭代之间不丢失。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::{EngineError, Task, TaskCategory, TaskStatus};

/// 持久化的任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub category: TaskCategory,
    pub status: TaskStatus,
    pub iteration_count: u32,
    pub accumulated_outputs: Vec<String>,
    pub annotations: Vec<String>,
    pub degraded: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            category: task.category,
            status: task.status,
            iteration_count: task.iteration_count,
            accumulated_outputs: task.accumulated_outputs.clone(),
            annotations: task.annotations.clone(),
            degraded: task.degraded,
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[async_trait::async_trait]
pub trait TaskRecordStore: Send + Sync {
    async fn save(&self, record: &TaskRecord) -> Result<(), EngineError>;

    async fn load(&self, id: &str) -> Result<Option<TaskRecord>, EngineError>;

    /// 按创建时间排序
    async fn list(&self) -> Result<Vec<TaskRecord>, EngineError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRecords {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskRecords {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskRecordStore for InMemoryTaskRecords {
    async fn save(&self, record: &TaskRecord) -> Result<(), EngineError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<TaskRecord>, EngineError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, EngineError> {
        let mut all: Vec<TaskRecord> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

/// SQLite 任务记录库；rusqlite 为同步 API，经 spawn_blocking 调用
pub struct SqliteTaskRecords {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS task_records (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    status TEXT NOT NULL,
    iteration_count INTEGER NOT NULL,
    outputs TEXT NOT NULL,
    annotations TEXT NOT NULL,
    degraded INTEGER NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

fn persistence_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(e.to_string())
}

impl SqliteTaskRecords {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(persistence_err)?;
            }
        }
        let conn = Connection::open(&path).map_err(persistence_err)?;
        conn.execute(SCHEMA, []).map_err(persistence_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(TaskRecordRow, String, String)> {
    Ok((
        TaskRecordRow {
            id: row.get(0)?,
            description: row.get(1)?,
            category: row.get(2)?,
            status: row.get(3)?,
            iteration_count: row.get(4)?,
            degraded: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        },
        row.get(5)?,
        row.get(6)?,
    ))
}

struct TaskRecordRow {
    id: String,
    description: String,
    category: String,
    status: String,
    iteration_count: u32,
    degraded: bool,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn decode(
    (row, outputs, annotations): (TaskRecordRow, String, String),
) -> Result<TaskRecord, EngineError> {
    Ok(TaskRecord {
        id: row.id,
        description: row.description,
        category: row.category.parse().map_err(persistence_err)?,
        status: row.status.parse().map_err(persistence_err)?,
        iteration_count: row.iteration_count,
        accumulated_outputs: serde_json::from_str(&outputs).map_err(persistence_err)?,
        annotations: serde_json::from_str(&annotations).map_err(persistence_err)?,
        degraded: row.degraded,
        error: row.error,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

const SELECT_COLUMNS: &str = "SELECT id, description, category, status, iteration_count, outputs, \
     annotations, degraded, error, created_at, updated_at FROM task_records";

#[async_trait::async_trait]
impl TaskRecordStore for SqliteTaskRecords {
    async fn save(&self, record: &TaskRecord) -> Result<(), EngineError> {
        let record = record.clone();
        let outputs = serde_json::to_string(&record.accumulated_outputs).map_err(persistence_err)?;
        let annotations = serde_json::to_string(&record.annotations).map_err(persistence_err)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO task_records (id, description, category, status, \
                 iteration_count, outputs, annotations, degraded, error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.description,
                    record.category.as_str(),
                    record.status.as_str(),
                    record.iteration_count,
                    outputs,
                    annotations,
                    record.degraded,
                    record.error,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .map_err(persistence_err)?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<TaskRecord>, EngineError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()
                .map_err(persistence_err)?;
            raw.map(decode).transpose()
        })
        .await
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, EngineError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at"))
                .map_err(persistence_err)?;
            let rows = stmt
                .query_map([], row_to_record)
                .map_err(persistence_err)?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(decode(raw.map_err(persistence_err)?)?);
            }
            Ok(out)
        })
        .await
    }
}
