//! libSQL backend for task records, sealed sessions and user settings.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text (microseconds, `Z` suffix) so SQL string
//! comparison orders them correctly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params, params_from_iter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, ErrorClass};
use crate::queue::state::TaskState;
use crate::queue::task::{ChatRef, SourceRef, Task, TaskError, TaskPatch};
use crate::store::migrations;
use crate::settings::UserSettings;
use crate::store::traits::{SessionStore, SettingsStore, TaskStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, owner_user_id, chat_id, source_chat, source_message_id, state, \
     attempt_count, last_error_class, last_error_message, created_at, updated_at, claimed_by, \
     claim_expiry, not_before, priority, batch_id, bytes_done, bytes_total, target_chat";

const ACTIVE_STATES: &str = "('pending', 'claimed', 'downloading', 'uploading')";
const CLAIMED_STATES: &str = "('claimed', 'downloading', 'uploading')";
const TERMINAL_STATES: &str = "('completed', 'failed', 'cancelled')";

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
        })
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(fmt_ts))
}

fn opt_int(n: Option<u64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n as i64),
        None => libsql::Value::Null,
    }
}

/// Local mirror of `libsql`'s sealed, non-exported `FromValue` bound so that
/// `col` can stay generic; each impl just delegates to `Row::get`.
trait ColValue: Sized {
    fn get_from(row: &libsql::Row, idx: i32) -> libsql::Result<Self>;
}

macro_rules! impl_col_value {
    ($($t:ty),*) => {$(
        impl ColValue for $t {
            fn get_from(row: &libsql::Row, idx: i32) -> libsql::Result<Self> {
                row.get::<$t>(idx)
            }
        }
        impl ColValue for Option<$t> {
            fn get_from(row: &libsql::Row, idx: i32) -> libsql::Result<Self> {
                row.get::<Option<$t>>(idx)
            }
        }
    )*};
}

impl_col_value!(libsql::Value, i32, u32, i64, u64, f64, Vec<u8>, String, bool);

fn col<T: ColValue>(row: &libsql::Row, idx: i32, name: &str) -> Result<T, DatabaseError> {
    T::get_from(row, idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {name}: {e}")))
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: String = col(row, 0, "id")?;
    let source_chat: String = col(row, 3, "source_chat")?;
    let state: String = col(row, 5, "state")?;
    let error_class: Option<String> = col(row, 7, "last_error_class")?;
    let error_message: Option<String> = col(row, 8, "last_error_message")?;
    let created_at: String = col(row, 9, "created_at")?;
    let updated_at: String = col(row, 10, "updated_at")?;
    let batch_id: Option<String> = col(row, 15, "batch_id")?;
    let bytes_total: Option<i64> = col(row, 17, "bytes_total")?;
    let target_chat: Option<i64> = col(row, 18, "target_chat")?;

    let chat: ChatRef = serde_json::from_str(&source_chat)
        .map_err(|e| DatabaseError::Serialization(format!("source_chat: {e}")))?;

    let last_error = match error_class {
        Some(class) => Some(TaskError {
            class: class.parse().map_err(DatabaseError::Serialization)?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(format!("id: {e}")))?,
        owner_user_id: col(row, 1, "owner_user_id")?,
        chat_id: col(row, 2, "chat_id")?,
        target_chat,
        source: SourceRef::new(chat, col(row, 4, "source_message_id")?),
        state: state.parse().map_err(DatabaseError::Serialization)?,
        attempt_count: col::<i64>(row, 6, "attempt_count")?.max(0) as u32,
        last_error,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
        claimed_by: col(row, 11, "claimed_by")?,
        claim_expiry: parse_optional_datetime(col(row, 12, "claim_expiry")?)?,
        not_before: parse_optional_datetime(col(row, 13, "not_before")?)?,
        priority: col(row, 14, "priority")?,
        batch_id: batch_id
            .map(|b| Uuid::parse_str(&b))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("batch_id: {e}")))?,
        bytes_done: col::<i64>(row, 16, "bytes_done")?.max(0) as u64,
        bytes_total: bytes_total.map(|n| n.max(0) as u64),
    })
}

fn task_params(task: &Task) -> Result<Vec<libsql::Value>, DatabaseError> {
    let source_chat = serde_json::to_string(&task.source.chat)
        .map_err(|e| DatabaseError::Serialization(format!("source_chat: {e}")))?;
    Ok(vec![
        task.id.to_string().into(),
        task.owner_user_id.into(),
        task.chat_id.into(),
        source_chat.into(),
        task.source.message_id.into(),
        task.state.as_str().into(),
        (task.attempt_count as i64).into(),
        opt_text(task.last_error.as_ref().map(|e| e.class.as_str().to_string())),
        opt_text(task.last_error.as_ref().map(|e| e.message.clone())),
        fmt_ts(task.created_at).into(),
        fmt_ts(task.updated_at).into(),
        opt_text(task.claimed_by.clone()),
        opt_ts(task.claim_expiry),
        opt_ts(task.not_before),
        task.priority.into(),
        opt_text(task.batch_id.map(|b| b.to_string())),
        (task.bytes_done as i64).into(),
        opt_int(task.bytes_total),
        match task.target_chat {
            Some(chat) => libsql::Value::Integer(chat),
            None => libsql::Value::Null,
        },
    ])
}

const INSERT_TASK: &str = "INSERT INTO tasks (id, owner_user_id, chat_id, source_chat, \
     source_message_id, state, attempt_count, last_error_class, last_error_message, created_at, \
     updated_at, claimed_by, claim_expiry, not_before, priority, batch_id, bytes_done, bytes_total, \
     target_chat) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)";

/// Batch insert from a JSON array of [`task_json`] objects.
const INSERT_TASKS_FROM_JSON: &str = "INSERT INTO tasks (id, owner_user_id, chat_id, source_chat, \
     source_message_id, state, attempt_count, last_error_class, last_error_message, created_at, \
     updated_at, claimed_by, claim_expiry, not_before, priority, batch_id, bytes_done, bytes_total, \
     target_chat) \
     SELECT json_extract(value, '$.id'), json_extract(value, '$.owner_user_id'), \
     json_extract(value, '$.chat_id'), json_extract(value, '$.source_chat'), \
     json_extract(value, '$.source_message_id'), json_extract(value, '$.state'), \
     json_extract(value, '$.attempt_count'), json_extract(value, '$.last_error_class'), \
     json_extract(value, '$.last_error_message'), json_extract(value, '$.created_at'), \
     json_extract(value, '$.updated_at'), json_extract(value, '$.claimed_by'), \
     json_extract(value, '$.claim_expiry'), json_extract(value, '$.not_before'), \
     json_extract(value, '$.priority'), json_extract(value, '$.batch_id'), \
     json_extract(value, '$.bytes_done'), json_extract(value, '$.bytes_total'), \
     json_extract(value, '$.target_chat') \
     FROM json_each(?1)";

fn task_json(task: &Task) -> Result<serde_json::Value, DatabaseError> {
    let source_chat = serde_json::to_string(&task.source.chat)
        .map_err(|e| DatabaseError::Serialization(format!("source_chat: {e}")))?;
    Ok(serde_json::json!({
        "id": task.id.to_string(),
        "owner_user_id": task.owner_user_id,
        "chat_id": task.chat_id,
        "source_chat": source_chat,
        "source_message_id": task.source.message_id,
        "state": task.state.as_str(),
        "attempt_count": task.attempt_count,
        "last_error_class": task.last_error.as_ref().map(|e| e.class.as_str()),
        "last_error_message": task.last_error.as_ref().map(|e| e.message.as_str()),
        "created_at": fmt_ts(task.created_at),
        "updated_at": fmt_ts(task.updated_at),
        "claimed_by": task.claimed_by,
        "claim_expiry": task.claim_expiry.map(fmt_ts),
        "not_before": task.not_before.map(fmt_ts),
        "priority": task.priority,
        "batch_id": task.batch_id.map(|b| b.to_string()),
        "bytes_done": task.bytes_done,
        "bytes_total": task.bytes_total,
        "target_chat": task.target_chat,
    }))
}

/// SQL list of the claimed states a patch may be applied from.
fn patch_source_states(patch: &TaskPatch) -> String {
    let states: Vec<String> = TaskState::CLAIMED
        .into_iter()
        .filter(|s| match patch.state {
            Some(target) => s.can_transition_to(target),
            None => true,
        })
        .map(|s| format!("'{s}'"))
        .collect();
    format!("({})", states.join(", "))
}

fn owner_list(owners: &[i64]) -> String {
    owners
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ── TaskStore ───────────────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn create(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(INSERT_TASK, params_from_iter(task_params(task)?))
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;
        debug!(task_id = %task.id, owner = task.owner_user_id, "Task inserted");
        Ok(())
    }

    async fn create_many(&self, tasks: &[Task]) -> Result<(), DatabaseError> {
        if tasks.is_empty() {
            return Ok(());
        }
        // One statement: SQLite applies all rows or none, and no other write
        // on the shared connection can land inside it.
        let rows = tasks
            .iter()
            .map(task_json)
            .collect::<Result<Vec<_>, _>>()?;
        let rows = serde_json::to_string(&rows)
            .map_err(|e| DatabaseError::Serialization(format!("create_many: {e}")))?;
        self.conn()
            .execute(INSERT_TASKS_FROM_JSON, params![rows])
            .await
            .map_err(|e| DatabaseError::Query(format!("create_many: {e}")))?;
        debug!(count = tasks.len(), "Task batch inserted");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                vec![id.to_string().into()],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expiry: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET state = 'claimed', claimed_by = ?1, claim_expiry = ?2, updated_at = ?3
                 WHERE id = ?4 AND (
                    (state = 'pending' AND (not_before IS NULL OR not_before <= ?3))
                    OR (state = 'claimed' AND claim_expiry <= ?3)
                 )",
                params![worker, fmt_ts(lease_expiry), fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_claim: {e}")))?;
        Ok(affected == 1)
    }

    async fn update_claimed(
        &self,
        id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        patch: &TaskPatch,
    ) -> Result<bool, DatabaseError> {
        let mut sets = vec!["updated_at = ?".to_string()];
        let mut values: Vec<libsql::Value> = vec![fmt_ts(now).into()];

        if let Some(state) = patch.state {
            sets.push("state = ?".into());
            values.push(state.as_str().into());
        }
        if let Some(done) = patch.bytes_done {
            sets.push("bytes_done = ?".into());
            values.push((done as i64).into());
        }
        if let Some(total) = patch.bytes_total {
            sets.push("bytes_total = ?".into());
            values.push((total as i64).into());
        }
        if let Some(error) = &patch.last_error {
            sets.push("last_error_class = ?".into());
            values.push(error.class.as_str().into());
            sets.push("last_error_message = ?".into());
            values.push(error.message.clone().into());
        }
        if let Some(gate) = patch.not_before {
            sets.push("not_before = ?".into());
            values.push(fmt_ts(gate).into());
        }
        if patch.increment_attempts {
            sets.push("attempt_count = attempt_count + 1".into());
        }
        if patch.releases_claim() {
            sets.push("claimed_by = NULL".into());
            sets.push("claim_expiry = NULL".into());
        } else if let Some(lease) = patch.claim_expiry {
            sets.push("claim_expiry = ?".into());
            values.push(fmt_ts(lease).into());
        }

        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ? AND claimed_by = ? AND state IN {}",
            sets.join(", "),
            patch_source_states(patch),
        );
        values.push(id.to_string().into());
        values.push(worker.to_string().into());

        let affected = self
            .conn()
            .execute(&sql, params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_claimed: {e}")))?;
        Ok(affected == 1)
    }

    async fn find_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "find_expired_leases",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE state IN {CLAIMED_STATES} AND claim_expiry <= ?1
                 ORDER BY created_at, rowid"
            ),
            vec![fmt_ts(now).into()],
        )
        .await
    }

    async fn revert_expired(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Option<TaskState>, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET
                        state = CASE WHEN attempt_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                        attempt_count = attempt_count + 1,
                        claimed_by = NULL,
                        claim_expiry = NULL,
                        last_error_class = 'transient',
                        last_error_message = 'worker lease expired',
                        updated_at = ?2
                     WHERE id = ?3 AND state IN {CLAIMED_STATES} AND claim_expiry <= ?2"
                ),
                params![max_attempts as i64, fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("revert_expired: {e}")))?;

        if affected == 0 {
            return Ok(None);
        }
        Ok(self.get(id).await?.map(|t| t.state))
    }

    async fn find_by_owner(
        &self,
        owner: i64,
        state: Option<TaskState>,
    ) -> Result<Vec<Task>, DatabaseError> {
        match state {
            Some(state) => {
                self.query_tasks(
                    "find_by_owner",
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_user_id = ?1 AND state = ?2
                         ORDER BY created_at, rowid"
                    ),
                    vec![owner.into(), state.as_str().into()],
                )
                .await
            }
            None => {
                self.query_tasks(
                    "find_by_owner",
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_user_id = ?1
                         ORDER BY created_at, rowid"
                    ),
                    vec![owner.into()],
                )
                .await
            }
        }
    }

    async fn list_tasks(
        &self,
        owner: Option<i64>,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut filters = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(owner) = owner {
            filters.push("owner_user_id = ?");
            values.push(owner.into());
        }
        if let Some(state) = state {
            filters.push("state = ?");
            values.push(state.as_str().into());
        }
        let where_clause = if filters.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", filters.join(" AND "))
        };
        values.push((limit as i64).into());

        self.query_tasks(
            "list_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
                 ORDER BY created_at DESC, rowid DESC LIMIT ?"
            ),
            values,
        )
        .await
    }

    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        exclude_owners: &[i64],
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let exclusion = if exclude_owners.is_empty() {
            String::new()
        } else {
            format!("AND owner_user_id NOT IN ({})", owner_list(exclude_owners))
        };
        self.query_tasks(
            "find_dispatchable",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE state = 'pending' AND (not_before IS NULL OR not_before <= ?1) {exclusion}
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT ?2"
            ),
            vec![fmt_ts(now).into(), (limit as i64).into()],
        )
        .await
    }

    async fn cancel(
        &self,
        id: Uuid,
        owner: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE tasks SET state = 'cancelled', claimed_by = NULL, claim_expiry = NULL,
                last_error_class = 'cancelled', last_error_message = 'cancelled', updated_at = ?1
             WHERE id = ?2 AND state IN {ACTIVE_STATES} AND (?3 IS NULL OR owner_user_id = ?3)"
        );
        let owner = match owner {
            Some(o) => libsql::Value::Integer(o),
            None => libsql::Value::Null,
        };
        let affected = self
            .conn()
            .execute(&sql, params![fmt_ts(now), id.to_string(), owner])
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_task: {e}")))?;
        Ok(affected == 1)
    }

    async fn cancel_all(&self, owner: i64, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "UPDATE tasks SET state = 'cancelled', claimed_by = NULL, claim_expiry = NULL,
                        last_error_class = 'cancelled', last_error_message = 'cancelled', updated_at = ?1
                     WHERE owner_user_id = ?2 AND state IN {ACTIVE_STATES}"
                ),
                params![fmt_ts(now), owner],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_all: {e}")))
    }

    async fn fail_pending_for_owner(
        &self,
        owner: i64,
        error: &TaskError,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET state = 'failed', last_error_class = ?1, last_error_message = ?2,
                    updated_at = ?3
                 WHERE owner_user_id = ?4 AND state = 'pending'",
                params![
                    error.class.as_str(),
                    error.message.clone(),
                    fmt_ts(now),
                    owner
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_pending_for_owner: {e}")))
    }

    async fn set_priority(
        &self,
        id: Uuid,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                &format!(
                    "UPDATE tasks SET priority = ?1, updated_at = ?2
                     WHERE id = ?3 AND state IN {ACTIVE_STATES}"
                ),
                params![priority, fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_priority: {e}")))?;
        Ok(affected == 1)
    }

    async fn retry_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET state = 'pending', attempt_count = 0, not_before = NULL,
                    bytes_done = 0, updated_at = ?1
                 WHERE id = ?2 AND state = 'failed'",
                params![fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_failed: {e}")))?;
        Ok(affected == 1)
    }

    async fn counts_by_state(&self) -> Result<HashMap<TaskState, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT state, COUNT(*) FROM tasks GROUP BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("counts_by_state: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("counts_by_state: {e}")))?
        {
            let state: String = col(&row, 0, "state")?;
            let count: i64 = col(&row, 1, "count")?;
            let state: TaskState = state.parse().map_err(DatabaseError::Serialization)?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }

    async fn counts_by_error_class(&self) -> Result<HashMap<ErrorClass, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_error_class, COUNT(*) FROM tasks
                 WHERE state = 'failed' AND last_error_class IS NOT NULL
                 GROUP BY last_error_class",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("counts_by_error_class: {e}")))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("counts_by_error_class: {e}")))?
        {
            let class: String = col(&row, 0, "last_error_class")?;
            let count: i64 = col(&row, 1, "count")?;
            let class: ErrorClass = class.parse().map_err(DatabaseError::Serialization)?;
            counts.insert(class, count as u64);
        }
        Ok(counts)
    }

    async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let pruned = self
            .conn()
            .execute(
                &format!(
                    "DELETE FROM tasks WHERE state IN {TERMINAL_STATES} AND updated_at < ?1"
                ),
                params![fmt_ts(older_than)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_terminal: {e}")))?;
        if pruned > 0 {
            info!(pruned, "Pruned old terminal tasks");
        }
        Ok(pruned)
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "all_tasks",
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, rowid"),
            Vec::new(),
        )
        .await
    }
}

// ── SessionStore ────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for LibSqlBackend {
    async fn put_sealed(
        &self,
        user_id: i64,
        blob: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let now = fmt_ts(now);
        self.conn()
            .execute(
                "INSERT INTO sessions (user_id, sealed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET sealed = excluded.sealed,
                    updated_at = excluded.updated_at",
                params![user_id, libsql::Value::Blob(blob.to_vec()), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_sealed: {e}")))?;
        Ok(())
    }

    async fn get_sealed(&self, user_id: i64) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT sealed FROM sessions WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_sealed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(col(&row, 0, "sealed")?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_sealed: {e}"))),
        }
    }

    async fn delete_sealed(&self, user_id: i64) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_sealed: {e}")))?;
        Ok(affected > 0)
    }

    async fn count_sessions(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM sessions", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_sessions: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(col::<i64>(&row, 0, "count")? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_sessions: {e}"))),
        }
    }
}

// ── SettingsStore ───────────────────────────────────────────────────

#[async_trait]
impl SettingsStore for LibSqlBackend {
    async fn get_settings(&self, user_id: i64) -> Result<UserSettings, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT target_chat, skipped FROM user_settings WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_settings: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_settings: {e}")))?;
        let Some(row) = row else {
            return Ok(UserSettings::default());
        };
        let skipped: String = col(&row, 1, "skipped")?;
        Ok(UserSettings {
            target_chat: col(&row, 0, "target_chat")?,
            skipped: serde_json::from_str(&skipped)
                .map_err(|e| DatabaseError::Serialization(format!("skipped: {e}")))?,
        })
    }

    async fn put_settings(
        &self,
        user_id: i64,
        settings: &UserSettings,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let skipped = serde_json::to_string(&settings.skipped)
            .map_err(|e| DatabaseError::Serialization(format!("skipped: {e}")))?;
        let target_chat = match settings.target_chat {
            Some(chat) => libsql::Value::Integer(chat),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                "INSERT INTO user_settings (user_id, target_chat, skipped, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET target_chat = excluded.target_chat,
                    skipped = excluded.skipped, updated_at = excluded.updated_at",
                params![user_id, target_chat, skipped, fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_settings: {e}")))?;
        debug!(user_id, ?settings, "Settings saved");
        Ok(())
    }
}
