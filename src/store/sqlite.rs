use super::subscriptions::{ChangeCallback, ErrorCallback, Subscription, SubscriptionRegistry};
use super::{new_record_id, strip_metadata, validate_field_name, validate_id, validate_path, StoreAdapter};
use crate::errors::{AppError, AppResult};
use crate::models::{FieldFilter, Fields, Record, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, ToSql};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub struct SqliteStore {
    conn: Mutex<Connection>,
    revisions: Mutex<HashMap<String, u64>>,
    subscriptions: SubscriptionRegistry,
    closed: AtomicBool,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened sqlite store");
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            revisions: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionRegistry::new(),
            closed: AtomicBool::new(false),
            db_path,
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::StoreUnavailable("sqlite store is closed".to_string()));
        }
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn revision(&self, path: &str) -> u64 {
        self.revisions
            .lock()
            .map(|revisions| revisions.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    // Runs under the connection lock so revision and snapshot agree.
    fn bump(&self, conn: &Connection, path: &str) -> AppResult<Option<(u64, Vec<Record>)>> {
        let revision = {
            let mut revisions = self
                .revisions
                .lock()
                .map_err(|_| AppError::Internal("revision mutex poisoned".to_string()))?;
            let entry = revisions.entry(path.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if !self.subscriptions.is_watched(path) {
            return Ok(None);
        }
        Ok(Some((revision, select_nodes(conn, path, None)?)))
    }

    fn publish(&self, path: &str, change: Option<(u64, Vec<Record>)>) {
        if let Some((revision, snapshot)) = change {
            self.subscriptions.notify(path, revision, &snapshot);
        }
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create(&self, path: &str, data: Fields, id: Option<&str>) -> AppResult<Record> {
        validate_path(path)?;
        if let Some(id) = id {
            validate_id(id)?;
        }

        let now = Utc::now();
        let record = Record {
            id: id.map(ToString::to_string).unwrap_or_else(|| new_record_id(now)),
            fields: strip_metadata(data),
            created_at: now.timestamp_millis(),
            updated_at: now.timestamp_millis(),
        };
        let data_json = serde_json::to_string(&record.fields)?;

        let change = {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO nodes (path, id, data, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![path, record.id, data_json, record.created_at, record.updated_at],
            )
            .map_err(|err| {
                if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    AppError::Conflict(format!("record '{}' already exists at '{}'", record.id, path))
                } else {
                    AppError::from(err)
                }
            })?;
            self.bump(&conn, path)?
        };

        self.publish(path, change);
        Ok(record)
    }

    async fn get_by_id(&self, path: &str, id: &str) -> AppResult<Record> {
        validate_path(path)?;
        let conn = self.lock()?;
        select_node(&conn, path, id)?
            .ok_or_else(|| AppError::NotFound(format!("record '{}' not found at '{}'", id, path)))
    }

    async fn scan_native(&self, path: &str, equality: Option<&FieldFilter>) -> AppResult<Vec<Record>> {
        validate_path(path)?;
        if let Some(filter) = equality {
            validate_field_name(&filter.field)?;
        }
        let conn = self.lock()?;
        let records = select_nodes(&conn, path, equality)?;
        // SQL comparison is looser than JSON equality (true = 1), so recheck.
        Ok(match equality {
            Some(filter) => records.into_iter().filter(|record| filter.matches(record)).collect(),
            None => records,
        })
    }

    async fn update(&self, path: &str, id: &str, partial: Fields) -> AppResult<Record> {
        validate_path(path)?;

        let (record, change) = {
            let conn = self.lock()?;
            let mut record = select_node(&conn, path, id)?
                .ok_or_else(|| AppError::NotFound(format!("record '{}' not found at '{}'", id, path)))?;
            for (key, value) in strip_metadata(partial) {
                record.fields.insert(key, value);
            }
            record.updated_at = Utc::now().timestamp_millis().max(record.updated_at);
            conn.execute(
                "UPDATE nodes SET data = ?1, updated_at = ?2 WHERE path = ?3 AND id = ?4",
                params![serde_json::to_string(&record.fields)?, record.updated_at, path, id],
            )?;
            let change = self.bump(&conn, path)?;
            (record, change)
        };

        self.publish(path, change);
        Ok(record)
    }

    async fn delete(&self, path: &str, id: &str) -> AppResult<()> {
        validate_path(path)?;
        let change = {
            let conn = self.lock()?;
            let removed = conn.execute("DELETE FROM nodes WHERE path = ?1 AND id = ?2", params![path, id])?;
            if removed == 0 {
                None
            } else {
                self.bump(&conn, path)?
            }
        };
        self.publish(path, change);
        Ok(())
    }

    async fn subscribe(
        &self,
        path: &str,
        on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> AppResult<Subscription> {
        validate_path(path)?;
        let subscription = self.subscriptions.register(path, on_change, on_error);
        let (revision, snapshot) = {
            let conn = self.lock()?;
            (self.revision(path), select_nodes(&conn, path, None)?)
        };
        self.subscriptions.deliver_to(subscription.id(), revision, &snapshot);
        Ok(subscription)
    }

    async fn close(&self) -> AppResult<()> {
        {
            let conn = self.lock()?;
            if self.db_path.is_some() {
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            }
        }
        self.closed.store(true, Ordering::Release);
        self.subscriptions
            .notify_error(&AppError::StoreUnavailable("sqlite store is closed".to_string()));
        Ok(())
    }
}

fn select_node(conn: &Connection, path: &str, id: &str) -> AppResult<Option<Record>> {
    let row = conn
        .query_row(
            "SELECT id, data, created_at, updated_at FROM nodes WHERE path = ?1 AND id = ?2",
            params![path, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(id, data, created_at, updated_at)| parse_record(id, &data, created_at, updated_at))
        .transpose()
}

fn select_nodes(conn: &Connection, path: &str, equality: Option<&FieldFilter>) -> AppResult<Vec<Record>> {
    let mut query = String::from("SELECT id, data, created_at, updated_at FROM nodes WHERE path = ?");
    let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(path.to_string())];

    if let Some(filter) = equality {
        let (column, json_path) = match filter.field.as_str() {
            ID_FIELD => ("id", None),
            CREATED_AT_FIELD => ("created_at", None),
            UPDATED_AT_FIELD => ("updated_at", None),
            field => ("json_extract(data, ?)", Some(format!("$.{}", field))),
        };
        // Arrays and objects have no SQL form; the caller matches them.
        if let Some(scalar) = sql_scalar(&filter.value) {
            if let Some(json_path) = json_path {
                params_vec.push(Box::new(json_path));
            }
            match scalar {
                SqlScalar::Null => query.push_str(&format!(" AND {} IS NULL", column)),
                SqlScalar::Bound(value) => {
                    query.push_str(&format!(" AND {} = ?", column));
                    params_vec.push(value);
                }
            }
        }
    }

    query.push_str(" ORDER BY id ASC");

    let mut statement = conn.prepare(&query)?;
    let rows = statement.query_map(
        rusqlite::params_from_iter(params_vec.iter().map(|param| param.as_ref())),
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        },
    )?;

    let mut result = Vec::new();
    for row in rows {
        let (id, data, created_at, updated_at) = row?;
        result.push(parse_record(id, &data, created_at, updated_at)?);
    }
    Ok(result)
}

enum SqlScalar {
    Null,
    Bound(Box<dyn ToSql>),
}

fn sql_scalar(value: &Value) -> Option<SqlScalar> {
    match value {
        Value::Null => Some(SqlScalar::Null),
        Value::Bool(flag) => Some(SqlScalar::Bound(Box::new(i64::from(*flag)))),
        Value::Number(number) => match number.as_i64() {
            Some(int) => Some(SqlScalar::Bound(Box::new(int))),
            None => number.as_f64().map(|float| SqlScalar::Bound(Box::new(float))),
        },
        Value::String(text) => Some(SqlScalar::Bound(Box::new(text.clone()))),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn parse_record(id: String, data: &str, created_at: i64, updated_at: i64) -> AppResult<Record> {
    let fields = match serde_json::from_str::<Value>(data)? {
        Value::Object(fields) => fields,
        other => {
            return Err(AppError::Internal(format!(
                "node '{}' holds non-object data: {}",
                id, other
            )))
        }
    };
    Ok(Record {
        id,
        fields,
        created_at,
        updated_at,
    })
}
