use super::{extended, ObjectDescriptor, ObjectKind, State, StateChange, StateStore};
use crate::error::{AdapterError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 1024;

/// SQLite-backed tree. Rows are keyed by the full id (`<namespace>.<id>`).
pub struct SqliteStore {
    conn: Mutex<Connection>,
    namespace: String,
    changes: broadcast::Sender<StateChange>,
}

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS objects (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            common TEXT NOT NULL,
            native TEXT NOT NULL,
            updated_at TEXT DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS states (
            id TEXT PRIMARY KEY,
            val TEXT NOT NULL,
            ack BOOLEAN NOT NULL DEFAULT 0,
            ts INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, namespace: &str) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, namespace)
    }

    pub fn open_in_memory(namespace: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> Result<Self> {
        init_db(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            namespace: namespace.to_string(),
            changes,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AdapterError::StoreUnavailable(format!("connection lock poisoned: {}", e)))
    }

    fn full_id(&self, id: &str) -> String {
        format!("{}.{}", self.namespace, id)
    }

    fn relative_id<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(full)
    }

    fn read_object(conn: &Connection, full_id: &str) -> Result<Option<ObjectDescriptor>> {
        let row = conn
            .query_row(
                "SELECT kind, common, native FROM objects WHERE id = ?1",
                [full_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(kind, common, native)| decode_object(&kind, &common, &native))
            .transpose()
    }

    fn write_object(conn: &Connection, full_id: &str, obj: &ObjectDescriptor) -> Result<()> {
        conn.execute(
            "INSERT INTO objects (id, kind, common, native, updated_at)
             VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                common = excluded.common,
                native = excluded.native,
                updated_at = excluded.updated_at",
            params![
                full_id,
                obj.kind.as_str(),
                encode(&obj.common)?,
                encode(&obj.native)?,
            ],
        )?;
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AdapterError::StoreUnavailable(e.to_string()))
}

fn decode_object(kind: &str, common: &str, native: &str) -> Result<ObjectDescriptor> {
    let malformed = |e: serde_json::Error| AdapterError::StoreUnavailable(format!("malformed row: {}", e));
    Ok(ObjectDescriptor {
        kind: serde_json::from_value(Value::String(kind.to_string())).map_err(malformed)?,
        common: serde_json::from_str(common).map_err(malformed)?,
        native: serde_json::from_str(native).map_err(malformed)?,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_object(&self, id: &str) -> Result<Option<ObjectDescriptor>> {
        let conn = self.conn()?;
        Self::read_object(&conn, &self.full_id(id))
    }

    async fn set_object(&self, id: &str, obj: ObjectDescriptor) -> Result<()> {
        let conn = self.conn()?;
        Self::write_object(&conn, &self.full_id(id), &obj)
    }

    async fn set_object_not_exists(&self, id: &str, obj: ObjectDescriptor) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO objects (id, kind, common, native) VALUES (?1, ?2, ?3, ?4)",
            params![
                self.full_id(id),
                obj.kind.as_str(),
                encode(&obj.common)?,
                encode(&obj.native)?,
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn extend_object(&self, id: &str, partial: Value) -> Result<()> {
        let conn = self.conn()?;
        let full_id = self.full_id(id);
        let existing = Self::read_object(&conn, &full_id)?;
        let merged = extended(existing.as_ref(), &partial)?;
        if existing.as_ref() != Some(&merged) {
            Self::write_object(&conn, &full_id, &merged)?;
        }
        Ok(())
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let full_id = self.full_id(id);
        conn.execute("DELETE FROM objects WHERE id = ?1", [&full_id])?;
        conn.execute("DELETE FROM states WHERE id = ?1", [&full_id])?;
        Ok(())
    }

    async fn get_state(&self, id: &str) -> Result<Option<State>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT val, ack, ts FROM states WHERE id = ?1",
                [self.full_id(id)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(val, ack, ts)| {
            let val = serde_json::from_str(&val)
                .map_err(|e| AdapterError::StoreUnavailable(format!("malformed state: {}", e)))?;
            Ok(State { val, ack, ts })
        })
        .transpose()
    }

    async fn set_state(&self, id: &str, val: Value, ack: bool) -> Result<()> {
        let state = State::new(val, ack);
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO states (id, val, ack, ts) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET val = excluded.val, ack = excluded.ack, ts = excluded.ts",
                params![self.full_id(id), encode(&state.val)?, state.ack, state.ts],
            )?;
        }
        let _ = self.changes.send(StateChange {
            id: id.to_string(),
            state,
        });
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        kind: Option<ObjectKind>,
    ) -> Result<Vec<(String, ObjectDescriptor)>> {
        let conn = self.conn()?;
        let full_prefix = self.full_id(prefix);
        let mut stmt = conn.prepare(
            "SELECT id, kind, common, native FROM objects WHERE substr(id, 1, ?2) = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![full_prefix, full_prefix.len() as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut objects = Vec::new();
        for row in rows {
            let (id, kind_raw, common, native) = row?;
            let obj = decode_object(&kind_raw, &common, &native)?;
            if kind.map_or(true, |k| obj.kind == k) {
                objects.push((self.relative_id(&id).to_string(), obj));
            }
        }
        Ok(objects)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
