//! SQLite-backed message log.
//!
//! One database file holds every session's stream; the `session_id` column
//! partitions them. The connection runs in WAL mode so session appends do
//! not stall concurrent replays from other sessions.
//!
//! The [`LogStore`] interface is synchronous because it is consumed inside
//! the inbound dispatch path; appends are single-row inserts and replays
//! only happen while answering a ResendRequest.

use crate::fix::store::{Direction, LogEntry, LogStore, StoreError};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Mutex;

const SQL_ENTER_WAL_MODE: &str = "PRAGMA journal_mode=WAL;";
const SQL_CREATE_LOG_TABLE: &str = "CREATE TABLE IF NOT EXISTS message_log (
        key INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id VARCHAR NOT NULL,
        at_millis INTEGER NOT NULL,
        seq_num INTEGER NOT NULL,
        direction VARCHAR NOT NULL,
        msg_type VARCHAR NOT NULL,
        message BLOB NOT NULL,
        metadata TEXT
    );";
const SQL_CREATE_LOG_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS message_log_session ON message_log (session_id, key);";
const SQL_INSERT_ENTRY: &str = "INSERT INTO message_log \
     (session_id, at_millis, seq_num, direction, msg_type, message, metadata) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";
const SQL_SELECT_STREAM: &str = "SELECT at_millis, seq_num, direction, msg_type, message, metadata \
     FROM message_log WHERE session_id = ?1 ORDER BY key";

pub struct SqliteLogStore {
    conn: Mutex<Connection>,
}

impl SqliteLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(path, OpenFlags::default())?;
        conn.query_row(SQL_ENTER_WAL_MODE, (), |_| Ok(()))?;
        conn.execute(SQL_CREATE_LOG_TABLE, ())?;
        conn.execute(SQL_CREATE_LOG_INDEX, ())?;
        Ok(SqliteLogStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SQL_CREATE_LOG_TABLE, ())?;
        conn.execute(SQL_CREATE_LOG_INDEX, ())?;
        Ok(SqliteLogStore {
            conn: Mutex::new(conn),
        })
    }
}

impl LogStore for SqliteLogStore {
    fn write(&self, entry: LogEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            SQL_INSERT_ENTRY,
            rusqlite::params![
                entry.session_id,
                entry.at_millis,
                entry.seq_num,
                entry.direction.as_str(),
                entry.msg_type.to_string(),
                entry.raw,
                entry.metadata.map(|m| m.to_string()),
            ],
        )?;
        Ok(())
    }

    fn replay(
        &self,
        session_id: &str,
        visitor: &mut dyn FnMut(&LogEntry) -> bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(SQL_SELECT_STREAM)?;
        let rows = stmt.query_map(rusqlite::params![session_id], |row| {
            let direction: String = row.get(2)?;
            let msg_type: String = row.get(3)?;
            let metadata: Option<String> = row.get(5)?;
            Ok(LogEntry {
                at_millis: row.get(0)?,
                seq_num: row.get(1)?,
                direction: if direction == "IN" {
                    Direction::Inbound
                } else {
                    Direction::Outbound
                },
                msg_type: msg_type.chars().next().unwrap_or('?'),
                session_id: session_id.to_string(),
                raw: row.get(4)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        })?;
        for row in rows {
            if !visitor(&row?) {
                break;
            }
        }
        Ok(())
    }
}
