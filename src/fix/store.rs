//! The append-only message log.
//!
//! Every session writes one [`LogEntry`] per message sent or received (when
//! `log-messages` is on) and replays its own OUTBOUND entries to answer a
//! ResendRequest. Stores are shared across sessions; appends are already
//! serialized per session by the session itself.

use crate::fix::SessionId;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("An I/O error occured: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
        }
    }
}

/// One logged message.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at_millis: i64,
    pub seq_num: u32,
    pub direction: Direction,
    pub session_id: String,
    pub msg_type: char,
    pub raw: Vec<u8>,
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(
        at_millis: i64,
        seq_num: u32,
        direction: Direction,
        session_id: &SessionId,
        msg_type: char,
        raw: Vec<u8>,
    ) -> Self {
        LogEntry {
            at_millis,
            seq_num,
            direction,
            session_id: session_id.to_string(),
            msg_type,
            raw,
            metadata: None,
        }
    }
}

/// Append-only log consumed by the session layer.
///
/// `replay` enumerates all entries for one session in append order; the
/// visitor returns true to continue. A session configured without a store
/// skips writes and answers resends with a single gap-fill instead.
pub trait LogStore: Send + Sync {
    fn write(&self, entry: LogEntry) -> Result<(), StoreError>;

    fn replay(
        &self,
        session_id: &str,
        visitor: &mut dyn FnMut(&LogEntry) -> bool,
    ) -> Result<(), StoreError>;
}

/// In-memory store, one append vector per session stream.
#[derive(Default)]
pub struct MemoryLogStore {
    streams: Mutex<HashMap<String, Vec<LogEntry>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.streams
            .lock()
            .expect("store lock")
            .get(session_id)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, session_id: &str) -> bool {
        self.len(session_id) == 0
    }
}

impl LogStore for MemoryLogStore {
    fn write(&self, entry: LogEntry) -> Result<(), StoreError> {
        self.streams
            .lock()
            .expect("store lock")
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn replay(
        &self,
        session_id: &str,
        visitor: &mut dyn FnMut(&LogEntry) -> bool,
    ) -> Result<(), StoreError> {
        let streams = self.streams.lock().expect("store lock");
        if let Some(entries) = streams.get(session_id) {
            for entry in entries {
                if !visitor(entry) {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Collects the OUTBOUND entries within `[begin, end]`, in sequence order.
pub(crate) fn outbound_range(
    store: &dyn LogStore,
    session_id: &str,
    begin: u32,
    end: u32,
) -> Result<Vec<LogEntry>, StoreError> {
    let mut found = Vec::new();
    store.replay(session_id, &mut |entry| {
        if entry.direction == Direction::Outbound
            && (begin..=end).contains(&entry.seq_num)
        {
            found.push(entry.clone());
        }
        true
    })?;
    found.sort_by_key(|e| e.seq_num);
    Ok(found)
}
