//! The persisted event log.
//!
//! Everything the control loop does to the world is recorded as an event:
//! releases, syncs, and policy changes. Events live in the same `SQLite`
//! database as the job queue and survive daemon restarts.

#![allow(clippy::missing_panics_doc)]

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::JobId;
use crate::update::{Cause, ReleaseResult, UpdateSpec};
use crate::workload::WorkloadId;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from the event store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HistoryError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A metadata payload would not (de)serialise.
    #[error("encoding event payload: {reason}")]
    Encoding {
        /// Why encoding failed.
        reason: String,
    },

    /// The event id does not exist.
    #[error("no such event {0}")]
    NoSuchEvent(EventId),
}

/// An event identifier, assigned on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A release wrote image updates to the repo.
    Release,
    /// A sync applied commits to the cluster.
    Sync,
    /// A workload was marked automated.
    Automate,
    /// A workload's automation was removed.
    Deautomate,
    /// A workload was locked.
    Lock,
    /// A workload was unlocked.
    Unlock,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Release => "release",
            Self::Sync => "sync",
            Self::Automate => "automate",
            Self::Deautomate => "deautomate",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
        };
        f.write_str(s)
    }
}

/// How important an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Noise, kept for debugging.
    Debug,
    /// Routine operation.
    Info,
    /// Something odd but survivable.
    Warn,
    /// Something went wrong.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Type-specific event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventMetadata {
    /// Payload of a release event.
    Release {
        /// What was asked for.
        spec: UpdateSpec,
        /// Who asked.
        cause: Cause,
        /// What happened, per workload.
        result: ReleaseResult,
        /// The job that ran the release, if any.
        job: Option<JobId>,
        /// The error, for failed releases.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Payload of a sync event.
    Sync {
        /// The commit ids the sync applied, oldest first.
        revisions: Vec<String>,
    },
    /// Events with nothing extra to say.
    None,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store on insert.
    pub id: Option<EventId>,
    /// The workloads the event touched.
    pub workload_ids: Vec<WorkloadId>,
    /// What kind of thing happened.
    pub event_type: EventType,
    /// When it began.
    pub started_at: DateTime<Utc>,
    /// When it ended; equal to `started_at` for instantaneous events.
    pub ended_at: DateTime<Utc>,
    /// How important it is.
    pub log_level: LogLevel,
    /// Type-specific payload.
    pub metadata: EventMetadata,
}

impl Event {
    /// An instantaneous info-level event happening now.
    #[must_use]
    pub fn now(
        event_type: EventType,
        workload_ids: Vec<WorkloadId>,
        metadata: EventMetadata,
    ) -> Self {
        let at = Utc::now();
        Self {
            id: None,
            workload_ids,
            event_type,
            started_at: at,
            ended_at: at,
            log_level: LogLevel::Info,
            metadata,
        }
    }
}

/// The `SQLite`-backed event log.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Opens or creates a store at `path`. Sharing the job queue's database
    /// file is fine; the schemas are disjoint.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or initialised.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be initialised.
    pub fn in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Appends an event, returning its assigned id.
    ///
    /// # Errors
    ///
    /// Fails on database or encoding errors.
    pub fn log_event(&self, instance: &str, event: &Event) -> Result<EventId, HistoryError> {
        let workload_ids = serde_json::to_string(&event.workload_ids).map_err(encoding)?;
        let metadata = serde_json::to_string(&event.metadata).map_err(encoding)?;
        let conn = self.conn.lock().expect("event store lock");
        conn.execute(
            "INSERT INTO events (instance, workload_ids, type, started_at, ended_at,
                                 log_level, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                instance,
                workload_ids,
                event.event_type.to_string(),
                event.started_at.timestamp_millis(),
                event.ended_at.timestamp_millis(),
                event.log_level.to_string(),
                metadata,
            ],
        )?;
        Ok(EventId(conn.last_insert_rowid()))
    }

    /// The most recent events for an instance, newest first.
    ///
    /// # Errors
    ///
    /// Fails on database or decoding errors.
    pub fn all_events(&self, instance: &str, limit: i64) -> Result<Vec<Event>, HistoryError> {
        let conn = self.conn.lock().expect("event store lock");
        let mut stmt = conn.prepare(
            "SELECT id, workload_ids, type, started_at, ended_at, log_level, metadata
             FROM events WHERE instance = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![instance, limit], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// The most recent events touching one workload, newest first.
    ///
    /// # Errors
    ///
    /// Fails on database or decoding errors.
    pub fn events_for_service(
        &self,
        instance: &str,
        id: &WorkloadId,
        limit: i64,
    ) -> Result<Vec<Event>, HistoryError> {
        let all = self.all_events(instance, limit.saturating_mul(8))?;
        Ok(all
            .into_iter()
            .filter(|e| e.workload_ids.contains(id))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    /// Reads one event by id.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::NoSuchEvent`] when the id does not exist.
    pub fn get_event(&self, id: EventId) -> Result<Event, HistoryError> {
        let conn = self.conn.lock().expect("event store lock");
        let event = conn
            .query_row(
                "SELECT id, workload_ids, type, started_at, ended_at, log_level, metadata
                 FROM events WHERE id = ?1",
                params![id.0],
                row_to_event,
            )
            .optional()?;
        event.ok_or(HistoryError::NoSuchEvent(id))
    }
}

fn encoding(e: serde_json::Error) -> HistoryError {
    HistoryError::Encoding {
        reason: e.to_string(),
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let decode = |reason: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, reason)),
        )
    };
    let workload_ids: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let log_level: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    Ok(Event {
        id: Some(EventId(row.get(0)?)),
        workload_ids: serde_json::from_str(&workload_ids).map_err(|e| decode(e.to_string()))?,
        event_type: serde_json::from_str(&format!("\"{event_type}\""))
            .map_err(|e| decode(e.to_string()))?,
        started_at: DateTime::from_timestamp_millis(row.get(3)?).unwrap_or_default(),
        ended_at: DateTime::from_timestamp_millis(row.get(4)?).unwrap_or_default(),
        log_level: serde_json::from_str(&format!("\"{log_level}\""))
            .map_err(|e| decode(e.to_string()))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| decode(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_event(ids: &[&str], revisions: &[&str]) -> Event {
        Event::now(
            EventType::Sync,
            ids.iter().map(|s| s.parse().unwrap()).collect(),
            EventMetadata::Sync {
                revisions: revisions.iter().map(|s| (*s).to_string()).collect(),
            },
        )
    }

    #[test]
    fn events_round_trip_with_metadata() {
        let store = EventStore::in_memory().unwrap();
        let event = sync_event(&["default/hello"], &["abc123"]);
        let id = store.log_event("inst", &event).unwrap();

        let read = store.get_event(id).unwrap();
        assert_eq!(read.event_type, event.event_type);
        assert_eq!(read.metadata, event.metadata);
        assert_eq!(read.workload_ids, event.workload_ids);
    }

    #[test]
    fn all_events_is_scoped_and_newest_first() {
        let store = EventStore::in_memory().unwrap();
        store
            .log_event("inst", &sync_event(&["default/a"], &["r1"]))
            .unwrap();
        store
            .log_event("inst", &sync_event(&["default/b"], &["r2"]))
            .unwrap();
        store
            .log_event("elsewhere", &sync_event(&["default/c"], &["r3"]))
            .unwrap();

        let events = store.all_events("inst", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].metadata,
            EventMetadata::Sync {
                revisions: vec!["r2".to_string()]
            }
        );
    }

    #[test]
    fn events_for_service_filters() {
        let store = EventStore::in_memory().unwrap();
        store
            .log_event("inst", &sync_event(&["default/a", "default/b"], &["r1"]))
            .unwrap();
        store
            .log_event("inst", &sync_event(&["default/b"], &["r2"]))
            .unwrap();

        let for_a = store
            .events_for_service("inst", &"default/a".parse().unwrap(), 10)
            .unwrap();
        assert_eq!(for_a.len(), 1);
        let for_b = store
            .events_for_service("inst", &"default/b".parse().unwrap(), 10)
            .unwrap();
        assert_eq!(for_b.len(), 2);
    }

    #[test]
    fn missing_event_is_typed() {
        let store = EventStore::in_memory().unwrap();
        assert!(matches!(
            store.get_event(EventId(99)),
            Err(HistoryError::NoSuchEvent(_))
        ));
    }
}
