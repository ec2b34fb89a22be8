//! The job queue.
//!
//! A durable, transactional work queue backed by `SQLite`. Jobs are
//! deduplicated on `(instance, key)` while unfinished, ordered by priority
//! then schedule, claimed atomically inside an immediate transaction
//! (`SQLite`'s single-writer lock stands in for `SELECT ... FOR UPDATE SKIP
//! LOCKED`), heartbeaten by their worker, and garbage-collected after a
//! retention window. A reaper step requeues claimed jobs whose worker went
//! quiet, so a crashed worker never strands work.
//!
//! Handlers may return follow-up jobs; [`JobStore::finish_job`] enqueues
//! them in the same transaction that marks the current job finished, so no
//! follow-up is lost.

// SQLite hands back i64 for integer columns; timestamps fit comfortably.
#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::update::{Cause, UpdateSpec};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Queue and method name for release jobs.
pub const METHOD_RELEASE: &str = "release";
/// Queue and method name for the recurring automated-instance scan.
pub const METHOD_AUTOMATED_INSTANCE: &str = "automated-instance";

/// Priority of user-initiated work.
pub const PRIORITY_INTERACTIVE: i64 = 100;
/// Priority of scheduler-initiated work.
pub const PRIORITY_BACKGROUND: i64 = 0;

/// How long finished jobs are kept before GC removes them, in seconds.
pub const DEFAULT_RETENTION_SECS: i64 = 3600;
/// How stale a claimed job's heartbeat may be, in seconds, before the
/// reaper requeues it. Workers must heartbeat at an interval strictly
/// below this.
pub const DEFAULT_STALENESS_SECS: i64 = 10;

/// The default retention window.
#[must_use]
pub fn default_retention() -> Duration {
    Duration::seconds(DEFAULT_RETENTION_SECS)
}

/// The default heartbeat staleness threshold.
#[must_use]
pub fn default_staleness() -> Duration {
    Duration::seconds(DEFAULT_STALENESS_SECS)
}

/// Errors from the job store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// An unfinished job with the same `(instance, key)` already exists.
    #[error("job already queued for {instance}/{key}")]
    AlreadyQueued {
        /// The instance.
        instance: String,
        /// The deduplication key.
        key: String,
    },

    /// No claimable job right now.
    #[error("no job available")]
    NoJobAvailable,

    /// The job id does not exist (or is not visible to the instance).
    #[error("no such job {id}")]
    NoSuchJob {
        /// The id that was looked up.
        id: JobId,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A params or log payload would not (de)serialise.
    #[error("encoding job payload: {reason}")]
    Encoding {
        /// Why encoding failed.
        reason: String,
    },
}

/// A job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Method-specific job payloads, serialised as a tagged object so new
/// methods never need a schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "kebab-case")]
pub enum JobParams {
    /// Run a release.
    Release(ReleaseJobParams),
    /// Scan an instance for automated image updates.
    AutomatedInstance(AutomatedInstanceParams),
}

impl JobParams {
    /// The handler-selecting method name.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Release(_) => METHOD_RELEASE,
            Self::AutomatedInstance(_) => METHOD_AUTOMATED_INSTANCE,
        }
    }
}

/// Parameters of a release job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseJobParams {
    /// What to release.
    pub spec: UpdateSpec,
    /// Who asked and why.
    #[serde(default)]
    pub cause: Cause,
}

/// Parameters of an automated-instance scan job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomatedInstanceParams {
    /// The instance to scan.
    pub instance: String,
}

/// A job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: JobId,
    /// Owning instance.
    pub instance: String,
    /// Queue name.
    pub queue: String,
    /// Deduplication key.
    pub key: String,
    /// Handler-selecting method name.
    pub method: String,
    /// Larger runs first.
    pub priority: i64,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    /// When the job was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When a worker claimed it.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last heartbeat from the claiming worker.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When the job finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the job is finished.
    pub done: bool,
    /// Whether it finished successfully.
    pub success: bool,
    /// Human-readable current status.
    pub status: String,
    /// Append-only progress log.
    pub log: Vec<String>,
    /// Method-specific payload.
    pub params: JobParams,
}

impl Job {
    /// Whether the job has finished, successfully or not.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.done
    }
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Queue to submit to.
    pub queue: String,
    /// Deduplication key.
    pub key: String,
    /// Priority.
    pub priority: i64,
    /// Deliver no earlier than this; `None` means now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Method-specific payload.
    pub params: JobParams,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The `SQLite`-backed job store.
pub struct JobStore {
    conn: Mutex<Connection>,
    retention: Duration,
    staleness: Duration,
    now: Clock,
}

impl JobStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened or initialised.
    pub fn open(
        path: impl AsRef<Path>,
        retention: Duration,
        staleness: Duration,
    ) -> Result<Self, JobError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention,
            staleness,
            now: Box::new(Utc::now),
        })
    }

    /// An in-memory store for tests.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be initialised.
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention: default_retention(),
            staleness: default_staleness(),
            now: Box::new(Utc::now),
        })
    }

    /// Replaces the store's clock, so tests can move time.
    pub fn set_clock(&mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        self.now = Box::new(now);
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }

    /// Submits a job. `scheduled_at` defaults to now; a future time defers
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyQueued`] when an unfinished job with the
    /// same `(instance, key)` exists.
    pub fn put_job(&self, instance: &str, new: NewJob) -> Result<JobId, JobError> {
        let now = self.now();
        let mut conn = self.conn.lock().expect("job store lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = Self::insert_job(&tx, instance, &new, now)?;
        tx.commit()?;
        Ok(id)
    }

    fn insert_job(
        tx: &rusqlite::Transaction<'_>,
        instance: &str,
        new: &NewJob,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobError> {
        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE instance = ?1 AND key = ?2 AND done = 0",
            params![instance, new.key],
            |row| row.get(0),
        )?;
        if pending > 0 {
            return Err(JobError::AlreadyQueued {
                instance: instance.to_string(),
                key: new.key.clone(),
            });
        }

        let id = JobId::generate();
        let scheduled = new.scheduled_at.unwrap_or(now);
        let log = serde_json::to_string(&vec!["Queued.".to_string()]).map_err(encoding)?;
        let params_json = serde_json::to_string(&new.params).map_err(encoding)?;
        tx.execute(
            "INSERT INTO jobs (id, instance, queue, key, method, priority,
                               scheduled_at, submitted_at, status, log, params)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id.to_string(),
                instance,
                new.queue,
                new.key,
                new.params.method(),
                new.priority,
                scheduled.timestamp_millis(),
                now.timestamp_millis(),
                "Queued.",
                log,
                params_json,
            ],
        )?;
        Ok(id)
    }

    /// Claims the next ready job: unfinished, unclaimed, `scheduled_at` in
    /// the past, highest priority first, earliest schedule breaking ties.
    /// The claim is atomic; no other worker will see the job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoJobAvailable`] when nothing is ready.
    pub fn next_job(&self, queues: &[&str]) -> Result<Job, JobError> {
        let now = self.now();
        let mut conn = self.conn.lock().expect("job store lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let queue_filter = if queues.is_empty() {
            String::new()
        } else {
            let marks = vec!["?"; queues.len()].join(", ");
            format!(" AND queue IN ({marks})")
        };
        let sql = format!(
            "SELECT id FROM jobs
             WHERE done = 0 AND claimed_at IS NULL AND scheduled_at <= ?1{queue_filter}
             ORDER BY priority DESC, scheduled_at ASC, submitted_at ASC
             LIMIT 1"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(now.timestamp_millis())];
        for q in queues {
            args.push(Box::new((*q).to_string()));
        }
        let id: Option<String> = tx
            .query_row(
                &sql,
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Err(JobError::NoJobAvailable);
        };

        let mut job = Self::read_job(&tx, &id)?.ok_or(JobError::NoJobAvailable)?;
        job.claimed_at = Some(now);
        job.heartbeat_at = Some(now);
        job.status = "Claimed by worker.".to_string();
        job.log.push(job.status.clone());
        let log = serde_json::to_string(&job.log).map_err(encoding)?;
        tx.execute(
            "UPDATE jobs SET claimed_at = ?2, heartbeat_at = ?2, status = ?3, log = ?4
             WHERE id = ?1",
            params![id, now.timestamp_millis(), job.status, log],
        )?;
        tx.commit()?;
        Ok(job)
    }

    /// Reads a job belonging to `instance`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoSuchJob`] when the row does not exist.
    pub fn get_job(&self, instance: &str, id: JobId) -> Result<Job, JobError> {
        let conn = self.conn.lock().expect("job store lock");
        let job = conn
            .query_row(
                &format!("{SELECT_JOB} WHERE id = ?1 AND instance = ?2"),
                params![id.to_string(), instance],
                row_to_job,
            )
            .optional()?;
        job.ok_or(JobError::NoSuchJob { id })
    }

    /// Writes back a job's `status`, `log`, `done`, and `success`. Sets
    /// `finished_at` the first time `done` goes true.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoSuchJob`] when the row does not exist.
    pub fn update_job(&self, job: &Job) -> Result<(), JobError> {
        let now = self.now();
        let mut conn = self.conn.lock().expect("job store lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::write_back(&tx, job, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a job finished and enqueues its follow-ups in the same
    /// transaction. A follow-up colliding with an already-queued key is
    /// skipped; the work it represents is already pending.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoSuchJob`] when the row does not exist.
    pub fn finish_job(&self, job: &Job, follow_ups: Vec<NewJob>) -> Result<(), JobError> {
        let now = self.now();
        let mut conn = self.conn.lock().expect("job store lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::write_back(&tx, job, now)?;
        for follow_up in follow_ups {
            match Self::insert_job(&tx, &job.instance, &follow_up, now) {
                Ok(_) | Err(JobError::AlreadyQueued { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn write_back(
        tx: &rusqlite::Transaction<'_>,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        let log = serde_json::to_string(&job.log).map_err(encoding)?;
        let changed = tx.execute(
            "UPDATE jobs SET status = ?2, log = ?3, done = ?4, success = ?5,
                             finished_at = CASE WHEN ?4 = 1 AND finished_at IS NULL
                                                THEN ?6 ELSE finished_at END
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.status,
                log,
                job.done,
                job.success,
                now.timestamp_millis(),
            ],
        )?;
        if changed == 0 {
            return Err(JobError::NoSuchJob { id: job.id });
        }
        Ok(())
    }

    /// Records that the worker holding a job is still alive.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoSuchJob`] when the row does not exist.
    pub fn heartbeat(&self, id: JobId) -> Result<(), JobError> {
        let now = self.now();
        let conn = self.conn.lock().expect("job store lock");
        let changed = conn.execute(
            "UPDATE jobs SET heartbeat_at = ?2 WHERE id = ?1",
            params![id.to_string(), now.timestamp_millis()],
        )?;
        if changed == 0 {
            return Err(JobError::NoSuchJob { id });
        }
        Ok(())
    }

    /// Garbage collection: removes finished jobs older than the retention
    /// window, and requeues claimed-but-silent jobs so another worker picks
    /// them up. Returns `(removed, requeued)`.
    ///
    /// # Errors
    ///
    /// Fails on database errors.
    pub fn gc(&self) -> Result<(usize, usize), JobError> {
        let now = self.now();
        let mut conn = self.conn.lock().expect("job store lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            "DELETE FROM jobs WHERE done = 1 AND finished_at < ?1",
            params![(now - self.retention).timestamp_millis()],
        )?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE claimed_at IS NOT NULL AND done = 0 AND heartbeat_at < ?1",
            )?;
            let rows = stmt.query_map(
                params![(now - self.staleness).timestamp_millis()],
                |row| row.get(0),
            )?;
            rows.collect::<Result<_, _>>()?
        };
        for id in &stale {
            let Some(mut job) = Self::read_job(&tx, id)? else {
                continue;
            };
            job.log.push("Requeued: worker went quiet.".to_string());
            let log = serde_json::to_string(&job.log).map_err(encoding)?;
            tx.execute(
                "UPDATE jobs SET claimed_at = NULL, heartbeat_at = NULL,
                                 status = 'Requeued.', log = ?2
                 WHERE id = ?1",
                params![id, log],
            )?;
        }

        tx.commit()?;
        Ok((removed, stale.len()))
    }

    fn read_job(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<Option<Job>, JobError> {
        Ok(tx
            .query_row(
                &format!("{SELECT_JOB} WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?)
    }
}

const SELECT_JOB: &str = "SELECT id, instance, queue, key, method, priority,
       scheduled_at, submitted_at, claimed_at, heartbeat_at, finished_at,
       done, success, status, log, params
FROM jobs";

fn encoding(e: serde_json::Error) -> JobError {
    JobError::Encoding {
        reason: e.to_string(),
    }
}

fn millis(value: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value).unwrap_or_default()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let log: String = row.get(14)?;
    let params_json: String = row.get(15)?;
    let decode = |reason: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, reason)),
        )
    };
    Ok(Job {
        id: id.parse().map_err(|e: uuid::Error| decode(e.to_string()))?,
        instance: row.get(1)?,
        queue: row.get(2)?,
        key: row.get(3)?,
        method: row.get(4)?,
        priority: row.get(5)?,
        scheduled_at: millis(row.get(6)?),
        submitted_at: millis(row.get(7)?),
        claimed_at: row.get::<_, Option<i64>>(8)?.map(millis),
        heartbeat_at: row.get::<_, Option<i64>>(9)?.map(millis),
        finished_at: row.get::<_, Option<i64>>(10)?.map(millis),
        done: row.get(11)?,
        success: row.get(12)?,
        status: row.get(13)?,
        log: serde_json::from_str(&log).map_err(|e| decode(e.to_string()))?,
        params: serde_json::from_str(&params_json).map_err(|e| decode(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::{ImageSpec, ReleaseKind, ReleaseSpec, ServiceSpec};

    fn release_job(key: &str, priority: i64) -> NewJob {
        NewJob {
            queue: METHOD_RELEASE.to_string(),
            key: key.to_string(),
            priority,
            scheduled_at: None,
            params: JobParams::Release(ReleaseJobParams {
                spec: UpdateSpec::Images(ReleaseSpec {
                    services: ServiceSpec::All,
                    image: ImageSpec::Latest,
                    kind: ReleaseKind::Execute,
                    excludes: Vec::new(),
                }),
                cause: Cause::default(),
            }),
        }
    }

    #[test]
    fn empty_queue_has_no_job() {
        let store = JobStore::in_memory().unwrap();
        assert!(matches!(
            store.next_job(&[]),
            Err(JobError::NoJobAvailable)
        ));
    }

    #[test]
    fn priority_beats_submission_order() {
        let store = JobStore::in_memory().unwrap();
        let background = store
            .put_job("inst", release_job("bg", PRIORITY_BACKGROUND))
            .unwrap();
        let interactive = store
            .put_job("inst", release_job("fg", PRIORITY_INTERACTIVE))
            .unwrap();

        let first = store.next_job(&[]).unwrap();
        assert_eq!(first.id, interactive);
        assert_eq!(first.queue, METHOD_RELEASE);
        assert!(first.claimed_at.is_some());
        assert!(!first.log.is_empty() && !first.status.is_empty());

        let second = store.next_job(&[]).unwrap();
        assert_eq!(second.id, background);
        assert!(matches!(store.next_job(&[]), Err(JobError::NoJobAvailable)));
    }

    #[test]
    fn equal_priority_breaks_ties_by_schedule() {
        let mut store = JobStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.set_clock(move || t0);
        store
            .put_job(
                "inst",
                NewJob {
                    scheduled_at: Some(t0 - Duration::minutes(2)),
                    ..release_job("older", PRIORITY_BACKGROUND)
                },
            )
            .unwrap();
        store
            .put_job(
                "inst",
                NewJob {
                    scheduled_at: Some(t0 - Duration::minutes(1)),
                    ..release_job("newer", PRIORITY_BACKGROUND)
                },
            )
            .unwrap();
        assert_eq!(store.next_job(&[]).unwrap().key, "older");
    }

    #[test]
    fn duplicate_pending_key_is_rejected() {
        let store = JobStore::in_memory().unwrap();
        let id = store.put_job("inst", release_job("same", 0)).unwrap();
        assert!(matches!(
            store.put_job("inst", release_job("same", 0)),
            Err(JobError::AlreadyQueued { .. })
        ));
        assert!(matches!(
            store.put_job("inst", release_job("same", 0)),
            Err(JobError::AlreadyQueued { .. })
        ));
        // a different instance is a different lineage
        store.put_job("other", release_job("same", 0)).unwrap();

        // finishing the job frees the key
        let mut job = store.get_job("inst", id).unwrap();
        store.next_job(&[METHOD_RELEASE]).unwrap();
        job.done = true;
        job.success = true;
        store.update_job(&job).unwrap();
        store.put_job("inst", release_job("same", 0)).unwrap();
    }

    #[test]
    fn future_schedule_defers_delivery() {
        let mut store = JobStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.set_clock(move || t0);
        let id = store
            .put_job(
                "inst",
                NewJob {
                    scheduled_at: Some(t0 + Duration::minutes(1)),
                    ..release_job("later", PRIORITY_INTERACTIVE)
                },
            )
            .unwrap();
        assert!(matches!(store.next_job(&[]), Err(JobError::NoJobAvailable)));

        store.set_clock(move || t0 + Duration::minutes(2));
        assert_eq!(store.next_job(&[]).unwrap().id, id);
    }

    #[test]
    fn update_and_heartbeat_round_trip() {
        let store = JobStore::in_memory().unwrap();
        let id = store.put_job("inst", release_job("j", 0)).unwrap();
        let mut job = store.next_job(&[]).unwrap();

        job.status = "Cloning repo.".to_string();
        job.log.push(job.status.clone());
        store.update_job(&job).unwrap();
        let read = store.get_job("inst", id).unwrap();
        assert_eq!(read.status, "Cloning repo.");
        assert_eq!(read.log.last().unwrap(), "Cloning repo.");

        let before = read.heartbeat_at.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.heartbeat(id).unwrap();
        assert!(store.get_job("inst", id).unwrap().heartbeat_at.unwrap() > before);
    }

    #[test]
    fn gc_removes_only_expired_finished_rows() {
        let mut store = JobStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.set_clock(move || t0);

        let finished = store.put_job("inst", release_job("done", 0)).unwrap();
        let mut job = store.next_job(&[]).unwrap();
        job.done = true;
        job.success = true;
        store.update_job(&job).unwrap();
        let pending = store.put_job("inst", release_job("pending", 0)).unwrap();

        // inside the retention window nothing goes
        let (removed, _) = store.gc().unwrap();
        assert_eq!(removed, 0);

        store.set_clock(move || t0 + default_retention() + Duration::minutes(1));
        let (removed, _) = store.gc().unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            store.get_job("inst", finished),
            Err(JobError::NoSuchJob { .. })
        ));
        store.get_job("inst", pending).unwrap();
    }

    #[test]
    fn reaper_requeues_silent_claims() {
        let mut store = JobStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.set_clock(move || t0);

        let id = store.put_job("inst", release_job("crashy", 0)).unwrap();
        let mut job = store.next_job(&[]).unwrap();
        job.log.push("got as far as this".to_string());
        store.update_job(&job).unwrap();

        // worker dies; heartbeat goes stale
        store.set_clock(move || t0 + default_staleness() + Duration::seconds(1));
        let (_, requeued) = store.gc().unwrap();
        assert_eq!(requeued, 1);

        let again = store.next_job(&[]).unwrap();
        assert_eq!(again.id, id);
        assert!(again.log.iter().any(|l| l.contains("got as far as this")));
        assert!(again.log.iter().any(|l| l.contains("Requeued")));
    }

    #[test]
    fn live_heartbeat_is_not_reaped() {
        let mut store = JobStore::in_memory().unwrap();
        let t0 = Utc::now();
        store.set_clock(move || t0);
        let id = store.put_job("inst", release_job("alive", 0)).unwrap();
        store.next_job(&[]).unwrap();

        store.set_clock(move || t0 + default_staleness() - Duration::seconds(2));
        store.heartbeat(id).unwrap();
        store.set_clock(move || t0 + default_staleness() + Duration::seconds(1));
        let (_, requeued) = store.gc().unwrap();
        assert_eq!(requeued, 0);
    }

    #[test]
    fn follow_ups_enqueue_with_the_finish() {
        let store = JobStore::in_memory().unwrap();
        store.put_job("inst", release_job("first", 0)).unwrap();
        let mut job = store.next_job(&[]).unwrap();
        job.done = true;
        job.success = true;
        store
            .finish_job(&job, vec![release_job("second", 0), release_job("second", 0)])
            .unwrap();

        let next = store.next_job(&[]).unwrap();
        assert_eq!(next.key, "second");
        // the colliding duplicate was dropped
        assert!(matches!(store.next_job(&[]), Err(JobError::NoJobAvailable)));
    }

    #[test]
    fn queue_filter_limits_claims() {
        let store = JobStore::in_memory().unwrap();
        store
            .put_job(
                "inst",
                NewJob {
                    queue: METHOD_AUTOMATED_INSTANCE.to_string(),
                    key: "scan".to_string(),
                    priority: 0,
                    scheduled_at: None,
                    params: JobParams::AutomatedInstance(AutomatedInstanceParams {
                        instance: "inst".to_string(),
                    }),
                },
            )
            .unwrap();
        assert!(matches!(
            store.next_job(&[METHOD_RELEASE]),
            Err(JobError::NoJobAvailable)
        ));
        let job = store.next_job(&[METHOD_AUTOMATED_INSTANCE]).unwrap();
        assert_eq!(job.method, METHOD_AUTOMATED_INSTANCE);
    }

    #[test]
    fn params_round_trip_with_method_tag() {
        let params = JobParams::Release(ReleaseJobParams {
            spec: UpdateSpec::Images(ReleaseSpec {
                services: ServiceSpec::All,
                image: ImageSpec::Latest,
                kind: ReleaseKind::Plan,
                excludes: Vec::new(),
            }),
            cause: Cause {
                user: "alice".to_string(),
                message: "ship it".to_string(),
            },
        });
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"method\":\"release\""));
        assert_eq!(serde_json::from_str::<JobParams>(&json).unwrap(), params);
    }
}
