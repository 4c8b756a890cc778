//! Durable state for the parkwatch pipeline: an SQLite store for
//! configs, tasks, snapshots and change rows, plus a filesystem blob
//! store for the captured images.
//!
//! All methods are synchronous and hold the connection lock only for
//! the duration of one statement or one small transaction. Status
//! transitions are conditional updates so that multiple executor
//! instances can share one database; the caller learns about a lost
//! race from the row count, not from an error.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use parkwatch_types::{
    ChangeRecord, ChangeType, ChannelCode, Snapshot, SpaceState, Task, TaskConfig, TaskStatus,
};

mod blob;
mod config;
mod filters;
mod schema;

pub use blob::BlobStore;
pub use config::{NewAutoRule, NewChannelConfig, NewNvrConfig};
pub use filters::{ChangeFilter, Page, SnapshotFilter, TaskConfigFilter, TaskFilter, TimeRange};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Types(#[from] parkwatch_types::Error),
    #[error("row not found: {0}")]
    NotFound(&'static str),
    #[error("blocking store task failed: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Input for one task row of a day plan.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub date: String,
    pub index: u32,
    pub start_ts: i64,
    pub end_ts: i64,
    pub rtsp_url: String,
    pub ip: String,
    pub channel: ChannelCode,
}

/// Input for the task-config row of a day plan.
#[derive(Debug, Clone)]
pub struct NewTaskConfig {
    pub date: String,
    pub rtsp_base: String,
    pub channel: ChannelCode,
    pub interval_minutes: u32,
    pub day_start_ts: i64,
    pub day_end_ts: i64,
}

/// What a `plan()` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlanStats {
    pub created: u32,
    pub existing: u32,
    pub total: u32,
}

/// Input for the snapshot written on task completion.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub ip: String,
    pub channel: ChannelCode,
    pub image_path: String,
    pub detected_image_path: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSpaceState {
    pub space_id: String,
    pub occupied: Option<bool>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewChangeRecord {
    pub prev_snapshot_id: Option<i64>,
    pub space_id: String,
    pub prev_occupied: Option<bool>,
    pub curr_occupied: Option<bool>,
    pub change_type: Option<ChangeType>,
    pub detection_confidence: Option<f64>,
}

pub struct Store {
    conn: Mutex<Connection>,
}

pub(crate) fn millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn task_from_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let channel: String = row.get("channel")?;
    Ok(Task {
        id: row.get("id")?,
        date: row.get("date")?,
        index: row.get("idx")?,
        start_ts: row.get("start_ts")?,
        end_ts: row.get("end_ts")?,
        rtsp_url: row.get("rtsp_url")?,
        ip: row.get("ip")?,
        channel: ChannelCode::parse(&channel)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        status: TaskStatus::parse(&status)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        screenshot_path: row.get("screenshot_path")?,
        error: row.get("error")?,
        operation_time: from_millis(row.get("operation_time")?),
    })
}

pub(crate) fn snapshot_from_row(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let channel: String = row.get("channel")?;
    Ok(Snapshot {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        ip: row.get("ip")?,
        channel: ChannelCode::parse(&channel)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        image_path: row.get("image_path")?,
        detected_image_path: row.get("detected_image_path")?,
        change_count: row.get("change_count")?,
        detected_at: from_millis(row.get("detected_at")?),
    })
}

pub(crate) fn change_from_row(row: &rusqlite::Row) -> rusqlite::Result<ChangeRecord> {
    let change_type: Option<String> = row.get("change_type")?;
    Ok(ChangeRecord {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        prev_snapshot_id: row.get("prev_snapshot_id")?,
        space_id: row.get("space_id")?,
        prev_occupied: row.get("prev_occupied")?,
        curr_occupied: row.get("curr_occupied")?,
        change_type: change_type.as_deref().and_then(ChangeType::parse),
        detection_confidence: row.get("detection_confidence")?,
        detected_at: from_millis(row.get("detected_at")?),
    })
}

pub(crate) fn task_config_from_row(row: &rusqlite::Row) -> rusqlite::Result<TaskConfig> {
    let channel: String = row.get("channel")?;
    Ok(TaskConfig {
        id: row.get("id")?,
        date: row.get("date")?,
        rtsp_base: row.get("rtsp_base")?,
        channel: ChannelCode::parse(&channel)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?,
        interval_minutes: row.get("interval_minutes")?,
        day_start_ts: row.get("day_start_ts")?,
        day_end_ts: row.get("day_end_ts")?,
        operation_time: from_millis(row.get("operation_time")?),
    })
}

const TASK_COLS: &str = "id, date, idx, start_ts, end_ts, rtsp_url, ip, channel, \
     status, screenshot_path, error, operation_time";

impl Store {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// A fresh private database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Run one store operation on the blocking pool.
    ///
    /// Every method on [Store] holds the connection lock synchronously;
    /// async callers go through here so the runtime worker stays
    /// suspendable while the statement runs.
    pub async fn run<T, F>(self: Arc<Self>, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::task::spawn_blocking(move || f(&self)).await {
            Ok(result) => result,
            Err(e) => Err(Error::Runtime(e.to_string())),
        }
    }

    /// Persist one day plan: the task-config row plus its task rows,
    /// in a single transaction.
    ///
    /// Uses `INSERT OR IGNORE` against the unique keys, so calling this
    /// again with the same plan leaves existing rows (and their status)
    /// untouched. Safe under concurrent writers.
    pub fn insert_plan(
        &self,
        cfg: &NewTaskConfig,
        tasks: &[NewTask],
        now: DateTime<Utc>,
    ) -> Result<PlanStats> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO task_config
             (date, rtsp_base, channel, interval_minutes, day_start_ts, day_end_ts, operation_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                cfg.date,
                cfg.rtsp_base,
                cfg.channel.as_str(),
                cfg.interval_minutes,
                cfg.day_start_ts,
                cfg.day_end_ts,
                millis(&now),
            ],
        )?;
        let mut created = 0u32;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO task
                 (date, idx, start_ts, end_ts, rtsp_url, ip, channel, status, operation_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            )?;
            for t in tasks {
                created += stmt.execute(params![
                    t.date,
                    t.index,
                    t.start_ts,
                    t.end_ts,
                    t.rtsp_url,
                    t.ip,
                    t.channel.as_str(),
                    millis(&now),
                ])? as u32;
            }
        }
        tx.commit()?;
        let total = tasks.len() as u32;
        Ok(PlanStats {
            created,
            existing: total - created,
            total,
        })
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLS} FROM task WHERE id = ?1"))?;
        Ok(stmt.query_row([id], task_from_row).optional()?)
    }

    /// Take ownership of a task: `pending|failed|screenshot_taken ->
    /// playing`. Returns the claimed row, or `None` if another worker
    /// owns it (or it does not exist).
    pub fn claim_task(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE task SET status = 'playing', error = NULL, operation_time = ?2
             WHERE id = ?1 AND status IN ('pending', 'failed', 'screenshot_taken')",
            params![id, millis(&now)],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLS} FROM task WHERE id = ?1"))?;
        Ok(stmt.query_row([id], task_from_row).optional()?)
    }

    /// `playing -> failed` with an error message. Conditional: a task
    /// that already left `playing` is not touched.
    pub fn fail_task(&self, id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE task SET status = 'failed', error = ?2, operation_time = ?3
             WHERE id = ?1 AND status = 'playing'",
            params![id, error, millis(&now)],
        )?;
        Ok(n == 1)
    }

    /// The success transaction: insert the snapshot and its space
    /// states and move the task `playing -> screenshot_taken`, all or
    /// nothing. Returns the new snapshot id, or `None` on a lost
    /// ownership race.
    pub fn complete_task(
        &self,
        task_id: i64,
        screenshot_path: &str,
        snap: &NewSnapshot,
        states: &[NewSpaceState],
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE task SET status = 'screenshot_taken', screenshot_path = ?2,
                 error = NULL, operation_time = ?3
             WHERE id = ?1 AND status = 'playing'",
            params![task_id, screenshot_path, millis(&now)],
        )?;
        if n == 0 {
            // Lost the race; leave everything untouched.
            return Ok(None);
        }
        // A re-armed task that completes again replaces its previous
        // snapshot; the cascade drops the stale states and change rows.
        tx.execute(
            "INSERT OR REPLACE INTO snapshot
             (task_id, ip, channel, image_path, detected_image_path, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_id,
                snap.ip,
                snap.channel.as_str(),
                snap.image_path,
                snap.detected_image_path,
                millis(&snap.detected_at),
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO space_state (snapshot_id, space_id, occupied, confidence)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for s in states {
                stmt.execute(params![snapshot_id, s.space_id, s.occupied, s.confidence])?;
            }
        }
        tx.commit()?;
        Ok(Some(snapshot_id))
    }

    /// Re-arm one task to `pending`. Tasks currently `playing` are left
    /// alone.
    pub fn rearm_task(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE task SET status = 'pending', error = NULL, operation_time = ?2
             WHERE id = ?1 AND status != 'playing'",
            params![id, millis(&now)],
        )?;
        Ok(n == 1)
    }

    /// Re-arm every non-`playing` task matching the predicate, and
    /// return the affected ids.
    pub fn rearm_matching(
        &self,
        date: &str,
        ip: Option<&str>,
        channel: Option<&ChannelCode>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "UPDATE task SET status = 'pending', error = NULL, operation_time = ?1
             WHERE date = ?2 AND status != 'playing'",
        );
        let mut p: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(millis(&now)), Box::new(date.to_string())];
        if let Some(ip) = ip {
            sql.push_str(&format!(" AND ip = ?{}", p.len() + 1));
            p.push(Box::new(ip.to_string()));
        }
        if let Some(ch) = channel {
            sql.push_str(&format!(" AND channel = ?{}", p.len() + 1));
            p.push(Box::new(ch.as_str().to_string()));
        }
        sql.push_str(" RETURNING id");
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(p.iter().map(|b| b.as_ref())), |r| {
                r.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Task ids matching a scheduler predicate, status-filtered.
    pub fn task_ids_by(
        &self,
        date: &str,
        ip: Option<&str>,
        channel: Option<&ChannelCode>,
        statuses: &[TaskStatus],
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT id FROM task WHERE date = ?1 AND status IN ({status_list})"
        );
        let mut p: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(date.to_string())];
        if let Some(ip) = ip {
            sql.push_str(&format!(" AND ip = ?{}", p.len() + 1));
            p.push(Box::new(ip.to_string()));
        }
        if let Some(ch) = channel {
            sql.push_str(&format!(" AND channel = ?{}", p.len() + 1));
            p.push(Box::new(ch.as_str().to_string()));
        }
        sql.push_str(" ORDER BY idx");
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(rusqlite::params_from_iter(p.iter().map(|b| b.as_ref())), |r| {
                r.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Fail tasks stuck in `playing` beyond `6 x window + 60 s`,
    /// returning the swept ids. The second layer of recovery for
    /// executors that died outright.
    pub fn sweep_stuck_playing(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "UPDATE task SET status = 'failed', error = 'stuck in playing', operation_time = ?1
             WHERE status = 'playing'
               AND operation_time <= ?1 - (6 * (end_ts - start_ts) + 60) * 1000
             RETURNING id",
        )?;
        let ids = stmt
            .query_map([millis(&now)], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, task_id, ip, channel, image_path, detected_image_path,
                    change_count, detected_at
             FROM snapshot WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], snapshot_from_row).optional()?)
    }

    pub fn space_states(&self, snapshot_id: i64) -> Result<Vec<SpaceState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, space_id, occupied, confidence
             FROM space_state WHERE snapshot_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(SpaceState {
                    snapshot_id: row.get(0)?,
                    space_id: row.get(1)?,
                    occupied: row.get(2)?,
                    confidence: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The immediate predecessor of `current` on the same combo: the
    /// largest `(detected_at, id)` strictly below the current pair.
    /// Snapshots with identical `detected_at` order by id.
    pub fn previous_snapshot(&self, current: &Snapshot) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, task_id, ip, channel, image_path, detected_image_path,
                    change_count, detected_at
             FROM snapshot
             WHERE ip = ?1 AND channel = ?2 AND id != ?3
               AND (detected_at < ?4 OR (detected_at = ?4 AND id < ?3))
             ORDER BY detected_at DESC, id DESC
             LIMIT 1",
        )?;
        Ok(stmt
            .query_row(
                params![
                    current.ip,
                    current.channel.as_str(),
                    current.id,
                    millis(&current.detected_at)
                ],
                snapshot_from_row,
            )
            .optional()?)
    }

    /// The change-engine write: `change_count` update plus all change
    /// rows in one transaction.
    pub fn write_changes(
        &self,
        snapshot: &Snapshot,
        change_count: u32,
        rows: &[NewChangeRecord],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE snapshot SET change_count = ?2 WHERE id = ?1",
            params![snapshot.id, change_count],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO change_record
                 (snapshot_id, prev_snapshot_id, space_id, prev_occupied, curr_occupied,
                  change_type, detection_confidence, ip, channel, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in rows {
                stmt.execute(params![
                    snapshot.id,
                    r.prev_snapshot_id,
                    r.space_id,
                    r.prev_occupied,
                    r.curr_occupied,
                    r.change_type.map(|c| c.as_str()),
                    r.detection_confidence,
                    snapshot.ip,
                    snapshot.channel.as_str(),
                    millis(&snapshot.detected_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// True once change rows exist for this snapshot. Lets the change
    /// engine skip re-delivered jobs.
    pub fn has_changes(&self, snapshot_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_record WHERE snapshot_id = ?1",
            [snapshot_id],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn changes_for_snapshot(&self, snapshot_id: i64) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, snapshot_id, prev_snapshot_id, space_id, prev_occupied,
                    curr_occupied, change_type, detection_confidence, detected_at
             FROM change_record WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], change_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkwatch_types::ChannelCode;

    fn chan(s: &str) -> ChannelCode {
        ChannelCode::parse(s).unwrap()
    }

    fn sample_plan(n: u32) -> (NewTaskConfig, Vec<NewTask>) {
        let cfg = NewTaskConfig {
            date: "2025-12-19".into(),
            rtsp_base: "rtsp://u:p@10.0.0.1:554".into(),
            channel: chan("c1"),
            interval_minutes: 10,
            day_start_ts: 1000,
            day_end_ts: 1000 + 86399,
        };
        let tasks = (0..n)
            .map(|i| {
                let start = 1000 + (i as i64) * 600;
                NewTask {
                    date: "2025-12-19".into(),
                    index: i,
                    start_ts: start,
                    end_ts: start + 599,
                    rtsp_url: format!("rtsp://u:p@10.0.0.1:554/c1/b{}/e{}/replay/s1", start, start + 599),
                    ip: "10.0.0.1".into(),
                    channel: chan("c1"),
                }
            })
            .collect();
        (cfg, tasks)
    }

    fn new_snapshot(ip: &str, at_ms: i64) -> NewSnapshot {
        NewSnapshot {
            ip: ip.into(),
            channel: chan("c1"),
            image_path: "2025-12-19/x.jpg".into(),
            detected_image_path: "2025-12-19/x_detected.jpg".into(),
            detected_at: from_millis(at_ms),
        }
    }

    #[test]
    fn plan_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(144);
        let now = Utc::now();

        let first = store.insert_plan(&cfg, &tasks, now).unwrap();
        assert_eq!(
            first,
            PlanStats {
                created: 144,
                existing: 0,
                total: 144
            }
        );

        let again = store.insert_plan(&cfg, &tasks, now).unwrap();
        assert_eq!(
            again,
            PlanStats {
                created: 0,
                existing: 144,
                total: 144
            }
        );
    }

    #[test]
    fn replan_preserves_status() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(3);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();

        let claimed = store.claim_task(1, now).unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Playing);

        store.insert_plan(&cfg, &tasks, now).unwrap();
        let t = store.get_task(1).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Playing);
    }

    #[test]
    fn claim_is_single_winner() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(1);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();

        assert!(store.claim_task(1, now).unwrap().is_some());
        // Second claim loses: the task is playing.
        assert!(store.claim_task(1, now).unwrap().is_none());

        assert!(store.fail_task(1, "timeout", now).unwrap());
        // Failed tasks are claimable again.
        assert!(store.claim_task(1, now).unwrap().is_some());
    }

    #[test]
    fn complete_task_writes_snapshot_and_states() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(1);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();
        store.claim_task(1, now).unwrap().unwrap();

        let states = vec![
            NewSpaceState {
                space_id: "A".into(),
                occupied: Some(true),
                confidence: Some(0.9),
            },
            NewSpaceState {
                space_id: "B".into(),
                occupied: None,
                confidence: None,
            },
        ];
        let snap_id = store
            .complete_task(1, "2025-12-19/x.jpg", &new_snapshot("10.0.0.1", 5000), &states, now)
            .unwrap()
            .unwrap();

        let t = store.get_task(1).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::ScreenshotTaken);
        assert_eq!(t.screenshot_path.as_deref(), Some("2025-12-19/x.jpg"));

        let got = store.space_states(snap_id).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].occupied, Some(true));
        assert_eq!(got[1].occupied, None);
        assert_eq!(got[1].confidence, None);

        // A second completion attempt loses the conditional update and
        // writes nothing.
        assert!(store
            .complete_task(1, "p", &new_snapshot("10.0.0.1", 6000), &[], now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn rerun_completion_replaces_snapshot() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(1);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();

        store.claim_task(1, now).unwrap().unwrap();
        let first = store
            .complete_task(1, "p", &new_snapshot("10.0.0.1", 1000), &[], now)
            .unwrap()
            .unwrap();

        assert!(store.rearm_task(1, now).unwrap());
        store.claim_task(1, now).unwrap().unwrap();
        let second = store
            .complete_task(1, "p", &new_snapshot("10.0.0.1", 2000), &[], now)
            .unwrap()
            .unwrap();

        assert_ne!(first, second);
        assert!(store.get_snapshot(first).unwrap().is_none());
        let snap = store.get_snapshot(second).unwrap().unwrap();
        assert_eq!(snap.task_id, 1);
    }

    #[test]
    fn previous_snapshot_ordering() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(4);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();

        // Three snapshots; two share detected_at so ties break by id.
        for (task_id, at) in [(1i64, 1000i64), (2, 2000), (3, 2000)] {
            store.claim_task(task_id, now).unwrap().unwrap();
            store
                .complete_task(task_id, "p", &new_snapshot("10.0.0.1", at), &[], now)
                .unwrap()
                .unwrap();
        }

        let s3 = store.get_snapshot(3).unwrap().unwrap();
        let prev = store.previous_snapshot(&s3).unwrap().unwrap();
        assert_eq!(prev.id, 2);

        let s2 = store.get_snapshot(2).unwrap().unwrap();
        let prev = store.previous_snapshot(&s2).unwrap().unwrap();
        assert_eq!(prev.id, 1);

        let s1 = store.get_snapshot(1).unwrap().unwrap();
        assert!(store.previous_snapshot(&s1).unwrap().is_none());
    }

    #[test]
    fn rearm_skips_playing() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(3);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();

        store.claim_task(1, now).unwrap().unwrap();
        store.claim_task(2, now).unwrap().unwrap();
        store.fail_task(2, "timeout", now).unwrap();

        let ids = store
            .rearm_matching("2025-12-19", Some("10.0.0.1"), None, now)
            .unwrap();
        // Task 1 is playing and stays; 2 and 3 re-arm.
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(
            store.get_task(1).unwrap().unwrap().status,
            TaskStatus::Playing
        );
        assert_eq!(
            store.get_task(2).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn sweep_recovers_stuck_tasks() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(1);
        let claimed_at = from_millis(1_000_000);
        store.insert_plan(&cfg, &tasks, claimed_at).unwrap();
        store.claim_task(1, claimed_at).unwrap().unwrap();

        // Window is 599 s; threshold is 6*599+60 = 3654 s after claim.
        let before = from_millis(1_000_000 + 3_600_000);
        assert!(store.sweep_stuck_playing(before).unwrap().is_empty());

        let after = from_millis(1_000_000 + 3_700_000);
        assert_eq!(store.sweep_stuck_playing(after).unwrap(), vec![1]);
        let t = store.get_task(1).unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("stuck in playing"));
    }

    #[test]
    fn write_changes_updates_count() {
        let store = Store::open_in_memory().unwrap();
        let (cfg, tasks) = sample_plan(1);
        let now = Utc::now();
        store.insert_plan(&cfg, &tasks, now).unwrap();
        store.claim_task(1, now).unwrap().unwrap();
        let snap_id = store
            .complete_task(1, "p", &new_snapshot("10.0.0.1", 1000), &[], now)
            .unwrap()
            .unwrap();
        let snap = store.get_snapshot(snap_id).unwrap().unwrap();

        let rows = vec![NewChangeRecord {
            prev_snapshot_id: None,
            space_id: "A".into(),
            prev_occupied: Some(false),
            curr_occupied: Some(true),
            change_type: Some(ChangeType::Arrive),
            detection_confidence: Some(0.8),
        }];
        store.write_changes(&snap, 1, &rows).unwrap();

        assert!(store.has_changes(snap_id).unwrap());
        let snap = store.get_snapshot(snap_id).unwrap().unwrap();
        assert_eq!(snap.change_count, 1);
        let got = store.changes_for_snapshot(snap_id).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].change_type, Some(ChangeType::Arrive));
        assert_eq!(got[0].detected_at, snap.detected_at);
    }
}
