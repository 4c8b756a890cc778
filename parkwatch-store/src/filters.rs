//! Paged, filtered reads backing the query facade.
//!
//! Each list method builds one WHERE clause from the populated filter
//! fields, runs a COUNT for the page header, then fetches one page.
//! Numbered placeholders are appended in field order.

use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

use parkwatch_types::{ChangeRecord, Snapshot, Task, TaskConfig, TaskStatus};

use crate::{
    change_from_row, snapshot_from_row, task_config_from_row, task_from_row, Result, Store,
    TASK_COLS,
};

/// Inclusive bounds on an integer column (epoch seconds or millis,
/// matching the column).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl TimeRange {
    fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

fn page_bounds(page: u32, page_size: u32) -> (u32, u32) {
    let page_size = match page_size {
        0 => 50,
        n => n.min(500),
    };
    (page.max(1), page_size)
}

/// Accumulates `AND`-joined conditions with their parameters.
struct WhereBuilder {
    conds: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl WhereBuilder {
    fn new() -> Self {
        WhereBuilder {
            conds: Vec::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, cond_fmt: &str, value: Box<dyn ToSql>) {
        self.params.push(value);
        let idx = self.params.len();
        self.conds.push(cond_fmt.replace("?N", &format!("?{idx}")));
    }

    fn eq_or_prefix(&mut self, col: &str, exact: &Option<String>, prefix: &Option<String>) {
        if let Some(v) = exact {
            self.push(&format!("{col} = ?N"), Box::new(v.clone()));
        } else if let Some(v) = prefix {
            // LIKE special characters in the operand are taken literally.
            let escaped = v.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            self.push(
                &format!("{col} LIKE ?N ESCAPE '\\'"),
                Box::new(format!("{escaped}%")),
            );
        }
    }

    fn range(&mut self, col: &str, range: &TimeRange) {
        if let Some(min) = range.min {
            self.push(&format!("{col} >= ?N"), Box::new(min));
        }
        if let Some(max) = range.max {
            self.push(&format!("{col} <= ?N"), Box::new(max));
        }
    }

    fn clause(&self) -> String {
        if self.conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conds.join(" AND "))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub date: Option<String>,
    pub ip: Option<String>,
    pub ip_prefix: Option<String>,
    pub channel: Option<String>,
    pub channel_prefix: Option<String>,
    #[serde(default)]
    pub status_in: Vec<TaskStatus>,
    /// Substring match over rtsp_url and error.
    pub text: Option<String>,
    #[serde(default)]
    pub start_ts: TimeRange,
    #[serde(default)]
    pub end_ts: TimeRange,
    /// Millis UTC.
    #[serde(default)]
    pub operation_time: TimeRange,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

impl TaskFilter {
    fn build(&self) -> WhereBuilder {
        let mut w = WhereBuilder::new();
        if let Some(date) = &self.date {
            w.push("date = ?N", Box::new(date.clone()));
        }
        w.eq_or_prefix("ip", &self.ip, &self.ip_prefix);
        w.eq_or_prefix("channel", &self.channel, &self.channel_prefix);
        if !self.status_in.is_empty() {
            let list = self
                .status_in
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            w.conds.push(format!("status IN ({list})"));
        }
        if let Some(text) = &self.text {
            let needle = format!("%{text}%");
            w.push(
                "(rtsp_url LIKE ?N OR ifnull(error, '') LIKE ?N)",
                Box::new(needle),
            );
        }
        w.range("start_ts", &self.start_ts);
        w.range("end_ts", &self.end_ts);
        w.range("operation_time", &self.operation_time);
        w
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfigFilter {
    pub date: Option<String>,
    pub channel: Option<String>,
    pub interval_minutes: Option<u32>,
    /// Substring match on rtsp_base.
    pub text: Option<String>,
    #[serde(default)]
    pub operation_time: TimeRange,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotFilter {
    pub date: Option<String>,
    pub ip: Option<String>,
    pub ip_prefix: Option<String>,
    pub channel: Option<String>,
    pub channel_prefix: Option<String>,
    /// Millis UTC on detected_at.
    #[serde(default)]
    pub detected_at: TimeRange,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeFilter {
    pub ip: Option<String>,
    pub ip_prefix: Option<String>,
    pub channel: Option<String>,
    pub channel_prefix: Option<String>,
    pub space_id: Option<String>,
    /// Wire values; empty means all.
    #[serde(default)]
    pub change_type_in: Vec<String>,
    /// Millis UTC on detected_at.
    #[serde(default)]
    pub detected_at: TimeRange,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

impl Store {
    fn run_page<T, F>(
        &self,
        table_and_where: (&str, WhereBuilder),
        cols: &str,
        order: &str,
        page: u32,
        page_size: u32,
        map: F,
    ) -> Result<Page<T>>
    where
        F: Fn(&rusqlite::Row) -> rusqlite::Result<T>,
    {
        let (table, w) = table_and_where;
        let (page, page_size) = page_bounds(page, page_size);
        let clause = w.clause();
        let conn = self.conn.lock();

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table}{clause}"),
            rusqlite::params_from_iter(w.params.iter().map(|b| b.as_ref())),
            |r| r.get(0),
        )?;

        let offset = (page - 1) as u64 * page_size as u64;
        let sql = format!(
            "SELECT {cols} FROM {table}{clause} ORDER BY {order} LIMIT {page_size} OFFSET {offset}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                rusqlite::params_from_iter(w.params.iter().map(|b| b.as_ref())),
                map,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            page,
            page_size,
        })
    }

    pub fn list_tasks(&self, f: &TaskFilter) -> Result<Page<Task>> {
        self.run_page(
            ("task", f.build()),
            TASK_COLS,
            "date, idx, id",
            f.page,
            f.page_size,
            task_from_row,
        )
    }

    pub fn list_task_configs(&self, f: &TaskConfigFilter) -> Result<Page<TaskConfig>> {
        let mut w = WhereBuilder::new();
        if let Some(date) = &f.date {
            w.push("date = ?N", Box::new(date.clone()));
        }
        if let Some(channel) = &f.channel {
            w.push("channel = ?N", Box::new(channel.clone()));
        }
        if let Some(iv) = f.interval_minutes {
            w.push("interval_minutes = ?N", Box::new(iv));
        }
        if let Some(text) = &f.text {
            w.push("rtsp_base LIKE ?N", Box::new(format!("%{text}%")));
        }
        if !f.operation_time.is_empty() {
            w.range("operation_time", &f.operation_time);
        }
        self.run_page(
            ("task_config", w),
            "id, date, rtsp_base, channel, interval_minutes, day_start_ts, day_end_ts, operation_time",
            "date DESC, id",
            f.page,
            f.page_size,
            task_config_from_row,
        )
    }

    pub fn list_snapshots(&self, f: &SnapshotFilter) -> Result<Page<Snapshot>> {
        let mut w = WhereBuilder::new();
        if let Some(date) = &f.date {
            // Snapshots carry no date column; join through the task's
            // date via image_path prefix would be fragile, so filter on
            // the owning task.
            w.push(
                "task_id IN (SELECT id FROM task WHERE date = ?N)",
                Box::new(date.clone()),
            );
        }
        w.eq_or_prefix("ip", &f.ip, &f.ip_prefix);
        w.eq_or_prefix("channel", &f.channel, &f.channel_prefix);
        w.range("detected_at", &f.detected_at);
        self.run_page(
            ("snapshot", w),
            "id, task_id, ip, channel, image_path, detected_image_path, change_count, detected_at",
            "detected_at DESC, id DESC",
            f.page,
            f.page_size,
            snapshot_from_row,
        )
    }

    pub fn list_changes(&self, f: &ChangeFilter) -> Result<Page<ChangeRecord>> {
        let mut w = WhereBuilder::new();
        w.eq_or_prefix("ip", &f.ip, &f.ip_prefix);
        w.eq_or_prefix("channel", &f.channel, &f.channel_prefix);
        if let Some(space) = &f.space_id {
            w.push("space_id = ?N", Box::new(space.clone()));
        }
        if !f.change_type_in.is_empty() {
            let named: Vec<String> = f
                .change_type_in
                .iter()
                .filter(|t| matches!(t.as_str(), "arrive" | "leave" | "unknown"))
                .map(|t| format!("'{t}'"))
                .collect();
            // Anything else ("none", empty string) selects rows with no
            // transition.
            let wants_null = named.len() < f.change_type_in.len();
            let list = named.join(", ");
            let cond = match (named.is_empty(), wants_null) {
                (false, false) => format!("change_type IN ({list})"),
                (false, true) => format!("(change_type IN ({list}) OR change_type IS NULL)"),
                (true, _) => "change_type IS NULL".to_string(),
            };
            w.conds.push(cond);
        }
        w.range("detected_at", &f.detected_at);
        self.run_page(
            ("change_record", w),
            "id, snapshot_id, prev_snapshot_id, space_id, prev_occupied, curr_occupied, \
             change_type, detection_confidence, detected_at",
            "detected_at DESC, id DESC",
            f.page,
            f.page_size,
            change_from_row,
        )
    }
}
