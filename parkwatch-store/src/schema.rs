//! SQLite schema.
//!
//! The two uniqueness constraints on `task_config` and `task` are
//! load-bearing: planner idempotence relies on the storage layer
//! rejecting duplicates, not on application checks.

use rusqlite::Connection;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_config (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    rtsp_base TEXT NOT NULL,
    channel TEXT NOT NULL,
    interval_minutes INTEGER NOT NULL,
    day_start_ts INTEGER NOT NULL,
    day_end_ts INTEGER NOT NULL,
    operation_time INTEGER NOT NULL,
    UNIQUE (date, rtsp_base, channel, interval_minutes)
);

CREATE TABLE IF NOT EXISTS task (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    idx INTEGER NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    rtsp_url TEXT NOT NULL,
    ip TEXT NOT NULL,
    channel TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    screenshot_path TEXT,
    error TEXT,
    operation_time INTEGER NOT NULL,
    UNIQUE (date, idx, rtsp_url)
);
CREATE INDEX IF NOT EXISTS task_combo ON task (ip, channel);
CREATE INDEX IF NOT EXISTS task_status ON task (status);
CREATE INDEX IF NOT EXISTS task_date ON task (date);

CREATE TABLE IF NOT EXISTS snapshot (
    id INTEGER PRIMARY KEY,
    task_id INTEGER NOT NULL UNIQUE REFERENCES task (id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    channel TEXT NOT NULL,
    image_path TEXT NOT NULL,
    detected_image_path TEXT NOT NULL,
    change_count INTEGER NOT NULL DEFAULT 0,
    detected_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS snapshot_combo_time
    ON snapshot (ip, channel, detected_at, id);

CREATE TABLE IF NOT EXISTS space_state (
    snapshot_id INTEGER NOT NULL REFERENCES snapshot (id) ON DELETE CASCADE,
    space_id TEXT NOT NULL,
    occupied INTEGER,
    confidence REAL
);
CREATE INDEX IF NOT EXISTS space_state_snapshot ON space_state (snapshot_id);

CREATE TABLE IF NOT EXISTS change_record (
    id INTEGER PRIMARY KEY,
    snapshot_id INTEGER NOT NULL REFERENCES snapshot (id) ON DELETE CASCADE,
    prev_snapshot_id INTEGER,
    space_id TEXT NOT NULL,
    prev_occupied INTEGER,
    curr_occupied INTEGER,
    change_type TEXT,
    detection_confidence REAL,
    ip TEXT NOT NULL,
    channel TEXT NOT NULL,
    detected_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS change_snapshot ON change_record (snapshot_id);
CREATE INDEX IF NOT EXISTS change_combo_time
    ON change_record (ip, channel, detected_at);

CREATE TABLE IF NOT EXISTS nvr_config (
    id INTEGER PRIMARY KEY,
    site_name TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    user TEXT NOT NULL,
    password TEXT NOT NULL,
    ext_db_host TEXT,
    ext_db_port INTEGER,
    ext_db_user TEXT,
    ext_db_password TEXT,
    ext_db_name TEXT
);

CREATE TABLE IF NOT EXISTS channel_config (
    id INTEGER PRIMARY KEY,
    nvr_id INTEGER NOT NULL REFERENCES nvr_config (id) ON DELETE CASCADE,
    channel_code TEXT NOT NULL,
    camera_ip TEXT NOT NULL,
    display_name TEXT NOT NULL,
    vendor_sn TEXT NOT NULL,
    track_space TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0,
    UNIQUE (nvr_id, channel_code)
);

CREATE TABLE IF NOT EXISTS parking_space (
    id INTEGER PRIMARY KEY,
    channel_id INTEGER NOT NULL REFERENCES channel_config (id) ON DELETE CASCADE,
    space_id TEXT NOT NULL,
    space_name TEXT NOT NULL,
    x1 INTEGER NOT NULL,
    y1 INTEGER NOT NULL,
    x2 INTEGER NOT NULL,
    y2 INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS parking_space_channel ON parking_space (channel_id);

CREATE TABLE IF NOT EXISTS auto_rule (
    id INTEGER PRIMARY KEY,
    use_today INTEGER NOT NULL DEFAULT 1,
    custom_date TEXT,
    base_rtsp TEXT NOT NULL,
    channel TEXT NOT NULL,
    interval_minutes INTEGER NOT NULL,
    trigger_time TEXT NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    execution_count INTEGER NOT NULL DEFAULT 0,
    last_executed_at INTEGER,
    last_execution_status TEXT NOT NULL DEFAULT 'none',
    last_execution_error TEXT
);
"#;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)
}
