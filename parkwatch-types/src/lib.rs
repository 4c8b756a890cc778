//! Shared vocabulary for the parkwatch pipeline.
//!
//! Everything that crosses a crate boundary lives here: task and change
//! enums, the NVR configuration tree, parking-space geometry in the
//! reference frame, and the RTSP replay-URL grammar.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod rtsp;

pub use rtsp::{ReplayUrl, RtspBase};

/// Width of the reference frame in which all bboxes are specified.
pub const REFERENCE_WIDTH: u32 = 1920;
/// Height of the reference frame in which all bboxes are specified.
pub const REFERENCE_HEIGHT: u32 = 1080;

/// Wall-date format used throughout (`YYYY-MM-DD`).
pub const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid channel code \"{0}\": expected c<digits>")]
    InvalidChannelCode(String),
    #[error("invalid RTSP url \"{0}\": {1}")]
    InvalidRtspUrl(String, &'static str),
    #[error("invalid bbox [{x1},{y1},{x2},{y2}] for reference frame {w}x{h}")]
    InvalidBBox {
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        w: u32,
        h: u32,
    },
    #[error("interval_minutes {0} out of range 1..=1440")]
    InvalidInterval(u32),
    #[error("invalid wall date \"{0}\"")]
    InvalidDate(String),
    #[error("unknown task status \"{0}\"")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A channel code, normalized to lowercase `c<digits>`.
///
/// Input is case-insensitive on the `c` prefix; the normalized form is
/// what gets persisted and compared everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelCode(String);

impl ChannelCode {
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix('c')
            .or_else(|| s.strip_prefix('C'))
            .ok_or_else(|| Error::InvalidChannelCode(s.to_string()))?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidChannelCode(s.to_string()));
        }
        Ok(ChannelCode(format!("c{rest}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ChannelCode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        ChannelCode::parse(s)
    }
}

/// The pair that scopes per-stream concurrency: camera ip + channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComboKey {
    pub ip: String,
    pub channel: ChannelCode,
}

impl std::fmt::Display for ComboKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.channel)
    }
}

/// Lifecycle state of a capture task.
///
/// `completed` is accepted on input as an alias of `screenshot_taken`
/// and is never written back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Playing,
    ScreenshotTaken,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Playing => "playing",
            TaskStatus::ScreenshotTaken => "screenshot_taken",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "playing" => Ok(TaskStatus::Playing),
            "screenshot_taken" | "completed" => Ok(TaskStatus::ScreenshotTaken),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }

    /// True for states in which the task is not owned by any worker.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Playing)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inferred transition for one space between consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Arrive,
    Leave,
    Unknown,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Arrive => "arrive",
            ChangeType::Leave => "leave",
            ChangeType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "arrive" => Some(ChangeType::Arrive),
            "leave" => Some(ChangeType::Leave),
            "unknown" => Some(ChangeType::Unknown),
            _ => None,
        }
    }
}

/// Occupancy transition table.
///
/// `None` occupancy means the detector could not decide. A `None`
/// return means "no change row of interest" (both states known and
/// equal, or both unknown).
pub fn change_type_for(prev: Option<bool>, curr: Option<bool>) -> Option<ChangeType> {
    match (prev, curr) {
        (Some(false), Some(true)) => Some(ChangeType::Arrive),
        (Some(true), Some(false)) => Some(ChangeType::Leave),
        (Some(_), Some(_)) => None,
        (None, Some(_)) => Some(ChangeType::Unknown),
        (Some(_), None) => Some(ChangeType::Unknown),
        (None, None) => None,
    }
}

/// Axis-aligned detection region in reference-frame coordinates.
///
/// Deserialization goes through [BBox::validated], so untrusted input
/// cannot construct a degenerate or out-of-frame region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    /// Validate `0 <= x1 < x2 <= REFERENCE_WIDTH` (same for y).
    pub fn validated(x1: i64, y1: i64, x2: i64, y2: i64) -> Result<Self> {
        let (w, h) = (REFERENCE_WIDTH, REFERENCE_HEIGHT);
        let ok = 0 <= x1 && x1 < x2 && x2 <= w as i64 && 0 <= y1 && y1 < y2 && y2 <= h as i64;
        if !ok {
            return Err(Error::InvalidBBox { x1, y1, x2, y2, w, h });
        }
        Ok(BBox {
            x1: x1 as u32,
            y1: y1 as u32,
            x2: x2 as u32,
            y2: y2 as u32,
        })
    }
}

impl<'de> Deserialize<'de> for BBox {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            x1: i64,
            y1: i64,
            x2: i64,
            y2: i64,
        }
        let raw = Raw::deserialize(deserializer)?;
        BBox::validated(raw.x1, raw.y1, raw.x2, raw.y2).map_err(serde::de::Error::custom)
    }
}

/// One detection region of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkingSpace {
    /// External stable identifier.
    pub space_id: String,
    /// Display name.
    pub space_name: String,
    pub bbox: BBox,
}

/// Coordinates of an NVR-side external database, stored opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalDbCoords {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db_name: String,
}

/// A camera deployment at one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvrConfig {
    pub id: i64,
    pub site_name: String,
    pub host: String,
    pub port: u16,
    /// Compared verbatim, never encoded.
    pub user: String,
    pub password: String,
    pub external_db: Option<ExternalDbCoords>,
    pub channels: Vec<ChannelConfig>,
}

/// One camera under an [NvrConfig].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: i64,
    pub channel_code: ChannelCode,
    pub camera_ip: String,
    pub display_name: String,
    pub vendor_sn: String,
    /// Recognition-ROI polygon, opaque to the pipeline. Stored and
    /// exposed, never parsed.
    pub track_space: String,
    pub spaces: Vec<ParkingSpace>,
}

/// A per-day, per-camera capture plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: i64,
    /// Wall date `YYYY-MM-DD`.
    pub date: String,
    pub rtsp_base: String,
    pub channel: ChannelCode,
    pub interval_minutes: u32,
    /// 00:00 of `date` in the wall zone, epoch seconds.
    pub day_start_ts: i64,
    /// 23:59:59 of `date` in the wall zone, epoch seconds.
    pub day_end_ts: i64,
    pub operation_time: DateTime<Utc>,
}

/// One capture window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub date: String,
    /// 0-based index within the day.
    pub index: u32,
    pub start_ts: i64,
    pub end_ts: i64,
    pub rtsp_url: String,
    pub ip: String,
    pub channel: ChannelCode,
    pub status: TaskStatus,
    pub screenshot_path: Option<String>,
    pub error: Option<String>,
    pub operation_time: DateTime<Utc>,
}

impl Task {
    pub fn combo(&self) -> ComboKey {
        ComboKey {
            ip: self.ip.clone(),
            channel: self.channel.clone(),
        }
    }

    /// Capture window length in seconds.
    pub fn window_secs(&self) -> i64 {
        self.end_ts - self.start_ts
    }
}

/// The successful artifact of one task: image on disk plus detector
/// outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub task_id: i64,
    pub ip: String,
    pub channel: ChannelCode,
    pub image_path: String,
    pub detected_image_path: String,
    pub change_count: u32,
    pub detected_at: DateTime<Utc>,
}

/// One space's detector output within one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceState {
    pub snapshot_id: i64,
    pub space_id: String,
    /// `None` when the detector could not decide.
    pub occupied: Option<bool>,
    /// In `[0, 1]`; `None` when occupancy is unknown.
    pub confidence: Option<f64>,
}

/// A single space transition derived from two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub snapshot_id: i64,
    pub prev_snapshot_id: Option<i64>,
    pub space_id: String,
    pub prev_occupied: Option<bool>,
    pub curr_occupied: Option<bool>,
    pub change_type: Option<ChangeType>,
    pub detection_confidence: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

/// Outcome of the last auto-rule firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    None,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::None => "none",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::None,
        }
    }
}

/// A recurring or one-shot scheduling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRule {
    pub id: i64,
    pub use_today: bool,
    pub custom_date: Option<String>,
    pub base_rtsp: String,
    pub channel: ChannelCode,
    pub interval_minutes: u32,
    /// Wall time `HH:MM`.
    pub trigger_time: String,
    pub is_enabled: bool,
    pub execution_count: u32,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub last_execution_status: ExecutionStatus,
    pub last_execution_error: Option<String>,
}

/// Parse a `YYYY-MM-DD` wall date.
pub fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DAY_FORMAT).map_err(|_| Error::InvalidDate(s.to_string()))
}

/// Epoch-second bounds of `day` in `zone`: 00:00:00 and 23:59:59.
///
/// On zones with DST the day is still treated as 86400 seconds from its
/// local midnight, which matches how the NVRs address replay windows.
pub fn day_bounds(day: NaiveDate, zone: chrono_tz::Tz) -> Result<(i64, i64)> {
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| Error::InvalidDate(day.to_string()))?;
    let start = zone
        .from_local_datetime(&midnight)
        .earliest()
        .ok_or_else(|| Error::InvalidDate(day.to_string()))?
        .timestamp();
    Ok((start, start + 86400 - 1))
}

/// Relative blob path of a window's screenshot:
/// `<YYYY-MM-DD>/<ip_underscored>_<start>_<end>_<channel>.jpg`.
pub fn screenshot_rel_path(
    date: &str,
    ip: &str,
    start_ts: i64,
    end_ts: i64,
    channel: &ChannelCode,
) -> String {
    let ip_underscored = ip.replace('.', "_");
    format!("{date}/{ip_underscored}_{start_ts}_{end_ts}_{channel}.jpg")
}

/// The annotated variant of a screenshot path (`_detected` before the
/// extension).
pub fn detected_variant(path: &str) -> String {
    match path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_detected.{ext}"),
        None => format!("{path}_detected"),
    }
}
