//! TOML configuration for the parkwatch binary.
//!
//! Every knob has a default matching the deployment the system was
//! built for, so an empty file is a valid config. Relative paths are
//! made relative to the config file location, and values can contain
//! shell variables such as `~`, `$A`, or `${B}`.

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("unknown wall timezone \"{0}\"")]
    UnknownTimezone(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn default_max_combo_concurrency() -> usize {
    4
}

fn default_max_workers_per_combo() -> usize {
    2
}

fn default_hls_idle_timeout_sec() -> u64 {
    60
}

fn default_rtsp_connect_timeout_sec() -> u64 {
    10
}

fn default_task_retry_count() -> u32 {
    2
}

fn default_task_deadline_factor() -> u32 {
    2
}

fn default_wall_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_blob_root() -> std::path::PathBuf {
    std::path::PathBuf::from("data/screenshots")
}

fn default_hls_root() -> std::path::PathBuf {
    std::path::PathBuf::from("data/hls")
}

fn default_db_path() -> std::path::PathBuf {
    std::path::PathBuf::from("data/parkwatch.sqlite")
}

fn default_http_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_ffmpeg_path() -> std::path::PathBuf {
    std::path::PathBuf::from("ffmpeg")
}

fn default_reference_width() -> u32 {
    1920
}

fn default_reference_height() -> u32 {
    1080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParkwatchConfig {
    /// Global capture permit count across all streams.
    #[serde(default = "default_max_combo_concurrency")]
    pub max_combo_concurrency: usize,
    /// Capture permit count within one `(ip, channel)` stream.
    #[serde(default = "default_max_workers_per_combo")]
    pub max_workers_per_combo: usize,
    /// Seconds an unused HLS transcoder may linger before reaping.
    #[serde(default = "default_hls_idle_timeout_sec")]
    pub hls_idle_timeout_sec: u64,
    #[serde(default = "default_rtsp_connect_timeout_sec")]
    pub task_rtsp_connect_timeout_sec: u64,
    /// Transport retries per capture after the first attempt.
    #[serde(default = "default_task_retry_count")]
    pub task_retry_count: u32,
    /// Task deadline multiplier on the window duration.
    #[serde(default = "default_task_deadline_factor")]
    pub task_deadline_factor: u32,
    /// IANA zone for day boundaries and auto-rule trigger times.
    #[serde(default = "default_wall_timezone")]
    pub wall_timezone: String,
    /// Reference frame for parking-space coordinates. Changing these
    /// invalidates every configured bbox; they exist for forward
    /// compatibility, not tuning.
    #[serde(default = "default_reference_width")]
    pub reference_width: u32,
    #[serde(default = "default_reference_height")]
    pub reference_height: u32,
    /// Screenshot tree root. Can contain shell variables.
    #[serde(default = "default_blob_root")]
    pub blob_root: std::path::PathBuf,
    /// HLS playlist tree root. Can contain shell variables.
    #[serde(default = "default_hls_root")]
    pub hls_root: std::path::PathBuf,
    /// SQLite database file. Can contain shell variables.
    #[serde(default = "default_db_path")]
    pub db_path: std::path::PathBuf,
    #[serde(default = "default_http_listen_addr")]
    pub http_listen_addr: String,
    /// Executable used for both frame grabbing and HLS transcoding.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: std::path::PathBuf,
    /// HTTP inference endpoint for occupancy detection. When unset,
    /// every space reports unknown.
    #[serde(default)]
    pub detector_url: Option<String>,
}

impl Default for ParkwatchConfig {
    fn default() -> Self {
        // An empty document picks up every field default.
        toml::from_str("").expect("defaults are complete")
    }
}

impl ParkwatchConfig {
    pub fn wall_timezone(&self) -> Result<chrono_tz::Tz> {
        self.wall_timezone
            .parse()
            .map_err(|_| Error::UnknownTimezone(self.wall_timezone.clone()))
    }
}

/// Split `path` (which must be a file) into directory and filename
/// components.
fn dirname_of(path: &std::path::Path) -> std::path::PathBuf {
    path.parent().unwrap_or(std::path::Path::new(".")).into()
}

/// If `path` is relative, make it relative to `dirname`, expanding
/// shell variables first.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    if let Some(pathstr) = path.as_os_str().to_str() {
        let expanded = shellexpand::full(pathstr)?;
        *path = std::path::PathBuf::from(expanded.to_string());
    }
    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<ParkwatchConfig> {
    use std::io::Read;

    let mut file = std::fs::File::open(fname.as_ref())?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let mut cfg: ParkwatchConfig = toml::from_str(&contents)?;

    let dirname = dirname_of(fname.as_ref());
    fixup_relative_path(&mut cfg.blob_root, &dirname)?;
    fixup_relative_path(&mut cfg.hls_root, &dirname)?;
    fixup_relative_path(&mut cfg.db_path, &dirname)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_gets_defaults() {
        let cfg = ParkwatchConfig::default();
        assert_eq!(cfg.max_combo_concurrency, 4);
        assert_eq!(cfg.max_workers_per_combo, 2);
        assert_eq!(cfg.hls_idle_timeout_sec, 60);
        assert_eq!(cfg.task_rtsp_connect_timeout_sec, 10);
        assert_eq!(cfg.wall_timezone, "Asia/Shanghai");
        assert_eq!(cfg.wall_timezone().unwrap(), chrono_tz::Asia::Shanghai);
        assert_eq!(cfg.reference_width, 1920);
        assert_eq!(cfg.reference_height, 1080);
    }

    #[test]
    fn file_overrides_and_path_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("parkwatch.toml");
        let mut fd = std::fs::File::create(&cfg_path).unwrap();
        write!(
            fd,
            "max_combo_concurrency = 8\nblob_root = \"shots\"\nwall_timezone = \"UTC\"\n"
        )
        .unwrap();
        drop(fd);

        let cfg = parse_config_file(&cfg_path).unwrap();
        assert_eq!(cfg.max_combo_concurrency, 8);
        assert_eq!(cfg.blob_root, dir.path().join("shots"));
        assert_eq!(cfg.wall_timezone().unwrap(), chrono_tz::UTC);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.task_retry_count, 2);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = toml::from_str::<ParkwatchConfig>("no_such_knob = 1");
        assert!(err.is_err());
    }

    #[test]
    fn bad_timezone_is_an_error() {
        let cfg: ParkwatchConfig =
            toml::from_str("wall_timezone = \"Mars/Olympus\"").unwrap();
        assert!(matches!(
            cfg.wall_timezone(),
            Err(Error::UnknownTimezone(_))
        ));
    }
}
