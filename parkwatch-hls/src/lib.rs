//! On-demand RTSP -> HLS transcoding for browser playback.
//!
//! Children are keyed by a fingerprint of the RTSP URL. Concurrent
//! `start` calls for one URL converge on a single child: the registry
//! map has one mutex, and each fingerprint has its own async spawn
//! lock. A background reaper terminates children idle past the
//! timeout and deletes their output directory a little later, so
//! last-byte consumers can finish.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const PLAYLIST_NAME: &str = "index.m3u8";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to spawn transcoder: {0}")]
    Spawn(std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A spawn for this fingerprint failed moments ago; try again
    /// shortly.
    #[error("transcoder respawn rate-limited")]
    RateLimited,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub hls_root: PathBuf,
    /// Reap children idle longer than this.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Output directories linger this long after the child dies.
    pub dir_removal_delay: Duration,
    /// A child exiting this soon after spawn counts as a spawn
    /// failure.
    pub early_exit_window: Duration,
    /// Minimum gap between spawn attempts per fingerprint after a
    /// failure.
    pub respawn_min_interval: Duration,
}

impl Default for HlsConfig {
    fn default() -> Self {
        HlsConfig {
            hls_root: PathBuf::from("hls"),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(15),
            dir_removal_delay: Duration::from_secs(30),
            early_exit_window: Duration::from_secs(2),
            respawn_min_interval: Duration::from_secs(2),
        }
    }
}

/// Spawns the actual transcoder child. Injected so tests can run the
/// lifecycle with a stub command.
pub trait Transcoder: Send + Sync {
    fn spawn(&self, rtsp_url: &str, out_dir: &Path) -> std::io::Result<Child>;
}

/// ffmpeg copy-mode transcoder writing a sliding-window playlist.
pub struct FfmpegTranscoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new<P: Into<PathBuf>>(ffmpeg_path: P) -> Self {
        FfmpegTranscoder {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, rtsp_url: &str, out_dir: &Path) -> std::io::Result<Child> {
        let playlist = out_dir.join(PLAYLIST_NAME);
        Command::new(&self.ffmpeg_path)
            .args([
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-i",
                rtsp_url,
                "-c:v",
                "copy",
                "-an",
                "-f",
                "hls",
                "-hls_time",
                "2",
                "-hls_list_size",
                "6",
                "-hls_flags",
                "delete_segments+append_list",
            ])
            .arg(&playlist)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

struct HlsEntry {
    child: Mutex<Child>,
    out_dir: PathBuf,
    spawned_at: Instant,
    last_access: Mutex<Instant>,
}

impl HlsEntry {
    fn is_alive(&self) -> bool {
        self.child.lock().try_wait().ok().flatten().is_none()
    }
}

/// Result of a successful `start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsPlaylist {
    pub fingerprint: String,
    pub path: PathBuf,
}

/// Deterministic key for one RTSP URL.
pub fn fingerprint(rtsp_url: &str) -> String {
    let digest = Sha256::digest(rtsp_url.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Clone)]
pub struct HlsManager {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: HlsConfig,
    transcoder: Arc<dyn Transcoder>,
    registry: Mutex<HashMap<String, Arc<HlsEntry>>>,
    spawn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    last_attempt: Mutex<HashMap<String, (Instant, bool)>>,
}

impl HlsManager {
    pub fn new(cfg: HlsConfig, transcoder: Arc<dyn Transcoder>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.hls_root)?;
        Ok(HlsManager {
            inner: Arc::new(Inner {
                cfg,
                transcoder,
                registry: Mutex::new(HashMap::new()),
                spawn_locks: Mutex::new(HashMap::new()),
                last_attempt: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start or reuse the transcoder for `rtsp_url` and return its
    /// playlist location.
    pub async fn start(&self, rtsp_url: &str) -> Result<HlsPlaylist> {
        let fp = fingerprint(rtsp_url);

        if let Some(playlist) = self.inner.reuse(&fp) {
            return Ok(playlist);
        }

        // One spawn per fingerprint at a time; losers of the race find
        // the winner's entry on re-check.
        let lock = {
            let mut locks = self.inner.spawn_locks.lock();
            locks
                .entry(fp.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(playlist) = self.inner.reuse(&fp) {
            return Ok(playlist);
        }

        // Rate-limit respawns after a failed attempt.
        {
            let attempts = self.inner.last_attempt.lock();
            if let Some((at, failed)) = attempts.get(&fp) {
                if *failed && at.elapsed() < self.inner.cfg.respawn_min_interval {
                    return Err(Error::RateLimited);
                }
            }
        }

        let out_dir = self.inner.cfg.hls_root.join(&fp);
        std::fs::create_dir_all(&out_dir)?;
        let spawned = self.inner.transcoder.spawn(rtsp_url, &out_dir);
        let now = Instant::now();
        match spawned {
            Ok(child) => {
                self.inner.last_attempt.lock().insert(fp.clone(), (now, false));
                let entry = Arc::new(HlsEntry {
                    child: Mutex::new(child),
                    out_dir: out_dir.clone(),
                    spawned_at: now,
                    last_access: Mutex::new(now),
                });
                self.inner.registry.lock().insert(fp.clone(), entry);
                info!(fingerprint = %fp, "transcoder started");
                Ok(HlsPlaylist {
                    fingerprint: fp,
                    path: out_dir.join(PLAYLIST_NAME),
                })
            }
            Err(e) => {
                self.inner.last_attempt.lock().insert(fp.clone(), (now, true));
                Err(Error::Spawn(e))
            }
        }
    }

    /// How many children are currently registered.
    pub fn live_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// One reaper pass: drop dead children, terminate idle ones, and
    /// schedule their directories for delayed removal.
    pub fn reap_once(&self) {
        let cfg = &self.inner.cfg;
        let mut doomed: Vec<(String, Arc<HlsEntry>, bool)> = Vec::new();
        {
            let registry = self.inner.registry.lock();
            for (fp, entry) in registry.iter() {
                if !entry.is_alive() {
                    let early = entry.spawned_at.elapsed() < cfg.early_exit_window;
                    doomed.push((fp.clone(), entry.clone(), early));
                } else if entry.last_access.lock().elapsed() > cfg.idle_timeout {
                    doomed.push((fp.clone(), entry.clone(), false));
                }
            }
        }
        for (fp, entry, early_death) in doomed {
            self.inner.registry.lock().remove(&fp);
            if early_death {
                // Treat like a spawn failure so the rate limit applies
                // to the respawn.
                self.inner
                    .last_attempt
                    .lock()
                    .insert(fp.clone(), (Instant::now(), true));
                warn!(fingerprint = %fp, "transcoder died right after spawn");
            } else {
                debug!(fingerprint = %fp, "reaping idle transcoder");
            }
            let mut child = entry.child.lock();
            if let Err(e) = child.start_kill() {
                debug!(fingerprint = %fp, "kill failed (already dead?): {e}");
            }
            drop(child);
            let out_dir = entry.out_dir.clone();
            let delay = cfg.dir_removal_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = tokio::fs::remove_dir_all(&out_dir).await {
                    debug!("hls dir removal failed for {}: {e}", out_dir.display());
                }
            });
        }
    }

    /// Periodic reaper; exits when `shutdown` flips true.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.inner.cfg.reap_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => manager.reap_once(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            manager.kill_all();
        })
    }

    /// Terminate every registered child (shutdown path).
    pub fn kill_all(&self) {
        let entries: Vec<_> = {
            let mut registry = self.inner.registry.lock();
            registry.drain().collect()
        };
        for (fp, entry) in entries {
            debug!(fingerprint = %fp, "killing transcoder on shutdown");
            let _ = entry.child.lock().start_kill();
        }
    }
}

impl Inner {
    /// Fast path: a live, non-idle child for this fingerprint.
    fn reuse(&self, fp: &str) -> Option<HlsPlaylist> {
        let registry = self.registry.lock();
        let entry = registry.get(fp)?;
        if !entry.is_alive() {
            return None;
        }
        let mut last_access = entry.last_access.lock();
        if last_access.elapsed() > self.cfg.idle_timeout {
            // Idle past the threshold; leave it for the reaper.
            return None;
        }
        *last_access = Instant::now();
        Some(HlsPlaylist {
            fingerprint: fp.to_string(),
            path: entry.out_dir.join(PLAYLIST_NAME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stub transcoder: a long sleep standing in for ffmpeg, touching
    /// the playlist so consumers have something to read.
    struct StubTranscoder {
        fail_spawn: bool,
        exit_immediately: bool,
    }

    impl Transcoder for StubTranscoder {
        fn spawn(&self, _rtsp_url: &str, out_dir: &Path) -> std::io::Result<Child> {
            if self.fail_spawn {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such transcoder",
                ));
            }
            std::fs::write(out_dir.join(PLAYLIST_NAME), "#EXTM3U\n")?;
            let arg = if self.exit_immediately {
                "exit 1"
            } else {
                "sleep 60"
            };
            Command::new("sh")
                .args(["-c", arg])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
        }
    }

    fn test_cfg(root: &Path) -> HlsConfig {
        HlsConfig {
            hls_root: root.to_path_buf(),
            idle_timeout: Duration::from_millis(200),
            reap_interval: Duration::from_millis(50),
            dir_removal_delay: Duration::from_millis(50),
            early_exit_window: Duration::from_millis(500),
            respawn_min_interval: Duration::from_millis(300),
        }
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn start_reuses_live_child() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(
            test_cfg(dir.path()),
            Arc::new(StubTranscoder {
                fail_spawn: false,
                exit_immediately: false,
            }),
        )
        .unwrap();

        let url = "rtsp://u:p@10.0.0.1:554/c1/b1/e2/replay/s1";
        let first = manager.start(url).await.unwrap();
        let second = manager.start(url).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.live_count(), 1);
        assert!(first.path.ends_with("index.m3u8"));
        assert!(first.path.exists());

        // A different URL gets its own child.
        let other = manager.start("rtsp://u:p@10.0.0.2:554/c9/b1/e2/x").await.unwrap();
        assert_ne!(other.fingerprint, first.fingerprint);
        assert_eq!(manager.live_count(), 2);

        manager.kill_all();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn idle_children_are_reaped_and_dir_removed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(
            test_cfg(dir.path()),
            Arc::new(StubTranscoder {
                fail_spawn: false,
                exit_immediately: false,
            }),
        )
        .unwrap();

        let playlist = manager.start("rtsp://u:p@10.0.0.1:554/x").await.unwrap();
        let out_dir = playlist.path.parent().unwrap().to_path_buf();
        assert!(out_dir.exists());

        // Exceed the idle timeout, then reap.
        tokio::time::sleep(Duration::from_millis(250)).await;
        manager.reap_once();
        assert_eq!(manager.live_count(), 0);

        // Directory removal is delayed, then happens.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!out_dir.exists());

        // The next start spawns a fresh child.
        let again = manager.start("rtsp://u:p@10.0.0.1:554/x").await.unwrap();
        assert_eq!(again.fingerprint, playlist.fingerprint);
        assert_eq!(manager.live_count(), 1);
        manager.kill_all();
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn spawn_failures_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(
            test_cfg(dir.path()),
            Arc::new(StubTranscoder {
                fail_spawn: true,
                exit_immediately: false,
            }),
        )
        .unwrap();

        let url = "rtsp://u:p@10.0.0.1:554/x";
        assert!(matches!(manager.start(url).await, Err(Error::Spawn(_))));
        // Immediately after the failure: limited.
        assert!(matches!(manager.start(url).await, Err(Error::RateLimited)));
        // After the interval the next attempt goes through (and fails
        // again, honestly).
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(matches!(manager.start(url).await, Err(Error::Spawn(_))));
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn early_exit_marks_dead_and_allows_respawn() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(
            test_cfg(dir.path()),
            Arc::new(StubTranscoder {
                fail_spawn: false,
                exit_immediately: true,
            }),
        )
        .unwrap();

        let url = "rtsp://u:p@10.0.0.1:554/x";
        manager.start(url).await.unwrap();
        // Give the child time to exit, then reap: the entry goes away.
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.reap_once();
        assert_eq!(manager.live_count(), 0);

        // Respawn right away is rate-limited; after the window it is
        // allowed again.
        assert!(matches!(manager.start(url).await, Err(Error::RateLimited)));
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(manager.start(url).await.is_ok());
        manager.kill_all();
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("rtsp://u:p@10.0.0.1:554/x");
        let b = fingerprint("rtsp://u:p@10.0.0.1:554/x");
        let c = fingerprint("rtsp://u:p@10.0.0.1:554/y");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
