//! The seam between the execution engine and RTSP.
//!
//! A [FrameSource] opens a replay URL and yields one decoded frame for
//! the window. The production implementation shells out to ffmpeg and
//! lets it handle transport, demuxing, and waiting for the first
//! decodable keyframe; tests use [testing::ScriptedFrameSource].
//!
//! Errors distinguish transport failures from decode failures because
//! only the former are retried upstream.

use std::process::Stdio;
use std::time::Duration;

use image::RgbImage;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

pub mod testing;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Connection refused, host unreachable, reset. Worth retrying.
    #[error("transport failure: {0}")]
    Transport(String),
    /// No frame arrived within the read window. Not retried.
    #[error("timeout")]
    Timeout,
    /// A frame (or stream) arrived but could not be decoded. Not
    /// retried.
    #[error("decode failure: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the engine's transport-retry policy applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Yields one representative frame per capture window.
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync {
    async fn grab_frame(
        &self,
        url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<RgbImage>;
}

/// ffmpeg-backed [FrameSource]. One short-lived child per grab; the
/// child exits after emitting a single JPEG on stdout.
pub struct FfmpegFrameSource {
    ffmpeg_path: std::path::PathBuf,
}

impl FfmpegFrameSource {
    pub fn new<P: Into<std::path::PathBuf>>(ffmpeg_path: P) -> Self {
        FfmpegFrameSource {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

/// stderr fragments that indicate the transport layer failed before any
/// media arrived.
const TRANSPORT_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection reset",
    "No route to host",
    "Network is unreachable",
    "Connection timed out",
    "Immediate exit requested",
    "Name or service not known",
];

fn classify_stderr(stderr: &str) -> Error {
    let line = stderr.lines().last().unwrap_or("ffmpeg failed").trim();
    if TRANSPORT_MARKERS.iter().any(|m| stderr.contains(m)) {
        Error::Transport(line.to_string())
    } else {
        Error::Decode(line.to_string())
    }
}

#[async_trait::async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn grab_frame(
        &self,
        url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<RgbImage> {
        // -stimeout is the RTSP socket timeout in microseconds and
        // covers the TCP connect.
        let stimeout = format!("{}", connect_timeout.as_micros());
        let mut child = Command::new(&self.ffmpeg_path)
            .args([
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "error",
                "-rtsp_transport",
                "tcp",
                "-stimeout",
                &stimeout,
                "-i",
                url,
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let deadline = connect_timeout + read_timeout;
        let collected = tokio::time::timeout(deadline, async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = stdout.read_to_end(&mut out);
            let read_err = stderr.read_to_end(&mut err);
            let (ro, re) = tokio::join!(read_out, read_err);
            ro?;
            re?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        })
        .await;

        let (status, out, err) = match collected {
            Ok(io_result) => io_result?,
            Err(_elapsed) => {
                // kill_on_drop reaps the child.
                debug!("ffmpeg grab exceeded {deadline:?} for stream");
                return Err(Error::Timeout);
            }
        };

        let stderr_text = String::from_utf8_lossy(&err);
        if !status.success() || out.is_empty() {
            return Err(classify_stderr(&stderr_text));
        }
        let decoded = image::load_from_memory(&out)
            .map_err(|e| Error::Decode(format!("bad JPEG from ffmpeg: {e}")))?;
        Ok(decoded.to_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        let e = classify_stderr("rtsp://x: Connection refused");
        assert!(matches!(e, Error::Transport(_)));
        assert!(e.is_transient());

        let e = classify_stderr("Invalid data found when processing input");
        assert!(matches!(e, Error::Decode(_)));
        assert!(!e.is_transient());

        assert!(!Error::Timeout.is_transient());
    }
}
