//! Scripted frame source for engine tests.

use std::collections::VecDeque;
use std::time::Duration;

use image::RgbImage;
use parking_lot::Mutex;

use crate::{Error, FrameSource, Result};

/// One scripted response per `grab_frame` call, consumed in order.
pub enum Scripted {
    /// Yield a frame after an optional delay.
    Frame(RgbImage),
    /// Yield a frame after sleeping (to hold permits and exercise
    /// concurrency caps).
    SlowFrame(RgbImage, Duration),
    Transport(String),
    Decode(String),
    Timeout,
}

/// A [FrameSource] that replays a fixed script and records the URLs it
/// was asked for. When the script runs dry it keeps returning the
/// fallback frame.
pub struct ScriptedFrameSource {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<String>>,
    fallback: RgbImage,
}

/// A small uniform gray frame, cheap to clone around in tests.
pub fn test_frame(w: u32, h: u32) -> RgbImage {
    RgbImage::from_pixel(w, h, image::Rgb([128, 128, 128]))
}

impl ScriptedFrameSource {
    pub fn new(script: Vec<Scripted>) -> Self {
        ScriptedFrameSource {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            fallback: test_frame(64, 36),
        }
    }

    /// Always succeeds with the fallback frame.
    pub fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    /// The URLs passed to `grab_frame`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn grab_frame(
        &self,
        url: &str,
        _connect_timeout: Duration,
        _read_timeout: Duration,
    ) -> Result<RgbImage> {
        self.calls.lock().push(url.to_string());
        let next = self.script.lock().pop_front();
        match next {
            None => Ok(self.fallback.clone()),
            Some(Scripted::Frame(f)) => Ok(f),
            Some(Scripted::SlowFrame(f, delay)) => {
                tokio::time::sleep(delay).await;
                Ok(f)
            }
            Some(Scripted::Transport(msg)) => Err(Error::Transport(msg)),
            Some(Scripted::Decode(msg)) => Err(Error::Decode(msg)),
            Some(Scripted::Timeout) => Err(Error::Timeout),
        }
    }
}
