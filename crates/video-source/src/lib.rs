//! Pull-based video source abstraction for network cameras.
//!
//! The engine owns the read cadence, so sources expose a blocking
//! [`VideoSource::read`] instead of pushing frames over a channel. The
//! OpenCV/FFmpeg implementation lives behind the `opencv-backend` feature to
//! keep the default build free of native dependencies.

use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "opencv-backend")]
mod opencv_source;

#[cfg(feature = "opencv-backend")]
pub use opencv_source::OpenCvSource;

/// Raw BGR frame captured from a video source.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl Frame {
    /// Number of pixels in the frame.
    pub fn pixel_count(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize)
    }

    /// Whether the payload length matches the advertised dimensions.
    pub fn is_complete(&self) -> bool {
        match self.format {
            FrameFormat::Bgr8 => self.data.len() == self.pixel_count() * 3,
        }
    }
}

/// RTSP transport negotiated with the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Udp,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Tcp => "tcp",
            TransportMode::Udp => "udp",
        }
    }
}

/// Typed per-connection stream options.
///
/// Passed to the source on every connection attempt; there is no ambient
/// process-wide configuration beyond what the backend derives from this
/// struct at open time.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    /// Decoder-side frame queue depth requested from the backend.
    pub buffer_depth: i32,
    pub transport: TransportMode,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 15.0,
            buffer_depth: 3,
            transport: TransportMode::Tcp,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamOptions {
    /// Target interval between frames at the configured rate.
    pub fn frame_interval(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.fps)
        } else {
            Duration::from_millis(66)
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("timed out opening video source {uri:?} after {timeout:?}")]
    OpenTimeout { uri: String, timeout: Duration },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("video source is closed")]
    Closed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A connected camera transport the engine pulls frames from.
///
/// Implementations surface read failures as [`CaptureError::Read`]; they never
/// panic across the trait boundary. `read` blocks until a frame arrives, the
/// backend read timeout elapses, or the transport fails.
pub trait VideoSource: Send {
    fn read(&mut self) -> Result<Frame, CaptureError>;
    fn is_open(&self) -> bool;
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_completeness_tracks_dimensions() {
        let frame = Frame {
            data: vec![0u8; 4 * 2 * 3],
            width: 4,
            height: 2,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        assert!(frame.is_complete());

        let truncated = Frame {
            data: vec![0u8; 5],
            ..frame
        };
        assert!(!truncated.is_complete());
    }

    #[test]
    fn frame_interval_follows_fps() {
        let opts = StreamOptions {
            fps: 20.0,
            ..StreamOptions::default()
        };
        assert_eq!(opts.frame_interval(), Duration::from_millis(50));
    }
}
