//! Shared engine data types: per-frame metrics, status snapshots, and the
//! bounded frame buffer seeding highlight clips.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use video_source::Frame;

/// Visibility classification driven by the hysteresis rule in the estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VisibilityStatus {
    Good,
    Moderate,
    Poor,
    Unknown,
}

impl VisibilityStatus {
    pub fn label(self) -> &'static str {
        match self {
            VisibilityStatus::Good => "Good",
            VisibilityStatus::Moderate => "Moderate",
            VisibilityStatus::Poor => "Poor",
            VisibilityStatus::Unknown => "Unknown",
        }
    }
}

/// Complete metrics for one processed frame.
///
/// Published as a whole value; readers never observe a partially updated
/// snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct FrameMetrics {
    /// Mean luminance, 0-255.
    pub brightness: f64,
    /// Luminance standard deviation.
    pub contrast: f64,
    /// Mean gradient magnitude scaled to 0-100.
    pub edge_score: f64,
    /// Laplacian-response variance scaled to 0-100. Reported only; not part
    /// of the composite score.
    pub sharpness: f64,
    /// Average Delta E across configured ROIs.
    pub color_delta_avg: f64,
    /// Composite visibility score, 0-100.
    pub visibility_score: f64,
    pub visibility_status: VisibilityStatus,
    /// Estimated visibility distance in meters, when ROI state supports one.
    pub visibility_distance_m: Option<f64>,
    pub alert_message: Option<String>,
    pub timestamp_ms: i64,
}

/// One entry of the rolling visibility window.
#[derive(Clone, Debug, Serialize)]
pub struct VisibilityHistoryEntry {
    pub timestamp_ms: i64,
    pub visibility_score: f64,
    pub visibility_status: VisibilityStatus,
    pub brightness: f64,
    pub color_delta_avg: f64,
    pub visibility_distance_m: Option<f64>,
}

/// Connection/recording snapshot served to the dashboard boundary.
#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub connected: bool,
    pub recording: bool,
    pub connection_attempts: u32,
    pub last_highlight_ms: Option<i64>,
    pub metrics: Option<FrameMetrics>,
}

/// Full analytics view of a camera session.
#[derive(Clone, Debug, Serialize)]
pub struct CameraData {
    pub camera_id: String,
    pub connected: bool,
    pub recording: bool,
    pub frames_processed: u64,
    pub corrupt_frames: u64,
    pub metrics: Option<FrameMetrics>,
    pub history: Vec<VisibilityHistoryEntry>,
    pub color_deltas: HashMap<String, f64>,
}

/// The most recent frame available from a session.
///
/// `LastGood` frames are retained for presentation and recording across read
/// failures but are never treated as live input for analytics.
#[derive(Clone)]
pub enum LatestFrame {
    Live(Frame),
    LastGood(Frame),
}

impl LatestFrame {
    pub fn frame(&self) -> &Frame {
        match self {
            LatestFrame::Live(frame) | LatestFrame::LastGood(frame) => frame,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, LatestFrame::Live(_))
    }
}

/// Bounded ring of recently processed frames, oldest evicted on overflow.
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Clone the buffered frames, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
