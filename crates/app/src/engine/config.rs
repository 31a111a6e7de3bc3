//! Typed camera configuration with validation and JSON loading.
//!
//! Invalid combinations are rejected when the configuration is constructed or
//! replaced; a running session keeps its previous configuration when an
//! update fails validation.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_source::{StreamOptions, TransportMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "recovery_threshold ({recovery}) must be greater than visibility_threshold ({visibility})"
    )]
    ThresholdOrder { visibility: f64, recovery: f64 },
    #[error("ROI {name:?}: {reason}")]
    InvalidRoi { name: String, reason: String },
    #[error("stream settings: {0}")]
    InvalidStream(String),
    #[error("{0}")]
    InvalidValue(String),
}

/// Named analysis rectangle with a real-world reference distance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoiRegion {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Reference distance in meters from the camera to this landmark.
    #[serde(default = "default_roi_distance")]
    pub distance: f64,
}

fn default_roi_distance() -> f64 {
    100.0
}

/// Pixel-space ROI rectangle, clamped to frame bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl RoiRegion {
    pub fn validate(&self, normalized: bool) -> Result<(), ConfigError> {
        let err = |reason: &str| ConfigError::InvalidRoi {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(err("name must not be empty"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(err("width and height must be positive"));
        }
        if self.x < 0.0 || self.y < 0.0 {
            return Err(err("origin must not be negative"));
        }
        if normalized {
            let in_unit = |v: f64| (0.0..=1.0).contains(&v);
            if !(in_unit(self.x) && in_unit(self.y) && in_unit(self.width) && in_unit(self.height))
            {
                return Err(err("normalized coordinates must lie in [0, 1]"));
            }
        }
        if self.distance < 0.0 {
            return Err(err("distance must not be negative"));
        }
        Ok(())
    }

    /// Resolve to a pixel rectangle within a `frame_w` x `frame_h` frame.
    pub fn to_pixel_rect(&self, normalized: bool, frame_w: usize, frame_h: usize) -> PixelRect {
        let (mut x, mut y, mut w, mut h) = if normalized {
            (
                (self.x * frame_w as f64) as usize,
                (self.y * frame_h as f64) as usize,
                (self.width * frame_w as f64) as usize,
                (self.height * frame_h as f64) as usize,
            )
        } else {
            (
                self.x as usize,
                self.y as usize,
                self.width as usize,
                self.height as usize,
            )
        };
        x = x.min(frame_w.saturating_sub(1));
        y = y.min(frame_h.saturating_sub(1));
        w = w.clamp(1, frame_w - x);
        h = h.clamp(1, frame_h - y);
        PixelRect {
            x,
            y,
            width: w,
            height: h,
        }
    }
}

/// Stream negotiation parameters, mirroring the shape of the JSON config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub buffer_size: i32,
    pub rtsp_transport: String,
    pub connection_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 15.0,
            buffer_size: 3,
            rtsp_transport: "tcp".to_string(),
            connection_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

impl StreamSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width <= 0 || self.height <= 0 {
            return Err(ConfigError::InvalidStream(
                "width and height must be positive".to_string(),
            ));
        }
        if self.fps <= 0.0 {
            return Err(ConfigError::InvalidStream("fps must be positive".to_string()));
        }
        self.transport()?;
        Ok(())
    }

    pub fn transport(&self) -> Result<TransportMode, ConfigError> {
        match self.rtsp_transport.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportMode::Tcp),
            "udp" => Ok(TransportMode::Udp),
            other => Err(ConfigError::InvalidStream(format!(
                "unknown rtsp_transport {other:?} (expected \"tcp\" or \"udp\")"
            ))),
        }
    }

    pub fn to_options(&self) -> Result<StreamOptions, ConfigError> {
        self.validate()?;
        Ok(StreamOptions {
            width: self.width,
            height: self.height,
            fps: self.fps,
            buffer_depth: self.buffer_size,
            transport: self.transport()?,
            connect_timeout: Duration::from_secs(self.connection_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
        })
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.fps)
        } else {
            Duration::from_millis(66)
        }
    }
}

/// Complete configuration for one camera session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub name: String,
    pub rtsp_url: String,
    pub stream_settings: StreamSettings,

    /// Composite score below which visibility is classified Poor.
    pub visibility_threshold: f64,
    /// Composite score above which visibility is classified Good. Must be
    /// strictly greater than `visibility_threshold`.
    pub recovery_threshold: f64,
    /// Delta E above which a ROI counts as obscured.
    pub color_delta_threshold: f64,
    /// Luminance standard deviation below which a frame is corrupt.
    pub std_threshold: f64,
    /// Luminance-histogram standard deviation below which a frame is corrupt.
    pub hist_threshold: f64,

    pub roi_regions: Vec<RoiRegion>,
    /// Whether ROI coordinates are normalized to [0, 1] or absolute pixels.
    pub roi_normalized: bool,

    /// Valid frames used to learn each ROI's reference color.
    pub reference_frame_count: u32,
    /// Entries kept in the rolling visibility window.
    pub history_window: usize,

    pub max_connection_attempts: u32,
    pub max_consecutive_errors: u32,
    /// Consecutive corrupt frames tolerated before escalating to reconnect.
    pub max_corrupt_run: u32,
    pub reconnect_backoff_secs: f64,

    pub min_highlight_gap_secs: f64,
    pub post_roll_seconds: f64,

    pub analytics_refresh_interval_secs: f64,

    /// Root under which per-camera `recordings/` and `highlights/`
    /// directories are created.
    pub output_dir: PathBuf,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "camera".to_string(),
            rtsp_url: String::new(),
            stream_settings: StreamSettings::default(),
            visibility_threshold: 40.0,
            recovery_threshold: 60.0,
            color_delta_threshold: 10.0,
            std_threshold: 12.0,
            hist_threshold: 150.0,
            roi_regions: default_roi_regions(),
            roi_normalized: true,
            reference_frame_count: 10,
            history_window: 30,
            max_connection_attempts: 3,
            max_consecutive_errors: 5,
            max_corrupt_run: 30,
            reconnect_backoff_secs: 2.0,
            min_highlight_gap_secs: 30.0,
            post_roll_seconds: 5.0,
            analytics_refresh_interval_secs: 5.0,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Fallback ROI layout used when the configuration provides none.
pub fn default_roi_regions() -> Vec<RoiRegion> {
    let roi = |name: &str, x: f64, y: f64, distance: f64| RoiRegion {
        name: name.to_string(),
        x,
        y,
        width: 0.2,
        height: 0.2,
        distance,
    };
    vec![
        roi("top-left", 0.1, 0.1, 100.0),
        roi("top-right", 0.7, 0.1, 200.0),
        roi("center", 0.4, 0.4, 150.0),
        roi("bottom-left", 0.1, 0.7, 300.0),
        roi("bottom-right", 0.7, 0.7, 400.0),
    ]
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery_threshold <= self.visibility_threshold {
            return Err(ConfigError::ThresholdOrder {
                visibility: self.visibility_threshold,
                recovery: self.recovery_threshold,
            });
        }
        if self.color_delta_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "color_delta_threshold must be positive".to_string(),
            ));
        }
        if self.history_window == 0 {
            return Err(ConfigError::InvalidValue(
                "history_window must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(ConfigError::InvalidValue(
                "max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        self.stream_settings.validate()?;
        for roi in &self.roi_regions {
            roi.validate(self.roi_normalized)?;
        }
        Ok(())
    }

    /// Load and validate a configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Capacity of the short-term frame buffer: fps x 20 seconds.
    pub fn frame_buffer_capacity(&self) -> usize {
        ((self.stream_settings.fps * 20.0).round() as usize).max(1)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.output_dir.join("recordings").join(&self.name)
    }

    pub fn highlights_dir(&self) -> PathBuf {
        self.output_dir.join("highlights").join(&self.name)
    }
}
