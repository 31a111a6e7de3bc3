//! Per-frame visibility metrics and corruption classification.
//!
//! The corruption test runs before any metric is computed; corrupt frames are
//! counted by the caller but never reach the color reference tracker or the
//! running aggregates.

use std::collections::HashMap;

use video_source::Frame;

use crate::engine::{
    color::{mean_lab, ColorReferenceTracker},
    config::CameraConfig,
};

/// Delta E reported while the reference learning phase is incomplete.
const LEARNING_DEFAULT_DELTA: f64 = 10.0;

/// Floor applied to every sub-score so noisy inputs cannot collapse the
/// composite to zero.
const SUB_SCORE_FLOOR: f64 = 10.0;

/// Outcome of analyzing a single frame.
pub enum FrameAnalysis {
    Metrics(Measurements),
    Corrupted(CorruptionKind),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Frame dimensions do not match the negotiated stream resolution.
    DimensionMismatch,
    /// Mean pixel intensity below 1.0.
    NearBlack,
    /// Luminance standard deviation below the configured threshold.
    LowVariance,
    /// Luminance histogram too close to uniform.
    FlatHistogram,
}

impl CorruptionKind {
    pub fn label(self) -> &'static str {
        match self {
            CorruptionKind::DimensionMismatch => "dimension_mismatch",
            CorruptionKind::NearBlack => "near_black",
            CorruptionKind::LowVariance => "low_variance",
            CorruptionKind::FlatHistogram => "flat_histogram",
        }
    }
}

/// Raw measurements for one valid frame, before status classification.
#[derive(Clone, Debug)]
pub struct Measurements {
    /// Mean luminance, 0-255.
    pub brightness: f64,
    /// Luminance standard deviation.
    pub contrast: f64,
    /// Mean gradient magnitude scaled to 0-100.
    pub edge_score: f64,
    /// Laplacian-response variance scaled to 0-100.
    pub sharpness: f64,
    /// Delta E per configured ROI; empty while the tracker is learning.
    pub roi_deltas: HashMap<String, f64>,
    pub color_delta_avg: f64,
    /// Composite visibility score, 0-100.
    pub visibility_score: f64,
    pub timestamp_ms: i64,
}

/// Analyze one frame against the current configuration.
///
/// Updates `tracker` only for valid frames during the learning phase.
pub fn analyze(
    frame: &Frame,
    config: &CameraConfig,
    tracker: &mut ColorReferenceTracker,
) -> FrameAnalysis {
    let expected_w = config.stream_settings.width;
    let expected_h = config.stream_settings.height;
    if frame.width != expected_w || frame.height != expected_h || !frame.is_complete() {
        return FrameAnalysis::Corrupted(CorruptionKind::DimensionMismatch);
    }

    let plane = luminance_plane(frame);
    let (brightness, contrast) = mean_std(&plane);
    if brightness < 1.0 {
        return FrameAnalysis::Corrupted(CorruptionKind::NearBlack);
    }
    if contrast < config.std_threshold {
        return FrameAnalysis::Corrupted(CorruptionKind::LowVariance);
    }
    if histogram_std(&plane) < config.hist_threshold {
        return FrameAnalysis::Corrupted(CorruptionKind::FlatHistogram);
    }

    let width = frame.width as usize;
    let height = frame.height as usize;
    let edge_raw = mean_gradient(&plane, width, height);
    let edge_score = (edge_raw / 50.0 * 100.0).min(100.0);
    let sharpness = (laplacian_variance(&plane, width, height) / 500.0 * 100.0).min(100.0);
    let contrast_score = (contrast / 128.0 * 100.0).min(100.0);

    let mut roi_deltas = HashMap::new();
    for roi in &config.roi_regions {
        let rect = roi.to_pixel_rect(config.roi_normalized, width, height);
        let Some(lab) = mean_lab(frame, rect) else {
            continue;
        };
        if tracker.is_learning() {
            tracker.observe(&roi.name, lab);
        } else if let Some(delta) = tracker.delta(&roi.name, lab) {
            roi_deltas.insert(roi.name.clone(), delta);
        }
    }
    tracker.advance_frame();

    let color_delta_avg = if roi_deltas.is_empty() {
        LEARNING_DEFAULT_DELTA
    } else {
        roi_deltas.values().sum::<f64>() / roi_deltas.len() as f64
    };

    let visibility_score = composite_score(
        brightness_score(brightness),
        contrast_score,
        edge_score,
        delta_score(color_delta_avg),
    );

    FrameAnalysis::Metrics(Measurements {
        brightness,
        contrast,
        edge_score,
        sharpness,
        roi_deltas,
        color_delta_avg,
        visibility_score,
        timestamp_ms: frame.timestamp_ms,
    })
}

/// Bell-curve brightness sub-score penalizing under- and over-exposure.
pub fn brightness_score(luminance: f64) -> f64 {
    if luminance < 40.0 {
        luminance / 40.0 * 100.0
    } else if luminance > 200.0 {
        (255.0 - luminance) / 55.0 * 100.0
    } else {
        100.0
    }
}

/// Stepped conversion from average Delta E to a 0-100 sub-score.
pub fn delta_score(avg_delta: f64) -> f64 {
    if avg_delta <= 5.0 {
        100.0
    } else if avg_delta <= 10.0 {
        80.0
    } else if avg_delta <= 20.0 {
        60.0
    } else if avg_delta <= 30.0 {
        40.0
    } else {
        20.0
    }
}

/// Weighted composite with per-component floors.
pub fn composite_score(brightness: f64, contrast: f64, edge: f64, delta: f64) -> f64 {
    0.25 * brightness.max(SUB_SCORE_FLOOR)
        + 0.20 * contrast.max(SUB_SCORE_FLOOR)
        + 0.25 * edge.max(SUB_SCORE_FLOOR)
        + 0.30 * delta.max(SUB_SCORE_FLOOR)
}

/// BT.601 luminance plane of a BGR8 frame.
fn luminance_plane(frame: &Frame) -> Vec<u8> {
    frame
        .data
        .chunks_exact(3)
        .map(|px| {
            let lum = 0.114 * px[0] as f64 + 0.587 * px[1] as f64 + 0.299 * px[2] as f64;
            lum.round().min(255.0) as u8
        })
        .collect()
}

fn mean_std(plane: &[u8]) -> (f64, f64) {
    if plane.is_empty() {
        return (0.0, 0.0);
    }
    let n = plane.len() as f64;
    let mean = plane.iter().map(|&v| v as f64).sum::<f64>() / n;
    let variance = plane
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

/// Standard deviation of the 256-bin luminance histogram. Decoder garbage
/// tends to spread uniformly across bins, collapsing this value.
fn histogram_std(plane: &[u8]) -> f64 {
    let mut bins = [0u32; 256];
    for &v in plane {
        bins[v as usize] += 1;
    }
    let mean = plane.len() as f64 / 256.0;
    let variance = bins
        .iter()
        .map(|&count| {
            let d = count as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / 256.0;
    variance.sqrt()
}

/// Mean Sobel gradient magnitude (equal horizontal/vertical weight) over the
/// frame interior.
fn mean_gradient(plane: &[u8], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }
    let at = |x: usize, y: usize| plane[y * width + x] as f64;
    let mut sum = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            sum += 0.5 * gx.abs() + 0.5 * gy.abs();
        }
    }
    sum / (((width - 2) * (height - 2)) as f64)
}

/// Variance of the 4-neighbor Laplacian response over the frame interior.
fn laplacian_variance(plane: &[u8], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }
    let at = |x: usize, y: usize| plane[y * width + x] as f64;
    let n = ((width - 2) * (height - 2)) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / n;
    sum_sq / n - mean * mean
}
