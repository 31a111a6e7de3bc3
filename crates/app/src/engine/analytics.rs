//! Throttled visibility analytics: periodic samples plus daily rollups.
//!
//! The reporter is fed every processed frame but only emits a sample when the
//! refresh interval has elapsed, keeping downstream sinks cheap at full frame
//! rate. Sinks are injected so tests and alternate backends plug in without
//! touching the capture path.

use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::info;

use crate::engine::data::{FrameMetrics, VisibilityStatus};

/// One periodic visibility observation.
#[derive(Clone, Debug, Serialize)]
pub struct VisibilitySample {
    pub camera_id: String,
    pub timestamp_ms: i64,
    pub visibility_score: f64,
    pub visibility_status: VisibilityStatus,
    pub brightness: f64,
    pub color_delta_avg: f64,
    pub visibility_distance_m: Option<f64>,
}

/// Aggregate of one camera-day, emitted when the day rolls over.
#[derive(Clone, Debug, Serialize)]
pub struct DailyRollup {
    pub camera_id: String,
    pub date: NaiveDate,
    pub frames: u64,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub poor_frames: u64,
    pub corrupt_frames: u64,
    pub alerts: u64,
}

/// Destination for analytics output.
pub trait AnalyticsSink: Send {
    fn record_sample(&mut self, sample: &VisibilitySample);
    fn record_rollup(&mut self, rollup: &DailyRollup);
}

/// Default sink: structured logs plus Prometheus gauges.
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn record_sample(&mut self, sample: &VisibilitySample) {
        info!(
            camera = %sample.camera_id,
            score = sample.visibility_score,
            status = sample.visibility_status.label(),
            brightness = sample.brightness,
            delta = sample.color_delta_avg,
            "visibility sample"
        );
        let labels = [("camera", sample.camera_id.clone())];
        metrics::gauge!("viscam_visibility_score", &labels).set(sample.visibility_score);
        metrics::gauge!("viscam_brightness", &labels).set(sample.brightness);
        metrics::gauge!("viscam_color_delta_avg", &labels).set(sample.color_delta_avg);
        if let Some(distance) = sample.visibility_distance_m {
            metrics::gauge!("viscam_visibility_distance_m", &labels).set(distance);
        }
    }

    fn record_rollup(&mut self, rollup: &DailyRollup) {
        info!(
            camera = %rollup.camera_id,
            date = %rollup.date,
            frames = rollup.frames,
            avg_score = rollup.avg_score,
            min_score = rollup.min_score,
            max_score = rollup.max_score,
            poor_frames = rollup.poor_frames,
            corrupt_frames = rollup.corrupt_frames,
            alerts = rollup.alerts,
            "daily visibility rollup"
        );
    }
}

struct DayAccumulator {
    date: NaiveDate,
    frames: u64,
    score_sum: f64,
    min_score: f64,
    max_score: f64,
    poor_frames: u64,
    corrupt_frames: u64,
    alerts: u64,
}

impl DayAccumulator {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            frames: 0,
            score_sum: 0.0,
            min_score: f64::INFINITY,
            max_score: f64::NEG_INFINITY,
            poor_frames: 0,
            corrupt_frames: 0,
            alerts: 0,
        }
    }

    fn fold(&mut self, metrics: &FrameMetrics) {
        self.frames += 1;
        self.score_sum += metrics.visibility_score;
        self.min_score = self.min_score.min(metrics.visibility_score);
        self.max_score = self.max_score.max(metrics.visibility_score);
        if metrics.visibility_status == VisibilityStatus::Poor {
            self.poor_frames += 1;
        }
        if metrics.alert_message.is_some() {
            self.alerts += 1;
        }
    }

    fn finish(self, camera_id: &str) -> DailyRollup {
        DailyRollup {
            camera_id: camera_id.to_string(),
            date: self.date,
            frames: self.frames,
            avg_score: if self.frames > 0 {
                self.score_sum / self.frames as f64
            } else {
                0.0
            },
            min_score: self.min_score,
            max_score: self.max_score,
            poor_frames: self.poor_frames,
            corrupt_frames: self.corrupt_frames,
            alerts: self.alerts,
        }
    }
}

/// Per-camera analytics reporter with interval throttling.
pub struct AnalyticsReporter {
    camera_id: String,
    sink: Box<dyn AnalyticsSink>,
    interval: Duration,
    last_emit: Option<Instant>,
    day: Option<DayAccumulator>,
}

impl AnalyticsReporter {
    pub fn new(camera_id: String, interval: Duration, sink: Box<dyn AnalyticsSink>) -> Self {
        Self {
            camera_id,
            sink,
            interval,
            last_emit: None,
            day: None,
        }
    }

    /// Fold one frame's metrics in. Every frame contributes to the daily
    /// rollup; a sample is emitted at most once per refresh interval.
    pub fn observe(&mut self, metrics: &FrameMetrics, now: Instant) {
        self.roll_day(date_of(metrics.timestamp_ms));
        if let Some(day) = self.day.as_mut() {
            day.fold(metrics);
        }

        let due = self
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            self.sink.record_sample(&VisibilitySample {
                camera_id: self.camera_id.clone(),
                timestamp_ms: metrics.timestamp_ms,
                visibility_score: metrics.visibility_score,
                visibility_status: metrics.visibility_status,
                brightness: metrics.brightness,
                color_delta_avg: metrics.color_delta_avg,
                visibility_distance_m: metrics.visibility_distance_m,
            });
        }
    }

    /// Count a corrupt frame toward the daily rollup. Corrupt frames never
    /// contribute to the score aggregates.
    pub fn observe_corrupt(&mut self, timestamp_ms: i64) {
        self.roll_day(date_of(timestamp_ms));
        if let Some(day) = self.day.as_mut() {
            day.corrupt_frames += 1;
        }
    }

    /// Close the accumulating day when the date changes, or open the first
    /// one.
    fn roll_day(&mut self, date: NaiveDate) {
        match self.day.as_ref() {
            Some(day) if day.date == date => {}
            Some(_) => {
                if let Some(finished) = self.day.take() {
                    self.sink.record_rollup(&finished.finish(&self.camera_id));
                }
                self.day = Some(DayAccumulator::new(date));
            }
            None => self.day = Some(DayAccumulator::new(date)),
        }
    }

    /// Emit the pending rollup. Called at shutdown and on disconnect.
    pub fn flush(&mut self) {
        if let Some(day) = self.day.take() {
            if day.frames > 0 || day.corrupt_frames > 0 {
                self.sink.record_rollup(&day.finish(&self.camera_id));
            }
        }
    }
}

fn date_of(timestamp_ms: i64) -> NaiveDate {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.date_naive())
        .unwrap_or_default()
}
