//! Highlight-clip and manual-recording writers.
//!
//! Trigger decisions run on the capture thread; clip materialization runs on
//! a dedicated writer thread fed by a bounded channel so the capture loop
//! never blocks on disk I/O. Clips are MJPEG files (concatenated JPEG
//! frames) with a JSON sidecar marker.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};
use serde::Serialize;
use tracing::{error, info, warn};
use video_source::Frame;

use crate::engine::{
    config::CameraConfig,
    data::{FrameMetrics, VisibilityStatus},
    telemetry,
};

const WRITER_QUEUE_DEPTH: usize = 64;
const JPEG_QUALITY: u8 = 85;
/// Poor visibility must persist this long before a highlight triggers.
const SUSTAIN_DURATION: Duration = Duration::from_secs(2);

/// A triggered highlight; immutable once created.
#[derive(Clone, Debug, Serialize)]
pub struct HighlightEvent {
    pub camera_id: String,
    pub triggered_at_ms: i64,
    pub metrics: FrameMetrics,
    pub output_path: PathBuf,
}

/// Sidecar marker written next to each finished highlight clip.
#[derive(Debug, Serialize)]
struct HighlightMarker<'a> {
    camera_id: &'a str,
    trigger_time: String,
    duration_seconds: f64,
    frames_written: u64,
    metrics: &'a FrameMetrics,
}

enum WriterJob {
    OpenHighlight {
        event: Box<HighlightEvent>,
        seed: Vec<Frame>,
    },
    HighlightFrame(Frame),
    CloseHighlight,
    OpenRecording {
        path: PathBuf,
    },
    RecordFrame(Frame),
    CloseRecording,
}

enum ClipState {
    Idle,
    /// A highlight clip is open. The deadline is armed when visibility
    /// recovers and cleared if it degrades again before the post-roll ends.
    Active {
        post_roll_deadline: Option<Instant>,
    },
}

/// Capture-thread side of highlight recording.
pub struct HighlightRecorder {
    camera_id: String,
    highlights_dir: PathBuf,
    recordings_dir: PathBuf,
    tx: Sender<WriterJob>,
    worker: Option<thread::JoinHandle<()>>,
    state: ClipState,
    poor_since: Option<Instant>,
    last_highlight: Option<Instant>,
    last_highlight_ms: Option<i64>,
    recording: bool,
}

impl HighlightRecorder {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let highlights_dir = config.highlights_dir();
        let recordings_dir = config.recordings_dir();
        fs::create_dir_all(&highlights_dir)
            .with_context(|| format!("failed to create {}", highlights_dir.display()))?;
        fs::create_dir_all(&recordings_dir)
            .with_context(|| format!("failed to create {}", recordings_dir.display()))?;

        let (tx, rx) = bounded::<WriterJob>(WRITER_QUEUE_DEPTH);
        let worker = telemetry::spawn_thread("clip-writer", move || {
            let mut writer = ClipWriter::default();
            for job in rx {
                writer.handle(job);
            }
            writer.finish();
        })
        .context("failed to spawn clip writer thread")?;

        Ok(Self {
            camera_id: config.name.clone(),
            highlights_dir,
            recordings_dir,
            tx,
            worker: Some(worker),
            state: ClipState::Idle,
            poor_since: None,
            last_highlight: None,
            last_highlight_ms: None,
            recording: false,
        })
    }

    pub fn is_clipping(&self) -> bool {
        matches!(self.state, ClipState::Active { .. })
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn last_highlight_ms(&self) -> Option<i64> {
        self.last_highlight_ms
    }

    /// Observe one frame's metrics and decide whether a highlight triggers.
    ///
    /// Returns the event when a new clip should start; the caller seeds it
    /// with the frame buffer via [`HighlightRecorder::begin_clip`].
    pub fn on_metrics(
        &mut self,
        metrics: &FrameMetrics,
        config: &CameraConfig,
        now: Instant,
    ) -> Option<HighlightEvent> {
        let poor = metrics.visibility_status == VisibilityStatus::Poor;
        if poor {
            self.poor_since.get_or_insert(now);
        } else {
            self.poor_since = None;
        }

        match &mut self.state {
            ClipState::Active { post_roll_deadline } => {
                if poor {
                    *post_roll_deadline = None;
                } else {
                    let deadline = *post_roll_deadline
                        .get_or_insert(now + Duration::from_secs_f64(config.post_roll_seconds));
                    if now >= deadline {
                        self.send(WriterJob::CloseHighlight);
                        self.state = ClipState::Idle;
                    }
                }
                None
            }
            ClipState::Idle => {
                let sustained = self
                    .poor_since
                    .is_some_and(|since| now.duration_since(since) >= SUSTAIN_DURATION);
                if !sustained {
                    return None;
                }
                self.trigger(metrics, config, now, metrics.timestamp_ms)
            }
        }
    }

    /// Manually trigger a highlight (dashboard boundary) stamped with the
    /// caller's trigger time. Skips the sustain requirement but still honors
    /// the inter-highlight gap.
    pub fn trigger_manual(
        &mut self,
        metrics: &FrameMetrics,
        config: &CameraConfig,
        now: Instant,
        timestamp_ms: i64,
    ) -> Option<HighlightEvent> {
        if self.is_clipping() {
            return None;
        }
        self.trigger(metrics, config, now, timestamp_ms)
    }

    fn trigger(
        &mut self,
        metrics: &FrameMetrics,
        config: &CameraConfig,
        now: Instant,
        triggered_at_ms: i64,
    ) -> Option<HighlightEvent> {
        let gap = Duration::from_secs_f64(config.min_highlight_gap_secs);
        let gap_ok = self
            .last_highlight
            .map_or(true, |last| now.duration_since(last) >= gap);
        if !gap_ok {
            // Rate-limited: a no-op, not an error.
            return None;
        }

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let output_path = self.highlights_dir.join(format!("highlight_{stamp}.mjpeg"));
        let event = HighlightEvent {
            camera_id: self.camera_id.clone(),
            triggered_at_ms,
            metrics: metrics.clone(),
            output_path,
        };
        self.last_highlight = Some(now);
        self.last_highlight_ms = Some(triggered_at_ms);
        metrics::counter!("viscam_highlights_total").increment(1);
        info!(
            camera = %self.camera_id,
            score = event.metrics.visibility_score,
            "highlight triggered"
        );
        Some(event)
    }

    /// Open the clip on the writer thread, seeded with buffered frames
    /// (oldest first).
    pub fn begin_clip(&mut self, event: HighlightEvent, seed: Vec<Frame>) {
        self.state = ClipState::Active {
            post_roll_deadline: None,
        };
        if !self.send(WriterJob::OpenHighlight {
            event: Box::new(event),
            seed,
        }) {
            // Writer backlogged; abandon the clip but keep the rate limit.
            self.state = ClipState::Idle;
        }
    }

    /// Forward a live frame to any open clip or recording. Never blocks.
    pub fn push_frame(&mut self, frame: &Frame) {
        if self.is_clipping() {
            self.try_send(WriterJob::HighlightFrame(frame.clone()));
        }
        if self.recording {
            self.try_send(WriterJob::RecordFrame(frame.clone()));
        }
    }

    pub fn start_recording(&mut self) -> Option<PathBuf> {
        if self.recording {
            return None;
        }
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = self.recordings_dir.join(format!("{stamp}.mjpeg"));
        if self.send(WriterJob::OpenRecording { path: path.clone() }) {
            self.recording = true;
            info!(camera = %self.camera_id, path = %path.display(), "recording started");
            Some(path)
        } else {
            None
        }
    }

    pub fn stop_recording(&mut self) -> bool {
        if !self.recording {
            return false;
        }
        self.recording = false;
        self.send(WriterJob::CloseRecording);
        info!(camera = %self.camera_id, "recording stopped");
        true
    }

    fn send(&self, job: WriterJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(camera = %self.camera_id, "clip writer backlogged, dropping job");
                metrics::counter!("viscam_writer_dropped_jobs_total").increment(1);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                error!(camera = %self.camera_id, "clip writer thread is gone");
                false
            }
        }
    }

    fn try_send(&self, job: WriterJob) {
        let _ = self.send(job);
    }

    /// Close any open artifacts and join the writer thread.
    pub fn shutdown(mut self) {
        if self.is_clipping() {
            self.try_send(WriterJob::CloseHighlight);
        }
        if self.recording {
            self.try_send(WriterJob::CloseRecording);
        }
        drop(self.tx);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct OpenClip {
    file: BufWriter<File>,
    path: PathBuf,
    frames_written: u64,
    opened_at: Instant,
    event: Option<Box<HighlightEvent>>,
}

/// Writer-thread state: at most one highlight clip and one manual recording
/// open at a time.
#[derive(Default)]
struct ClipWriter {
    highlight: Option<OpenClip>,
    recording: Option<OpenClip>,
}

impl ClipWriter {
    fn handle(&mut self, job: WriterJob) {
        match job {
            WriterJob::OpenHighlight { event, seed } => {
                match open_clip(event.output_path.clone(), Some(event)) {
                    Ok(mut clip) => {
                        for frame in &seed {
                            append_frame(&mut clip, frame);
                        }
                        self.highlight = Some(clip);
                    }
                    Err(err) => error!("failed to open highlight clip: {err:#}"),
                }
            }
            WriterJob::HighlightFrame(frame) => {
                if let Some(clip) = self.highlight.as_mut() {
                    append_frame(clip, &frame);
                }
            }
            WriterJob::CloseHighlight => {
                if let Some(clip) = self.highlight.take() {
                    close_highlight(clip);
                }
            }
            WriterJob::OpenRecording { path } => match open_clip(path, None) {
                Ok(clip) => self.recording = Some(clip),
                Err(err) => error!("failed to open recording: {err:#}"),
            },
            WriterJob::RecordFrame(frame) => {
                if let Some(clip) = self.recording.as_mut() {
                    append_frame(clip, &frame);
                }
            }
            WriterJob::CloseRecording => {
                if let Some(mut clip) = self.recording.take() {
                    if let Err(err) = clip.file.flush() {
                        error!("failed to flush recording: {err}");
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Some(clip) = self.highlight.take() {
            close_highlight(clip);
        }
        if let Some(mut clip) = self.recording.take() {
            let _ = clip.file.flush();
        }
    }
}

fn open_clip(path: PathBuf, event: Option<Box<HighlightEvent>>) -> Result<OpenClip> {
    let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    Ok(OpenClip {
        file: BufWriter::new(file),
        path,
        frames_written: 0,
        opened_at: Instant::now(),
        event,
    })
}

fn append_frame(clip: &mut OpenClip, frame: &Frame) {
    match encode_jpeg(frame) {
        Ok(jpeg) => {
            if let Err(err) = clip.file.write_all(&jpeg) {
                error!("failed to append frame to {}: {err}", clip.path.display());
                return;
            }
            clip.frames_written += 1;
        }
        Err(err) => error!("jpeg encode failed: {err:#}"),
    }
}

fn close_highlight(mut clip: OpenClip) {
    if let Err(err) = clip.file.flush() {
        error!("failed to flush {}: {err}", clip.path.display());
    }
    let Some(event) = clip.event.take() else {
        return;
    };
    let trigger_time = Utc
        .timestamp_millis_opt(event.triggered_at_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    let marker = HighlightMarker {
        camera_id: &event.camera_id,
        trigger_time,
        duration_seconds: clip.opened_at.elapsed().as_secs_f64(),
        frames_written: clip.frames_written,
        metrics: &event.metrics,
    };
    let marker_path = clip.path.with_extension("json");
    match serde_json::to_vec_pretty(&marker) {
        Ok(bytes) => {
            if let Err(err) = fs::write(&marker_path, bytes) {
                error!("failed to write marker {}: {err}", marker_path.display());
            } else {
                info!(
                    path = %clip.path.display(),
                    frames = clip.frames_written,
                    "highlight clip closed"
                );
            }
        }
        Err(err) => error!("failed to serialize highlight marker: {err}"),
    }
}

/// Encode a BGR8 frame as JPEG.
fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(
            &rgb,
            frame.width as u32,
            frame.height as u32,
            ExtendedColorType::Rgb8,
        )
        .context("jpeg encoding failed")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_source::FrameFormat;

    fn test_config(dir: &std::path::Path) -> CameraConfig {
        CameraConfig {
            name: "test-cam".to_string(),
            output_dir: dir.to_path_buf(),
            min_highlight_gap_secs: 30.0,
            post_roll_seconds: 2.0,
            ..CameraConfig::default()
        }
    }

    fn metrics(status: VisibilityStatus) -> FrameMetrics {
        FrameMetrics {
            brightness: 80.0,
            contrast: 20.0,
            edge_score: 30.0,
            sharpness: 25.0,
            color_delta_avg: 18.0,
            visibility_score: 32.0,
            visibility_status: status,
            visibility_distance_m: Some(120.0),
            alert_message: None,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    fn frame() -> Frame {
        Frame {
            data: vec![128u8; 8 * 8 * 3],
            width: 8,
            height: 8,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn sustained_poor_visibility_triggers_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut recorder = HighlightRecorder::new(&config).unwrap();
        let poor = metrics(VisibilityStatus::Poor);
        let t0 = Instant::now();

        assert!(recorder.on_metrics(&poor, &config, t0).is_none());
        assert!(recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(1))
            .is_none());
        let event = recorder
            .on_metrics(&poor, &config, t0 + Duration::from_millis(2_500))
            .expect("2.5s of poor visibility must trigger");
        recorder.begin_clip(event, vec![frame()]);

        // Still poor: no second trigger while the clip is open.
        assert!(recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(4))
            .is_none());
        recorder.shutdown();
    }

    #[test]
    fn highlights_are_rate_limited_by_min_gap() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut recorder = HighlightRecorder::new(&config).unwrap();
        let poor = metrics(VisibilityStatus::Poor);
        let good = metrics(VisibilityStatus::Good);
        let t0 = Instant::now();

        recorder.on_metrics(&poor, &config, t0);
        let event = recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(3))
            .expect("first trigger");
        recorder.begin_clip(event, Vec::new());

        // Recover and let the post-roll close the clip.
        recorder.on_metrics(&good, &config, t0 + Duration::from_secs(4));
        recorder.on_metrics(&good, &config, t0 + Duration::from_secs(7));
        assert!(!recorder.is_clipping());

        // Second candidate inside the 30s gap: suppressed.
        recorder.on_metrics(&poor, &config, t0 + Duration::from_secs(8));
        assert!(recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(11))
            .is_none());

        // Once the gap elapses the still-sustained run triggers again.
        let second = recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(40))
            .expect("second trigger after the gap");
        assert!(second
            .output_path
            .to_string_lossy()
            .contains("highlight_"));
        // The fresh trigger re-arms the rate limit immediately.
        assert!(recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(43))
            .is_none());
        recorder.shutdown();
    }

    #[test]
    fn poor_again_during_post_roll_keeps_the_clip_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut recorder = HighlightRecorder::new(&config).unwrap();
        let poor = metrics(VisibilityStatus::Poor);
        let good = metrics(VisibilityStatus::Good);
        let t0 = Instant::now();

        recorder.on_metrics(&poor, &config, t0);
        let event = recorder
            .on_metrics(&poor, &config, t0 + Duration::from_secs(3))
            .unwrap();
        recorder.begin_clip(event, Vec::new());

        // Recovery arms the post-roll, relapse clears it.
        recorder.on_metrics(&good, &config, t0 + Duration::from_secs(4));
        recorder.on_metrics(&poor, &config, t0 + Duration::from_secs(5));
        recorder.on_metrics(&good, &config, t0 + Duration::from_secs(6));
        // Deadline re-armed at t+6s; one second in, the clip is still open.
        recorder.on_metrics(&good, &config, t0 + Duration::from_secs(7));
        assert!(recorder.is_clipping());
        recorder.shutdown();
    }

    #[test]
    fn clip_and_marker_land_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut recorder = HighlightRecorder::new(&config).unwrap();
        let poor = metrics(VisibilityStatus::Poor);
        let t0 = Instant::now();

        let event = recorder
            .trigger_manual(&poor, &config, t0, poor.timestamp_ms)
            .expect("manual trigger");
        assert_eq!(event.triggered_at_ms, poor.timestamp_ms);
        let clip_path = event.output_path.clone();
        recorder.begin_clip(event, vec![frame(), frame()]);
        recorder.push_frame(&frame());
        recorder.shutdown();

        let clip_bytes = fs::read(&clip_path).unwrap();
        assert!(!clip_bytes.is_empty());
        // MJPEG: the stream starts with a JPEG SOI marker.
        assert_eq!(&clip_bytes[..2], &[0xFF, 0xD8]);

        let marker_path = clip_path.with_extension("json");
        let marker: serde_json::Value =
            serde_json::from_slice(&fs::read(marker_path).unwrap()).unwrap();
        assert_eq!(marker["camera_id"], "test-cam");
        assert_eq!(marker["frames_written"], 3);
        assert!(marker["metrics"]["visibility_score"].as_f64().is_some());
    }

    #[test]
    fn manual_recording_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut recorder = HighlightRecorder::new(&config).unwrap();

        let path = recorder.start_recording().expect("recording starts");
        assert!(recorder.is_recording());
        assert!(recorder.start_recording().is_none());
        recorder.push_frame(&frame());
        recorder.push_frame(&frame());
        assert!(recorder.stop_recording());
        recorder.shutdown();

        let bytes = fs::read(path).unwrap();
        assert!(!bytes.is_empty());
    }
}
