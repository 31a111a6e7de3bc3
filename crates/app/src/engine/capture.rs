//! Camera session lifecycle: connection, the capture loop, supervision, and
//! the operations served to the dashboard boundary.
//!
//! Locking is split in two so slow device I/O never blocks readers: the
//! source lock covers the video device, the state lock covers analysis state
//! (frame buffer, reference tracker, estimator, recorder). The capture loop
//! takes them one at a time and never holds both.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use video_source::{CaptureError, StreamOptions, VideoSource};

use crate::engine::{
    analytics::{AnalyticsReporter, AnalyticsSink, LogSink},
    analyzer::{self, FrameAnalysis},
    color::ColorReferenceTracker,
    config::{CameraConfig, RoiRegion},
    data::{CameraData, CameraStatus, FrameBuffer, FrameMetrics, LatestFrame},
    estimator::VisibilityEstimator,
    recorder::HighlightRecorder,
    telemetry,
    watchdog::{self, RestartReason, SessionHealth, WatchdogState},
};

/// Supervisor poll interval between health checks.
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Extra slack on top of the stream read timeout before the watchdog flags
/// the capture loop as stalled.
const STALE_SLACK: Duration = Duration::from_secs(2);

/// Constructor for video sources, injected so tests and alternate backends
/// can substitute the device layer.
pub type SourceFactory =
    Arc<dyn Fn(&str, &StreamOptions) -> Result<Box<dyn VideoSource>, CaptureError> + Send + Sync>;

/// Analysis state guarded by the state lock.
struct AnalysisState {
    buffer: FrameBuffer,
    tracker: ColorReferenceTracker,
    estimator: VisibilityEstimator,
    latest: Option<LatestFrame>,
    metrics: Option<FrameMetrics>,
    roi_deltas: HashMap<String, f64>,
    recorder: Option<HighlightRecorder>,
    analytics: AnalyticsReporter,
}

struct Inner {
    config: Mutex<Arc<CameraConfig>>,
    source: Mutex<Option<Box<dyn VideoSource>>>,
    state: Mutex<AnalysisState>,
    watchdog: Arc<WatchdogState>,
    factory: SourceFactory,
    connected: AtomicBool,
    connection_attempts: AtomicU32,
    frames_processed: AtomicU64,
    corrupt_frames: AtomicU64,
}

/// Threads belonging to one connection.
struct SessionThreads {
    running: Arc<AtomicBool>,
    capture: thread::JoinHandle<()>,
    watchdog: thread::JoinHandle<()>,
}

/// One camera session: owns the source, the capture thread, and all derived
/// analysis state.
pub struct CaptureController {
    inner: Arc<Inner>,
    threads: Mutex<Option<SessionThreads>>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureController {
    pub fn new(config: CameraConfig, factory: SourceFactory) -> Result<Self> {
        Self::with_sink(config, factory, Box::new(LogSink))
    }

    pub fn with_sink(
        config: CameraConfig,
        factory: SourceFactory,
        sink: Box<dyn AnalyticsSink>,
    ) -> Result<Self> {
        config.validate().context("invalid camera configuration")?;
        let recorder = HighlightRecorder::new(&config)?;
        let analytics = AnalyticsReporter::new(
            config.name.clone(),
            Duration::from_secs_f64(config.analytics_refresh_interval_secs),
            sink,
        );
        let state = AnalysisState {
            buffer: FrameBuffer::new(config.frame_buffer_capacity()),
            tracker: ColorReferenceTracker::new(config.reference_frame_count),
            estimator: VisibilityEstimator::new(config.history_window),
            latest: None,
            metrics: None,
            roi_deltas: HashMap::new(),
            recorder: Some(recorder),
            analytics,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                config: Mutex::new(Arc::new(config)),
                source: Mutex::new(None),
                state: Mutex::new(state),
                watchdog: Arc::new(WatchdogState::new()),
                factory,
                connected: AtomicBool::new(false),
                connection_attempts: AtomicU32::new(0),
                frames_processed: AtomicU64::new(0),
                corrupt_frames: AtomicU64::new(0),
            }),
            threads: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn config(&self) -> Arc<CameraConfig> {
        self.inner.config()
    }

    /// Open the source and start the capture and watchdog threads.
    ///
    /// Retries up to `max_connection_attempts` with backoff before giving up.
    /// The threads mutex is held for the whole attempt so concurrent callers
    /// cannot race a second capture loop onto the same source.
    pub fn connect(&self) -> Result<()> {
        let mut threads = self.lock_threads();
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let config = self.config();
        let options = config
            .stream_settings
            .to_options()
            .context("invalid stream settings")?;
        let backoff = Duration::from_secs_f64(config.reconnect_backoff_secs);

        let mut last_err = None;
        for attempt in 1..=config.max_connection_attempts {
            self.inner.connection_attempts.fetch_add(1, Ordering::Relaxed);
            match (self.inner.factory)(&config.rtsp_url, &options) {
                Ok(source) => {
                    *self.inner.lock_source() = Some(source);
                    *threads = Some(self.spawn_threads(&config));
                    self.inner.connected.store(true, Ordering::SeqCst);
                    // The attempt counter resets only on success.
                    self.inner.connection_attempts.store(0, Ordering::Relaxed);
                    info!(camera = %config.name, attempt, "camera connected");
                    metrics::counter!("viscam_connects_total").increment(1);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        camera = %config.name,
                        attempt,
                        max = config.max_connection_attempts,
                        "connection attempt failed: {err}"
                    );
                    last_err = Some(err);
                    if attempt < config.max_connection_attempts {
                        thread::sleep(backoff);
                    }
                }
            }
        }
        metrics::counter!("viscam_connect_failures_total").increment(1);
        match last_err {
            Some(err) => Err(err).with_context(|| {
                format!(
                    "failed to connect to {} after {} attempts",
                    config.rtsp_url, config.max_connection_attempts
                )
            }),
            None => bail!("failed to connect to {}", config.rtsp_url),
        }
    }

    fn spawn_threads(&self, config: &CameraConfig) -> SessionThreads {
        let running = Arc::new(AtomicBool::new(true));
        let health = Arc::new(SessionHealth::new());

        let capture = {
            let inner = Arc::clone(&self.inner);
            let running = Arc::clone(&running);
            let shutdown = Arc::clone(&self.shutdown);
            let health = Arc::clone(&health);
            telemetry::spawn_thread("capture", move || {
                run_capture(&inner, &running, &shutdown, &health);
            })
            .expect("failed to spawn capture thread")
        };

        let stale_threshold = config.stream_settings.read_timeout() + STALE_SLACK;
        let watchdog = watchdog::spawn_watchdog(
            health,
            Arc::clone(&running),
            Arc::clone(&self.shutdown),
            Arc::clone(&self.inner.watchdog),
            stale_threshold,
        );

        SessionThreads {
            running,
            capture,
            watchdog,
        }
    }

    /// Stop the capture thread, close the source, and clear per-connection
    /// state. The visibility history and estimator survive a disconnect; the
    /// color references do not.
    pub fn disconnect(&self) {
        let threads = self.lock_threads().take();
        if let Some(threads) = threads {
            threads.running.store(false, Ordering::SeqCst);
            let config = self.config();
            let deadline = config.stream_settings.read_timeout() + STALE_SLACK;
            join_with_timeout(threads.capture, deadline, "capture");
            join_with_timeout(threads.watchdog, Duration::from_secs(2), "watchdog");
        }

        if let Some(mut source) = self.inner.lock_source().take() {
            source.close();
        }

        {
            let mut state = self.inner.lock_state();
            state.buffer.clear();
            state.tracker.reset();
            state.latest = None;
            state.roi_deltas.clear();
            state.analytics.flush();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        info!(camera = %self.config().name, "camera disconnected");
    }

    /// Full disconnect followed by a fresh connection attempt.
    pub fn reconnect(&self) -> Result<()> {
        self.disconnect();
        self.inner.watchdog.disarm();
        self.connect()
    }

    /// Supervise the session until shutdown: reconnect whenever the watchdog
    /// fires or the connection drops.
    pub fn run(&self) -> Result<()> {
        self.connect().context("initial connection failed")?;
        let backoff = Duration::from_secs_f64(self.config().reconnect_backoff_secs);

        while !self.shutdown.load(Ordering::SeqCst) {
            thread::sleep(SUPERVISOR_POLL_INTERVAL);
            if self.inner.watchdog.is_triggered() {
                let reason = self
                    .inner
                    .watchdog
                    .reason()
                    .map(RestartReason::label)
                    .unwrap_or("unknown");
                warn!(camera = %self.config().name, reason, "restarting camera session");
                metrics::counter!("viscam_session_restarts_total").increment(1);
                self.disconnect();
                self.inner.watchdog.disarm();
                thread::sleep(backoff);
            }
            if !self.inner.connected.load(Ordering::SeqCst)
                && !self.shutdown.load(Ordering::SeqCst)
            {
                if let Err(err) = self.connect() {
                    error!(camera = %self.config().name, "reconnect failed: {err:#}");
                    thread::sleep(backoff);
                }
            }
        }

        self.disconnect();
        Ok(())
    }

    /// Request shutdown from another thread (signal handler).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop everything and release the clip writer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.disconnect();
        let recorder = self.inner.lock_state().recorder.take();
        if let Some(recorder) = recorder {
            recorder.shutdown();
        }
    }

    /// The most recent frame, live when the last read succeeded.
    pub fn read_latest_frame(&self) -> Option<LatestFrame> {
        self.inner.lock_state().latest.clone()
    }

    pub fn get_status(&self) -> CameraStatus {
        let state = self.inner.lock_state();
        CameraStatus {
            connected: self.inner.connected.load(Ordering::SeqCst),
            recording: state
                .recorder
                .as_ref()
                .is_some_and(HighlightRecorder::is_recording),
            connection_attempts: self.inner.connection_attempts.load(Ordering::Relaxed),
            last_highlight_ms: state
                .recorder
                .as_ref()
                .and_then(HighlightRecorder::last_highlight_ms),
            metrics: state.metrics.clone(),
        }
    }

    pub fn get_camera_data(&self) -> CameraData {
        let config = self.config();
        let state = self.inner.lock_state();
        CameraData {
            camera_id: config.name.clone(),
            connected: self.inner.connected.load(Ordering::SeqCst),
            recording: state
                .recorder
                .as_ref()
                .is_some_and(HighlightRecorder::is_recording),
            frames_processed: self.inner.frames_processed.load(Ordering::Relaxed),
            corrupt_frames: self.inner.corrupt_frames.load(Ordering::Relaxed),
            metrics: state.metrics.clone(),
            history: state.estimator.history(),
            color_deltas: state.roi_deltas.clone(),
        }
    }

    /// Replace the ROI layout, with `normalized` telling how the new
    /// coordinates are interpreted. References relearn from scratch because
    /// the old ones describe regions that may no longer exist.
    pub fn set_roi_regions(&self, rois: Vec<RoiRegion>, normalized: bool) -> Result<()> {
        self.swap_config(|config| {
            config.roi_regions = rois.clone();
            config.roi_normalized = normalized;
        })?;
        self.inner.lock_state().tracker.reset();
        info!(camera = %self.config().name, count = rois.len(), "ROI layout replaced");
        Ok(())
    }

    /// Replace the visibility thresholds. A running session keeps its
    /// previous configuration when the new pair fails validation.
    pub fn set_thresholds(&self, visibility: f64, recovery: f64) -> Result<()> {
        self.swap_config(|config| {
            config.visibility_threshold = visibility;
            config.recovery_threshold = recovery;
        })?;
        info!(
            camera = %self.config().name,
            visibility, recovery,
            "visibility thresholds updated"
        );
        Ok(())
    }

    fn swap_config(&self, mutate: impl FnOnce(&mut CameraConfig)) -> Result<()> {
        let mut guard = self
            .inner
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut candidate = (**guard).clone();
        mutate(&mut candidate);
        candidate.validate().context("rejected config update")?;
        *guard = Arc::new(candidate);
        Ok(())
    }

    pub fn start_recording(&self) -> Result<std::path::PathBuf> {
        let mut state = self.inner.lock_state();
        let Some(recorder) = state.recorder.as_mut() else {
            bail!("session is shut down");
        };
        match recorder.start_recording() {
            Some(path) => Ok(path),
            None => bail!("recording already in progress"),
        }
    }

    pub fn stop_recording(&self) -> Result<()> {
        let mut state = self.inner.lock_state();
        let Some(recorder) = state.recorder.as_mut() else {
            bail!("session is shut down");
        };
        if recorder.stop_recording() {
            Ok(())
        } else {
            bail!("no recording in progress")
        }
    }

    /// Manually cut a highlight clip from the current buffer contents,
    /// stamped with the caller-supplied trigger time.
    pub fn create_highlight(&self, timestamp_ms: i64) -> Result<std::path::PathBuf> {
        let config = self.config();
        let mut state = self.inner.lock_state();
        let Some(metrics) = state.metrics.clone() else {
            bail!("no frames processed yet");
        };
        let seed = state.buffer.snapshot();
        let Some(recorder) = state.recorder.as_mut() else {
            bail!("session is shut down");
        };
        let Some(event) = recorder.trigger_manual(&metrics, &config, Instant::now(), timestamp_ms)
        else {
            bail!("highlight suppressed (clip in progress or within the minimum gap)");
        };
        let path = event.output_path.clone();
        recorder.begin_clip(event, seed);
        Ok(path)
    }
}

impl Inner {
    fn config(&self) -> Arc<CameraConfig> {
        Arc::clone(&self.config.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_source(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn VideoSource>>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AnalysisState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureController {
    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Option<SessionThreads>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_with_timeout(handle: thread::JoinHandle<()>, timeout: Duration, name: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} thread did not stop within {timeout:?}; detaching");
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    let _ = handle.join();
}

/// The capture loop body, paced to the configured frame rate.
fn run_capture(
    inner: &Inner,
    running: &AtomicBool,
    shutdown: &AtomicBool,
    health: &SessionHealth,
) {
    let mut consecutive_errors = 0u32;
    let mut corrupt_run = 0u32;
    while running.load(Ordering::Relaxed) && !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();
        let interval = inner.config().stream_settings.frame_interval();

        capture_tick(
            inner,
            running,
            health,
            &mut consecutive_errors,
            &mut corrupt_run,
        );

        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

/// One read-analyze-publish iteration.
fn capture_tick(
    inner: &Inner,
    running: &AtomicBool,
    health: &SessionHealth,
    consecutive_errors: &mut u32,
    corrupt_run: &mut u32,
) {
    let config = inner.config();
    let result = {
        let mut source = inner.lock_source();
        match source.as_mut() {
            Some(source) => source.read(),
            None => Err(CaptureError::Closed),
        }
    };
    health.beat();

    match result {
        Ok(frame) => {
            *consecutive_errors = 0;
            process_frame(inner, &config, frame, running, corrupt_run);
        }
        Err(err) => {
            *consecutive_errors += 1;
            metrics::counter!("viscam_read_errors_total").increment(1);
            warn!(
                camera = %config.name,
                run = *consecutive_errors,
                "frame read failed: {err}"
            );
            demote_latest(inner);
            if *consecutive_errors >= config.max_consecutive_errors {
                error!(
                    camera = %config.name,
                    "read failures exceeded limit; requesting reconnect"
                );
                inner.watchdog.arm(RestartReason::ReadErrors);
                inner.connected.store(false, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
            }
        }
    }
}

fn process_frame(
    inner: &Inner,
    config: &CameraConfig,
    frame: video_source::Frame,
    running: &AtomicBool,
    corrupt_run: &mut u32,
) {
    let mut state = inner.lock_state();
    let analysis = analyzer::analyze(&frame, config, &mut state.tracker);
    match analysis {
        FrameAnalysis::Metrics(m) => {
            *corrupt_run = 0;
            let update = state.estimator.update(&m, config);
            let frame_metrics = FrameMetrics {
                brightness: m.brightness,
                contrast: m.contrast,
                edge_score: m.edge_score,
                sharpness: m.sharpness,
                color_delta_avg: m.color_delta_avg,
                visibility_score: m.visibility_score,
                visibility_status: update.status,
                visibility_distance_m: update.distance_m,
                alert_message: update.alert.clone(),
                timestamp_ms: m.timestamp_ms,
            };
            if let Some(alert) = &update.alert {
                let was_alerting = state
                    .metrics
                    .as_ref()
                    .is_some_and(|prev| prev.alert_message.is_some());
                if !was_alerting {
                    warn!(camera = %config.name, "{alert}");
                    metrics::counter!("viscam_alerts_total").increment(1);
                }
            }

            state.buffer.push(frame.clone());
            state.latest = Some(LatestFrame::Live(frame.clone()));
            state.roi_deltas = m.roi_deltas;
            state.metrics = Some(frame_metrics.clone());
            inner.frames_processed.fetch_add(1, Ordering::Relaxed);

            let now = Instant::now();
            state.analytics.observe(&frame_metrics, now);
            let seed_needed = {
                let Some(recorder) = state.recorder.as_mut() else {
                    return;
                };
                recorder.on_metrics(&frame_metrics, config, now)
            };
            if let Some(event) = seed_needed {
                let seed = state.buffer.snapshot();
                if let Some(recorder) = state.recorder.as_mut() {
                    recorder.begin_clip(event, seed);
                }
            }
            if let Some(recorder) = state.recorder.as_mut() {
                recorder.push_frame(&frame);
            }
        }
        FrameAnalysis::Corrupted(kind) => {
            *corrupt_run += 1;
            inner.corrupt_frames.fetch_add(1, Ordering::Relaxed);
            state.analytics.observe_corrupt(frame.timestamp_ms);
            metrics::counter!("viscam_corrupt_frames_total", "kind" => kind.label())
                .increment(1);
            warn!(
                camera = %config.name,
                kind = kind.label(),
                run = *corrupt_run,
                "corrupt frame discarded"
            );
            drop(state);
            demote_latest(inner);
            if *corrupt_run >= config.max_corrupt_run {
                error!(
                    camera = %config.name,
                    "corrupt frame run exceeded limit; requesting reconnect"
                );
                inner.watchdog.arm(RestartReason::CorruptFrames);
                inner.connected.store(false, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Mark the latest frame as stale so consumers can tell presentation frames
/// from live input.
fn demote_latest(inner: &Inner) {
    let mut state = inner.lock_state();
    if matches!(state.latest, Some(LatestFrame::Live(_))) {
        if let Some(LatestFrame::Live(frame)) = state.latest.take() {
            state.latest = Some(LatestFrame::LastGood(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use video_source::{Frame, FrameFormat};

    /// Source that replays a script of read outcomes.
    struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Result<Frame, String>>>>,
        open: bool,
    }

    impl VideoSource for ScriptedSource {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(frame)) => Ok(frame),
                Some(Err(msg)) => Err(CaptureError::Read(msg)),
                None => Err(CaptureError::Read("script exhausted".to_string())),
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    fn scripted_factory(
        script: Arc<Mutex<VecDeque<Result<Frame, String>>>>,
        opens: Arc<AtomicUsize>,
    ) -> SourceFactory {
        Arc::new(move |_uri, _options| {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                script: Arc::clone(&script),
                open: true,
            }))
        })
    }

    fn test_config(dir: &std::path::Path) -> CameraConfig {
        let mut config = CameraConfig {
            name: "unit".to_string(),
            rtsp_url: "rtsp://unit.test/stream".to_string(),
            output_dir: dir.to_path_buf(),
            max_consecutive_errors: 5,
            reconnect_backoff_secs: 0.0,
            ..CameraConfig::default()
        };
        config.stream_settings.width = 64;
        config.stream_settings.height = 64;
        config
    }

    /// Blocky checkerboard that passes every corruption check under the
    /// default thresholds: strong contrast, concentrated histogram.
    fn textured_frame(ts: i64) -> Frame {
        let (w, h) = (64usize, 64usize);
        let mut data = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let v = if (x / 8 + y / 8) % 2 == 0 { 90 } else { 170 };
                let base = (y * w + x) * 3;
                data[base] = v;
                data[base + 1] = v;
                data[base + 2] = v;
            }
        }
        Frame {
            data,
            width: 64,
            height: 64,
            timestamp_ms: ts,
            format: FrameFormat::Bgr8,
        }
    }

    fn controller_with_script(
        dir: &std::path::Path,
        script: VecDeque<Result<Frame, String>>,
    ) -> (CaptureController, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let factory = scripted_factory(Arc::new(Mutex::new(script)), Arc::clone(&opens));
        let controller = CaptureController::new(test_config(dir), factory).unwrap();
        (controller, opens)
    }

    fn tick(controller: &CaptureController, errors: &mut u32, corrupt: &mut u32) -> bool {
        let running = AtomicBool::new(true);
        let health = SessionHealth::new();
        capture_tick(&controller.inner, &running, &health, errors, corrupt);
        running.load(Ordering::SeqCst)
    }

    fn open_source(controller: &CaptureController) {
        let config = controller.config();
        let options = config.stream_settings.to_options().unwrap();
        let source = (controller.inner.factory)(&config.rtsp_url, &options).unwrap();
        *controller.inner.lock_source() = Some(source);
    }

    #[test]
    fn valid_frames_publish_metrics_and_fill_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = (0..12).map(|i| Ok(textured_frame(i))).collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        let (mut errors, mut corrupt) = (0, 0);
        for _ in 0..12 {
            assert!(tick(&controller, &mut errors, &mut corrupt));
        }

        let data = controller.get_camera_data();
        assert_eq!(data.frames_processed, 12);
        assert_eq!(data.corrupt_frames, 0);
        let metrics = data.metrics.expect("metrics published");
        assert!(metrics.visibility_score > 0.0);
        assert_eq!(data.history.len(), 12);
        // First 10 frames learn references; frames 11+ report real deltas.
        assert!(!data.color_deltas.is_empty());
        assert!(controller
            .read_latest_frame()
            .is_some_and(|latest| latest.is_live()));
        controller.shutdown();
    }

    #[test]
    fn read_failure_run_requests_reconnect_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = std::iter::once(Ok(textured_frame(0)))
            .chain((0..6).map(|i| Err(format!("timeout {i}"))))
            .collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);
        controller.inner.connected.store(true, Ordering::SeqCst);

        let running = AtomicBool::new(true);
        let health = SessionHealth::new();
        let (mut errors, mut corrupt) = (0, 0);
        let mut stops = 0;
        for _ in 0..7 {
            let was_running = running.load(Ordering::SeqCst);
            capture_tick(
                &controller.inner,
                &running,
                &health,
                &mut errors,
                &mut corrupt,
            );
            if was_running && !running.load(Ordering::SeqCst) {
                stops += 1;
            }
        }

        // The 5th consecutive failure (max_consecutive_errors) stops the loop.
        assert_eq!(stops, 1);
        assert!(controller.inner.watchdog.is_triggered());
        assert_eq!(
            controller.inner.watchdog.reason(),
            Some(RestartReason::ReadErrors)
        );
        // The dead loop marks the session disconnected so callers know to
        // reconnect.
        assert!(!controller.get_status().connected);
        // The last good frame survives as a presentation frame.
        let latest = controller.read_latest_frame().expect("last good kept");
        assert!(!latest.is_live());
        controller.shutdown();
    }

    #[test]
    fn a_success_resets_the_error_run() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = vec![
            Err("a".to_string()),
            Err("b".to_string()),
            Err("c".to_string()),
            Err("d".to_string()),
            Ok(textured_frame(0)),
            Err("e".to_string()),
        ]
        .into_iter()
        .collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        let (mut errors, mut corrupt) = (0, 0);
        for _ in 0..6 {
            assert!(tick(&controller, &mut errors, &mut corrupt));
        }
        assert!(!controller.inner.watchdog.is_triggered());
        assert_eq!(errors, 1);
        controller.shutdown();
    }

    #[test]
    fn corrupt_frames_are_counted_but_not_processed() {
        let dir = tempfile::tempdir().unwrap();
        // Uniform gray: fails the variance check.
        let flat = Frame {
            data: vec![128u8; 64 * 64 * 3],
            width: 64,
            height: 64,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let script: VecDeque<_> = vec![Ok(textured_frame(0)), Ok(flat)].into_iter().collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        let (mut errors, mut corrupt) = (0, 0);
        tick(&controller, &mut errors, &mut corrupt);
        tick(&controller, &mut errors, &mut corrupt);

        let data = controller.get_camera_data();
        assert_eq!(data.frames_processed, 1);
        assert_eq!(data.corrupt_frames, 1);
        // The corrupt frame demotes the latest frame to last-good.
        assert!(controller
            .read_latest_frame()
            .is_some_and(|latest| !latest.is_live()));
        controller.shutdown();
    }

    #[test]
    fn sustained_corruption_escalates_to_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let flat = || Frame {
            data: vec![128u8; 64 * 64 * 3],
            width: 64,
            height: 64,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let mut config = test_config(dir.path());
        config.max_corrupt_run = 4;
        let opens = Arc::new(AtomicUsize::new(0));
        let script: VecDeque<_> = std::iter::once(Ok(textured_frame(0)))
            .chain((0..4).map(|_| Ok(flat())))
            .collect();
        let factory = scripted_factory(Arc::new(Mutex::new(script)), opens);
        let controller = CaptureController::new(config, factory).unwrap();
        open_source(&controller);
        controller.inner.connected.store(true, Ordering::SeqCst);

        let (mut errors, mut corrupt) = (0, 0);
        assert!(tick(&controller, &mut errors, &mut corrupt));
        for _ in 0..3 {
            assert!(tick(&controller, &mut errors, &mut corrupt));
        }
        // The 4th consecutive corrupt frame (max_corrupt_run) stops the loop.
        assert!(!tick(&controller, &mut errors, &mut corrupt));
        assert!(controller.inner.watchdog.is_triggered());
        assert_eq!(
            controller.inner.watchdog.reason(),
            Some(RestartReason::CorruptFrames)
        );
        assert!(!controller.get_status().connected);
        assert_eq!(controller.get_camera_data().corrupt_frames, 4);
        controller.shutdown();
    }

    #[test]
    fn connect_is_a_noop_while_connected() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = (0..200).map(|i| Ok(textured_frame(i))).collect();
        let (controller, opens) = controller_with_script(dir.path(), script);

        controller.connect().unwrap();
        // A second connect on a live session must not open another source or
        // spawn a second capture loop.
        controller.connect().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(controller.get_status().connected);
        controller.shutdown();
    }

    #[test]
    fn connect_retries_and_reports_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let factory: SourceFactory = Arc::new(move |uri, _options| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        });
        let controller = CaptureController::new(test_config(dir.path()), factory).unwrap();

        assert!(controller.connect().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(controller.get_status().connection_attempts, 3);
        assert!(!controller.get_status().connected);
        controller.shutdown();
    }

    #[test]
    fn disconnect_resets_references_but_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = (0..15).map(|i| Ok(textured_frame(i))).collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        let (mut errors, mut corrupt) = (0, 0);
        for _ in 0..15 {
            tick(&controller, &mut errors, &mut corrupt);
        }
        assert!(!controller.get_camera_data().history.is_empty());

        controller.disconnect();
        let data = controller.get_camera_data();
        assert!(!data.connected);
        // History survives, per-connection state does not.
        assert_eq!(data.history.len(), 15);
        assert!(controller.read_latest_frame().is_none());
        assert!(controller.inner.lock_state().tracker.is_learning());
        controller.shutdown();
    }

    #[test]
    fn threshold_updates_validate_before_applying() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _) = controller_with_script(dir.path(), VecDeque::new());

        assert!(controller.set_thresholds(30.0, 55.0).is_ok());
        assert_eq!(controller.config().visibility_threshold, 30.0);

        // Inverted pair is rejected and the previous values stay in force.
        assert!(controller.set_thresholds(70.0, 50.0).is_err());
        assert_eq!(controller.config().visibility_threshold, 30.0);
        assert_eq!(controller.config().recovery_threshold, 55.0);
        controller.shutdown();
    }

    #[test]
    fn roi_updates_restart_reference_learning() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = (0..11).map(|i| Ok(textured_frame(i))).collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        let (mut errors, mut corrupt) = (0, 0);
        for _ in 0..11 {
            tick(&controller, &mut errors, &mut corrupt);
        }
        assert!(!controller.inner.lock_state().tracker.is_learning());

        let rois = vec![RoiRegion {
            name: "horizon".to_string(),
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 0.3,
            distance: 500.0,
        }];
        controller.set_roi_regions(rois, true).unwrap();
        assert!(controller.inner.lock_state().tracker.is_learning());
        assert_eq!(controller.config().roi_regions.len(), 1);

        // A pixel-space layout carries its own interpretation flag.
        let pixels = vec![RoiRegion {
            name: "gate".to_string(),
            x: 10.0,
            y: 10.0,
            width: 40.0,
            height: 40.0,
            distance: 250.0,
        }];
        controller.set_roi_regions(pixels, false).unwrap();
        assert!(!controller.config().roi_normalized);

        // Malformed ROI set is rejected outright.
        let bad = vec![RoiRegion {
            name: "".to_string(),
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            distance: 0.0,
        }];
        assert!(controller.set_roi_regions(bad, false).is_err());
        assert_eq!(controller.config().roi_regions.len(), 1);
        controller.shutdown();
    }

    #[test]
    fn manual_highlight_requires_processed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let script: VecDeque<_> = (0..3).map(|i| Ok(textured_frame(i))).collect();
        let (controller, _) = controller_with_script(dir.path(), script);
        open_source(&controller);

        assert!(controller.create_highlight(1_000).is_err());

        let (mut errors, mut corrupt) = (0, 0);
        for _ in 0..3 {
            tick(&controller, &mut errors, &mut corrupt);
        }
        let path = controller.create_highlight(4_242).unwrap();
        assert!(path.to_string_lossy().contains("highlight_"));
        // The caller's trigger time stamps the highlight.
        assert_eq!(controller.get_status().last_highlight_ms, Some(4_242));
        // A second manual highlight while the clip is open is refused.
        assert!(controller.create_highlight(4_243).is_err());
        controller.shutdown();
    }
}
