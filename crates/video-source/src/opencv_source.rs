//! OpenCV/FFmpeg-backed camera transport.

use std::time::Instant;

use chrono::Utc;
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::warn;

use crate::{CaptureError, Frame, FrameFormat, StreamOptions, VideoSource};

/// RTSP or local-device source decoded by OpenCV's FFmpeg backend.
pub struct OpenCvSource {
    cap: VideoCapture,
    options: StreamOptions,
    scratch: Mat,
    open: bool,
}

impl OpenCvSource {
    /// Open `uri` with the given options applied per connection attempt.
    pub fn open(uri: &str, options: &StreamOptions) -> Result<Self, CaptureError> {
        // FFmpeg only accepts demuxer options through this environment
        // variable; the string is derived from the typed options in one place
        // right before the capture is constructed.
        std::env::set_var(
            "OPENCV_FFMPEG_CAPTURE_OPTIONS",
            ffmpeg_capture_options(options),
        );

        let started = Instant::now();
        let cap = open_video_capture(uri)?;
        if started.elapsed() > options.connect_timeout {
            return Err(CaptureError::OpenTimeout {
                uri: uri.to_string(),
                timeout: options.connect_timeout,
            });
        }

        let mut source = Self {
            cap,
            options: options.clone(),
            scratch: Mat::default(),
            open: true,
        };
        source.configure();
        Ok(source)
    }

    fn configure(&mut self) {
        let cap = &mut self.cap;
        let opts = &self.options;
        let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, opts.buffer_depth as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, opts.width as f64);
        let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, opts.height as f64);
        let _ = cap.set(videoio::CAP_PROP_FPS, opts.fps);
        let _ = cap.set(videoio::CAP_PROP_CONVERT_RGB, 1.0);
    }
}

impl VideoSource for OpenCvSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if !self.open {
            return Err(CaptureError::Closed);
        }

        let mut mat = Mat::default();
        let grabbed = self
            .cap
            .read(&mut mat)
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        if !grabbed {
            return Err(CaptureError::Read("no frame returned".into()));
        }

        let size = mat.size().map_err(|e| CaptureError::Read(e.to_string()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::Read("empty frame".into()));
        }

        let working = if size.width != self.options.width || size.height != self.options.height {
            opencv::imgproc::resize(
                &mat,
                &mut self.scratch,
                opencv::core::Size {
                    width: self.options.width,
                    height: self.options.height,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Read(e.to_string()))?;
            &self.scratch
        } else {
            &mat
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Read(e.to_string()))?
            .to_vec();

        Ok(Frame {
            data,
            width: self.options.width,
            height: self.options.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn is_open(&self) -> bool {
        self.open && self.cap.is_opened().unwrap_or(false)
    }

    fn close(&mut self) {
        if self.open {
            if let Err(err) = self.cap.release() {
                warn!("error releasing video capture: {err}");
            }
            self.open = false;
        }
    }
}

impl Drop for OpenCvSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Render the FFmpeg demuxer option string for one connection attempt.
fn ffmpeg_capture_options(options: &StreamOptions) -> String {
    let timeout_us = options.read_timeout.as_micros();
    format!(
        "rtsp_transport;{transport}|\
         fflags;nobuffer+genpts+discardcorrupt|\
         flags;low_delay|\
         timeout;{timeout_us}|\
         stimeout;{timeout_us}|\
         buffer_size;5000000|\
         reconnect;1|\
         reconnect_streamed;1|\
         reconnect_delay_max;5",
        transport = options.transport.as_str(),
    )
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        match VideoCapture::from_file(uri, videoio::CAP_FFMPEG) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with FFmpeg backend: {err}");
            }
        }
        return Err(CaptureError::Open {
            uri: uri.to_string(),
        });
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}
