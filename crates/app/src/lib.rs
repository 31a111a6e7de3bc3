//! Camera visibility monitoring: stream capture, per-frame visibility
//! analysis, ROI color-drift tracking, and highlight recording.
//!
//! The [`engine::capture::CaptureController`] is the main entry point; it
//! owns one camera session end to end. Operations like
//! [`engine::capture::CaptureController::get_camera_data`] and the recording
//! controls are the integration surface for dashboards and embedders.

pub mod cli;
pub mod engine;
