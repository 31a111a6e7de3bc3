//! Camera visibility monitoring engine.
//!
//! A session connects to one stream, analyzes every frame for visibility,
//! tracks per-ROI color drift against learned references, and records
//! highlight clips when visibility degrades.

pub mod analytics;
pub mod analyzer;
pub mod capture;
pub mod color;
pub mod config;
pub mod data;
pub mod estimator;
pub mod recorder;
pub mod telemetry;
pub mod watchdog;
