//! Visibility status hysteresis, distance estimation, and the rolling
//! visibility window.

use std::collections::{HashMap, VecDeque};

use crate::engine::{
    analyzer::Measurements,
    config::{CameraConfig, RoiRegion},
    data::{VisibilityHistoryEntry, VisibilityStatus},
};

/// Result of folding one frame's measurements into the estimator.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub status: VisibilityStatus,
    pub distance_m: Option<f64>,
    pub alert: Option<String>,
}

/// Classifies visibility with a hysteresis band and keeps the bounded
/// history window.
pub struct VisibilityEstimator {
    status: VisibilityStatus,
    history: VecDeque<VisibilityHistoryEntry>,
    window: usize,
}

impl VisibilityEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            status: VisibilityStatus::Unknown,
            history: VecDeque::with_capacity(window.max(1)),
            window: window.max(1),
        }
    }

    pub fn status(&self) -> VisibilityStatus {
        self.status
    }

    /// Apply the hysteresis rule: below the visibility threshold is Poor,
    /// above the recovery threshold is Good, and the band in between holds a
    /// previous Good/Poor classification.
    pub fn classify(
        &mut self,
        score: f64,
        visibility_threshold: f64,
        recovery_threshold: f64,
    ) -> VisibilityStatus {
        let next = if score < visibility_threshold {
            VisibilityStatus::Poor
        } else if score > recovery_threshold {
            VisibilityStatus::Good
        } else {
            match self.status {
                VisibilityStatus::Good | VisibilityStatus::Poor => self.status,
                _ => VisibilityStatus::Moderate,
            }
        };
        self.status = next;
        next
    }

    /// Estimate visibility distance from the visible/obscured ROI partition.
    ///
    /// ROIs without a positive reference distance or without a computed delta
    /// do not participate.
    pub fn estimate_distance(
        rois: &[RoiRegion],
        deltas: &HashMap<String, f64>,
        color_delta_threshold: f64,
    ) -> Option<f64> {
        let mut max_visible: Option<f64> = None;
        let mut min_obscured: Option<f64> = None;
        for roi in rois.iter().filter(|roi| roi.distance > 0.0) {
            let Some(&delta) = deltas.get(&roi.name) else {
                continue;
            };
            if delta <= color_delta_threshold {
                max_visible = Some(max_visible.map_or(roi.distance, |v| v.max(roi.distance)));
            } else {
                min_obscured = Some(min_obscured.map_or(roi.distance, |v| v.min(roi.distance)));
            }
        }
        match (max_visible, min_obscured) {
            // Midpoint between the farthest confirmed-visible landmark and
            // the nearest confirmed-obscured one.
            (Some(visible), Some(obscured)) => Some((visible + obscured) / 2.0),
            // Visibility likely extends somewhat past the farthest landmark.
            (Some(visible), None) => Some(visible * 1.2),
            // Visibility likely ends before the nearest obscured landmark.
            (None, Some(obscured)) => Some(obscured * 0.8),
            (None, None) => None,
        }
    }

    /// Fold one frame's measurements in: classify, estimate distance, append
    /// to the window, and raise an alert on rapid color drift.
    pub fn update(&mut self, m: &Measurements, config: &CameraConfig) -> StatusUpdate {
        let status = self.classify(
            m.visibility_score,
            config.visibility_threshold,
            config.recovery_threshold,
        );
        let distance_m = Self::estimate_distance(
            &config.roi_regions,
            &m.roi_deltas,
            config.color_delta_threshold,
        );

        self.history.push_back(VisibilityHistoryEntry {
            timestamp_ms: m.timestamp_ms,
            visibility_score: m.visibility_score,
            visibility_status: status,
            brightness: m.brightness,
            color_delta_avg: m.color_delta_avg,
            visibility_distance_m: distance_m,
        });
        while self.history.len() > self.window {
            self.history.pop_front();
        }

        // Rapid color drift is flagged independently of the status machine so
        // it can fire inside the hysteresis band.
        let alert = self.window_avg_delta().and_then(|avg_delta| {
            if avg_delta > config.color_delta_threshold * 1.5 {
                let distance_note = self
                    .window_avg_distance()
                    .map(|d| format!(" (est. {:.0}m visibility)", d))
                    .unwrap_or_default();
                Some(format!(
                    "significant color shift detected (ΔE {avg_delta:.1}){distance_note}"
                ))
            } else {
                None
            }
        });

        StatusUpdate {
            status,
            distance_m,
            alert,
        }
    }

    fn window_avg_delta(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let sum: f64 = self.history.iter().map(|e| e.color_delta_avg).sum();
        Some(sum / self.history.len() as f64)
    }

    fn window_avg_distance(&self) -> Option<f64> {
        let distances: Vec<f64> = self
            .history
            .iter()
            .filter_map(|e| e.visibility_distance_m)
            .collect();
        if distances.is_empty() {
            return None;
        }
        Some(distances.iter().sum::<f64>() / distances.len() as f64)
    }

    pub fn history(&self) -> Vec<VisibilityHistoryEntry> {
        self.history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements(score: f64, delta: f64) -> Measurements {
        Measurements {
            brightness: 120.0,
            contrast: 40.0,
            edge_score: 50.0,
            sharpness: 30.0,
            roi_deltas: HashMap::new(),
            color_delta_avg: delta,
            visibility_score: score,
            timestamp_ms: 0,
        }
    }

    fn roi(name: &str, distance: f64) -> RoiRegion {
        RoiRegion {
            name: name.to_string(),
            x: 0.1,
            y: 0.1,
            width: 0.2,
            height: 0.2,
            distance,
        }
    }

    #[test]
    fn hysteresis_holds_previous_state_inside_band() {
        let mut est = VisibilityEstimator::new(30);
        let scores = [70.0, 50.0, 35.0, 55.0, 65.0];
        let expected = [
            VisibilityStatus::Good,
            VisibilityStatus::Good,
            VisibilityStatus::Poor,
            VisibilityStatus::Poor,
            VisibilityStatus::Good,
        ];
        for (score, want) in scores.iter().zip(expected) {
            assert_eq!(est.classify(*score, 40.0, 60.0), want);
        }
    }

    #[test]
    fn band_reports_moderate_from_unknown() {
        let mut est = VisibilityEstimator::new(30);
        assert_eq!(est.classify(50.0, 40.0, 60.0), VisibilityStatus::Moderate);
        // And Moderate keeps reporting Moderate inside the band.
        assert_eq!(est.classify(45.0, 40.0, 60.0), VisibilityStatus::Moderate);
    }

    #[test]
    fn single_step_jump_across_both_thresholds_is_allowed() {
        let mut est = VisibilityEstimator::new(30);
        assert_eq!(est.classify(70.0, 40.0, 60.0), VisibilityStatus::Good);
        assert_eq!(est.classify(35.0, 40.0, 60.0), VisibilityStatus::Poor);
    }

    #[test]
    fn distance_uses_midpoint_when_both_partitions_exist() {
        let rois = vec![roi("near", 50.0), roi("far", 300.0)];
        let deltas = HashMap::from([("near".to_string(), 3.0), ("far".to_string(), 25.0)]);
        let estimate = VisibilityEstimator::estimate_distance(&rois, &deltas, 10.0).unwrap();
        assert!((estimate - 175.0).abs() < 1e-9);
    }

    #[test]
    fn all_visible_extrapolates_past_farthest() {
        let rois = vec![roi("near", 50.0), roi("far", 300.0)];
        let deltas = HashMap::from([("near".to_string(), 2.0), ("far".to_string(), 9.0)]);
        let estimate = VisibilityEstimator::estimate_distance(&rois, &deltas, 10.0).unwrap();
        assert!(estimate > 0.0);
        assert!((estimate - 360.0).abs() < 1e-9);
    }

    #[test]
    fn all_obscured_pulls_back_from_nearest() {
        let rois = vec![roi("near", 50.0), roi("far", 300.0)];
        let deltas = HashMap::from([("near".to_string(), 20.0), ("far".to_string(), 40.0)]);
        let estimate = VisibilityEstimator::estimate_distance(&rois, &deltas, 10.0).unwrap();
        assert!((estimate - 40.0).abs() < 1e-9);
    }

    #[test]
    fn no_participating_rois_yields_no_estimate() {
        let rois = vec![roi("unranged", 0.0)];
        let deltas = HashMap::from([("unranged".to_string(), 3.0)]);
        assert_eq!(
            VisibilityEstimator::estimate_distance(&rois, &deltas, 10.0),
            None
        );
        assert_eq!(
            VisibilityEstimator::estimate_distance(&[], &HashMap::new(), 10.0),
            None
        );
    }

    #[test]
    fn alert_fires_on_sustained_color_shift() {
        let config = CameraConfig::default(); // color_delta_threshold 10.0
        let mut est = VisibilityEstimator::new(30);

        let update = est.update(&measurements(70.0, 5.0), &config);
        assert!(update.alert.is_none());

        let mut est = VisibilityEstimator::new(30);
        let update = est.update(&measurements(70.0, 22.0), &config);
        let alert = update.alert.expect("window average 22 > 15 must alert");
        assert!(alert.contains("color shift"));
    }

    #[test]
    fn history_window_is_bounded_and_ordered() {
        let config = CameraConfig {
            history_window: 5,
            ..CameraConfig::default()
        };
        let mut est = VisibilityEstimator::new(config.history_window);
        for i in 0..12 {
            let mut m = measurements(70.0, 5.0);
            m.timestamp_ms = i;
            est.update(&m, &config);
        }
        let history = est.history();
        assert_eq!(history.len(), 5);
        let stamps: Vec<i64> = history.iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![7, 8, 9, 10, 11]);
    }
}
