//! CIELAB color math and the per-ROI reference tracker.
//!
//! References are learned from the first N valid frames with an online
//! average, then frozen until the session reconnects. Drift is measured as
//! Euclidean distance in Lab space (simplified Delta E, not CIEDE2000).

use std::collections::HashMap;

use video_source::{Frame, FrameFormat};

use crate::engine::config::PixelRect;

/// Average Lab color of a region.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LabColor {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl LabColor {
    /// Euclidean distance in Lab space.
    pub fn delta_e(self, other: LabColor) -> f64 {
        let dl = self.l - other.l;
        let da = self.a - other.a;
        let db = self.b - other.b;
        (dl * dl + da * da + db * db).sqrt()
    }
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn lab_f(t: f64) -> f64 {
    const DELTA: f64 = 6.0 / 29.0;
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

/// Convert one BGR pixel to Lab (D65 white point).
pub fn bgr_to_lab(b: u8, g: u8, r: u8) -> LabColor {
    let rl = srgb_to_linear(r as f64 / 255.0);
    let gl = srgb_to_linear(g as f64 / 255.0);
    let bl = srgb_to_linear(b as f64 / 255.0);

    let x = 0.412_456_4 * rl + 0.357_576_1 * gl + 0.180_437_5 * bl;
    let y = 0.212_672_9 * rl + 0.715_152_2 * gl + 0.072_175_0 * bl;
    let z = 0.019_333_9 * rl + 0.119_192_0 * gl + 0.950_304_1 * bl;

    let fx = lab_f(x / 0.950_47);
    let fy = lab_f(y);
    let fz = lab_f(z / 1.088_83);

    LabColor {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

/// Average Lab color over a pixel rectangle of a BGR8 frame.
///
/// Returns `None` when the frame payload does not cover the rectangle.
pub fn mean_lab(frame: &Frame, rect: PixelRect) -> Option<LabColor> {
    debug_assert_eq!(frame.format, FrameFormat::Bgr8);
    let width = frame.width.max(0) as usize;
    let height = frame.height.max(0) as usize;
    if rect.x + rect.width > width || rect.y + rect.height > height || !frame.is_complete() {
        return None;
    }

    let mut sum = LabColor {
        l: 0.0,
        a: 0.0,
        b: 0.0,
    };
    for row in rect.y..rect.y + rect.height {
        let base = (row * width + rect.x) * 3;
        for px in frame.data[base..base + rect.width * 3].chunks_exact(3) {
            let lab = bgr_to_lab(px[0], px[1], px[2]);
            sum.l += lab.l;
            sum.a += lab.a;
            sum.b += lab.b;
        }
    }
    let n = (rect.width * rect.height) as f64;
    Some(LabColor {
        l: sum.l / n,
        a: sum.a / n,
        b: sum.b / n,
    })
}

/// Running-average reference color per ROI.
pub struct ColorReferenceTracker {
    references: HashMap<String, LabColor>,
    frames_observed: u32,
    frames_needed: u32,
}

impl ColorReferenceTracker {
    pub fn new(frames_needed: u32) -> Self {
        Self {
            references: HashMap::new(),
            frames_observed: 0,
            frames_needed,
        }
    }

    /// Whether the learning phase is still running.
    pub fn is_learning(&self) -> bool {
        self.frames_observed < self.frames_needed
    }

    /// Fold one ROI observation into the running reference. No-op once the
    /// learning phase has completed.
    pub fn observe(&mut self, roi: &str, color: LabColor) {
        if !self.is_learning() {
            return;
        }
        let alpha = 1.0 / (self.frames_observed as f64 + 1.0);
        match self.references.get_mut(roi) {
            Some(reference) => {
                reference.l = (1.0 - alpha) * reference.l + alpha * color.l;
                reference.a = (1.0 - alpha) * reference.a + alpha * color.a;
                reference.b = (1.0 - alpha) * reference.b + alpha * color.b;
            }
            None => {
                self.references.insert(roi.to_string(), color);
            }
        }
    }

    /// Mark one full frame of observations as consumed.
    pub fn advance_frame(&mut self) {
        if self.is_learning() {
            self.frames_observed += 1;
        }
    }

    /// Delta E against the frozen reference, or `None` while the learning
    /// phase is incomplete or the ROI has no reference.
    pub fn delta(&self, roi: &str, color: LabColor) -> Option<f64> {
        if self.is_learning() {
            return None;
        }
        self.references
            .get(roi)
            .map(|reference| reference.delta_e(color))
    }

    /// Forget all references and restart the learning phase. Called when the
    /// session reconnects.
    pub fn reset(&mut self) {
        self.references.clear();
        self.frames_observed = 0;
    }
}
