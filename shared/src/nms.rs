//! Greedy non-maximum suppression.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::PipelineConfig;
use crate::vision::{BBox, CandidateDetection};

/// Whether boxes of different classes may suppress each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsPolicy {
    /// Any higher-scoring box suppresses an overlapping one.
    CrossClass,
    /// Only boxes of the same class compete.
    PerClass,
}

/// Intersection over union. Zero when either box has no area or the union
/// is degenerate.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = iw * ih;
    let union = area_a + area_b - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Indices of kept candidates, in descending confidence order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Suppressed {
    pub kept: Vec<usize>,
    /// Input size before the candidate cap was applied.
    pub considered: usize,
    /// Set when lower-confidence candidates beyond the cap were dropped.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct NonMaxSuppressor {
    iou_threshold: f32,
    policy: NmsPolicy,
    max_candidates: usize,
}

impl NonMaxSuppressor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            policy: config.nms_policy,
            max_candidates: config.max_candidates.max(1),
        }
    }

    pub fn with_threshold(iou_threshold: f32, policy: NmsPolicy) -> Self {
        Self {
            iou_threshold,
            policy,
            max_candidates: usize::MAX,
        }
    }

    /// Sorts by confidence, then keeps each box unless a kept box overlaps it
    /// with IoU strictly above the threshold.
    #[instrument(skip(self, candidates), fields(n = candidates.len()))]
    pub fn suppress(&self, candidates: &[CandidateDetection]) -> Suppressed {
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        // stable: equal confidences keep input order
        order.sort_by(|&a, &b| rank(&candidates[b]).total_cmp(&rank(&candidates[a])));

        let truncated = order.len() > self.max_candidates;
        order.truncate(self.max_candidates);

        let mut kept: Vec<usize> = Vec::new();
        for idx in order {
            let candidate = &candidates[idx];
            let overlaps = kept.iter().any(|&k| {
                let other = &candidates[k];
                let competes = match self.policy {
                    NmsPolicy::CrossClass => true,
                    NmsPolicy::PerClass => other.class_id == candidate.class_id,
                };
                competes && iou(&other.bbox, &candidate.bbox) > self.iou_threshold
            });
            if !overlaps {
                kept.push(idx);
            }
        }

        debug!(kept = kept.len(), truncated, "suppression finished");

        Suppressed {
            kept,
            considered: candidates.len(),
            truncated,
        }
    }

    /// Convenience wrapper returning the surviving candidates themselves.
    pub fn apply(&self, candidates: &[CandidateDetection]) -> (Vec<CandidateDetection>, Suppressed) {
        let result = self.suppress(candidates);
        let survivors = result.kept.iter().map(|&i| candidates[i]).collect();
        (survivors, result)
    }
}

/// Sort key; NaN scores rank below every real one.
fn rank(candidate: &CandidateDetection) -> f32 {
    if candidate.confidence.is_nan() {
        f32::NEG_INFINITY
    } else {
        candidate.confidence
    }
}
