use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::PipelineConfig;
use crate::image_processing::LetterboxMeta;
use crate::inference::RawOutput;

// ============================================================================
// Error Types
// ============================================================================

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum VisionError {
    #[error("raw output of {len} values is not a multiple of {features} features per anchor")]
    InvalidOutputShape { len: usize, features: usize },

    #[error("model must report at least one class")]
    NoClasses,
}

// ============================================================================
// Boxes and Detections
// ============================================================================

/// Axis-aligned box in corner form `(x1, y1, x2, y2)`, pixel units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// `(x2 - x1) * (y2 - y1)`; zero for inverted boxes.
    pub fn area(&self) -> f32 {
        (self.width() * self.height()).max(0.0)
    }

    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(
            self.x1 * factor,
            self.y1 * factor,
            self.x2 * factor,
            self.y2 * factor,
        )
    }

    pub fn clipped(&self, max_x: f32, max_y: f32) -> Self {
        Self::new(
            self.x1.clamp(0.0, max_x),
            self.y1.clamp(0.0, max_y),
            self.x2.clamp(0.0, max_x),
            self.y2.clamp(0.0, max_y),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// Decoded anchor in model-input pixel space, before suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateDetection {
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f32,
}

/// Final detection in original image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f32,
}

// ============================================================================
// DetectionDecoder
// ============================================================================

/// Memory order of the raw output tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `(4 + C) x N`: all `cx` values, then all `cy` values, and so on.
    FeatureMajor,
    /// `N x (4 + C)`: one contiguous row per anchor.
    AnchorMajor,
}

/// Turns the raw model output into thresholded candidates.
#[derive(Debug, Clone)]
pub struct DetectionDecoder {
    input_size: f32,
    conf_threshold: f32,
    layout: OutputLayout,
}

impl DetectionDecoder {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            input_size: config.input_size as f32,
            conf_threshold: config.conf_threshold,
            layout: config.output_layout,
        }
    }

    pub fn conf_threshold(&self) -> f32 {
        self.conf_threshold
    }

    /// Decodes every anchor whose best class score is strictly above the
    /// confidence threshold. Box values are `[0, 1]`-normalized and come back
    /// in model-input pixels, clipped to `[0, input_size]`.
    #[instrument(skip(self, raw), fields(len = raw.len()))]
    pub fn decode(
        &self,
        raw: &RawOutput,
        num_classes: usize,
    ) -> Result<Vec<CandidateDetection>, VisionError> {
        if num_classes == 0 {
            return Err(VisionError::NoClasses);
        }

        let features = 4 + num_classes;
        let data = raw.as_slice();
        if data.len() % features != 0 {
            return Err(VisionError::InvalidOutputShape {
                len: data.len(),
                features,
            });
        }

        let num_anchors = data.len() / features;
        let at = |anchor: usize, feature: usize| -> f32 {
            match self.layout {
                OutputLayout::FeatureMajor => data[feature * num_anchors + anchor],
                OutputLayout::AnchorMajor => data[anchor * features + feature],
            }
        };

        let mut candidates = Vec::new();

        for anchor in 0..num_anchors {
            let mut class_id = 0usize;
            let mut confidence = f32::NEG_INFINITY;
            for class in 0..num_classes {
                let score = at(anchor, 4 + class);
                // strict comparison keeps the lowest index on ties; NaN never wins
                if score > confidence {
                    class_id = class;
                    confidence = score;
                }
            }

            if !confidence.is_finite() || confidence <= self.conf_threshold {
                continue;
            }

            let bbox = BBox::from_center(at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3))
                .scaled(self.input_size);
            if !bbox.is_finite() {
                continue;
            }

            candidates.push(CandidateDetection {
                bbox: bbox.clipped(self.input_size, self.input_size),
                class_id: class_id as u32,
                confidence,
            });
        }

        debug!(
            anchors = num_anchors,
            candidates = candidates.len(),
            "decoded raw output"
        );

        Ok(candidates)
    }
}

// ============================================================================
// CoordinateRemapper
// ============================================================================

/// How boxes travel from model-input space back to the original image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapStrategy {
    /// Undo padding, then undo the aspect-preserving scale.
    Letterbox,
    /// Scale each axis by `original / input_size`, ignoring padding. Only
    /// correct for inputs that were stretched to a square rather than
    /// letterboxed.
    IndependentAxis,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinateRemapper {
    strategy: RemapStrategy,
}

impl CoordinateRemapper {
    pub fn new(strategy: RemapStrategy) -> Self {
        Self { strategy }
    }

    pub fn remap(
        &self,
        candidate: &CandidateDetection,
        meta: &LetterboxMeta,
        original_width: u32,
        original_height: u32,
    ) -> Detection {
        let max_x = original_width as f32;
        let max_y = original_height as f32;
        let b = candidate.bbox;

        let bbox = match self.strategy {
            RemapStrategy::Letterbox => {
                let (sx, sy) = (meta.scale_x(), meta.scale_y());
                let (ox, oy) = (meta.offset_x as f32, meta.offset_y as f32);
                BBox::new(
                    (b.x1 - ox) / sx,
                    (b.y1 - oy) / sy,
                    (b.x2 - ox) / sx,
                    (b.y2 - oy) / sy,
                )
            }
            RemapStrategy::IndependentAxis => {
                let input = meta.input_size as f32;
                let (sx, sy) = (max_x / input, max_y / input);
                BBox::new(b.x1 * sx, b.y1 * sy, b.x2 * sx, b.y2 * sy)
            }
        };

        Detection {
            bbox: bbox.clipped(max_x, max_y),
            class_id: candidate.class_id,
            confidence: candidate.confidence,
        }
    }

    /// Forward transform of a box in original pixels into model-input pixels.
    pub fn project(&self, bbox: &BBox, meta: &LetterboxMeta) -> BBox {
        match self.strategy {
            RemapStrategy::Letterbox => {
                let (sx, sy) = (meta.scale_x(), meta.scale_y());
                let (ox, oy) = (meta.offset_x as f32, meta.offset_y as f32);
                BBox::new(
                    bbox.x1 * sx + ox,
                    bbox.y1 * sy + oy,
                    bbox.x2 * sx + ox,
                    bbox.y2 * sy + oy,
                )
            }
            RemapStrategy::IndependentAxis => {
                let input = meta.input_size as f32;
                let sx = input / meta.original_width as f32;
                let sy = input / meta.original_height as f32;
                BBox::new(bbox.x1 * sx, bbox.y1 * sy, bbox.x2 * sx, bbox.y2 * sy)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Builds a feature-major output from `(cx, cy, w, h, scores)` rows.
    fn feature_major(rows: &[(f32, f32, f32, f32, Vec<f32>)]) -> RawOutput {
        let num_classes = rows[0].4.len();
        let n = rows.len();
        let mut data = vec![0.0; (4 + num_classes) * n];
        for (a, (cx, cy, w, h, scores)) in rows.iter().enumerate() {
            data[a] = *cx;
            data[n + a] = *cy;
            data[2 * n + a] = *w;
            data[3 * n + a] = *h;
            for (c, s) in scores.iter().enumerate() {
                data[(4 + c) * n + a] = *s;
            }
        }
        RawOutput::new(data)
    }

    fn decoder(input_size: u32) -> DetectionDecoder {
        DetectionDecoder::new(&PipelineConfig::default().with_input_size(input_size))
    }

    #[test]
    fn test_decode_converts_center_form_and_scales() {
        let raw = feature_major(&[(0.5, 0.5, 0.25, 0.5, vec![0.1, 0.8, 0.05])]);
        let out = decoder(640).decode(&raw, 3).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(out[0].bbox, BBox::new(240.0, 160.0, 400.0, 480.0));
    }

    #[test]
    fn test_decode_drops_anchors_at_or_below_threshold() {
        let raw = feature_major(&[
            (0.5, 0.5, 0.1, 0.1, vec![0.25, 0.1]),
            (0.5, 0.5, 0.1, 0.1, vec![0.1, 0.2]),
            (0.5, 0.5, 0.1, 0.1, vec![0.26, 0.1]),
        ]);
        let out = decoder(640).decode(&raw, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.26).abs() < 1e-6);
    }

    #[test]
    fn test_decode_clips_to_input_frame() {
        let raw = feature_major(&[(0.0, 1.0, 0.5, 0.5, vec![0.9])]);
        let out = decoder(100).decode(&raw, 1).unwrap();
        assert_eq!(out[0].bbox, BBox::new(0.0, 75.0, 25.0, 100.0));
    }

    #[test]
    fn test_decode_anchor_major_layout() {
        let config = PipelineConfig::default()
            .with_input_size(10)
            .with_output_layout(OutputLayout::AnchorMajor);
        let raw = RawOutput::new(vec![
            0.5, 0.5, 0.2, 0.2, 0.1, 0.9, //
            0.2, 0.2, 0.2, 0.2, 0.3, 0.1,
        ]);
        let out = DetectionDecoder::new(&config).decode(&raw, 2).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(out[1].class_id, 0);
        assert_eq!(out[1].bbox, BBox::new(1.0, 1.0, 3.0, 3.0));
    }

    #[test]
    fn test_decode_skips_non_finite_values() {
        let raw = feature_major(&[
            (f32::NAN, 0.5, 0.1, 0.1, vec![0.9]),
            (0.5, 0.5, 0.1, 0.1, vec![f32::NAN]),
            (0.5, 0.5, 0.1, 0.1, vec![f32::INFINITY]),
        ]);
        assert!(decoder(640).decode(&raw, 1).unwrap().is_empty());
    }

    #[test]
    fn test_decode_tie_prefers_lowest_class() {
        let raw = feature_major(&[(0.5, 0.5, 0.1, 0.1, vec![0.6, 0.6, 0.6])]);
        let out = decoder(640).decode(&raw, 3).unwrap();
        assert_eq!(out[0].class_id, 0);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let raw = RawOutput::new(vec![0.0; 13]);
        assert_eq!(
            decoder(640).decode(&raw, 8),
            Err(VisionError::InvalidOutputShape { len: 13, features: 12 })
        );
        assert_eq!(decoder(640).decode(&raw, 0), Err(VisionError::NoClasses));
    }

    #[test]
    fn test_decode_empty_output() {
        assert!(decoder(640).decode(&RawOutput::new(vec![]), 8).unwrap().is_empty());
    }

    #[test]
    fn test_remap_undoes_letterbox_padding() {
        let meta = LetterboxMeta::compute(400, 300, 640);
        let candidate = CandidateDetection {
            bbox: BBox::new(0.0, 80.0, 640.0, 560.0),
            class_id: 2,
            confidence: 0.7,
        };
        let det = CoordinateRemapper::new(RemapStrategy::Letterbox).remap(&candidate, &meta, 400, 300);

        assert!((det.bbox.x1 - 0.0).abs() < 1e-3);
        assert!((det.bbox.y1 - 0.0).abs() < 1e-3);
        assert!((det.bbox.x2 - 400.0).abs() < 1e-3);
        assert!((det.bbox.y2 - 300.0).abs() < 1e-3);
        assert_eq!(det.class_id, 2);
    }

    #[test]
    fn test_remap_clips_padding_region_to_image() {
        let meta = LetterboxMeta::compute(400, 300, 640);
        let candidate = CandidateDetection {
            bbox: BBox::new(0.0, 0.0, 640.0, 640.0),
            class_id: 0,
            confidence: 0.5,
        };
        let det = CoordinateRemapper::new(RemapStrategy::Letterbox).remap(&candidate, &meta, 400, 300);
        assert_eq!(det.bbox, BBox::new(0.0, 0.0, 400.0, 300.0));
    }

    #[test]
    fn test_remap_independent_axis() {
        let meta = LetterboxMeta::compute(400, 300, 640);
        let candidate = CandidateDetection {
            bbox: BBox::new(64.0, 64.0, 320.0, 320.0),
            class_id: 0,
            confidence: 0.5,
        };
        let det = CoordinateRemapper::new(RemapStrategy::IndependentAxis)
            .remap(&candidate, &meta, 400, 300);
        assert!((det.bbox.x1 - 40.0).abs() < 1e-3);
        assert!((det.bbox.y1 - 30.0).abs() < 1e-3);
        assert!((det.bbox.x2 - 200.0).abs() < 1e-3);
        assert!((det.bbox.y2 - 150.0).abs() < 1e-3);
    }

    proptest! {
        #[test]
        fn letterbox_round_trip_within_one_pixel(
            width in 1u32..3000,
            height in 1u32..3000,
            input_size in prop::sample::select(vec![160u32, 320, 416, 640, 1024]),
            fx1 in 0.0f32..0.5,
            fy1 in 0.0f32..0.5,
            fx2 in 0.5f32..1.0,
            fy2 in 0.5f32..1.0,
        ) {
            let meta = LetterboxMeta::compute(width, height, input_size);
            let remapper = CoordinateRemapper::new(RemapStrategy::Letterbox);
            let original = BBox::new(
                fx1 * width as f32,
                fy1 * height as f32,
                fx2 * width as f32,
                fy2 * height as f32,
            );

            let candidate = CandidateDetection {
                bbox: remapper.project(&original, &meta),
                class_id: 0,
                confidence: 0.9,
            };
            let back = remapper.remap(&candidate, &meta, width, height).bbox;

            prop_assert!((back.x1 - original.x1).abs() <= 1.0);
            prop_assert!((back.y1 - original.y1).abs() <= 1.0);
            prop_assert!((back.x2 - original.x2).abs() <= 1.0);
            prop_assert!((back.y2 - original.y2).abs() <= 1.0);
        }

        #[test]
        fn remapped_boxes_stay_inside_image(
            width in 1u32..2000,
            height in 1u32..2000,
            coords in prop::array::uniform4(-100.0f32..800.0),
        ) {
            let meta = LetterboxMeta::compute(width, height, 640);
            let candidate = CandidateDetection {
                bbox: BBox::new(coords[0], coords[1], coords[2], coords[3]),
                class_id: 0,
                confidence: 0.5,
            };
            for strategy in [RemapStrategy::Letterbox, RemapStrategy::IndependentAxis] {
                let b = CoordinateRemapper::new(strategy).remap(&candidate, &meta, width, height).bbox;
                for x in [b.x1, b.x2] {
                    prop_assert!((0.0..=width as f32).contains(&x));
                }
                for y in [b.y1, b.y2] {
                    prop_assert!((0.0..=height as f32).contains(&y));
                }
            }
        }

        #[test]
        fn decoded_confidences_exceed_threshold(
            scores in prop::collection::vec(0.0f32..1.0, 8 * 20),
            threshold in 0.0f32..1.0,
        ) {
            let n = 20;
            let mut data = vec![0.5f32; 4 * n];
            data.extend_from_slice(&scores);
            let config = PipelineConfig::default().with_conf_threshold(threshold);
            let out = DetectionDecoder::new(&config).decode(&RawOutput::new(data), 8).unwrap();
            for candidate in out {
                prop_assert!(candidate.confidence > threshold);
            }
        }
    }
}
