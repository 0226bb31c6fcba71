use serde::{Deserialize, Serialize};

use crate::enrichment::AiInsights;
use crate::knowledge::{GermanBin, RecyclingKnowledgeMapper, WasteClass};
use crate::vision::Detection;

/// Length of the hex digest used as the result identity.
pub const RESULT_HASH_LEN: usize = 16;

pub const DEFAULT_VISION_MODEL: &str = "On-device Object Detector";
pub const OFFLINE_KNOWLEDGE_MODEL: &str = "Offline Recycling DB";
pub const AI_INSIGHTS_MODEL: &str = "AIInsights";

/// Which models produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProvenance {
    pub vision: String,
    pub llm: String,
}

impl Default for ModelProvenance {
    fn default() -> Self {
        Self {
            vision: DEFAULT_VISION_MODEL.to_string(),
            llm: OFFLINE_KNOWLEDGE_MODEL.to_string(),
        }
    }
}

/// Per-stage wall clock durations of one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
    pub enrichment_ms: Option<f64>,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecyclingPlanItem {
    pub item_name: String,
    pub category: String,
    pub bin: GermanBin,
    pub is_pfand: bool,
    pub confidence: f32,
    pub recycling_instructions: String,
    pub reuse_ideas: Vec<String>,
    pub caution: Option<String>,
    pub preparation_steps: Vec<String>,
    pub environmental_benefits: Option<String>,
    pub ai_insights: Option<AiInsights>,
}

impl RecyclingPlanItem {
    /// Plan entry derived from local knowledge only.
    pub fn for_detection(detection: &Detection, mapper: &RecyclingKnowledgeMapper) -> Self {
        let info = mapper.classify_id(detection.class_id);
        let category = category_label(detection.class_id);

        Self {
            item_name: category.replace('_', " "),
            category,
            bin: info.bin,
            is_pfand: false,
            confidence: detection.confidence,
            recycling_instructions: info.instructions.join(" "),
            reuse_ideas: info.reuse_ideas.iter().map(|s| s.to_string()).collect(),
            caution: info.caution.map(str::to_string),
            preparation_steps: info.instructions.iter().map(|s| s.to_string()).collect(),
            environmental_benefits: info.environmental_impact.map(str::to_string),
            ai_insights: None,
        }
    }
}

/// Label for a class id, or `class_<id>` for ids outside the known set.
pub fn category_label(class_id: u32) -> String {
    match WasteClass::from_class_id(class_id) {
        Some(class) => class.label().to_string(),
        None => format!("class_{class_id}"),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub detections: Vec<Detection>,
    pub recycling_plan: Vec<RecyclingPlanItem>,
    pub result_hash: String,
    pub candidates_before_nms: usize,
    pub truncated: bool,
    pub timings: StageTimings,
    pub models: ModelProvenance,
}

impl AnalysisResult {
    pub fn local(
        detections: Vec<Detection>,
        mapper: &RecyclingKnowledgeMapper,
        candidates_before_nms: usize,
        truncated: bool,
        timings: StageTimings,
    ) -> Self {
        let recycling_plan = detections
            .iter()
            .map(|d| RecyclingPlanItem::for_detection(d, mapper))
            .collect();

        Self {
            result_hash: content_hash(&detections),
            detections,
            recycling_plan,
            candidates_before_nms,
            truncated,
            timings,
            models: ModelProvenance::default(),
        }
    }

    #[must_use]
    pub fn with_vision_model(mut self, name: &str) -> Self {
        self.models.vision = name.to_string();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Highest-confidence detection. Ties go to the earlier one.
    pub fn top_detection(&self) -> Option<&Detection> {
        self.detections.iter().fold(None, |best, d| match best {
            Some(b) if b.confidence >= d.confidence => Some(b),
            _ => Some(d),
        })
    }

    pub fn top_category(&self) -> Option<String> {
        self.top_detection().map(|d| category_label(d.class_id))
    }

    pub fn is_enriched(&self) -> bool {
        self.recycling_plan.iter().any(|item| item.ai_insights.is_some())
    }

    /// Attaches insights to every plan item of `category` and credits the
    /// insights model when at least one item matched.
    pub fn attach_insights(&mut self, category: &str, insights: &AiInsights) {
        let mut attached = false;
        for item in self.recycling_plan.iter_mut().filter(|i| i.category == category) {
            item.ai_insights = Some(insights.clone());
            attached = true;
        }
        if attached {
            self.models.llm = AI_INSIGHTS_MODEL.to_string();
        }
    }
}

/// Stable identity of a detection set.
///
/// Confidences are rounded to two decimals and boxes to whole pixels, so
/// frame-to-frame jitter below that resolution yields the same hash. Order
/// of detections matters.
pub fn content_hash(detections: &[Detection]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(detections.len() as u64).to_le_bytes());
    for d in detections {
        hasher.update(&d.class_id.to_le_bytes());
        hasher.update(&quantize(d.confidence * 100.0).to_le_bytes());
        for v in d.bbox.as_array() {
            hasher.update(&quantize(v).to_le_bytes());
        }
    }
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..RESULT_HASH_LEN].to_string()
}

fn quantize(value: f32) -> i32 {
    if value.is_finite() {
        value.round() as i32
    } else {
        0
    }
}
