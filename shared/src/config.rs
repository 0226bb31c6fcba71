use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::enrichment::parse_endpoint;
use crate::knowledge::Language;
use crate::nms::NmsPolicy;
use crate::vision::{OutputLayout, RemapStrategy};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NUM_CLASSES: usize = 8;
pub const DEFAULT_LIVE_INTERVAL_MS: u64 = 300;
pub const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ENRICHMENT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_ENRICHMENT_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_ENRICHMENT_RETRY_AFTER_MS: u64 = 30_000;
pub const DEFAULT_MAX_INPUT_BYTES: usize = 20 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_PIXELS: u64 = 100_000_000;
pub const DEFAULT_MAX_CANDIDATES: usize = 300;

pub const MIN_INPUT_SIZE: u32 = 32;
pub const MAX_INPUT_SIZE: u32 = 4096;
pub const MIN_LIVE_INTERVAL_MS: u64 = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for the whole detection pipeline.
///
/// Every field has a default, so partial JSON documents are accepted by
/// [`PipelineConfig::from_json`]. Values are clamped by [`PipelineConfig::validated`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_size: u32,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub nms_policy: NmsPolicy,
    pub remap_strategy: RemapStrategy,
    pub output_layout: OutputLayout,
    pub num_classes: usize,
    pub live_interval_ms: u64,
    pub inference_timeout_ms: u64,
    pub enrichment_timeout_ms: u64,
    pub enrichment_cache_capacity: usize,
    pub enrichment_retry_after_ms: u64,
    /// GraphQL endpoint for online insights. Without one the pipeline stays
    /// local even when the device is online.
    pub enrichment_endpoint: Option<String>,
    pub max_input_bytes: usize,
    pub max_image_pixels: u64,
    pub max_candidates: usize,
    pub language: Language,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            conf_threshold: DEFAULT_CONF_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            nms_policy: NmsPolicy::CrossClass,
            remap_strategy: RemapStrategy::Letterbox,
            output_layout: OutputLayout::FeatureMajor,
            num_classes: DEFAULT_NUM_CLASSES,
            live_interval_ms: DEFAULT_LIVE_INTERVAL_MS,
            inference_timeout_ms: DEFAULT_INFERENCE_TIMEOUT_MS,
            enrichment_timeout_ms: DEFAULT_ENRICHMENT_TIMEOUT_MS,
            enrichment_cache_capacity: DEFAULT_ENRICHMENT_CACHE_CAPACITY,
            enrichment_retry_after_ms: DEFAULT_ENRICHMENT_RETRY_AFTER_MS,
            enrichment_endpoint: None,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            max_image_pixels: DEFAULT_MAX_IMAGE_PIXELS,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            language: Language::En,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    pub fn with_input_size(mut self, input_size: u32) -> Self {
        self.input_size = input_size;
        self
    }

    pub fn with_conf_threshold(mut self, threshold: f32) -> Self {
        self.conf_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    pub fn with_nms_policy(mut self, policy: NmsPolicy) -> Self {
        self.nms_policy = policy;
        self
    }

    pub fn with_remap_strategy(mut self, strategy: RemapStrategy) -> Self {
        self.remap_strategy = strategy;
        self
    }

    pub fn with_output_layout(mut self, layout: OutputLayout) -> Self {
        self.output_layout = layout;
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_live_interval(mut self, interval: Duration) -> Self {
        self.live_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.enrichment_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_enrichment_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.enrichment_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn validated(mut self) -> Self {
        self.input_size = self.input_size.clamp(MIN_INPUT_SIZE, MAX_INPUT_SIZE);
        self.conf_threshold = clamp_unit(self.conf_threshold, DEFAULT_CONF_THRESHOLD);
        self.iou_threshold = clamp_unit(self.iou_threshold, DEFAULT_IOU_THRESHOLD);
        self.num_classes = self.num_classes.max(1);
        self.live_interval_ms = self.live_interval_ms.max(MIN_LIVE_INTERVAL_MS);
        self.inference_timeout_ms = self.inference_timeout_ms.max(1);
        self.enrichment_timeout_ms = self.enrichment_timeout_ms.max(1);
        self.enrichment_cache_capacity = self.enrichment_cache_capacity.max(1);
        self.max_input_bytes = self.max_input_bytes.max(1);
        self.max_image_pixels = self.max_image_pixels.max(1);
        self.max_candidates = self.max_candidates.max(1);
        self.enrichment_endpoint = self.enrichment_endpoint.take().and_then(|endpoint| {
            match parse_endpoint(&endpoint) {
                Ok(_) => Some(endpoint),
                Err(e) => {
                    warn!(error = %e, "ignoring enrichment endpoint");
                    None
                }
            }
        });
        self
    }

    pub fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn enrichment_timeout(&self) -> Duration {
        Duration::from_millis(self.enrichment_timeout_ms)
    }

    /// Number of floats one anchor occupies in the raw output.
    pub fn features_per_anchor(&self) -> usize {
        4 + self.num_classes
    }
}

fn clamp_unit(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_size, 640);
        assert!((config.conf_threshold - 0.25).abs() < f32::EPSILON);
        assert!((config.iou_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.nms_policy, NmsPolicy::CrossClass);
        assert_eq!(config.remap_strategy, RemapStrategy::Letterbox);
        assert_eq!(config.live_interval(), Duration::from_millis(300));
        assert_eq!(config.features_per_anchor(), 12);
    }

    #[test]
    fn test_validation_clamps() {
        let config = PipelineConfig::default()
            .with_input_size(1)
            .with_conf_threshold(1.5)
            .with_iou_threshold(f32::NAN)
            .with_live_interval(Duration::from_millis(1))
            .validated();

        assert_eq!(config.input_size, MIN_INPUT_SIZE);
        assert!((config.conf_threshold - 1.0).abs() < f32::EPSILON);
        assert!((config.iou_threshold - DEFAULT_IOU_THRESHOLD).abs() < f32::EPSILON);
        assert_eq!(config.live_interval_ms, MIN_LIVE_INTERVAL_MS);
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = PipelineConfig::from_json(
            r#"{"input_size": 320, "nms_policy": "per_class", "language": "de"}"#,
        )
        .unwrap();

        assert_eq!(config.input_size, 320);
        assert_eq!(config.nms_policy, NmsPolicy::PerClass);
        assert_eq!(config.language, Language::De);
        assert_eq!(config.num_classes, DEFAULT_NUM_CLASSES);
    }

    #[test]
    fn test_enrichment_endpoint_validated() {
        let kept = PipelineConfig::default()
            .with_enrichment_endpoint("https://api.example.com/graphql")
            .validated();
        assert_eq!(
            kept.enrichment_endpoint.as_deref(),
            Some("https://api.example.com/graphql")
        );

        let dropped = PipelineConfig::from_json(r#"{"enrichment_endpoint": "ftp://files.example.com"}"#)
            .unwrap();
        assert_eq!(dropped.enrichment_endpoint, None);
        assert_eq!(PipelineConfig::default().enrichment_endpoint, None);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            PipelineConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
