#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod analysis;
pub mod app;
pub mod capture;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod image_processing;
pub mod inference;
pub mod knowledge;
pub mod logging;
pub mod model;
pub mod nms;
pub mod orchestrator;
pub mod vision;

pub use analysis::{
    content_hash, AnalysisResult, ModelProvenance, RecyclingPlanItem, StageTimings,
};
pub use app::{App, Capabilities, CoreSettings, Effect, Event, Model};
pub use capture::{CaptureError, FrameSource, ImageLoader, ImageSource, LocalImageLoader};
pub use config::{ConfigError, PipelineConfig};
#[cfg(feature = "http-client")]
pub use enrichment::ReqwestTransport;
pub use enrichment::{AiInsights, EnrichmentError, EnrichmentKey, HttpTransport, TransportResponse};
pub use error::{AnalysisError, ErrorKind, ErrorSeverity};
pub use image_processing::{ImagePreprocessor, LetterboxMeta, PreprocessError, Tensor};
#[cfg(feature = "ml")]
pub use inference::OrtInferenceEngine;
pub use inference::{InferenceEngine, InferenceError, RawOutput};
pub use knowledge::{GermanBin, Language, RecyclingInfo, RecyclingKnowledgeMapper, WasteClass};
pub use model::{AnalysisMode, AnalysisStage, AnalysisView, NetworkMode, UserFacingError};
pub use nms::{iou, NmsPolicy, NonMaxSuppressor, Suppressed};
pub use orchestrator::{AnalysisOrchestrator, LiveSession, OrchestratorBuilder};
pub use vision::{
    BBox, CandidateDetection, CoordinateRemapper, Detection, DetectionDecoder, OutputLayout,
    RemapStrategy, VisionError,
};
