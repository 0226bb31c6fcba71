//! Model boundary.
//!
//! The orchestrator only sees [`InferenceEngine`]; the ONNX Runtime backed
//! implementation lives behind the `ml` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::DEFAULT_VISION_MODEL;
use crate::image_processing::Tensor;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("inference engine error: {0}")]
    Engine(String),

    #[error("invalid model output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    #[error("model configuration mismatch: {0}")]
    ModelMismatch(String),

    #[error("inference engine unavailable")]
    Unavailable,
}

/// Flat float output of one inference call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawOutput {
    data: Vec<f32>,
}

impl RawOutput {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

impl From<Vec<f32>> for RawOutput {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

/// Runs the detection model on a preprocessed tensor.
///
/// Implementations need not be reentrant. The orchestrator never has more
/// than one call in flight per engine.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn infer(&self, input: &Tensor) -> Result<RawOutput, InferenceError>;

    /// Optional one-off preparation, run before the first real frame.
    async fn warmup(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Name reported in result provenance.
    fn name(&self) -> &str {
        DEFAULT_VISION_MODEL
    }
}

#[cfg(feature = "ml")]
pub use ort_engine::OrtInferenceEngine;

#[cfg(feature = "ml")]
mod ort_engine {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use ndarray::Array2;
    use ort::session::Session;
    use tracing::{debug, error, instrument};

    use super::{InferenceEngine, InferenceError, RawOutput};
    use crate::config::PipelineConfig;
    use crate::image_processing::Tensor;
    use crate::vision::OutputLayout;

    /// Upper bound on anchors accepted from the model.
    const MAX_MODEL_ANCHORS: usize = 50_000;

    impl From<ort::Error> for InferenceError {
        fn from(e: ort::Error) -> Self {
            error!(error = %e, "onnx runtime error");
            InferenceError::Engine("internal inference error".into())
        }
    }

    /// ONNX Runtime session for a YOLO-style detector with a single
    /// `[1, 3, S, S]` input and a `[1, 4 + C, N]` or `[1, N, 4 + C]` output.
    pub struct OrtInferenceEngine {
        session: Arc<Mutex<Session>>,
        input_size: u32,
        features: usize,
        layout: OutputLayout,
    }

    impl OrtInferenceEngine {
        #[instrument(skip(model_bytes, config), fields(model_size = model_bytes.len()))]
        pub fn new(model_bytes: &[u8], config: &PipelineConfig) -> Result<Self, InferenceError> {
            let session = Session::builder()?.commit_from_memory(model_bytes)?;

            let input = session
                .inputs
                .first()
                .ok_or_else(|| InferenceError::ModelMismatch("model has no inputs".into()))?;
            let dims: Vec<i64> = input
                .input_type
                .tensor_dimensions()
                .ok_or_else(|| InferenceError::ModelMismatch("input is not a tensor".into()))?
                .collect();
            if dims.len() != 4 {
                return Err(InferenceError::ModelMismatch(format!(
                    "expected 4D input, got {}D",
                    dims.len()
                )));
            }
            let expected = i64::from(config.input_size);
            // dynamic axes report -1
            for dim in [dims[2], dims[3]] {
                if dim > 0 && dim != expected {
                    return Err(InferenceError::ModelMismatch(format!(
                        "model input {}x{} does not match configured size {}",
                        dims[3], dims[2], config.input_size
                    )));
                }
            }

            debug!(input_size = config.input_size, "model loaded");

            Ok(Self {
                session: Arc::new(Mutex::new(session)),
                input_size: config.input_size,
                features: config.features_per_anchor(),
                layout: config.output_layout,
            })
        }

        fn run(
            session: &Mutex<Session>,
            input: ndarray::Array4<f32>,
            features: usize,
            layout: OutputLayout,
        ) -> Result<RawOutput, InferenceError> {
            let value = ort::value::Value::from_array(input)?;
            let mut session = session
                .lock()
                .map_err(|_| InferenceError::Engine("session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![value])?;
            let output = outputs
                .get("output0")
                .or_else(|| outputs.get("output"))
                .ok_or_else(|| InferenceError::ModelMismatch("model missing output node".into()))?;
            let (shape, data) = output.try_extract_tensor::<f32>()?;

            if shape.len() != 3 || shape.iter().any(|&d| d < 0) {
                return Err(InferenceError::InvalidOutputShape {
                    expected: "[1, features, anchors] or [1, anchors, features]".into(),
                    got: format!("{:?}", &shape[..]),
                });
            }

            let (model_layout, anchors) = if shape[1] as usize == features {
                (OutputLayout::FeatureMajor, shape[2] as usize)
            } else if shape[2] as usize == features {
                (OutputLayout::AnchorMajor, shape[1] as usize)
            } else {
                return Err(InferenceError::InvalidOutputShape {
                    expected: format!("feature dim = {features}"),
                    got: format!("{:?}", &shape[..]),
                });
            };

            if anchors > MAX_MODEL_ANCHORS {
                return Err(InferenceError::InvalidOutputShape {
                    expected: format!("at most {MAX_MODEL_ANCHORS} anchors"),
                    got: format!("{anchors} anchors"),
                });
            }

            if model_layout == layout {
                return Ok(RawOutput::new(data.to_vec()));
            }

            let (rows, cols) = match model_layout {
                OutputLayout::FeatureMajor => (features, anchors),
                OutputLayout::AnchorMajor => (anchors, features),
            };
            let array = Array2::from_shape_vec((rows, cols), data.to_vec())
                .map_err(|e| InferenceError::Engine(e.to_string()))?;
            let transposed = array.t().as_standard_layout().into_owned();
            Ok(RawOutput::new(transposed.into_raw_vec_and_offset().0))
        }
    }

    #[async_trait]
    impl InferenceEngine for OrtInferenceEngine {
        async fn infer(&self, input: &Tensor) -> Result<RawOutput, InferenceError> {
            let (h, w, _) = input.shape();
            if h != self.input_size as usize || w != self.input_size as usize {
                return Err(InferenceError::InvalidOutputShape {
                    expected: format!("{0}x{0} input tensor", self.input_size),
                    got: format!("{w}x{h}"),
                });
            }

            let nchw = input.to_nchw();
            let session = Arc::clone(&self.session);
            let (features, layout) = (self.features, self.layout);
            tokio::task::spawn_blocking(move || Self::run(&session, nchw, features, layout))
                .await
                .map_err(|e| InferenceError::Engine(e.to_string()))?
        }

        async fn warmup(&self) -> Result<(), InferenceError> {
            let blank = Tensor::filled(self.input_size, 0.0);
            self.infer(&blank).await.map(|_| ())
        }

        fn name(&self) -> &str {
            "ONNX Runtime Object Detector"
        }
    }
}
