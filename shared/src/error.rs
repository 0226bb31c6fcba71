use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::DEFAULT_MAX_INPUT_BYTES;
use crate::image_processing::PreprocessError;
use crate::inference::InferenceError;
use crate::vision::VisionError;

/// How the shell should treat an error: offer a retry, ask for different
/// input, or give up on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Camera,
    ImageProcessing,
    ImageTooLarge,
    ImageFormatUnsupported,
    Inference,
    Timeout,
    Cancelled,
    Busy,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Camera => "CAMERA_ERROR",
            Self::ImageProcessing => "IMAGE_PROCESSING_ERROR",
            Self::ImageTooLarge => "IMAGE_TOO_LARGE",
            Self::ImageFormatUnsupported => "IMAGE_FORMAT_UNSUPPORTED",
            Self::Inference => "INFERENCE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Busy => "BUSY",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Camera | Self::Inference | Self::Timeout | Self::Busy => ErrorSeverity::Transient,
            Self::ImageProcessing
            | Self::ImageTooLarge
            | Self::ImageFormatUnsupported
            | Self::Cancelled => ErrorSeverity::Permanent,
            Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Camera | Self::Inference | Self::Timeout | Self::Busy
        )
    }

    #[must_use]
    pub fn user_facing_message(self) -> String {
        match self {
            Self::Camera => "Camera error. Please close and reopen the camera.".into(),
            Self::ImageProcessing => {
                "Unable to read the image. Please try a different photo.".into()
            }
            Self::ImageTooLarge => format!(
                "The image is too large. Please use an image smaller than {} MB.",
                DEFAULT_MAX_INPUT_BYTES / (1024 * 1024)
            ),
            Self::ImageFormatUnsupported => {
                "This image format is not supported. Please use JPEG, PNG, or WebP.".into()
            }
            Self::Inference => "Detection failed. Please try again.".into(),
            Self::Timeout => "Detection took too long. Please try again.".into(),
            Self::Cancelled => "The analysis was cancelled.".into(),
            Self::Busy => "An analysis is already running. Please wait a moment.".into(),
            Self::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

/// Failure of one analysis call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("image decode failed: {0}")]
    Decode(#[from] PreprocessError),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("model output rejected: {0}")]
    Output(#[from] VisionError),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("analysis superseded by a newer session")]
    Stale,

    #[error("an analysis is already in flight")]
    Busy,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Capture(_) => ErrorKind::Camera,
            AnalysisError::Decode(e) => match e {
                PreprocessError::InputTooLarge { .. } | PreprocessError::ImageTooLarge { .. } => {
                    ErrorKind::ImageTooLarge
                }
                PreprocessError::UnsupportedFormat => ErrorKind::ImageFormatUnsupported,
                _ => ErrorKind::ImageProcessing,
            },
            AnalysisError::Inference(_) | AnalysisError::Output(_) => ErrorKind::Inference,
            AnalysisError::Timeout(_) => ErrorKind::Timeout,
            AnalysisError::Stale => ErrorKind::Cancelled,
            AnalysisError::Busy => ErrorKind::Busy,
            AnalysisError::Internal(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Capture errors carry their own retry classification.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalysisError::Capture(e) => e.is_retryable(),
            other => other.kind().is_retryable(),
        }
    }

    /// Capture errors that cannot be retried are permanent; everything else
    /// follows its kind.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AnalysisError::Capture(e) if !e.is_retryable() => ErrorSeverity::Permanent,
            other => other.kind().default_severity(),
        }
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        self.kind().user_facing_message()
    }
}
