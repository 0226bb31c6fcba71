use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisResult;
use crate::error::{AnalysisError, ErrorSeverity};

/// Where the current analysis session is.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    #[default]
    Idle,
    Capturing,
    Preprocessing,
    Inferring,
    Decoding,
    Enriching,
    Done,
    Error,
}

impl AnalysisStage {
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Done | Self::Error)
    }
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    #[default]
    SingleShot,
    Live,
}

#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Online,
    Offline,
}

impl NetworkMode {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

/// Error as shown to the user. Internal detail stays in the logs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserFacingError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub severity: ErrorSeverity,
}

impl From<&AnalysisError> for UserFacingError {
    fn from(err: &AnalysisError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.user_facing_message(),
            retryable: err.is_retryable(),
            severity: err.severity(),
        }
    }
}

/// Snapshot published to the shell after every stage change.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AnalysisView {
    pub stage: AnalysisStage,
    pub mode: AnalysisMode,
    pub network: NetworkMode,
    /// Session generation this snapshot belongs to.
    pub generation: u64,
    pub model_ready: bool,
    pub result: Option<AnalysisResult>,
    pub error: Option<UserFacingError>,
    pub frames_analyzed: u64,
}

impl AnalysisView {
    pub fn detection_count(&self) -> usize {
        self.result.as_ref().map_or(0, |r| r.detections.len())
    }

    pub fn top_confidence(&self) -> f32 {
        self.result
            .as_ref()
            .and_then(AnalysisResult::top_detection)
            .map_or(0.0, |d| d.confidence)
    }
}
