//! Recognition engine seam: the traits the lifecycle manager drives, plus
//! the error and capability types it records.

use std::fmt;
use std::path::PathBuf;

use image::RgbImage;
use thiserror::Error;

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::DetectedFace;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model pack not found: {}", .0.display())]
    ModelPackNotFound(PathBuf),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Backend(String),
}

/// A constructed face engine: detects faces and embeds each of them.
///
/// Implementations are shared across request threads once built.
pub trait RecognitionEngine: Send + Sync + 'static {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EngineError>;
}

/// Builds [`RecognitionEngine`]s. Construction is expensive and may fail.
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: RecognitionEngine;

    /// Check, once at startup, whether the recognition backend can work at all.
    fn probe(&self, settings: &EngineSettings) -> Capability;

    fn construct(&self, settings: &EngineSettings) -> Result<Self::Engine, EngineError>;
}

/// Parameters handed to the engine constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Directory that holds the model packs.
    pub model_root: PathBuf,
    /// Model pack name, e.g. `buffalo_l`.
    pub model_name: String,
    /// InsightFace-style context id: negative for CPU, otherwise a GPU index.
    pub ctx_id: i32,
    /// Square detection canvas side in pixels.
    pub det_size: u32,
}

impl EngineSettings {
    pub fn model_dir(&self) -> PathBuf {
        self.model_root.join(&self.model_name)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from("models"),
            model_name: "buffalo_l".to_string(),
            ctx_id: -1,
            det_size: 640,
        }
    }
}

/// Result of a startup capability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Capability::Available => None,
            Capability::Unavailable(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A required capability is absent; only a restart can fix it.
    DependencyMissing,
    EngineConstructionFailed,
    /// Inference on a built engine failed; the engine is rebuilt.
    InferenceFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::DependencyMissing => "dependency_missing",
            FailureKind::EngineConstructionFailed => "engine_construction_failed",
            FailureKind::InferenceFailed => "inference_error",
        }
    }
}

/// An engine-health failure as recorded by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}
