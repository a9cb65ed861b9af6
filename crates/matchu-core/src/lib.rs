//! matchu-core: Face verification engine.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime, behind a lazily-initialized engine manager
//! with failure backoff. The verification pipeline compares a selfie with
//! a live capture by cosine similarity of their primary-face embeddings.

pub mod alignment;
pub mod analysis;
pub mod detector;
pub mod engine;
pub mod extract;
pub mod lifecycle;
pub mod recognizer;
pub mod similarity;
pub mod types;
pub mod verify;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use analysis::{FaceAnalysis, OnnxFactory};
pub use engine::{
    Capability, EngineError, EngineFactory, EngineSettings, ErrorDetail, FailureKind,
    RecognitionEngine,
};
pub use extract::{probe_decoder, ExtractError, Extraction, FaceExtractor};
pub use lifecycle::{Clock, EngineManager, SystemClock, DEFAULT_RETRY_INTERVAL};
pub use similarity::{cosine_similarity, SimilarityError};
pub use types::{BoundingBox, DetectedFace, Embedding};
pub use verify::{Reason, VerificationDecision, Verifier, VerifyError};
