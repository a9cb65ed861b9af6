//! Image bytes → primary-face embedding.

use std::sync::Arc;

use image::{ImageFormat, RgbImage};
use thiserror::Error;

use crate::engine::{Capability, EngineFactory, ErrorDetail, FailureKind, RecognitionEngine};
use crate::lifecycle::{Clock, EngineManager, SystemClock};
use crate::types::{DetectedFace, Embedding};

/// Formats uploads are expected to arrive in.
const REQUIRED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("engine_unavailable")]
    EngineUnavailable,
    #[error("invalid_image")]
    InvalidImage,
    #[error("face_not_detected")]
    FaceNotDetected,
    /// The engine failed while running; the caller must report it to the
    /// manager with [`EngineManager::mark_unhealthy`].
    #[error("inference failed: {0}")]
    InferenceFailed(ErrorDetail),
}

impl ExtractError {
    /// Caller-facing reason code. Inference faults read as an unavailable engine.
    pub fn reason(&self) -> &'static str {
        match self {
            ExtractError::EngineUnavailable | ExtractError::InferenceFailed(_) => {
                "engine_unavailable"
            }
            ExtractError::InvalidImage => "invalid_image",
            ExtractError::FaceNotDetected => "face_not_detected",
        }
    }
}

/// Check that the image decoder was built with the formats we accept.
pub fn probe_decoder() -> Capability {
    let missing: Vec<String> = REQUIRED_FORMATS
        .iter()
        .filter(|f| !f.reading_enabled())
        .map(|f| format!("{f:?}"))
        .collect();
    if missing.is_empty() {
        Capability::Available
    } else {
        Capability::Unavailable(format!("image decoder lacks support for {}", missing.join(", ")))
    }
}

/// Decode arbitrary image bytes into an 8-bit RGB image.
pub fn decode_image(bytes: &[u8]) -> Option<RgbImage> {
    match image::load_from_memory(bytes) {
        Ok(image) => Some(image.to_rgb8()),
        Err(e) => {
            tracing::debug!(error = %e, len = bytes.len(), "image decode failed");
            None
        }
    }
}

/// Pick the face with the largest box area; the first wins on ties.
pub fn select_primary_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces.into_iter().fold(None, |best, face| match best {
        Some(b) if b.bbox.area() >= face.bbox.area() => Some(b),
        _ => Some(face),
    })
}

/// Outcome of one extraction plus the engine that served it, if any.
pub struct Extraction<E> {
    pub result: Result<Embedding, ExtractError>,
    pub engine: Option<Arc<E>>,
}

impl<E> Extraction<E> {
    fn without_engine(error: ExtractError) -> Self {
        Self {
            result: Err(error),
            engine: None,
        }
    }
}

/// Extracts the primary face embedding of an uploaded image.
pub struct FaceExtractor<F: EngineFactory, C: Clock = SystemClock> {
    manager: Arc<EngineManager<F, C>>,
}

impl<F: EngineFactory, C: Clock> Clone for FaceExtractor<F, C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<F: EngineFactory, C: Clock> FaceExtractor<F, C> {
    pub fn new(manager: Arc<EngineManager<F, C>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<EngineManager<F, C>> {
        &self.manager
    }

    pub fn extract(&self, image_bytes: &[u8]) -> Result<Embedding, ExtractError> {
        self.run(image_bytes).result
    }

    /// Like [`extract`](Self::extract), also handing back the engine used so
    /// inference faults can be reported against it.
    pub fn run(&self, image_bytes: &[u8]) -> Extraction<F::Engine> {
        if !self.manager.decoder().is_available() {
            return Extraction::without_engine(ExtractError::EngineUnavailable);
        }
        let Some(engine) = self.manager.acquire() else {
            return Extraction::without_engine(ExtractError::EngineUnavailable);
        };
        let result = Self::embed(engine.as_ref(), image_bytes);
        Extraction {
            result,
            engine: Some(engine),
        }
    }

    fn embed(engine: &F::Engine, image_bytes: &[u8]) -> Result<Embedding, ExtractError> {
        if image_bytes.is_empty() {
            return Err(ExtractError::InvalidImage);
        }
        let image = decode_image(image_bytes).ok_or(ExtractError::InvalidImage)?;

        let faces = engine.detect(&image).map_err(|e| {
            ExtractError::InferenceFailed(ErrorDetail::new(
                FailureKind::InferenceFailed,
                e.to_string(),
            ))
        })?;
        tracing::debug!(
            faces = faces.len(),
            width = image.width(),
            height = image.height(),
            "faces detected"
        );

        select_primary_face(faces)
            .and_then(|face| face.embedding)
            .ok_or(ExtractError::FaceNotDetected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::mock::{face, solid_png, FakeClock, ScriptedFactory};

    const RED: [u8; 3] = [255, 0, 0];
    const GREEN: [u8; 3] = [0, 255, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    fn extractor(factory: ScriptedFactory) -> FaceExtractor<ScriptedFactory, FakeClock> {
        let manager = EngineManager::with_clock(
            factory,
            EngineSettings::default(),
            Capability::Available,
            FakeClock::new(),
        );
        FaceExtractor::new(Arc::new(manager))
    }

    #[test]
    fn test_probe_decoder_with_default_features() {
        assert_eq!(probe_decoder(), Capability::Available);
    }

    #[test]
    fn test_empty_bytes_are_invalid() {
        let ex = extractor(ScriptedFactory::default());
        assert_eq!(ex.extract(&[]), Err(ExtractError::InvalidImage));
    }

    #[test]
    fn test_garbage_bytes_are_invalid() {
        let ex = extractor(ScriptedFactory::default());
        assert_eq!(ex.extract(b"definitely not an image"), Err(ExtractError::InvalidImage));
    }

    #[test]
    fn test_no_faces() {
        let ex = extractor(ScriptedFactory::default());
        assert_eq!(ex.extract(&solid_png(RED)), Err(ExtractError::FaceNotDetected));
    }

    #[test]
    fn test_largest_face_wins() {
        let factory = ScriptedFactory::default().with_faces(
            RED,
            vec![
                face(0.0, 0.0, 10.0, 10.0, Some(vec![1.0, 0.0])),
                face(0.0, 0.0, 30.0, 20.0, Some(vec![0.0, 1.0])),
                face(5.0, 5.0, 20.0, 20.0, Some(vec![1.0, 1.0])),
            ],
        );
        let ex = extractor(factory);
        assert_eq!(ex.extract(&solid_png(RED)).unwrap().values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_tie_keeps_first_face() {
        let faces = vec![
            face(0.0, 0.0, 10.0, 10.0, Some(vec![1.0])),
            face(50.0, 50.0, 60.0, 60.0, Some(vec![2.0])),
        ];
        let primary = select_primary_face(faces).unwrap();
        assert_eq!(primary.embedding.unwrap().values, vec![1.0]);
    }

    #[test]
    fn test_primary_face_without_embedding() {
        let factory = ScriptedFactory::default().with_faces(
            GREEN,
            vec![
                face(0.0, 0.0, 10.0, 10.0, Some(vec![1.0, 0.0])),
                face(0.0, 0.0, 50.0, 50.0, None),
            ],
        );
        let ex = extractor(factory);
        assert_eq!(ex.extract(&solid_png(GREEN)), Err(ExtractError::FaceNotDetected));
    }

    #[test]
    fn test_engine_unavailable_before_decoding() {
        let ex = extractor(ScriptedFactory::default().fail_first(1));
        // Even invalid bytes report the engine first.
        assert_eq!(ex.extract(&[]), Err(ExtractError::EngineUnavailable));
    }

    #[test]
    fn test_decoder_unavailable_skips_engine() {
        let factory = ScriptedFactory::default();
        let manager = EngineManager::with_clock(
            factory.clone(),
            EngineSettings::default(),
            Capability::Unavailable("no decoder".into()),
            FakeClock::new(),
        );
        let ex = FaceExtractor::new(Arc::new(manager));
        assert_eq!(ex.extract(&solid_png(RED)), Err(ExtractError::EngineUnavailable));
        assert_eq!(factory.constructions(), 0);
    }

    #[test]
    fn test_run_returns_serving_engine() {
        let ex = extractor(ScriptedFactory::default().with_failure(BLUE, "cuda oom"));
        let extraction = ex.run(&solid_png(BLUE));
        let engine = extraction.engine.unwrap();
        assert!(Arc::ptr_eq(&engine, &ex.manager().acquire().unwrap()));
        assert!(matches!(extraction.result, Err(ExtractError::InferenceFailed(_))));
    }

    #[test]
    fn test_inference_failure_is_classified() {
        let ex = extractor(ScriptedFactory::default().with_failure(BLUE, "cuda oom"));
        let err = ex.extract(&solid_png(BLUE)).unwrap_err();
        assert_eq!(err.reason(), "engine_unavailable");
        match err {
            ExtractError::InferenceFailed(detail) => {
                assert_eq!(detail.kind, FailureKind::InferenceFailed);
                assert!(detail.message.contains("cuda oom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
