//! Selfie-vs-live verification decisions.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineFactory;
use crate::extract::{ExtractError, FaceExtractor};
use crate::lifecycle::{Clock, EngineManager, SystemClock};
use crate::types::Embedding;

/// Why a verification did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    InvalidImage,
    FaceNotDetected,
    EmbeddingError,
    FaceMismatch,
}

/// Caller-visible outcome of a verification request.
///
/// `similarity` and `threshold` are only reported once both embeddings were
/// compared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationDecision {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl VerificationDecision {
    fn rejected(reason: Reason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            similarity: None,
            threshold: None,
        }
    }

    fn scored(similarity: f32, threshold: f32) -> Self {
        let success = similarity >= threshold;
        Self {
            success,
            reason: (!success).then_some(Reason::FaceMismatch),
            similarity: Some(similarity),
            threshold: Some(threshold),
        }
    }
}

/// The only failure that escapes as an error instead of a decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error(
        "Face recognition engine is unavailable.{}",
        .detail.as_deref().map(|d| format!(" {d}")).unwrap_or_default()
    )]
    EngineUnavailable { detail: Option<String> },
}

/// Drives extraction for both images and applies the threshold.
pub struct Verifier<F: EngineFactory, C: Clock = SystemClock> {
    extractor: FaceExtractor<F, C>,
}

impl<F: EngineFactory, C: Clock> Clone for Verifier<F, C> {
    fn clone(&self) -> Self {
        Self {
            extractor: self.extractor.clone(),
        }
    }
}

impl<F: EngineFactory, C: Clock> Verifier<F, C> {
    pub fn new(manager: Arc<EngineManager<F, C>>) -> Self {
        Self {
            extractor: FaceExtractor::new(manager),
        }
    }

    pub fn manager(&self) -> &Arc<EngineManager<F, C>> {
        self.extractor.manager()
    }

    pub fn verify(
        &self,
        selfie: &[u8],
        live: &[u8],
        threshold: f32,
    ) -> Result<VerificationDecision, VerifyError> {
        let selfie = self.extract(selfie, "selfie");
        let live = self.extract(live, "live");

        let unavailable = |r: &Result<Embedding, ExtractError>| {
            matches!(r, Err(ExtractError::EngineUnavailable))
        };
        if unavailable(&selfie) || unavailable(&live) {
            return Err(VerifyError::EngineUnavailable {
                detail: self.manager().last_error(),
            });
        }

        let (selfie, live) = match (selfie, live) {
            (Ok(s), Ok(l)) => (s, l),
            (Err(ExtractError::InvalidImage), _) | (_, Err(ExtractError::InvalidImage)) => {
                return Ok(VerificationDecision::rejected(Reason::InvalidImage));
            }
            _ => return Ok(VerificationDecision::rejected(Reason::FaceNotDetected)),
        };

        let similarity = match selfie.similarity(&live) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "embedding comparison failed");
                return Ok(VerificationDecision::rejected(Reason::EmbeddingError));
            }
        };

        let decision = VerificationDecision::scored(similarity, threshold);
        tracing::info!(
            similarity,
            threshold,
            success = decision.success,
            "face verification decided"
        );
        Ok(decision)
    }

    /// Extract one image, reporting inference faults to the manager.
    fn extract(&self, bytes: &[u8], which: &'static str) -> Result<Embedding, ExtractError> {
        let extraction = self.extractor.run(bytes);
        match extraction.result {
            Err(ExtractError::InferenceFailed(detail)) => {
                tracing::error!(image = which, error = %detail, "face inference failed");
                if let Some(engine) = &extraction.engine {
                    self.manager().mark_unhealthy(engine, detail);
                }
                Err(ExtractError::EngineUnavailable)
            }
            Err(e) => {
                tracing::debug!(image = which, reason = e.reason(), "extraction failed");
                Err(e)
            }
            ok => ok,
        }
    }
}
