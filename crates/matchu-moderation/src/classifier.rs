//! Sequence classifier for chat messages.
//!
//! A fine-tuned transformer exported to ONNX produces six logits per
//! message; the label is the argmax of their softmax.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokenizers::{Tokenizer, TruncationParams};

/// Output classes, indexed by logit position.
pub const LABELS: [&str; 6] = [
    "grooming",
    "hate_or_threat",
    "insult",
    "normal",
    "scam",
    "sexual",
];

#[derive(Error, Debug)]
pub enum ModerationError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("tokenizer: {0}")]
    Tokenizer(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Moderation {
    pub label: &'static str,
    /// Softmax probability of `label`.
    pub score: f32,
}

/// Anything that scores a message against [`LABELS`].
pub trait TextClassifier: Send + Sync + 'static {
    /// Raw logits, one per label.
    fn logits(&self, text: &str) -> Result<Vec<f32>, ModerationError>;

    fn classify(&self, text: &str) -> Result<Moderation, ModerationError> {
        let logits = self.logits(text)?;
        if logits.len() != LABELS.len() {
            return Err(ModerationError::UnexpectedOutput(format!(
                "expected {} logits, got {}",
                LABELS.len(),
                logits.len()
            )));
        }
        let probs = softmax(&logits);
        let (index, score) = argmax(&probs)
            .ok_or_else(|| ModerationError::UnexpectedOutput("no logits".to_string()))?;
        Ok(Moderation {
            label: LABELS[index],
            score,
        })
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the largest element; the first wins on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

/// Transformer classifier running through ONNX Runtime.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl OnnxClassifier {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn load(model_dir: &Path, max_length: usize) -> Result<Self, ModerationError> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");
        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(ModerationError::ModelNotFound(path.clone()));
            }
        }

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModerationError::Tokenizer(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..TruncationParams::default()
            }))
            .map_err(|e| ModerationError::Tokenizer(e.to_string()))?;
        tokenizer.with_padding(None);

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)?;
        tracing::info!(
            path = %model_path.display(),
            max_length,
            "loaded moderation model"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }
}

impl TextClassifier for OnnxClassifier {
    fn logits(&self, text: &str) -> Result<Vec<f32>, ModerationError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| ModerationError::Tokenizer(e.to_string()))?;

        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        let mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| i64::from(m))
            .collect();
        let len = ids.len();
        let ids = Array2::from_shape_vec((1, len), ids)
            .map_err(|e| ModerationError::UnexpectedOutput(e.to_string()))?;
        let mask = Array2::from_shape_vec((1, len), mask)
            .map_err(|e| ModerationError::UnexpectedOutput(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            "input_ids" => TensorRef::from_array_view(ids.view())?,
            "attention_mask" => TensorRef::from_array_view(mask.view())?,
        ])?;
        let (_, logits) = outputs[0].try_extract_tensor::<f32>()?;
        tracing::debug!(tokens = len, "message classified");
        Ok(logits.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<f32>);

    impl TextClassifier for Fixed {
        fn logits(&self, _text: &str) -> Result<Vec<f32>, ModerationError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_large_logits() {
        let probs = softmax(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_first_on_tie() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_classify_picks_label() {
        let classifier = Fixed(vec![0.0, 0.0, 0.0, 5.0, 0.0, 0.0]);
        let verdict = classifier.classify("xin chào").unwrap();
        assert_eq!(verdict.label, "normal");
        let expected = 5f32.exp() / (5f32.exp() + 5.0);
        assert!((verdict.score - expected).abs() < 1e-5);
    }

    #[test]
    fn test_classify_rejects_wrong_width() {
        let classifier = Fixed(vec![1.0, 2.0]);
        assert!(matches!(
            classifier.classify("hi"),
            Err(ModerationError::UnexpectedOutput(_))
        ));
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxClassifier::load(Path::new("/nonexistent/moderation"), 256)
            .err()
            .unwrap();
        assert!(matches!(err, ModerationError::ModelNotFound(_)));
    }
}
