//! ONNX-backed recognition engine: an SCRFD detector and an ArcFace
//! recognizer loaded from an InsightFace model pack.

use std::path::{Path, PathBuf};

use image::RgbImage;
use ort::session::Session;
use parking_lot::Mutex;

use crate::detector::FaceDetector;
use crate::engine::{Capability, EngineError, EngineFactory, EngineSettings, RecognitionEngine};
use crate::recognizer::FaceRecognizer;
use crate::types::DetectedFace;

const DETECTOR_PREFIXES: [&str; 2] = ["det_", "scrfd"];
const RECOGNIZER_PREFIXES: [&str; 3] = ["w600k", "glintr", "arcface"];

/// Execution target for ONNX sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl Device {
    /// Negative context ids select the CPU, as in InsightFace.
    pub fn from_ctx_id(ctx_id: i32) -> Self {
        if ctx_id < 0 {
            Device::Cpu
        } else {
            Device::Cuda(ctx_id)
        }
    }
}

pub(crate) fn build_session(model_path: &Path, device: Device) -> ort::Result<Session> {
    let builder = Session::builder()?.with_intra_threads(2)?;
    let builder = match device {
        Device::Cpu => builder,
        #[cfg(feature = "cuda")]
        Device::Cuda(id) => builder.with_execution_providers([
            ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(id)
                .build(),
        ])?,
        #[cfg(not(feature = "cuda"))]
        Device::Cuda(id) => {
            tracing::warn!(
                device_id = id,
                "GPU context requested but built without `cuda`; using CPU"
            );
            builder
        }
    };
    builder.commit_from_file(model_path)
}

/// Detector and recognizer files found in a model pack directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPack {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPack {
    /// Locate the detection and recognition models by file-name prefix.
    pub fn discover(dir: &Path) -> Result<Self, EngineError> {
        let entries =
            std::fs::read_dir(dir).map_err(|_| EngineError::ModelPackNotFound(dir.to_path_buf()))?;
        let mut onnx: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
            .collect();
        onnx.sort();

        let pick = |prefixes: &[&str]| {
            onnx.iter()
                .find(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| prefixes.iter().any(|pre| n.starts_with(pre)))
                })
                .cloned()
        };

        match (pick(&DETECTOR_PREFIXES), pick(&RECOGNIZER_PREFIXES)) {
            (Some(detector), Some(recognizer)) => Ok(Self { detector, recognizer }),
            _ => Err(EngineError::ModelPackNotFound(dir.to_path_buf())),
        }
    }
}

/// SCRFD + ArcFace pipeline over one model pack.
///
/// `ort` sessions need exclusive access to run, so each session sits behind
/// its own mutex; concurrent requests serialize per model, not per engine.
pub struct FaceAnalysis {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
}

impl FaceAnalysis {
    pub fn load(settings: &EngineSettings) -> Result<Self, EngineError> {
        let pack = ModelPack::discover(&settings.model_dir())?;
        let device = Device::from_ctx_id(settings.ctx_id);

        let detector = FaceDetector::load(&pack.detector, settings.det_size, device)?;
        let recognizer = FaceRecognizer::load(&pack.recognizer, device)?;
        tracing::info!(model = %settings.model_name, ?device, "face analysis ready");

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl RecognitionEngine for FaceAnalysis {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EngineError> {
        let boxes = self.detector.lock().detect(image)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let mut recognizer = self.recognizer.lock();
        boxes
            .into_iter()
            .map(|bbox| {
                let embedding = match bbox.landmarks {
                    Some(_) => Some(recognizer.extract(image, &bbox)?),
                    None => None,
                };
                Ok(DetectedFace { bbox, embedding })
            })
            .collect()
    }
}

/// Builds [`FaceAnalysis`] engines from the configured model pack.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxFactory;

impl EngineFactory for OnnxFactory {
    type Engine = FaceAnalysis;

    fn probe(&self, settings: &EngineSettings) -> Capability {
        match ModelPack::discover(&settings.model_dir()) {
            Ok(_) => Capability::Available,
            Err(e) => Capability::Unavailable(e.to_string()),
        }
    }

    fn construct(&self, settings: &EngineSettings) -> Result<FaceAnalysis, EngineError> {
        FaceAnalysis::load(settings)
    }
}
