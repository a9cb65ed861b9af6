//! Test doubles for the engine seam: a scripted engine keyed by image
//! color, a counting factory and a manually advanced clock.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;

use crate::engine::{Capability, EngineError, EngineFactory, EngineSettings, RecognitionEngine};
use crate::lifecycle::Clock;
use crate::types::{BoundingBox, DetectedFace, Embedding};

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct FakeClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[derive(Debug, Clone)]
enum Script {
    Faces(Vec<DetectedFace>),
    Fail(String),
}

/// Engine whose answer depends on the color of the image's top-left pixel.
/// Unscripted colors yield no faces.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    scripts: HashMap<[u8; 3], Script>,
}

impl RecognitionEngine for ScriptedEngine {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, EngineError> {
        let Rgb(color) = *image.get_pixel(0, 0);
        match self.scripts.get(&color) {
            Some(Script::Faces(faces)) => Ok(faces.clone()),
            Some(Script::Fail(message)) => Err(EngineError::Backend(message.clone())),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct FactoryInner {
    constructions: AtomicUsize,
}

/// Factory that counts constructions and can fail on demand.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    inner: Arc<FactoryInner>,
    fail_first: usize,
    delay: Duration,
    capability: Option<String>,
    engine: ScriptedEngine,
}

impl ScriptedFactory {
    /// Fail the first `n` construction attempts.
    pub fn fail_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Sleep inside `construct` to widen race windows.
    pub fn construct_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report the backend as missing from `probe`.
    pub fn unavailable(mut self, reason: &str) -> Self {
        self.capability = Some(reason.to_string());
        self
    }

    pub fn with_faces(mut self, color: [u8; 3], faces: Vec<DetectedFace>) -> Self {
        self.engine.scripts.insert(color, Script::Faces(faces));
        self
    }

    pub fn with_failure(mut self, color: [u8; 3], message: &str) -> Self {
        self.engine.scripts.insert(color, Script::Fail(message.to_string()));
        self
    }

    pub fn constructions(&self) -> usize {
        self.inner.constructions.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ScriptedFactory {
    type Engine = ScriptedEngine;

    fn probe(&self, _settings: &EngineSettings) -> Capability {
        match &self.capability {
            Some(reason) => Capability::Unavailable(reason.clone()),
            None => Capability::Available,
        }
    }

    fn construct(&self, _settings: &EngineSettings) -> Result<ScriptedEngine, EngineError> {
        let attempt = self.inner.constructions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if attempt < self.fail_first {
            return Err(EngineError::Backend(format!("scripted failure #{}", attempt + 1)));
        }
        Ok(self.engine.clone())
    }
}

/// A face with corner coordinates and an optional embedding.
pub fn face(x1: f32, y1: f32, x2: f32, y2: f32, embedding: Option<Vec<f32>>) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox::from_corners(x1, y1, x2, y2, 0.9),
        embedding: embedding.map(Embedding::new),
    }
}

/// PNG bytes of a small image filled with `color`.
pub fn solid_png(color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(8, 8, Rgb(color));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("in-memory PNG encoding");
    bytes
}
