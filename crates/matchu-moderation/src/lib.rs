//! matchu-moderation: chat message moderation.
//!
//! Classifies a message into one of six categories with an ONNX
//! transformer and serves the verdict over HTTP.

pub mod api;
pub mod classifier;
pub mod config;

pub use api::create_router;
pub use classifier::{LABELS, Moderation, ModerationError, OnnxClassifier, TextClassifier};
pub use config::{Config, ConfigError};
