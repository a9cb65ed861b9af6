//! matchud: HTTP face verification daemon.
//!
//! Wraps the `matchu-core` verification pipeline in an Axum API with
//! engine health reporting.

pub mod api;
pub mod config;

pub use api::{AppState, create_router};
pub use config::{Config, ConfigError};
