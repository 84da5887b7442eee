//! Pattern memory: stores completed trades as labeled feature vectors and
//! retrieves the most similar history for a pending decision, with exposure
//! accounting that keeps any single pattern from dominating repeated
//! evaluations.

pub mod classifier;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod exposure;
pub mod logging;
pub mod record;
pub mod similarity;
pub mod store;

pub use config::Config;
pub use engine::PatternMemory;
pub use error::{MemoryError, Result};
