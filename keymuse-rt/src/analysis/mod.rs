//! CPU-bound analysis: typing statistics extraction and emotion mapping
//!
//! Both steps are pure functions over a snapshot of buffered events; the
//! scheduler runs them on the worker pool, never on the connection path.

pub mod emotion;
pub mod extractor;

pub use emotion::EmotionMapper;
pub use extractor::{Extraction, PatternExtractor};
