pub mod config;
pub mod core;

// Re-export commonly used items for convenience
pub use crate::config::{AsrConfig, CorrectorConfig, PipelineConfig, TtsConfig};
pub use crate::core::*;
