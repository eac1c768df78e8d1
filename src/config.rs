//! Declarative pipeline configuration.
//!
//! Everything here deserializes from JSON with camelCase keys, so one
//! document can configure a whole session: which vendors to use, how the
//! recognition side is gated, the synthesis voice, correction rules and the
//! cache bounds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::asr::{AsrProviderId, TranscribeOptions};
use crate::core::packet::StreamFormat;
use crate::core::tts::TtsProviderId;

pub use crate::core::cache::CacheConfig;

/// Recognition side of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AsrConfig {
    pub provider: AsrProviderId,
    #[serde(flatten)]
    pub options: TranscribeOptions,
    /// Open a provider stream per utterance instead of keeping one stream
    /// for the whole call.
    pub gated: bool,
    /// Lookback replayed as pre-roll when a gated stream opens, in
    /// milliseconds.
    pub lookback_ms: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            provider: AsrProviderId::new("mock"),
            options: TranscribeOptions::default(),
            gated: false,
            lookback_ms: 500,
        }
    }
}

/// Synthesis side of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtsConfig {
    pub provider: TtsProviderId,
    pub voice: String,
    pub model: String,
    /// Speaking rate multiplier, 1.0 is the provider default.
    pub speech_rate: f32,
    pub format: StreamFormat,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProviderId::new("mock"),
            voice: "default".to_string(),
            model: "default".to_string(),
            speech_rate: 1.0,
            format: StreamFormat::default(),
        }
    }
}

/// Transcript correction rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrectorConfig {
    /// Exact word replacements applied to segmented transcripts.
    pub replace_words: HashMap<String, String>,
    /// Replacement candidates matched by pinyin similarity.
    pub fuzzy_words: Vec<String>,
}

/// Complete per-session pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub corrector: CorrectorConfig,
    pub cache: CacheConfig,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.asr.provider.as_str(), "mock");
        assert!(!config.asr.gated);
        assert_eq!(config.tts.speech_rate, 1.0);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_deserializes_partial_document() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "asr": {"provider": "mock", "gated": true, "lookbackMs": 300},
                "corrector": {"replaceWords": {"令克": "灵刻"}, "fuzzyWords": ["南京"]}
            }"#,
        )
        .unwrap();
        assert!(config.asr.gated);
        assert_eq!(config.asr.lookback_ms, 300);
        assert_eq!(config.corrector.replace_words["令克"], "灵刻");
        assert_eq!(config.tts.voice, "default");
    }
}
