//! Result types returned by a generation run.

use crate::error::ImageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting reported by the model at the end of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Tokens spent on reasoning, when the provider reports them separately.
    #[serde(default)]
    pub reasoning_tokens: usize,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// The accumulated model answer for one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkAnswer {
    /// 1-indexed chunk number.
    pub chunk_num: usize,
    pub answer: String,
    /// Length in characters of the discarded reasoning stream.
    pub reasoning_chars: usize,
    pub usage: Option<TokenUsage>,
    pub duration_ms: u64,
}

/// Outcome of analysing one unique image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReport {
    /// 1-indexed position in the global image order.
    pub index: usize,
    /// Anchor label, e.g. `para_3_run_1` or `page_2_img_1`.
    pub anchor: String,
    /// Replacement text spliced into the document (empty = filtered).
    pub replacement: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub retries: u8,
    pub error: Option<ImageError>,
}

/// Aggregate run statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationStats {
    /// Characters in the linearized context after stripping.
    pub context_chars: usize,
    pub total_chunks: usize,
    /// Unique image slots in the global order.
    pub total_images: usize,
    /// Images whose replacement ended up non-empty.
    pub described_images: usize,
    /// Anchors dropped because they could not be resolved.
    pub dropped_anchors: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
    pub image_duration_ms: u64,
    pub llm_duration_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Final text: pretty-printed renumbered records, or the raw answer when
    /// repair failed.
    pub text: String,
    /// All chunk answers concatenated in chunk order.
    pub raw_answer: String,
    /// Renumbered records (empty when repair failed).
    pub records: Vec<Value>,
    /// `true` when `text` is the repaired JSON rather than the raw answer.
    pub repaired: bool,
    pub chunks: Vec<ChunkAnswer>,
    pub images: Vec<ImageReport>,
    pub stats: GenerationStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_adds_fieldwise() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            reasoning_tokens: 2,
        });
        total.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            reasoning_tokens: 0,
        });
        assert_eq!(
            total,
            TokenUsage {
                input_tokens: 11,
                output_tokens: 6,
                reasoning_tokens: 2
            }
        );
    }

    #[test]
    fn image_report_serializes_error() {
        let report = ImageReport {
            index: 1,
            anchor: "para_1_run_1".into(),
            replacement: String::new(),
            width: Some(10),
            height: Some(10),
            retries: 0,
            error: Some(ImageError::TooSmall {
                index: 1,
                width: 10,
                height: 10,
                bytes: 50,
            }),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["error"]["TooSmall"].is_object());
    }
}
