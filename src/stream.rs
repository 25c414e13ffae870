//! Delta stream consumption.
//!
//! A chat model answers with a pull-based stream of [`Delta`] events: the
//! reasoning trace first (for reasoning models), then the answer, then an
//! optional usage marker. One [`StreamAccumulator`] per chunk collects them;
//! [`accumulate`] drives it to exhaustion, forwarding every answer update to
//! the progress callback and checking for cancellation after each delta.

use crate::error::CaseGenError;
use crate::generate::CancelToken;
use crate::output::{ChunkAnswer, TokenUsage};
use crate::progress::ProgressCallback;
use futures::StreamExt;
use std::pin::Pin;
use std::time::Instant;
use tokio_stream::Stream;
use tracing::debug;

/// One incremental event from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Reasoning(String),
    Answer(String),
    Usage(TokenUsage),
}

/// A boxed stream of model deltas. Dropping it releases the connection.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Delta, CaseGenError>> + Send>>;

/// What the caller should forward after a delta was pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    /// Nothing visible changed (reasoning, usage, empty answer delta).
    Nothing,
    /// New answer text; `first` is set exactly once per accumulator.
    Answer { delta: String, first: bool },
}

/// Per-chunk buffers for reasoning and answer text.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    reasoning: String,
    answer: String,
    answer_started: bool,
    usage: Option<TokenUsage>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: Delta) -> Forward {
        match delta {
            Delta::Reasoning(text) => {
                self.reasoning.push_str(&text);
                Forward::Nothing
            }
            Delta::Answer(text) if text.is_empty() => Forward::Nothing,
            Delta::Answer(text) => {
                let first = !self.answer_started;
                self.answer_started = true;
                self.answer.push_str(&text);
                Forward::Answer { delta: text, first }
            }
            Delta::Usage(usage) => {
                self.usage = Some(usage);
                Forward::Nothing
            }
        }
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn answer_started(&self) -> bool {
        self.answer_started
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.usage
    }

    /// Consume the accumulator, returning `(answer, reasoning, usage)`.
    pub fn finish(self) -> (String, String, Option<TokenUsage>) {
        (self.answer, self.reasoning, self.usage)
    }
}

/// Drain `stream` for chunk `chunk_num` of `total` into a [`ChunkAnswer`].
///
/// Cancellation is checked after every delta; on cancel the stream is
/// dropped and the partial answer discarded.
pub async fn accumulate(
    mut stream: DeltaStream,
    chunk_num: usize,
    total: usize,
    cancel: &CancelToken,
    progress: Option<&ProgressCallback>,
) -> Result<ChunkAnswer, CaseGenError> {
    let start = Instant::now();
    let mut acc = StreamAccumulator::new();

    while let Some(item) = stream.next().await {
        let delta = item?;
        if let Forward::Answer { delta, first } = acc.push(delta) {
            if let Some(cb) = progress {
                if first {
                    cb.on_answer_start(chunk_num, total);
                }
                cb.on_answer_delta(&delta);
                cb.on_progress(acc.answer());
            }
        }
        if cancel.is_cancelled() {
            debug!("Chunk {}: cancelled mid-stream", chunk_num);
            return Err(CaseGenError::Cancelled {
                completed: chunk_num.saturating_sub(1),
                total,
            });
        }
    }

    let (answer, reasoning, usage) = acc.finish();
    let duration_ms = start.elapsed().as_millis() as u64;
    debug!(
        "Chunk {}/{}: {} answer chars, {} reasoning chars, {}ms",
        chunk_num,
        total,
        answer.chars().count(),
        reasoning.chars().count(),
        duration_ms
    );

    Ok(ChunkAnswer {
        chunk_num,
        answer,
        reasoning_chars: reasoning.chars().count(),
        usage,
        duration_ms,
    })
}
