//! Generation entry points.
//!
//! A run is strictly sequential: resolve the image order, optionally
//! describe the images, reconcile, linearize, chunk, then stream one model
//! answer per chunk. Chunk `i` is fully accumulated before chunk `i + 1`
//! is requested. The concatenated answer goes through repair and
//! normalization once at the end.
//!
//! [`run`] and [`spawn`] wrap the pipeline for orchestrators (CLI, GUI):
//! they fire exactly one of `on_finished` / `on_error` and turn panics into
//! [`CaseGenError::Internal`].

use crate::config::GenerationConfig;
use crate::document::DocumentSource;
use crate::error::CaseGenError;
use crate::output::{ChunkAnswer, GenerationOutput, GenerationStats, ImageReport, TokenUsage};
use crate::pipeline::chunk::{chunk_text, Chunk};
use crate::pipeline::input;
use crate::pipeline::linearize::linearize;
use crate::pipeline::llm::{ChatModel, ChatRequest, OpenAiCompatibleModel};
use crate::pipeline::normalize::normalize;
use crate::pipeline::order::GlobalImageOrder;
use crate::pipeline::reconcile::reconcile;
use crate::pipeline::repair::repair;
use crate::pipeline::vision::ImageAnalyzer;
use crate::progress::ProgressCallback;
use crate::stream::accumulate;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag shared between a run and its owner.
///
/// Checked before every chunk and after every delta.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The linearized document, split and ready to send.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    /// Linearized text before character stripping.
    pub text: String,
    pub chunks: Vec<Chunk>,
    pub images: Vec<ImageReport>,
    pub total_images: usize,
    pub dropped_anchors: usize,
    /// Characters left after stripping.
    pub context_chars: usize,
    pub image_duration_ms: u64,
}

/// Resolve images, describe them if enabled, and linearize + chunk `source`.
///
/// Does not touch the chat model; `--preview` stops here.
pub async fn prepare_context(
    source: &DocumentSource,
    config: &GenerationConfig,
    cancel: &CancelToken,
) -> Result<PreparedContext, CaseGenError> {
    let order = GlobalImageOrder::resolve(source, config.dedup_for(source));
    info!(
        "{} document: {} image slots from {} anchors ({} dropped)",
        source.kind(),
        order.len(),
        order.anchor_count(),
        order.dropped()
    );

    let image_start = Instant::now();
    let (replacements, images) = if config.analyze_images && !order.is_empty() {
        let analyzer = ImageAnalyzer::from_config(config)?;
        analyzer.analyze(source, &order, cancel).await?
    } else {
        (Vec::new(), Vec::new())
    };
    let image_duration_ms = image_start.elapsed().as_millis() as u64;

    let replacements = reconcile(replacements, order.len());
    let text = linearize(source, &order, &replacements, &config.linearize_options());
    let chunks = chunk_text(
        &text,
        config.chunk_size,
        config.chunk_overlap,
        &config.strip_chars,
    )?;
    let context_chars = text
        .chars()
        .filter(|c| !config.strip_chars.contains(c))
        .count();

    Ok(PreparedContext {
        text,
        chunks,
        images,
        total_images: order.len(),
        dropped_anchors: order.dropped(),
        context_chars,
        image_duration_ms,
    })
}

/// Repair the concatenated answer and renumber its records.
///
/// Returns `(text, records, repaired)`. When repair fails or yields no
/// records the raw answer is returned unchanged.
pub fn finalize(raw_answer: &str) -> (String, Vec<Value>, bool) {
    let Some(value) = repair(raw_answer).into_value() else {
        warn!("Answer could not be repaired into JSON; returning raw text");
        return (raw_answer.to_string(), Vec::new(), false);
    };
    let records = normalize(value);
    if records.is_empty() {
        warn!("Repaired answer holds no records; returning raw text");
        return (raw_answer.to_string(), Vec::new(), false);
    }
    match serde_json::to_string_pretty(&records) {
        Ok(text) => (text, records, true),
        Err(e) => {
            warn!("Could not serialise records: {}", e);
            (raw_answer.to_string(), Vec::new(), false)
        }
    }
}

fn chat_model(config: &GenerationConfig) -> Result<Arc<dyn ChatModel>, CaseGenError> {
    match config.chat_model {
        Some(ref model) => Ok(Arc::clone(model)),
        None => Ok(Arc::new(OpenAiCompatibleModel::from_config(config)?)),
    }
}

/// Generate test cases from a document already in memory.
pub async fn generate_from_source(
    source: &DocumentSource,
    config: &GenerationConfig,
    cancel: &CancelToken,
) -> Result<GenerationOutput, CaseGenError> {
    let total_start = Instant::now();
    let model = chat_model(config)?;
    let prepared = prepare_context(source, config, cancel).await?;
    let total = prepared.chunks.len();
    if total == 0 {
        warn!("Document linearized to empty text; nothing to send");
    }
    info!(
        "Context: {} chars in {} chunks, model {}",
        prepared.context_chars,
        total,
        model.name()
    );

    let progress = config.progress_callback.as_ref();
    let llm_start = Instant::now();
    let mut raw_answer = String::new();
    let mut answers: Vec<ChunkAnswer> = Vec::with_capacity(total);
    let mut usage = TokenUsage::default();

    for (i, chunk) in prepared.chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CaseGenError::Cancelled {
                completed: i,
                total,
            });
        }
        if let Some(cb) = progress {
            cb.on_stage(i, total);
        }

        let request = ChatRequest::from_config(config, i + 1, &chunk.text);
        let stream = model.stream_chat(&request).await?;
        let answer = accumulate(stream, i + 1, total, cancel, progress).await?;

        raw_answer.push_str(&answer.answer);
        if let Some(ref u) = answer.usage {
            usage.add(u);
        }
        answers.push(answer);

        if let Some(cb) = progress {
            cb.on_stage(i + 1, total);
        }
    }
    let llm_duration_ms = llm_start.elapsed().as_millis() as u64;

    let (text, records, repaired) = finalize(&raw_answer);
    debug!(
        "Finalized {} records (repaired={}) from {} answer chars",
        records.len(),
        repaired,
        raw_answer.chars().count()
    );

    let stats = GenerationStats {
        context_chars: prepared.context_chars,
        total_chunks: total,
        total_images: prepared.total_images,
        described_images: prepared
            .images
            .iter()
            .filter(|r| !r.replacement.is_empty())
            .count(),
        dropped_anchors: prepared.dropped_anchors,
        total_input_tokens: usage.input_tokens as u64,
        total_output_tokens: usage.output_tokens as u64,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
        image_duration_ms: prepared.image_duration_ms,
        llm_duration_ms,
    };

    Ok(GenerationOutput {
        text,
        raw_answer,
        records,
        repaired,
        chunks: answers,
        images: prepared.images,
        stats,
    })
}

/// Generate test cases from a file path or URL.
///
/// # Example
/// ```rust,no_run
/// use edgequake_casegen::{generate, GenerationConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = GenerationConfig::builder().industry("金融").build()?;
/// let output = generate("requirements.docx", &config).await?;
/// println!("{}", output.text);
/// # Ok(())
/// # }
/// ```
pub async fn generate(
    input_str: impl AsRef<str>,
    config: &GenerationConfig,
) -> Result<GenerationOutput, CaseGenError> {
    generate_with_cancel(input_str.as_ref(), config, &CancelToken::new()).await
}

async fn generate_with_cancel(
    input_str: &str,
    config: &GenerationConfig,
    cancel: &CancelToken,
) -> Result<GenerationOutput, CaseGenError> {
    info!("Starting generation: {}", input_str);
    let source = input::load_document(input_str, config.download_timeout_secs).await?;
    generate_from_source(&source, config, cancel).await
}

/// Run a generation and report the outcome through the progress callback.
///
/// Fires exactly one of `on_finished` / `on_error`, including when the
/// pipeline panics.
pub async fn run(
    input_str: &str,
    config: &GenerationConfig,
    cancel: &CancelToken,
) -> Result<GenerationOutput, CaseGenError> {
    let result = guarded(generate_with_cancel(input_str, config, cancel)).await;
    report(config.progress_callback.as_ref(), &result);
    result
}

async fn guarded(
    work: impl std::future::Future<Output = Result<GenerationOutput, CaseGenError>>,
) -> Result<GenerationOutput, CaseGenError> {
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(CaseGenError::Internal(panic_message(panic.as_ref()))))
}

fn report(progress: Option<&ProgressCallback>, result: &Result<GenerationOutput, CaseGenError>) {
    if let Some(cb) = progress {
        match result {
            Ok(output) => cb.on_finished(&output.text),
            Err(e) => cb.on_error(&e.to_string()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("generation panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("generation panicked: {s}")
    } else {
        "generation panicked".to_string()
    }
}

/// A run on a background task.
pub struct GenerationHandle {
    cancel: CancelToken,
    abort: Arc<Notify>,
    reported: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
    join: JoinHandle<Result<GenerationOutput, CaseGenError>>,
}

impl GenerationHandle {
    /// Ask the run to stop at the next chunk or delta boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the run now, even mid-request. The terminal `on_error` still
    /// fires and `wait` reports `Cancelled`.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.abort.notify_one();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run. Always resolves, whatever happened to the task.
    pub async fn wait(self) -> Result<GenerationOutput, CaseGenError> {
        let result = match self.join.await {
            Ok(result) => return result,
            Err(e) if e.is_cancelled() => Err(CaseGenError::Cancelled {
                completed: 0,
                total: 0,
            }),
            Err(e) => Err(CaseGenError::Internal(format!("generation task failed: {e}"))),
        };
        if !self.reported.swap(true, Ordering::SeqCst) {
            report(self.progress.as_ref(), &result);
        }
        result
    }
}

/// Start a run on a background tokio task.
///
/// Same reporting contract as [`run`]; [`GenerationHandle::abort`] drops the
/// in-flight request and reports `Cancelled` through `on_error`.
pub fn spawn(input_str: impl Into<String>, config: GenerationConfig) -> GenerationHandle {
    let cancel = CancelToken::new();
    let abort = Arc::new(Notify::new());
    let reported = Arc::new(AtomicBool::new(false));
    let progress = config.progress_callback.clone();

    let token = cancel.clone();
    let abort_signal = Arc::clone(&abort);
    let task_reported = Arc::clone(&reported);
    let input_str = input_str.into();
    let join = tokio::spawn(async move {
        let result = tokio::select! {
            result = guarded(generate_with_cancel(&input_str, &config, &token)) => result,
            _ = abort_signal.notified() => {
                warn!("Generation aborted");
                Err(CaseGenError::Cancelled { completed: 0, total: 0 })
            }
        };
        if !task_reported.swap(true, Ordering::SeqCst) {
            report(config.progress_callback.as_ref(), &result);
        }
        result
    });
    GenerationHandle {
        cancel,
        abort,
        reported,
        progress,
        join,
    }
}

/// Generate and write the final text to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn generate_to_file(
    input_str: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &GenerationConfig,
) -> Result<GenerationOutput, CaseGenError> {
    let output = generate(input_str, config).await?;
    write_output(output_path.as_ref(), &output.text).await?;
    Ok(output)
}

/// Atomic write: write to a sibling temp file, then rename.
pub async fn write_output(path: &Path, text: &str) -> Result<(), CaseGenError> {
    let write_failed = |e: std::io::Error| CaseGenError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, text).await.map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_failed)?;
    Ok(())
}

/// Synchronous wrapper around [`generate`].
///
/// Creates a temporary tokio runtime internally.
pub fn generate_sync(
    input_str: impl AsRef<str>,
    config: &GenerationConfig,
) -> Result<GenerationOutput, CaseGenError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CaseGenError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(generate(input_str, config))
}
