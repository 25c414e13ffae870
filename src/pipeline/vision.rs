//! Image analysis: one vision call per unique image, in global order.
//!
//! Every slot of the [`GlobalImageOrder`] yields exactly one replacement
//! string, so the result lines up with the order before reconciliation.
//! Nothing in here aborts the batch: undecodable, undersized and failed
//! images get an empty replacement and an [`ImageError`] in their report.
//!
//! ## Retry Strategy
//!
//! Vision endpoints throttle with 429/503. Failed calls back off
//! exponentially (`retry_backoff_ms * 2^(attempt-1)`), and consecutive
//! images are separated by `image_batch_delay_ms`.

use crate::config::GenerationConfig;
use crate::document::DocumentSource;
use crate::error::{CaseGenError, ImageError};
use crate::generate::CancelToken;
use crate::output::ImageReport;
use crate::pipeline::encode::{decode_image, encode_png_base64, png_image_data};
use crate::pipeline::order::GlobalImageOrder;
use crate::pipeline::repair::repair;
use crate::progress::ProgressCallback;
use crate::prompts::{
    build_vision_prompt, FILTERED_STATUS, INVALID_IMAGE_SENTINEL, UNDERSIZED_IMAGE_SENTINEL,
};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// A model that describes one image given a prompt.
pub trait VisionModel: Send + Sync {
    fn describe<'a>(
        &'a self,
        prompt: &'a str,
        image: ImageData,
    ) -> BoxFuture<'a, Result<String, String>>;
}

/// [`VisionModel`] backed by an `edgequake_llm` provider.
pub struct ProviderVision {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderVision {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &GenerationConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.vision_max_tokens),
                ..Default::default()
            },
        }
    }
}

impl VisionModel for ProviderVision {
    fn describe<'a>(
        &'a self,
        prompt: &'a str,
        image: ImageData,
    ) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let messages = vec![ChatMessage::user_with_images(prompt, vec![image])];
            let response = self
                .provider
                .chat(&messages, Some(&self.options))
                .await
                .map_err(|e| format!("{}", e))?;
            debug!(
                "Vision call: {} input tokens, {} output tokens",
                response.prompt_tokens, response.completion_tokens
            );
            Ok(response.content)
        })
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, CaseGenError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        CaseGenError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, from most-specific to least-specific:
///
/// 1. `config.vision_provider` as-is.
/// 2. `config.vision_provider_name` with `vision_model` (or `gpt-4.1-nano`).
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set.
/// 4. OpenAI when `OPENAI_API_KEY` is set.
/// 5. `ProviderFactory::from_env()` auto-detection.
pub fn resolve_vision_provider(
    config: &GenerationConfig,
) -> Result<Arc<dyn LLMProvider>, CaseGenError> {
    if let Some(ref provider) = config.vision_provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.vision_model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);
    if let Some(ref name) = config.vision_provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| CaseGenError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "Image analysis needs a vision provider.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --vision-provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Verdicts ─────────────────────────────────────────────────────────────

/// Turn a raw vision answer into the replacement text.
///
/// A JSON verdict contributes its `main_content`; anything else is taken
/// verbatim. Sentinel verdicts and blank answers become empty.
pub fn interpret_verdict(raw: &str) -> String {
    let content = extract_main_content(raw).unwrap_or_else(|| raw.to_string());
    let content = content.trim();
    if content.is_empty()
        || content.contains(INVALID_IMAGE_SENTINEL)
        || content.contains(UNDERSIZED_IMAGE_SENTINEL)
    {
        return String::new();
    }
    content.to_string()
}

fn extract_main_content(raw: &str) -> Option<String> {
    if !raw.contains('{') {
        return None;
    }
    let value = repair(raw).into_value()?;
    let object = match value {
        Value::Object(_) => value,
        Value::Array(items) => items
            .into_iter()
            .find(|v| v.get("main_content").is_some())?,
        _ => return None,
    };
    match object.get("main_content")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => Some(String::new()),
        other => Some(other.to_string()),
    }
}

/// Delay before retry `attempt` (1-based).
pub fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

// ── Analyzer ─────────────────────────────────────────────────────────────

/// Describes every image slot of a document.
pub struct ImageAnalyzer {
    model: Arc<dyn VisionModel>,
    industry: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    batch_delay_ms: u64,
    min_width: u32,
    min_height: u32,
    min_bytes: usize,
    progress: Option<ProgressCallback>,
}

impl ImageAnalyzer {
    /// Use `config.vision_backend`, or resolve a provider from `config`.
    pub fn from_config(config: &GenerationConfig) -> Result<Self, CaseGenError> {
        if let Some(ref model) = config.vision_backend {
            return Ok(Self::with_model(Arc::clone(model), config));
        }
        let provider = resolve_vision_provider(config)?;
        Ok(Self::with_model(
            Arc::new(ProviderVision::new(provider, config)),
            config,
        ))
    }

    pub fn with_model(model: Arc<dyn VisionModel>, config: &GenerationConfig) -> Self {
        Self {
            model,
            industry: config.industry.clone(),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            batch_delay_ms: config.image_batch_delay_ms,
            min_width: config.min_image_width,
            min_height: config.min_image_height,
            min_bytes: config.min_image_bytes,
            progress: config.progress_callback.clone(),
        }
    }

    /// One replacement per slot of `order`, plus a report per slot.
    pub async fn analyze(
        &self,
        source: &DocumentSource,
        order: &GlobalImageOrder,
        cancel: &CancelToken,
    ) -> Result<(Vec<String>, Vec<ImageReport>), CaseGenError> {
        let total = order.len();
        let mut replacements = Vec::with_capacity(total);
        let mut reports = Vec::with_capacity(total);
        info!("Analysing {} unique images", total);

        for (i, anchor) in order.images().iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Image analysis cancelled after {}/{} images", i, total);
                return Err(CaseGenError::Cancelled { completed: i, total });
            }
            let index = i + 1;
            let mut report = ImageReport {
                index,
                anchor: anchor.label(),
                replacement: String::new(),
                width: None,
                height: None,
                retries: 0,
                error: None,
            };

            let called = match source.image_bytes(anchor) {
                None => {
                    report.error = Some(ImageError::Undecodable {
                        index,
                        detail: "no image bytes in source".into(),
                    });
                    false
                }
                Some(bytes) => {
                    self.analyze_one(index, bytes, &mut report).await;
                    true
                }
            };

            match &report.error {
                Some(e) => warn!("{}", e),
                None => debug!("Image {}/{} ({}): described", index, total, report.anchor),
            }
            self.report_status(index, total, &report.replacement);

            replacements.push(report.replacement.clone());
            reports.push(report);

            if called && index < total && self.batch_delay_ms > 0 {
                sleep(Duration::from_millis(self.batch_delay_ms)).await;
            }
        }

        Ok((replacements, reports))
    }

    /// Fill `report` for one image. Returns without calling the model when
    /// the image is filtered before analysis.
    async fn analyze_one(&self, index: usize, bytes: &[u8], report: &mut ImageReport) {
        let prepared = match decode_image(bytes) {
            Ok(p) => p,
            Err(e) => {
                report.error = Some(ImageError::Undecodable {
                    index,
                    detail: e.to_string(),
                });
                return;
            }
        };
        report.width = Some(prepared.width);
        report.height = Some(prepared.height);

        if prepared.is_undersized(self.min_width, self.min_height, self.min_bytes) {
            report.error = Some(ImageError::TooSmall {
                index,
                width: prepared.width,
                height: prepared.height,
                bytes: prepared.byte_len,
            });
            return;
        }

        let b64 = match encode_png_base64(&prepared.image) {
            Ok(b64) => b64,
            Err(e) => {
                report.error = Some(ImageError::Undecodable {
                    index,
                    detail: e.to_string(),
                });
                return;
            }
        };
        let prompt = build_vision_prompt(&self.industry, prepared.width, prepared.height);

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let wait = backoff(self.retry_backoff_ms, attempt);
                warn!(
                    "Image {}: retry {}/{} after {:?}",
                    index, attempt, self.max_retries, wait
                );
                sleep(wait).await;
            }
            match self.model.describe(&prompt, png_image_data(b64.clone())).await {
                Ok(raw) => {
                    report.retries = attempt.min(u8::MAX as u32) as u8;
                    report.replacement = interpret_verdict(&raw);
                    return;
                }
                Err(e) => {
                    warn!("Image {}: attempt {} failed: {}", index, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        report.retries = self.max_retries.min(u8::MAX as u32) as u8;
        report.error = Some(ImageError::VisionFailed {
            index,
            retries: self.max_retries,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        });
    }

    fn report_status(&self, index: usize, total: usize, replacement: &str) {
        let Some(cb) = &self.progress else {
            return;
        };
        if replacement.is_empty() {
            cb.on_progress(&format!("image {index}/{total}: {FILTERED_STATUS}"));
        } else {
            let preview: String = replacement.chars().take(60).collect();
            cb.on_progress(&format!("image {index}/{total}: {preview}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Block, FlowDocument, InlineImage, Paragraph, Run};
    use crate::pipeline::encode::png_bytes;
    use crate::pipeline::order::DedupPolicy;
    use crate::progress::GenerationProgressCallback;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers from a script; `Err` entries simulate failed calls.
    struct Scripted {
        answers: Mutex<Vec<Result<String, String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(
                    answers
                        .into_iter()
                        .rev()
                        .map(|a| a.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl VisionModel for Scripted {
        fn describe<'a>(
            &'a self,
            prompt: &'a str,
            _image: ImageData,
        ) -> BoxFuture<'a, Result<String, String>> {
            assert!(prompt.contains(INVALID_IMAGE_SENTINEL));
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err("script exhausted".into()));
            Box::pin(async move { next })
        }
    }

    #[derive(Default)]
    struct Statuses(Mutex<Vec<String>>);

    impl GenerationProgressCallback for Statuses {
        fn on_progress(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    fn doc_with_images(images: Vec<(&str, Vec<u8>)>) -> DocumentSource {
        let mut media = BTreeMap::new();
        let runs = images
            .into_iter()
            .map(|(rel, bytes)| {
                media.insert(rel.to_string(), bytes);
                Run {
                    text: String::new(),
                    images: vec![InlineImage {
                        rel_id: Some(rel.to_string()),
                    }],
                }
            })
            .collect();
        DocumentSource::Flow(FlowDocument {
            blocks: vec![Block::Paragraph(Paragraph { style: None, runs })],
            media,
        })
    }

    fn config(cb: Option<ProgressCallback>) -> GenerationConfig {
        let mut b = GenerationConfig::builder()
            .min_image_size(50, 50)
            .min_image_bytes(0)
            .retry_backoff_ms(1)
            .image_batch_delay_ms(0)
            .max_retries(1);
        if let Some(cb) = cb {
            b = b.progress_callback(cb);
        }
        b.build().unwrap()
    }

    #[test]
    fn verdict_plain_text_is_kept() {
        assert_eq!(interpret_verdict("  登录界面截图  "), "登录界面截图");
    }

    #[test]
    fn verdict_json_main_content_is_extracted() {
        let raw = "```json\n{\"image_type\": \"界面\", \"main_content\": \"订单列表页\"}\n```";
        assert_eq!(interpret_verdict(raw), "订单列表页");
    }

    #[test]
    fn verdict_sentinels_collapse_to_empty() {
        assert_eq!(interpret_verdict("无效图片，无法识别！"), "");
        assert_eq!(
            interpret_verdict(r#"{"main_content": "这张图片不符合规定像素尺寸要求"}"#),
            ""
        );
        assert_eq!(interpret_verdict("   "), "");
    }

    #[test]
    fn verdict_json_without_main_content_falls_back_to_raw() {
        assert_eq!(interpret_verdict(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff(500, 1), Duration::from_millis(500));
        assert_eq!(backoff(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff(500, 3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn every_slot_gets_a_replacement_and_report() {
        let statuses = Arc::new(Statuses::default());
        let cb: ProgressCallback = statuses.clone();
        let source = doc_with_images(vec![
            ("rId1", png_bytes(80, 80)),
            ("rId2", png_bytes(10, 10)),
            ("rId3", b"not an image".to_vec()),
            ("rId4", png_bytes(60, 60)),
        ]);
        let order = GlobalImageOrder::resolve(&source, DedupPolicy::ByFingerprint);
        let model = Scripted::new(vec![Ok("流程图"), Ok("无效图片，无法识别")]);
        let analyzer = ImageAnalyzer::with_model(model.clone(), &config(Some(cb)));

        let (replacements, reports) = analyzer
            .analyze(&source, &order, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(replacements, vec!["流程图", "", "", ""]);
        assert_eq!(reports.len(), 4);
        assert!(reports[0].error.is_none());
        assert!(matches!(reports[1].error, Some(ImageError::TooSmall { .. })));
        assert!(matches!(reports[2].error, Some(ImageError::Undecodable { .. })));
        assert!(reports[3].error.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);

        let statuses = statuses.0.lock().unwrap();
        assert_eq!(statuses[0], "image 1/4: 流程图");
        assert_eq!(statuses[1], format!("image 2/4: {FILTERED_STATUS}"));
    }

    #[tokio::test]
    async fn failed_calls_are_retried_then_reported() {
        let source = doc_with_images(vec![("rId1", png_bytes(80, 80)), ("rId2", png_bytes(80, 80))]);
        let order = GlobalImageOrder::resolve(&source, DedupPolicy::ByFingerprint);
        let model = Scripted::new(vec![Err("503"), Ok("截图"), Err("429"), Err("429")]);
        let analyzer = ImageAnalyzer::with_model(model.clone(), &config(None));

        let (replacements, reports) = analyzer
            .analyze(&source, &order, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(replacements, vec!["截图", ""]);
        assert_eq!(reports[0].retries, 1);
        assert!(matches!(
            reports[1].error,
            Some(ImageError::VisionFailed { retries: 1, .. })
        ));
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_stops_the_batch() {
        let source = doc_with_images(vec![("rId1", png_bytes(80, 80))]);
        let order = GlobalImageOrder::resolve(&source, DedupPolicy::ByFingerprint);
        let analyzer = ImageAnalyzer::with_model(Scripted::new(vec![]), &config(None));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = analyzer.analyze(&source, &order, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            CaseGenError::Cancelled {
                completed: 0,
                total: 1
            }
        ));
    }

    /// Cancels the run from inside its first call.
    struct CancelOnCall(CancelToken);

    impl VisionModel for CancelOnCall {
        fn describe<'a>(
            &'a self,
            _prompt: &'a str,
            _image: ImageData,
        ) -> BoxFuture<'a, Result<String, String>> {
            self.0.cancel();
            Box::pin(async { Ok("登录页".to_string()) })
        }
    }

    #[tokio::test]
    async fn cancellation_between_images_reports_progress() {
        let source = doc_with_images(vec![
            ("rId1", png_bytes(80, 80)),
            ("rId2", png_bytes(90, 90)),
            ("rId3", png_bytes(100, 100)),
        ]);
        let order = GlobalImageOrder::resolve(&source, DedupPolicy::ByFingerprint);
        let cancel = CancelToken::new();
        let analyzer =
            ImageAnalyzer::with_model(Arc::new(CancelOnCall(cancel.clone())), &config(None));

        let err = analyzer.analyze(&source, &order, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            CaseGenError::Cancelled {
                completed: 1,
                total: 3
            }
        ));
        assert_eq!(err.to_string(), "Generation cancelled after 1/3 steps");
    }
}
