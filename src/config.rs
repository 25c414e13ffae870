//! Configuration types for test-case generation runs.
//!
//! Every knob lives in [`GenerationConfig`], built via its
//! [`GenerationConfigBuilder`]. One struct is easy to share with the worker
//! task, print for debugging and diff between runs.

use crate::document::DocumentSource;
use crate::error::CaseGenError;
use crate::pipeline::linearize::LinearizeOptions;
use crate::pipeline::llm::ChatModel;
use crate::pipeline::order::DedupPolicy;
use crate::pipeline::vision::VisionModel;
use crate::progress::ProgressCallback;
use crate::prompts::DEFAULT_INSTRUCTION;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Environment variables consulted, in order, when no API key is configured.
pub const API_KEY_ENV_VARS: &[&str] = &["CASEGEN_API_KEY", "DEEPSEEK_API_KEY"];

/// Configuration for a generation run.
///
/// Built via [`GenerationConfig::builder()`] or using
/// [`GenerationConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_casegen::GenerationConfig;
///
/// let config = GenerationConfig::builder()
///     .chunk_size(1500)
///     .chunk_overlap(300)
///     .industry("金融")
///     .design_methods(["边界值分析", "场景法"])
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct GenerationConfig {
    // ── Chunking ──
    /// Maximum characters per chunk. Default: 1000.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks. Must be below `chunk_size`. Default: 200.
    pub chunk_overlap: usize,
    /// Characters removed from the linearized text before chunking. Default:
    /// `◦` and the ASCII space, so CJK text reaches the model without padding.
    pub strip_chars: Vec<char>,

    // ── Request content ──
    /// Industry tag sent with every chunk. Default: "通用".
    pub industry: String,
    /// Requested kind of test case. Default: "功能测试".
    pub output_type: String,
    /// Test design methods to apply.
    pub design_methods: Vec<String>,
    /// Free-text instruction. If None, uses [`DEFAULT_INSTRUCTION`].
    pub instruction: Option<String>,

    // ── Chat model ──
    /// Pre-constructed chat model. Takes precedence over `model`/`base_url`.
    pub chat_model: Option<Arc<dyn ChatModel>>,
    /// Chat model identifier. Default: "deepseek-reasoner".
    pub model: String,
    /// OpenAI-compatible endpoint root. Default: "https://api.deepseek.com".
    pub base_url: String,
    /// API key. If None, read from [`API_KEY_ENV_VARS`].
    pub api_key: Option<String>,
    /// Maximum tokens the model may generate per chunk. Default: 60000.
    pub max_tokens: usize,
    /// Per-request timeout for the chat stream in seconds. Default: 600.
    pub api_timeout_secs: u64,

    // ── Image analysis ──
    /// Describe embedded images with a vision model. Default: false.
    pub analyze_images: bool,
    /// Pre-constructed vision model. Takes precedence over every provider setting.
    pub vision_backend: Option<Arc<dyn VisionModel>>,
    /// Pre-constructed vision provider. Takes precedence over `vision_provider_name`.
    pub vision_provider: Option<Arc<dyn LLMProvider>>,
    /// Vision provider name (e.g. "openai", "gemini").
    /// If None along with `vision_provider`, the provider is auto-detected.
    pub vision_provider_name: Option<String>,
    /// Vision model identifier. If None, uses "gpt-4.1-nano".
    pub vision_model: Option<String>,
    /// Sampling temperature for vision calls. Default: 0.1.
    pub temperature: f32,
    /// Maximum tokens per image description. Default: 2048.
    pub vision_max_tokens: usize,
    /// Retry attempts on a failed vision call. Default: 2.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,
    /// Pause between consecutive vision calls in milliseconds. Default: 1000.
    pub image_batch_delay_ms: u64,
    /// Images narrower than this are filtered. Default: 100.
    pub min_image_width: u32,
    /// Images shorter than this are filtered. Default: 100.
    pub min_image_height: u32,
    /// Images with fewer encoded bytes than this are filtered. Default: 1024.
    pub min_image_bytes: usize,

    // ── Linearization ──
    /// Duplicate-image policy for flow (DOCX) documents. Default: by relationship id.
    pub flow_dedup: DedupPolicy,
    /// Duplicate-image policy for paged (PDF layout) documents. Default: none.
    pub paged_dedup: DedupPolicy,
    /// Marker placed before an image description. Default: "[图片:".
    pub image_prefix: String,
    /// Marker placed after an image description. Default: "]".
    pub image_suffix: String,
    /// Separator between table cells. Default: " | ".
    pub column_separator: String,
    /// Keep only sections whose title contains one of these. Default: empty (whole document).
    pub section_titles: Vec<String>,

    // ── I/O ──
    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional progress callback. If None, no events are emitted.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            strip_chars: vec!['◦', ' '],
            industry: "通用".into(),
            output_type: "功能测试".into(),
            design_methods: vec!["等价类划分".into(), "边界值分析".into()],
            instruction: None,
            chat_model: None,
            model: "deepseek-reasoner".into(),
            base_url: "https://api.deepseek.com".into(),
            api_key: None,
            max_tokens: 60_000,
            api_timeout_secs: 600,
            analyze_images: false,
            vision_backend: None,
            vision_provider: None,
            vision_provider_name: None,
            vision_model: None,
            temperature: 0.1,
            vision_max_tokens: 2048,
            max_retries: 2,
            retry_backoff_ms: 500,
            image_batch_delay_ms: 1000,
            min_image_width: 100,
            min_image_height: 100,
            min_image_bytes: 1024,
            flow_dedup: DedupPolicy::ByFingerprint,
            paged_dedup: DedupPolicy::None,
            image_prefix: "[图片:".into(),
            image_suffix: "]".into(),
            column_separator: " | ".into(),
            section_titles: Vec::new(),
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .field("strip_chars", &self.strip_chars)
            .field("industry", &self.industry)
            .field("output_type", &self.output_type)
            .field("design_methods", &self.design_methods)
            .field("chat_model", &self.chat_model.as_ref().map(|_| "<dyn ChatModel>"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .field("analyze_images", &self.analyze_images)
            .field(
                "vision_backend",
                &self.vision_backend.as_ref().map(|_| "<dyn VisionModel>"),
            )
            .field(
                "vision_provider",
                &self.vision_provider.as_ref().map(|_| "<dyn LLMProvider>"),
            )
            .field("vision_provider_name", &self.vision_provider_name)
            .field("vision_model", &self.vision_model)
            .field("max_retries", &self.max_retries)
            .field("flow_dedup", &self.flow_dedup)
            .field("paged_dedup", &self.paged_dedup)
            .field("section_titles", &self.section_titles)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new builder for `GenerationConfig`.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder {
            config: Self::default(),
        }
    }

    /// The instruction sent with each chunk.
    pub fn instruction_text(&self) -> &str {
        self.instruction.as_deref().unwrap_or(DEFAULT_INSTRUCTION)
    }

    /// The configured API key, or the first non-empty one from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        API_KEY_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.is_empty())
    }

    /// Duplicate policy for the given source shape.
    pub fn dedup_for(&self, source: &DocumentSource) -> DedupPolicy {
        match source {
            DocumentSource::Flow(_) => self.flow_dedup,
            DocumentSource::Paged(_) => self.paged_dedup,
        }
    }

    pub fn linearize_options(&self) -> LinearizeOptions {
        LinearizeOptions {
            image_prefix: self.image_prefix.clone(),
            image_suffix: self.image_suffix.clone(),
            column_separator: self.column_separator.clone(),
            section_titles: self.section_titles.clone(),
            ..LinearizeOptions::default()
        }
    }
}

/// Builder for [`GenerationConfig`].
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl fmt::Debug for GenerationConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationConfigBuilder {
    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(1);
        self
    }

    pub fn chunk_overlap(mut self, n: usize) -> Self {
        self.config.chunk_overlap = n;
        self
    }

    pub fn strip_chars(mut self, chars: impl IntoIterator<Item = char>) -> Self {
        self.config.strip_chars = chars.into_iter().collect();
        self
    }

    pub fn industry(mut self, industry: impl Into<String>) -> Self {
        self.config.industry = industry.into();
        self
    }

    pub fn output_type(mut self, output_type: impl Into<String>) -> Self {
        self.config.output_type = output_type.into();
        self
    }

    pub fn design_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.design_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = Some(instruction.into());
        self
    }

    pub fn chat_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.config.chat_model = Some(model);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn analyze_images(mut self, v: bool) -> Self {
        self.config.analyze_images = v;
        self
    }

    pub fn vision_backend(mut self, model: Arc<dyn VisionModel>) -> Self {
        self.config.vision_backend = Some(model);
        self
    }

    pub fn vision_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.vision_provider = Some(provider);
        self
    }

    pub fn vision_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.vision_provider_name = Some(name.into());
        self
    }

    pub fn vision_model(mut self, model: impl Into<String>) -> Self {
        self.config.vision_model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn vision_max_tokens(mut self, n: usize) -> Self {
        self.config.vision_max_tokens = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn image_batch_delay_ms(mut self, ms: u64) -> Self {
        self.config.image_batch_delay_ms = ms;
        self
    }

    pub fn min_image_size(mut self, width: u32, height: u32) -> Self {
        self.config.min_image_width = width;
        self.config.min_image_height = height;
        self
    }

    pub fn min_image_bytes(mut self, bytes: usize) -> Self {
        self.config.min_image_bytes = bytes;
        self
    }

    pub fn flow_dedup(mut self, policy: DedupPolicy) -> Self {
        self.config.flow_dedup = policy;
        self
    }

    pub fn paged_dedup(mut self, policy: DedupPolicy) -> Self {
        self.config.paged_dedup = policy;
        self
    }

    pub fn image_marker(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.config.image_prefix = prefix.into();
        self.config.image_suffix = suffix.into();
        self
    }

    pub fn column_separator(mut self, sep: impl Into<String>) -> Self {
        self.config.column_separator = sep.into();
        self
    }

    pub fn section_titles<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.section_titles = titles.into_iter().map(Into::into).collect();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<GenerationConfig, CaseGenError> {
        let c = &self.config;
        if c.chunk_size == 0 {
            return Err(CaseGenError::InvalidConfig(
                "chunk_size must be ≥ 1".into(),
            ));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(CaseGenError::InvalidConfig(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if c.base_url.is_empty() && c.chat_model.is_none() {
            return Err(CaseGenError::InvalidConfig(
                "base_url must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
