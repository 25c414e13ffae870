//! CLI binary for edgequake-casegen.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `GenerationConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_casegen::pipeline::input::load_document;
use edgequake_casegen::{
    generate::write_output, prepare_context, spawn, CancelToken, DedupPolicy, GenerationConfig,
    GenerationProgressCallback, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a chunk counter bar plus log lines for image
/// analysis. With `echo` set, answer deltas are streamed to stderr.
struct CliProgressCallback {
    bar: ProgressBar,
    echo: bool,
}

impl CliProgressCallback {
    fn new(echo: bool) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar, echo })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Generating");
    }
}

impl GenerationProgressCallback for CliProgressCallback {
    fn on_progress(&self, text: &str) {
        // Image status lines; answer snapshots are shown via deltas instead.
        if text.starts_with("image ") {
            self.bar.println(format!("  {} {}", cyan("▣"), dim(text)));
        }
    }

    fn on_stage(&self, done: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            self.activate_bar(total);
        }
        self.bar.set_position(done as u64);
        self.bar.set_message(format!("当前推理进度：{done}/{total}"));
    }

    fn on_answer_start(&self, chunk: usize, total: usize) {
        self.bar.set_message(format!("answering chunk {chunk}/{total}"));
    }

    fn on_answer_delta(&self, delta: &str) {
        if self.echo {
            self.bar.suspend(|| {
                eprint!("{delta}");
                io::stderr().flush().ok();
            });
        }
    }

    fn on_finished(&self, _result: &str) {
        self.bar.finish_and_clear();
    }

    fn on_error(&self, message: &str) {
        self.bar.finish_and_clear();
        eprintln!("{} {}", red("✘"), red(message));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Generate test cases to stdout
  casegen requirements.docx

  # Write to file, finance domain, custom methods
  casegen requirements.docx -o cases.json --industry 金融 --methods 边界值分析,场景法

  # Only the "登录" and "支付" sections, smaller chunks
  casegen requirements.docx --sections 登录,支付 --chunk-size 800 --chunk-overlap 150

  # Describe embedded screenshots with a vision model first
  casegen requirements.docx --analyze-images --vision-provider openai --vision-model gpt-4.1-mini

  # PDF input via an extracted layout file
  casegen layout.json

  # Inspect the linearized context and chunk count without calling the model
  casegen requirements.docx --preview

ENVIRONMENT VARIABLES:
  CASEGEN_API_KEY         API key for the chat endpoint
  DEEPSEEK_API_KEY        Fallback API key
  OPENAI_API_KEY          Vision provider key (auto-detected)
  EDGEQUAKE_LLM_PROVIDER  Vision provider override
  EDGEQUAKE_MODEL         Vision model override
  RUST_LOG                Log filter (e.g. edgequake_casegen=debug)
"#;

/// Generate structured test cases from Word/PDF requirement documents.
#[derive(Parser, Debug)]
#[command(
    name = "casegen",
    version,
    about = "Generate structured test cases from Word/PDF requirement documents",
    long_about = "Linearize a requirement document (DOCX, a PDF layout JSON, or plain text / Markdown), stream it \
through an OpenAI-compatible reasoning model in overlapping chunks, and repair the answers \
into one renumbered JSON array of test cases.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local document path (.docx, layout .json, .txt or .md) or HTTP/HTTPS URL.
    input: String,

    /// Write the result to this file instead of stdout.
    #[arg(short, long, env = "CASEGEN_OUTPUT")]
    output: Option<PathBuf>,

    // ── Chunking ──
    /// Characters per chunk.
    #[arg(long, env = "CASEGEN_CHUNK_SIZE", default_value_t = 1000)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[arg(long, env = "CASEGEN_CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    // ── Prompt ──
    /// Industry sent with every chunk.
    #[arg(long, default_value = "通用")]
    industry: String,

    /// Kind of test case to generate.
    #[arg(long, default_value = "功能测试")]
    output_type: String,

    /// Design methods, comma-separated.
    #[arg(long, value_delimiter = ',', default_values_t = ["等价类划分".to_string(), "边界值分析".to_string()])]
    methods: Vec<String>,

    /// Path to a text file holding a custom instruction.
    #[arg(long, env = "CASEGEN_INSTRUCTION")]
    instruction: Option<PathBuf>,

    /// Keep only sections whose title contains one of these, comma-separated.
    #[arg(long, value_delimiter = ',')]
    sections: Vec<String>,

    // ── Chat model ──
    /// Chat model ID.
    #[arg(long, env = "CASEGEN_MODEL", default_value = "deepseek-reasoner")]
    model: String,

    /// OpenAI-compatible endpoint root.
    #[arg(long, env = "CASEGEN_BASE_URL", default_value = "https://api.deepseek.com")]
    base_url: String,

    /// API key (defaults to CASEGEN_API_KEY / DEEPSEEK_API_KEY).
    #[arg(long, hide_env_values = true)]
    api_key: Option<String>,

    /// Max tokens per chunk answer.
    #[arg(long, default_value_t = 60_000)]
    max_tokens: usize,

    /// Chat stream timeout in seconds.
    #[arg(long, default_value_t = 600)]
    api_timeout: u64,

    // ── Images ──
    /// Describe embedded images with a vision model before linearizing.
    #[arg(long, env = "CASEGEN_ANALYZE_IMAGES")]
    analyze_images: bool,

    /// Vision provider: openai, anthropic, gemini, ollama…
    #[arg(long)]
    vision_provider: Option<String>,

    /// Vision model ID (default gpt-4.1-nano).
    #[arg(long)]
    vision_model: Option<String>,

    /// Vision temperature (0.0–2.0).
    #[arg(long, default_value_t = 0.1)]
    temperature: f32,

    /// Retries per image on vision failure.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Pause between images in milliseconds.
    #[arg(long, default_value_t = 1000)]
    image_delay_ms: u64,

    /// Minimum image width/height in pixels.
    #[arg(long, default_value_t = 100)]
    min_image_px: u32,

    /// Minimum image file size in bytes.
    #[arg(long, default_value_t = 1024)]
    min_image_bytes: usize,

    /// Deduplicate repeated images in PDF layouts by content hash.
    #[arg(long)]
    dedup_pdf_images: bool,

    // ── Output ──
    /// Print the linearized context and chunk count, then exit.
    #[arg(long)]
    preview: bool,

    /// Echo answer text to stderr as it streams.
    #[arg(long)]
    stream: bool,

    /// Output structured JSON (GenerationOutput) instead of the records only.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "CASEGEN_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CASEGEN_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.preview;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new(cli.stream);
        Some(cb as Arc<dyn GenerationProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    // ── Preview mode ─────────────────────────────────────────────────────
    if cli.preview {
        let source = load_document(&cli.input, config.download_timeout_secs)
            .await
            .context("Failed to load document")?;
        let prepared = prepare_context(&source, &config, &CancelToken::new())
            .await
            .context("Failed to prepare context")?;
        println!("{}", prepared.text);
        eprintln!(
            "{} {} chars, {} chunks, {} images ({} dropped anchors)",
            cyan("◆"),
            prepared.context_chars,
            prepared.chunks.len(),
            prepared.total_images,
            prepared.dropped_anchors
        );
        return Ok(());
    }

    // ── Run generation ───────────────────────────────────────────────────
    let handle = spawn(cli.input.clone(), config);
    let token = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} cancelling after the current delta…", cyan("⚠"));
            token.cancel();
        }
    });

    let output = handle.wait().await.context("Generation failed")?;

    if let Some(ref output_path) = cli.output {
        let body = if cli.json {
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        } else {
            output.text.clone()
        };
        write_output(output_path, &body)
            .await
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
    } else if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(output.text.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.text.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }

    if !cli.quiet {
        let stats = &output.stats;
        eprintln!(
            "{}  {} records from {} chunks  {}ms{}",
            if output.repaired { green("✔") } else { cyan("⚠") },
            bold(&output.records.len().to_string()),
            stats.total_chunks,
            stats.total_duration_ms,
            cli.output
                .as_ref()
                .map(|p| format!("  →  {}", bold(&p.display().to_string())))
                .unwrap_or_default(),
        );
        if !output.repaired {
            eprintln!("   {}", dim("answer could not be repaired into JSON; raw text written"));
        }
        eprintln!(
            "   {} tokens in  /  {} tokens out  /  {} images described",
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
            dim(&format!("{}/{}", stats.described_images, stats.total_images)),
        );
    }

    Ok(())
}

/// Map CLI args to `GenerationConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<GenerationConfig> {
    let mut builder = GenerationConfig::builder()
        .chunk_size(cli.chunk_size)
        .chunk_overlap(cli.chunk_overlap)
        .industry(cli.industry.clone())
        .output_type(cli.output_type.clone())
        .design_methods(cli.methods.iter().cloned())
        .section_titles(cli.sections.iter().cloned())
        .model(cli.model.clone())
        .base_url(cli.base_url.clone())
        .max_tokens(cli.max_tokens)
        .api_timeout_secs(cli.api_timeout)
        .analyze_images(cli.analyze_images)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .image_batch_delay_ms(cli.image_delay_ms)
        .min_image_size(cli.min_image_px, cli.min_image_px)
        .min_image_bytes(cli.min_image_bytes)
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref path) = cli.instruction {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read instruction from {:?}", path))?;
        builder = builder.instruction(text);
    }
    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(ref name) = cli.vision_provider {
        builder = builder.vision_provider_name(name.clone());
    }
    if let Some(ref model) = cli.vision_model {
        builder = builder.vision_model(model.clone());
    }
    if cli.dedup_pdf_images {
        builder = builder.paged_dedup(DedupPolicy::ByFingerprint);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
