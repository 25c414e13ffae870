//! # edgequake-casegen
//!
//! Generate structured test cases from Word/PDF requirement documents with a
//! streaming language model.
//!
//! A requirement document is a mix of prose, tables and screenshots. This
//! crate flattens it into one reading-order string (optionally replacing each
//! embedded image with a vision-model description), cuts that string into
//! overlapping windows, streams one model answer per window, and repairs the
//! concatenated answer into a flat list of renumbered JSON records.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DOCX / layout JSON
//!  │
//!  ├─ 1. Input      resolve local file or download from URL, sniff the format
//!  ├─ 2. Order      one global, deduplicated image order
//!  ├─ 3. Vision     describe each image (optional), reconcile to the order
//!  ├─ 4. Linearize  text + tables + image descriptions in reading order
//!  ├─ 5. Chunk      overlapping character windows
//!  ├─ 6. Stream     one chat completion per chunk, reasoning discarded
//!  └─ 7. Repair     fenced / truncated JSON → renumbered records (TC_001…)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_casegen::{generate, GenerationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key read from CASEGEN_API_KEY / DEEPSEEK_API_KEY
//!     let config = GenerationConfig::builder()
//!         .industry("电商")
//!         .design_methods(["等价类划分", "边界值分析", "场景法"])
//!         .build()?;
//!     let output = generate("requirements.docx", &config).await?;
//!     println!("{}", output.text);
//!     eprintln!("{} records from {} chunks",
//!         output.records.len(),
//!         output.stats.total_chunks);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `casegen` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-casegen = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod generate;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GenerationConfig, GenerationConfigBuilder};
pub use document::{DocumentSource, FlowDocument, PagedDocument};
pub use error::{CaseGenError, ImageError};
pub use generate::{
    generate, generate_from_source, generate_sync, generate_to_file, prepare_context, run, spawn,
    CancelToken, GenerationHandle, PreparedContext,
};
pub use output::{ChunkAnswer, GenerationOutput, GenerationStats, ImageReport, TokenUsage};
pub use pipeline::llm::{ChatModel, ChatRequest, OpenAiCompatibleModel};
pub use pipeline::order::DedupPolicy;
pub use pipeline::repair::{repair, RepairOutcome};
pub use pipeline::vision::VisionModel;
pub use progress::{GenerationProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{Delta, DeltaStream};
