//! Error types for the edgequake-casegen library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`CaseGenError`]: **Fatal**: the current run cannot make forward
//!   progress (unreadable document, model call failed, run cancelled).
//!   Returned as `Err(CaseGenError)` from the top-level `generate*`
//!   functions and reported exactly once through
//!   [`crate::progress::GenerationProgressCallback::on_error`].
//!
//! * [`ImageError`]: **Non-fatal**: a single embedded image could not be
//!   analysed (undecodable bytes, too small, vision call failed). The image
//!   simply receives an empty replacement and the batch continues; the error
//!   is kept in [`crate::output::ImageReport`] so callers can see what was
//!   filtered.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-casegen library.
#[derive(Debug, Error)]
pub enum CaseGenError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Document errors ───────────────────────────────────────────────────
    /// The file was read but its container format is not one we can traverse.
    #[error("Unsupported document '{path}': {detail}")]
    UnsupportedFormat { path: PathBuf, detail: String },

    /// The container opened but its body could not be traversed.
    #[error("Document '{path}' is corrupt: {detail}")]
    CorruptDocument { path: PathBuf, detail: String },

    /// A JSON layout file did not match the document model.
    #[error("Invalid layout file '{path}': {detail}")]
    InvalidLayout { path: PathBuf, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The chat-completion endpoint rejected the request.
    #[error("LLM API error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    LlmApiError {
        status: Option<u16>,
        message: String,
    },

    /// The delta stream broke off before completion.
    #[error("Model stream interrupted on chunk {chunk}: {detail}")]
    StreamInterrupted { chunk: usize, detail: String },

    // ── Run control ───────────────────────────────────────────────────────
    /// The run was cancelled by the orchestrator.
    #[error("Generation cancelled after {completed}/{total} steps")]
    Cancelled { completed: usize, total: usize },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (including panics caught at the run boundary).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single embedded image.
///
/// The image's replacement collapses to an empty string and the remaining
/// images are still analysed.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ImageError {
    /// The bytes could not be decoded as a raster image (EMF/WMF, truncated data…).
    #[error("Image {index}: could not decode: {detail}")]
    Undecodable { index: usize, detail: String },

    /// Below the configured minimum width/height or file size.
    #[error("Image {index}: {width}x{height} px, {bytes} bytes is below the analysis threshold")]
    TooSmall {
        index: usize,
        width: u32,
        height: u32,
        bytes: usize,
    },

    /// Vision call failed after retries.
    #[error("Image {index}: vision call failed after {retries} retries: {detail}")]
    VisionFailed {
        index: usize,
        retries: u32,
        detail: String,
    },
}
