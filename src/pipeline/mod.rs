//! Pipeline stages for document-to-test-case generation.
//!
//! Each submodule implements exactly one transformation step and is
//! testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ order ──▶ vision ──▶ reconcile ──▶ linearize ──▶ chunk ──▶ llm ──▶ repair ──▶ normalize
//! (docx)    (slots)   (encode)   (pad/trim)    (text)        (windows)  (SSE)   (JSON)     (TC_nnn)
//! ```
//!
//! 1. [`input`] / [`docx`] / [`text`]: path or URL to a
//!    [`crate::document::DocumentSource`]
//! 2. [`order`]: single-pass anchor discovery, sort and dedup
//! 3. [`vision`] / [`encode`]: one description per unique image, with
//!    retry/backoff; only stage besides [`llm`] with network I/O
//! 4. [`reconcile`]: force the replacement list to the slot count
//! 5. [`linearize`]: reading-order text with image markers
//! 6. [`chunk`]: overlapping character windows
//! 7. [`llm`]: streamed chat completion per chunk
//! 8. [`repair`] / [`normalize`]: model answer to renumbered records

pub mod chunk;
pub mod docx;
pub mod encode;
pub mod input;
pub mod linearize;
pub mod llm;
pub mod normalize;
pub mod order;
pub mod reconcile;
pub mod repair;
pub mod text;
pub mod vision;
