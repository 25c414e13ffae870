//! Progress-callback trait for generation runs.
//!
//! Inject an [`Arc<dyn GenerationProgressCallback>`] via
//! [`crate::config::GenerationConfigBuilder::progress_callback`] to follow a
//! run from a terminal, a GUI or a web socket.
//!
//! Events arrive in the order they are produced, from the single task that
//! drives the run:
//!
//! * [`on_stage`](GenerationProgressCallback::on_stage) before and after each
//!   chunk (`"n/total"` style counters).
//! * [`on_progress`](GenerationProgressCallback::on_progress) with the full
//!   accumulated answer of the current chunk after every answer delta, and
//!   with status lines during image analysis.
//! * exactly one of [`on_finished`](GenerationProgressCallback::on_finished)
//!   or [`on_error`](GenerationProgressCallback::on_error) per run.
//!
//! # Example
//!
//! ```rust
//! use edgequake_casegen::{GenerationConfig, GenerationProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct StageCounter {
//!     stages: AtomicUsize,
//! }
//!
//! impl GenerationProgressCallback for StageCounter {
//!     fn on_stage(&self, done: usize, total: usize) {
//!         self.stages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("chunk {done}/{total}");
//!     }
//! }
//!
//! let counter = Arc::new(StageCounter { stages: AtomicUsize::new(0) });
//!
//! let config = GenerationConfig::builder()
//!     .progress_callback(counter as Arc<dyn GenerationProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Receives run events. All methods default to no-ops.
pub trait GenerationProgressCallback: Send + Sync {
    /// Status text: the accumulated answer of the current chunk, or an image
    /// analysis line such as `image 2/5: invalid image, filtered`.
    fn on_progress(&self, text: &str) {
        let _ = text;
    }

    /// Chunk counter: `(i, total)` before chunk `i + 1` starts and
    /// `(i + 1, total)` once it is complete.
    fn on_stage(&self, done: usize, total: usize) {
        let _ = (done, total);
    }

    /// Fired once per chunk when the first non-empty answer delta arrives
    /// (the model has finished reasoning).
    ///
    /// # Arguments
    /// * `chunk`: 1-indexed chunk number
    /// * `total`: number of chunks
    fn on_answer_start(&self, chunk: usize, total: usize) {
        let _ = (chunk, total);
    }

    /// Every answer delta, as received.
    fn on_answer_delta(&self, delta: &str) {
        let _ = delta;
    }

    /// Terminal success: the repaired and renumbered JSON text, or the raw
    /// answer when it could not be repaired.
    fn on_finished(&self, result: &str) {
        let _ = result;
    }

    /// Terminal failure.
    fn on_error(&self, message: &str) {
        let _ = message;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl GenerationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::GenerationConfig`].
pub type ProgressCallback = Arc<dyn GenerationProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl GenerationProgressCallback for Recorder {
        fn on_stage(&self, done: usize, total: usize) {
            self.events.lock().unwrap().push(format!("stage {done}/{total}"));
        }

        fn on_finished(&self, result: &str) {
            self.events.lock().unwrap().push(format!("finished {result}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_progress("text");
        cb.on_stage(0, 3);
        cb.on_answer_start(1, 3);
        cb.on_answer_delta("d");
        cb.on_finished("[]");
        cb.on_error("boom");
    }

    #[test]
    fn overridden_methods_receive_events_in_order() {
        let rec = Recorder::default();
        rec.on_stage(0, 1);
        rec.on_progress("ignored by default impl");
        rec.on_stage(1, 1);
        rec.on_finished("[]");
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["stage 0/1", "stage 1/1", "finished []"]
        );
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage(1, 10);
        cb.on_error("x");
    }
}
