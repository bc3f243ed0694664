//! Ordered execution queues.
//!
//! Every evaluation path takes a caller-supplied [`Stream`]. Submissions made
//! to one stream complete in the order they were made, and that total order
//! is the only synchronization the evaluator relies on; there are no locks
//! anywhere in the forward or backward paths.
//!
//! The CPU backend executes each submission eagerly on the calling thread,
//! spreading the per-element work of a single kernel over the `rayon` pool.
//! The `wgpu` backend blocks on its own queue for each kernel, so results are
//! visible once the call returns on either backend. Callers should still call
//! [`Stream::synchronize`] before reading results so code stays correct if a
//! deferred backend is added.

use crate::backend::{Backend, get_backend};
use crate::matrix::{Matrix, MatrixLayout};
use core::sync::atomic::{AtomicU64, Ordering};

/// A caller-owned, ordered execution queue.
#[derive(Debug)]
pub struct Stream {
    label: String,
    backend: Backend,
    submitted: AtomicU64,
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream {
    /// Creates a stream on the current global backend.
    pub fn new() -> Self {
        Self::with_backend(get_backend())
    }

    /// Creates a stream dispatching to `backend`.
    pub fn with_backend(backend: Backend) -> Self {
        Self {
            label: String::from("default"),
            backend,
            submitted: AtomicU64::new(0),
        }
    }

    /// Attaches a label used in log output.
    #[must_use]
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Name used in log output.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Backend every submission on this stream dispatches to.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Number of submissions made so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Allocates a zero-initialised batch buffer scoped to this stream.
    pub fn matrix(&self, rows: usize, cols: usize, layout: MatrixLayout) -> Matrix<f32> {
        self.record("alloc");
        Matrix::zeros(rows, cols, layout)
    }

    /// Waits for every submission to finish.
    pub fn synchronize(&self) {
        log::trace!(
            "stream `{}`: synchronize after {} submissions",
            self.label,
            self.submitted()
        );
    }

    pub(crate) fn record(&self, op: &'static str) {
        let n = self.submitted.fetch_add(1, Ordering::Relaxed);
        log::trace!("stream `{}` #{n}: {op}", self.label);
    }
}
