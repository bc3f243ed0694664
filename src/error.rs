//! Error types shared by every evaluation path.
//!
//! Shape and layout violations are raised synchronously, before anything is
//! submitted to a [`Stream`](crate::stream::Stream). Anything raised after a
//! submission poisons the forward context it was produced for; callers must
//! discard that context rather than pass it to a backward call.

use crate::matrix::MatrixLayout;
use briny::prelude::ValidationError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, FieldError>;

/// Errors produced by the field evaluator and its sub-modules.
#[derive(Debug, Error)]
pub enum FieldError {
    /// A reduced path received a buffer in a memory ordering it cannot slice.
    #[error("{op}: expected {expected:?} buffer, found {found:?}")]
    Layout {
        /// The operation that rejected the buffer.
        op: &'static str,
        /// The ordering the operation requires.
        expected: MatrixLayout,
        /// The ordering it was given.
        found: MatrixLayout,
    },

    /// Batch size or width disagreement between buffers.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// The configuration cannot be turned into a field.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A parameter buffer does not match the partition of the field.
    #[error("parameter buffer holds {found} values, expected {expected}")]
    Parameters {
        /// Number of values the partition requires.
        expected: usize,
        /// Number of values supplied.
        found: usize,
    },

    /// A forward context was handed to a module that did not create it.
    #[error("forward context does not belong to {0}")]
    Context(&'static str),

    /// Activation layer index outside the flat activation view.
    #[error("layer {index} out of range ({count} forward activations)")]
    Layer {
        /// Requested layer.
        index: usize,
        /// Number of addressable layers.
        count: usize,
    },

    /// A parameter snapshot is malformed or does not match the field.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// A record failed briny validation.
    #[error("validation failed: {0:?}")]
    Validation(ValidationError),

    /// Configuration JSON could not be parsed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a snapshot failed.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for FieldError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl FieldError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
