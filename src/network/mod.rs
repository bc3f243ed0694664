//! Feed-forward heads and the contracts every sub-module follows.
//!
//! A sub-module never owns its parameters. The composite field lends each
//! call the slice of its arena that belongs to the module, so the same
//! network can run against training or inference values without copying.
//!
//! Forward passes hand back an opaque [`Context`]. Only the module that
//! produced a context knows its concrete type; passing it to any other module
//! fails with [`FieldError::Context`].

pub mod activation;
pub mod mlp;

use crate::config::NetworkConfig;
use crate::error::{FieldError, Result};
use crate::matrix::{MatrixLayout, MatrixView, MatrixViewMut};
use crate::stream::Stream;
use core::any::Any;
use rand::RngCore;

pub use mlp::Mlp;

/// Opaque state captured by a forward pass for the matching backward pass.
pub trait Context: Any + Send + Sync {
    /// Upcast used by the owning module to recover its concrete context.
    fn as_any(&self) -> &dyn Any;
}

/// Downcasts `ctx` to the context type of the module named `owner`.
///
/// # Errors
/// [`FieldError::Context`] if `ctx` was produced by a different module type.
pub fn downcast_context<'a, C: Context>(ctx: &'a dyn Context, owner: &'static str) -> Result<&'a C> {
    ctx.as_any()
        .downcast_ref::<C>()
        .ok_or(FieldError::Context(owner))
}

/// How a backward pass writes parameter gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradientMode {
    /// Leave parameter gradients untouched.
    Ignore,
    /// Replace the gradient buffer.
    #[default]
    Overwrite,
    /// Add to the gradient buffer.
    Accumulate,
}

impl GradientMode {
    /// Writes `computed` into `gradients` according to the mode.
    pub fn apply(self, gradients: &mut [f32], computed: &[f32]) {
        match self {
            Self::Ignore => {}
            Self::Overwrite => gradients.copy_from_slice(computed),
            Self::Accumulate => gradients
                .iter_mut()
                .zip(computed)
                .for_each(|(g, c)| *g += *c),
        }
    }
}

/// A trainable feed-forward head.
pub trait Network: Send + Sync + core::fmt::Debug {
    /// Rows of the input buffer.
    fn input_width(&self) -> usize;

    /// Meaningful output rows.
    fn output_width(&self) -> usize;

    /// Rows of the output buffer, including alignment padding.
    fn padded_output_width(&self) -> usize;

    /// Ordering the network writes most efficiently.
    fn preferred_output_layout(&self) -> MatrixLayout {
        MatrixLayout::ColumnMajor
    }

    /// Number of trainable values.
    fn n_params(&self) -> usize;

    /// Fills `params` with initial values drawn from `rng`.
    fn initialize_params(&self, rng: &mut dyn RngCore, params: &mut [f32], scale: f32);

    /// Evaluates the network without keeping intermediate state.
    ///
    /// # Errors
    /// [`FieldError::Shape`] if the buffers do not match the network's widths.
    fn inference(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()>;

    /// Evaluates the network and returns the state backward needs.
    ///
    /// # Errors
    /// [`FieldError::Shape`] if the buffers do not match the network's widths.
    fn forward(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        prepare_input_gradients: bool,
    ) -> Result<Box<dyn Context>>;

    /// Propagates `dl_doutput` back through the network.
    ///
    /// # Errors
    /// [`FieldError::Context`] for a foreign context and [`FieldError::Shape`]
    /// for mismatched buffers.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        stream: &Stream,
        ctx: &dyn Context,
        params: &[f32],
        gradients: &mut [f32],
        input: MatrixView<'_, f32>,
        output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        mode: GradientMode,
    ) -> Result<()>;

    /// `(rows, cols)` of every weight matrix, input layer first.
    fn layer_sizes(&self) -> Vec<(usize, usize)>;

    /// Rows of the activation buffer of `layer`.
    fn width(&self, layer: usize) -> usize;

    /// Number of activation buffers a forward context exposes.
    fn num_forward_activations(&self) -> usize;

    /// Post-activation values of `layer` captured in `ctx`.
    ///
    /// # Errors
    /// [`FieldError::Context`] for a foreign context and [`FieldError::Layer`]
    /// for an index past the last activation.
    fn forward_activations<'a>(&self, ctx: &'a dyn Context, layer: usize) -> Result<MatrixView<'a, f32>>;

    /// The effective configuration.
    fn hyperparams(&self) -> serde_json::Value;
}

/// Builds the network described by `config`.
///
/// # Errors
/// [`FieldError::Config`] if the config lacks its input or output width.
pub fn create_network(config: &NetworkConfig) -> Result<Box<dyn Network>> {
    Ok(Box::new(Mlp::new(config)?))
}

pub(crate) fn check_shape(
    what: &str,
    view_rows: usize,
    view_cols: usize,
    rows: usize,
    cols: usize,
) -> Result<()> {
    if view_rows == rows && view_cols == cols {
        Ok(())
    } else {
        Err(FieldError::shape(format!(
            "{what}: expected {rows}x{cols}, found {view_rows}x{view_cols}"
        )))
    }
}
