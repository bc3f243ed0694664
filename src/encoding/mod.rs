//! Coordinate encodings.
//!
//! An encoding maps `input_width` raw coordinate rows to `output_width`
//! feature rows, rounded up to the alignment its consumer asked for. Rows past
//! `output_width` are padding and are written as `1.0`.

pub mod frequency;
pub mod identity;

use crate::config::EncodingConfig;
use crate::error::Result;
use crate::matrix::{MatrixLayout, MatrixView, MatrixViewMut};
use crate::network::{Context, GradientMode};
use crate::stream::Stream;
use core::any::Any;
use rand::RngCore;

pub use frequency::FrequencyEncoding;
pub use identity::IdentityEncoding;

/// Value written into padding rows of an encoding output.
pub const PADDING_VALUE: f32 = 1.0;

/// A (possibly trainable) coordinate encoding.
pub trait Encoding: Send + Sync + core::fmt::Debug {
    /// Short name used in errors.
    fn name(&self) -> &'static str;

    /// Rows of the raw input.
    fn input_width(&self) -> usize;

    /// Meaningful output rows.
    fn output_width(&self) -> usize;

    /// Output rows including alignment padding.
    fn padded_output_width(&self) -> usize;

    /// Ordering the encoding writes most efficiently.
    fn preferred_output_layout(&self) -> MatrixLayout {
        MatrixLayout::ColumnMajor
    }

    /// Number of trainable values.
    fn n_params(&self) -> usize {
        0
    }

    /// Fills `params` with initial values drawn from `rng`.
    fn initialize_params(&self, _rng: &mut dyn RngCore, _params: &mut [f32], _scale: f32) {}

    /// Encodes `input` into `output`.
    ///
    /// # Errors
    /// [`FieldError::Shape`](crate::error::FieldError::Shape) on mismatched buffers.
    fn inference(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()>;

    /// Encodes `input` into `output` and keeps what backward needs.
    ///
    /// # Errors
    /// [`FieldError::Shape`](crate::error::FieldError::Shape) on mismatched buffers.
    fn forward(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        prepare_input_gradients: bool,
    ) -> Result<Box<dyn Context>>;

    /// Propagates `dl_doutput` to parameter gradients and, if requested, to
    /// the raw coordinates. `dl_dinput` is overwritten.
    ///
    /// # Errors
    /// [`FieldError::Context`](crate::error::FieldError::Context) for a
    /// foreign context, [`FieldError::Shape`](crate::error::FieldError::Shape)
    /// on mismatched buffers.
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

    /// The effective configuration.
    fn hyperparams(&self) -> serde_json::Value;
}

/// Forward state of an encoding that needs nothing beyond its input.
#[derive(Debug)]
pub struct StatelessContext {
    owner: &'static str,
    batch: usize,
}

impl StatelessContext {
    pub(crate) fn new(owner: &'static str, batch: usize) -> Self {
        Self { owner, batch }
    }

    /// Name of the encoding that produced the context.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// Batch size of the forward pass.
    pub fn batch(&self) -> usize {
        self.batch
    }
}

impl Context for StatelessContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn stateless_context<'a>(ctx: &'a dyn Context, owner: &'static str) -> Result<&'a StatelessContext> {
    let ctx: &StatelessContext = crate::network::downcast_context(ctx, owner)?;
    if ctx.owner == owner {
        Ok(ctx)
    } else {
        Err(crate::error::FieldError::Context(owner))
    }
}

/// Builds the encoding described by `config` for `n_dims` input rows, padding
/// its output to a multiple of `alignment`.
pub fn create_encoding(config: &EncodingConfig, n_dims: usize, alignment: usize) -> Box<dyn Encoding> {
    match *config {
        EncodingConfig::Identity { scale, offset } => {
            Box::new(IdentityEncoding::new(n_dims, scale, offset, alignment))
        }
        EncodingConfig::Frequency { n_frequencies } => {
            Box::new(FrequencyEncoding::new(n_dims, n_frequencies, alignment))
        }
    }
}
