//! Inference and forward-with-context.
//!
//! Both paths run the same sequence:
//!
//! 1. position encoding into the density input
//! 2. density head into its own output buffer
//! 3. uv head straight into the uv band of the packed buffer
//! 4. padding rows of the packed buffer zeroed
//! 5. direction encoding into the leading band of the packed buffer
//! 6. color head into the leading rows of the caller's output
//! 7. density copied to output row 3

use super::NerfField;
use crate::error::Result;
use crate::layout::{DENSITY_CHANNEL, UV_CHANNELS, UV_OUTPUT_CHANNELS};
use crate::matrix::{Matrix, MatrixLayout, MatrixView, MatrixViewMut};
use crate::network::Context;
use crate::ops::dispatch;
use crate::params::ModuleId;
use crate::stream::Stream;

/// Everything a forward pass captured for its backward pass.
///
/// The context is tied to the batch it was produced for and must not be
/// reused after a failed call.
pub struct NerfForwardContext {
    pub(super) batch: usize,
    pub(super) density_network_input: Matrix<f32>,
    pub(super) density_network_output: Matrix<f32>,
    pub(super) rgb_network_input: Matrix<f32>,
    pub(super) pos_encoding_ctx: Box<dyn Context>,
    pub(super) density_network_ctx: Box<dyn Context>,
    pub(super) uv_network_ctx: Box<dyn Context>,
    pub(super) dir_encoding_ctx: Box<dyn Context>,
    pub(super) rgb_network_ctx: Box<dyn Context>,
}

impl core::fmt::Debug for NerfForwardContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NerfForwardContext")
            .field("batch", &self.batch)
            .field("density_network_input", &self.density_network_input.rows())
            .field("density_network_output", &self.density_network_output.rows())
            .field("rgb_network_input", &self.rgb_network_input.rows())
            .finish_non_exhaustive()
    }
}

impl NerfForwardContext {
    /// Batch size of the forward pass.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Position encoding output.
    pub fn density_network_input(&self) -> MatrixView<'_, f32> {
        self.density_network_input.view()
    }

    /// Padded density head output.
    pub fn density_network_output(&self) -> MatrixView<'_, f32> {
        self.density_network_output.view()
    }

    /// Packed color-head input.
    pub fn rgb_network_input(&self) -> MatrixView<'_, f32> {
        self.rgb_network_input.view()
    }
}

/// Buffers shared by inference and forward.
struct Intermediates {
    density_network_input: Matrix<f32>,
    density_network_output: Matrix<f32>,
    rgb_network_input: Matrix<f32>,
}

impl NerfField {
    pub(super) fn check_input(&self, what: &str, input: MatrixView<'_, f32>) -> Result<()> {
        Self::check_rows(what, input.rows(), self.input_width())
    }

    fn allocate(&self, stream: &Stream, batch: usize) -> Intermediates {
        let b = &self.buffers;
        Intermediates {
            density_network_input: stream.matrix(
                b.density_input_width,
                batch,
                self.pos_encoding.preferred_output_layout(),
            ),
            density_network_output: stream.matrix(
                b.density_output_width,
                batch,
                MatrixLayout::ColumnMajor,
            ),
            rgb_network_input: stream.matrix(
                b.rgb_input_width,
                batch,
                self.dir_encoding.preferred_output_layout(),
            ),
        }
    }

    pub(super) fn pos_input<'a>(&self, input: MatrixView<'a, f32>) -> MatrixView<'a, f32> {
        input.slice_rows(0, self.pos_encoding.input_width())
    }

    pub(super) fn dir_input<'a>(&self, input: MatrixView<'a, f32>) -> MatrixView<'a, f32> {
        input.slice_rows(self.config.dir_offset, self.dir_encoding.input_width())
    }

    /// Writes the density and, when the output has room, the uv latent.
    fn insert_channels(
        &self,
        stream: &Stream,
        bufs: &Intermediates,
        output: &mut MatrixViewMut<'_, f32>,
        with_uv: bool,
    ) {
        dispatch::copy_rows(
            stream,
            bufs.density_network_output.slice_rows(0, 1),
            &mut output.slice_rows_mut(DENSITY_CHANNEL, 1),
        );
        if with_uv && output.rows() >= UV_OUTPUT_CHANNELS.end {
            dispatch::copy_rows(
                stream,
                bufs.rgb_network_input
                    .slice_rows(self.buffers.dir_padded_width, UV_CHANNELS),
                &mut output.slice_rows_mut(UV_OUTPUT_CHANNELS.start, UV_CHANNELS),
            );
        }
    }

    /// Evaluates color and density for every column of `input`.
    ///
    /// `output` needs at least [`padded_output_width`](Self::padded_output_width)
    /// rows. If it has six or more, rows 4 and 5 receive the uv latent.
    ///
    /// # Errors
    /// [`FieldError::Shape`](crate::error::FieldError::Shape) if the buffers do
    /// not fit the field. Backend failures are fatal to the call.
    pub fn inference(
        &self,
        stream: &Stream,
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
        use_inference_params: bool,
    ) -> Result<()> {
        let batch = input.cols();
        self.check_input("inference input", input)?;
        Self::check_rows("inference output", output.rows(), self.padded_output_width())?;
        Self::check_batch("inference output", output.cols(), batch)?;

        let b = self.buffers;
        let mut bufs = self.allocate(stream, batch);

        self.pos_encoding.inference(
            stream,
            self.values(ModuleId::PosEncoding, use_inference_params),
            self.pos_input(input),
            &mut bufs.density_network_input.view_mut(),
        )?;
        self.density_network.inference(
            stream,
            self.values(ModuleId::DensityNetwork, use_inference_params),
            bufs.density_network_input.view(),
            &mut bufs.density_network_output.view_mut(),
        )?;
        self.uv_network.inference(
            stream,
            self.values(ModuleId::UvNetwork, use_inference_params),
            bufs.density_network_input.view(),
            &mut bufs
                .rgb_network_input
                .slice_rows_mut(b.dir_padded_width, b.uv_padded_width),
        )?;
        self.fill_unused(stream, &mut bufs.rgb_network_input);
        self.dir_encoding.inference(
            stream,
            self.values(ModuleId::DirEncoding, use_inference_params),
            self.dir_input(input),
            &mut bufs.rgb_network_input.slice_rows_mut(0, b.dir_padded_width),
        )?;
        self.rgb_network.inference(
            stream,
            self.values(ModuleId::RgbNetwork, use_inference_params),
            bufs.rgb_network_input.view(),
            &mut output.slice_rows_mut(0, b.rgb_output_width),
        )?;
        self.insert_channels(stream, &bufs, output, true);
        Ok(())
    }

    /// Same computation as [`inference`](Self::inference), keeping every
    /// intermediate buffer and sub-module context for
    /// [`backward`](Self::backward). With `output` absent the color head still
    /// runs but its result is discarded.
    ///
    /// The uv latent is not written to the output on this path.
    ///
    /// # Errors
    /// [`FieldError::Shape`](crate::error::FieldError::Shape) if the buffers do
    /// not fit the field.
    pub fn forward(
        &self,
        stream: &Stream,
        input: MatrixView<'_, f32>,
        mut output: Option<&mut MatrixViewMut<'_, f32>>,
        use_inference_params: bool,
        prepare_input_gradients: bool,
    ) -> Result<NerfForwardContext> {
        let batch = input.cols();
        self.check_input("forward input", input)?;
        if let Some(out) = output.as_deref() {
            Self::check_rows("forward output", out.rows(), self.padded_output_width())?;
            Self::check_batch("forward output", out.cols(), batch)?;
        }

        let b = self.buffers;
        let mut bufs = self.allocate(stream, batch);

        let pos_encoding_ctx = self.pos_encoding.forward(
            stream,
            self.values(ModuleId::PosEncoding, use_inference_params),
            self.pos_input(input),
            Some(&mut bufs.density_network_input.view_mut()),
            prepare_input_gradients,
        )?;
        let density_network_ctx = self.density_network.forward(
            stream,
            self.values(ModuleId::DensityNetwork, use_inference_params),
            bufs.density_network_input.view(),
            Some(&mut bufs.density_network_output.view_mut()),
            prepare_input_gradients,
        )?;
        let uv_network_ctx = self.uv_network.forward(
            stream,
            self.values(ModuleId::UvNetwork, use_inference_params),
            bufs.density_network_input.view(),
            Some(
                &mut bufs
                    .rgb_network_input
                    .slice_rows_mut(b.dir_padded_width, b.uv_padded_width),
            ),
            prepare_input_gradients,
        )?;
        self.fill_unused(stream, &mut bufs.rgb_network_input);
        let dir_encoding_ctx = self.dir_encoding.forward(
            stream,
            self.values(ModuleId::DirEncoding, use_inference_params),
            self.dir_input(input),
            Some(&mut bufs.rgb_network_input.slice_rows_mut(0, b.dir_padded_width)),
            prepare_input_gradients,
        )?;

        let mut rgb_output = output
            .as_deref_mut()
            .map(|out| out.slice_rows_mut(0, b.rgb_output_width));
        let rgb_network_ctx = self.rgb_network.forward(
            stream,
            self.values(ModuleId::RgbNetwork, use_inference_params),
            bufs.rgb_network_input.view(),
            rgb_output.as_mut(),
            prepare_input_gradients,
        )?;
        drop(rgb_output);

        if let Some(out) = output {
            self.insert_channels(stream, &bufs, out, false);
        }

        Ok(NerfForwardContext {
            batch,
            density_network_input: bufs.density_network_input,
            density_network_output: bufs.density_network_output,
            rgb_network_input: bufs.rgb_network_input,
            pos_encoding_ctx,
            density_network_ctx,
            uv_network_ctx,
            dir_encoding_ctx,
            rgb_network_ctx,
        })
    }
}
