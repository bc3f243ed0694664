//! Gradient routing through the five sub-modules.
//!
//! The color-head input gradient is split into its direction band and its uv
//! band. The uv band is scaled by `uv_network_scale` before it reaches the uv
//! head; the direction band is never scaled. Both the density head and the uv
//! head feed a single position-encoding gradient, summed before the position
//! encoding runs its own backward pass.

use super::{NerfField, NerfForwardContext};
use crate::error::Result;
use crate::layout::{DENSITY_CHANNEL, RGB_CHANNELS};
use crate::matrix::{Matrix, MatrixLayout, MatrixView, MatrixViewMut};
use crate::network::GradientMode;
use crate::ops::dispatch;
use crate::params::ModuleId;
use crate::stream::Stream;

impl NerfField {
    /// Propagates `dl_doutput` back to every sub-module's parameter gradients
    /// and, when `dl_dinput` is given, to the external input.
    ///
    /// `ctx` must come from [`forward`](Self::forward) on the same `input`,
    /// and `output` must be what that forward pass wrote. Only rows 0..3
    /// (color) and row 3 (density) of `dl_doutput` are read; the uv band of
    /// an extended output carries no gradient.
    ///
    /// Input rows outside the position and direction bands are left
    /// untouched in `dl_dinput`.
    ///
    /// # Errors
    /// [`FieldError::Shape`](crate::error::FieldError::Shape) if a buffer does
    /// not fit `ctx`, and
    /// [`FieldError::Context`](crate::error::FieldError::Context) if `ctx`
    /// was produced by a different field.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &mut self,
        stream: &Stream,
        ctx: &NerfForwardContext,
        input: MatrixView<'_, f32>,
        output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        mut dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        use_inference_params: bool,
        mode: GradientMode,
    ) -> Result<()> {
        let batch = ctx.batch;
        let padded_output_width = self.padded_output_width();
        self.check_input("backward input", input)?;
        Self::check_batch("backward input", input.cols(), batch)?;
        for (what, view) in [("backward output", output), ("output gradient", dl_doutput)] {
            Self::check_rows(what, view.rows(), padded_output_width)?;
            Self::check_batch(what, view.cols(), batch)?;
        }
        if let Some(d) = dl_dinput.as_deref() {
            Self::check_rows("input gradient", d.rows(), self.input_width())?;
            Self::check_batch("input gradient", d.cols(), batch)?;
        }

        let b = self.buffers;
        let want_input = dl_dinput.is_some();

        // color head
        let mut dl_drgb = stream.matrix(b.rgb_output_width, batch, MatrixLayout::ColumnMajor);
        dispatch::copy_rows(
            stream,
            dl_doutput.slice_rows(0, RGB_CHANNELS),
            &mut dl_drgb.slice_rows_mut(0, RGB_CHANNELS),
        );
        let mut dl_drgb_input = stream.matrix(
            b.rgb_input_width,
            batch,
            self.dir_encoding.preferred_output_layout(),
        );
        {
            let (params, grads) = self.block.split_mut(
                self.parameter_layout.range(ModuleId::RgbNetwork),
                use_inference_params,
            );
            self.rgb_network.backward(
                stream,
                ctx.rgb_network_ctx.as_ref(),
                params,
                grads,
                ctx.rgb_network_input(),
                output.slice_rows(0, b.rgb_output_width),
                dl_drgb.view(),
                Some(&mut dl_drgb_input.view_mut()),
                mode,
            )?;
        }

        // direction encoding
        if self.dir_encoding.n_params() > 0 || want_input {
            let dir_offset = self.config.dir_offset;
            let dir_in = self.dir_encoding.input_width();
            let (params, grads) = self.block.split_mut(
                self.parameter_layout.range(ModuleId::DirEncoding),
                use_inference_params,
            );
            let mut dl_ddir = dl_dinput
                .as_deref_mut()
                .map(|d| d.slice_rows_mut(dir_offset, dir_in));
            self.dir_encoding.backward(
                stream,
                ctx.dir_encoding_ctx.as_ref(),
                params,
                grads,
                input.slice_rows(dir_offset, dir_in),
                ctx.rgb_network_input.slice_rows(0, b.dir_padded_width),
                dl_drgb_input.slice_rows(0, b.dir_padded_width),
                dl_ddir.as_mut(),
                mode,
            )?;
        }

        // density head
        let mut dl_ddensity = stream.matrix(b.density_output_width, batch, MatrixLayout::ColumnMajor);
        dispatch::add_rows(
            stream,
            dl_doutput.slice_rows(DENSITY_CHANNEL, 1),
            &mut dl_ddensity.slice_rows_mut(0, 1),
        );
        let mut dl_ddensity_input = (self.pos_encoding.n_params() > 0 || want_input).then(|| {
            stream.matrix(
                b.density_input_width,
                batch,
                self.pos_encoding.preferred_output_layout(),
            )
        });
        {
            let (params, grads) = self.block.split_mut(
                self.parameter_layout.range(ModuleId::DensityNetwork),
                use_inference_params,
            );
            self.density_network.backward(
                stream,
                ctx.density_network_ctx.as_ref(),
                params,
                grads,
                ctx.density_network_input(),
                ctx.density_network_output(),
                dl_ddensity.view(),
                dl_ddensity_input.as_mut().map(Matrix::view_mut).as_mut(),
                mode,
            )?;
        }

        // uv head
        self.fill_unused(stream, &mut dl_drgb_input);
        dispatch::scale_gradient(
            stream,
            &mut dl_drgb_input.slice_rows_mut(b.dir_padded_width, b.uv_padded_width),
            self.uv_network_scale,
        );
        let mut dl_duv_input = dl_ddensity_input.as_ref().map(|_| {
            stream.matrix(
                b.density_input_width,
                batch,
                self.pos_encoding.preferred_output_layout(),
            )
        });
        {
            let (params, grads) = self.block.split_mut(
                self.parameter_layout.range(ModuleId::UvNetwork),
                use_inference_params,
            );
            self.uv_network.backward(
                stream,
                ctx.uv_network_ctx.as_ref(),
                params,
                grads,
                ctx.density_network_input(),
                ctx.rgb_network_input
                    .slice_rows(b.dir_padded_width, b.uv_padded_width),
                dl_drgb_input.slice_rows(b.dir_padded_width, b.uv_padded_width),
                dl_duv_input.as_mut().map(Matrix::view_mut).as_mut(),
                mode,
            )?;
        }

        // position encoding
        let Some(mut dl_ddensity_input) = dl_ddensity_input else {
            return Ok(());
        };
        if let Some(dl_duv_input) = &dl_duv_input {
            dispatch::add_gradient(stream, dl_duv_input.view(), &mut dl_ddensity_input.view_mut());
        }
        let n_pos = self.pos_encoding.input_width();
        let (params, grads) = self.block.split_mut(
            self.parameter_layout.range(ModuleId::PosEncoding),
            use_inference_params,
        );
        let mut dl_dpos = dl_dinput
            .as_deref_mut()
            .map(|d| d.slice_rows_mut(0, n_pos));
        self.pos_encoding.backward(
            stream,
            ctx.pos_encoding_ctx.as_ref(),
            params,
            grads,
            input.slice_rows(0, n_pos),
            ctx.density_network_input(),
            dl_ddensity_input.view(),
            dl_dpos.as_mut(),
            mode,
        )
    }
}
