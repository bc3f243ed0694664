//! Density-only evaluation: position encoding and density head, nothing else.
//!
//! These paths slice the external input and input gradient by row, which is
//! only a plain band for column-major buffers. Any other ordering is rejected
//! before anything is submitted.

use super::{NerfField, require_column_major};
use crate::error::Result;
use crate::matrix::{Matrix, MatrixView, MatrixViewMut};
use crate::network::{Context, GradientMode};
use crate::params::ModuleId;
use crate::stream::Stream;

/// State kept by [`NerfField::density_forward`].
pub struct DensityForwardContext {
    batch: usize,
    density_network_input: Matrix<f32>,
    pos_encoding_ctx: Box<dyn Context>,
    density_network_ctx: Box<dyn Context>,
}

impl core::fmt::Debug for DensityForwardContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DensityForwardContext")
            .field("batch", &self.batch)
            .field("density_network_input", &self.density_network_input.rows())
            .finish_non_exhaustive()
    }
}

impl DensityForwardContext {
    /// Batch size of the forward pass.
    pub fn batch_size(&self) -> usize {
        self.batch
    }

    /// Position encoding output.
    pub fn density_network_input(&self) -> MatrixView<'_, f32> {
        self.density_network_input.view()
    }
}

impl NerfField {
    fn check_density_output(&self, what: &str, rows: usize, cols: usize, batch: usize) -> Result<()> {
        Self::check_rows(what, rows, self.buffers.density_output_width)?;
        Self::check_batch(what, cols, batch)
    }

    /// Raw density head output for every column of `input`.
    ///
    /// `output` has [`padded_density_output_width`](Self::padded_density_output_width)
    /// rows and sets the batch size; row 0 is the density.
    ///
    /// # Errors
    /// [`FieldError::Layout`](crate::error::FieldError::Layout) unless `input`
    /// is column-major.
    pub fn density(
        &self,
        stream: &Stream,
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
        use_inference_params: bool,
    ) -> Result<()> {
        require_column_major("density", input.layout())?;
        let batch = output.cols();
        self.check_input("density input", input)?;
        Self::check_batch("density input", input.cols(), batch)?;
        self.check_density_output("density output", output.rows(), output.cols(), batch)?;

        let mut density_network_input = stream.matrix(
            self.buffers.density_input_width,
            batch,
            self.pos_encoding.preferred_output_layout(),
        );
        self.pos_encoding.inference(
            stream,
            self.values(ModuleId::PosEncoding, use_inference_params),
            self.pos_input(input),
            &mut density_network_input.view_mut(),
        )?;
        self.density_network.inference(
            stream,
            self.values(ModuleId::DensityNetwork, use_inference_params),
            density_network_input.view(),
            &mut output.slice_rows_mut(0, self.buffers.density_output_width),
        )
    }

    /// Same as [`density`](Self::density) but keeps what
    /// [`density_backward`](Self::density_backward) needs.
    ///
    /// # Errors
    /// [`FieldError::Layout`](crate::error::FieldError::Layout) unless `input`
    /// is column-major.
    pub fn density_forward(
        &self,
        stream: &Stream,
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        use_inference_params: bool,
        prepare_input_gradients: bool,
    ) -> Result<DensityForwardContext> {
        require_column_major("density_forward", input.layout())?;
        let batch = input.cols();
        self.check_input("density_forward input", input)?;
        if let Some(out) = output.as_deref() {
            self.check_density_output("density_forward output", out.rows(), out.cols(), batch)?;
        }

        let mut density_network_input = stream.matrix(
            self.buffers.density_input_width,
            batch,
            self.pos_encoding.preferred_output_layout(),
        );
        let pos_encoding_ctx = self.pos_encoding.forward(
            stream,
            self.values(ModuleId::PosEncoding, use_inference_params),
            self.pos_input(input),
            Some(&mut density_network_input.view_mut()),
            prepare_input_gradients,
        )?;
        let width = self.buffers.density_output_width;
        let density_network_ctx = self.density_network.forward(
            stream,
            self.values(ModuleId::DensityNetwork, use_inference_params),
            density_network_input.view(),
            output.map(|out| out.slice_rows_mut(0, width)).as_mut(),
            prepare_input_gradients,
        )?;

        Ok(DensityForwardContext {
            batch,
            density_network_input,
            pos_encoding_ctx,
            density_network_ctx,
        })
    }

    /// Backward pass of [`density_forward`](Self::density_forward).
    ///
    /// `output` and `dl_doutput` are padded density buffers. When `dl_dinput`
    /// is given its position rows receive the input gradient; every other row
    /// is left untouched.
    ///
    /// # Errors
    /// [`FieldError::Layout`](crate::error::FieldError::Layout) unless `input`
    /// and `dl_dinput` are column-major.
    #[allow(clippy::too_many_arguments)]
    pub fn density_backward(
        &mut self,
        stream: &Stream,
        ctx: &DensityForwardContext,
        input: MatrixView<'_, f32>,
        output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        mut dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        use_inference_params: bool,
        mode: GradientMode,
    ) -> Result<()> {
        require_column_major("density_backward", input.layout())?;
        if let Some(d) = dl_dinput.as_deref() {
            require_column_major("density_backward", d.layout())?;
        }
        let batch = ctx.batch;
        self.check_input("density_backward input", input)?;
        Self::check_batch("density_backward input", input.cols(), batch)?;
        self.check_density_output("density_backward output", output.rows(), output.cols(), batch)?;
        self.check_density_output(
            "density_backward output gradient",
            dl_doutput.rows(),
            dl_doutput.cols(),
            batch,
        )?;
        if let Some(d) = dl_dinput.as_deref() {
            Self::check_rows("density_backward input gradient", d.rows(), self.input_width())?;
            Self::check_batch("density_backward input gradient", d.cols(), batch)?;
        }

        let b = self.buffers;
        let mut dl_ddensity_input = (self.pos_encoding.n_params() > 0 || dl_dinput.is_some())
            .then(|| {
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
                ctx.density_network_input.view(),
                output.slice_rows(0, b.density_output_width),
                dl_doutput.slice_rows(0, b.density_output_width),
                dl_ddensity_input.as_mut().map(Matrix::view_mut).as_mut(),
                mode,
            )?;
        }

        let Some(dl_ddensity_input) = dl_ddensity_input else {
            return Ok(());
        };
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
            ctx.density_network_input.view(),
            dl_ddensity_input.view(),
            dl_dpos.as_mut(),
            mode,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NerfFieldConfig;
    use crate::error::FieldError;
    use crate::matrix::MatrixLayout;

    fn field() -> NerfField {
        let config = NerfFieldConfig::from_json_str(
            r#"{
                "n_pos_dims": 3, "n_dir_dims": 2, "dir_offset": 3,
                "pos_encoding": { "otype": "Identity" },
                "dir_encoding": { "otype": "Identity" },
                "density_network": { "otype": "MLP", "n_hidden_layers": 0 },
                "uv_network": { "otype": "MLP", "n_hidden_layers": 0 },
                "rgb_network": { "otype": "MLP", "n_hidden_layers": 0 }
            }"#,
        )
        .unwrap();
        NerfField::new(config).unwrap()
    }

    #[test]
    fn row_major_input_is_rejected_before_submission() {
        let field = field();
        let stream = Stream::new();
        let input = Matrix::<f32>::zeros(5, 4, MatrixLayout::RowMajor);
        let mut out = Matrix::zeros(1, 4, MatrixLayout::ColumnMajor);
        let err = field
            .density(&stream, input.view(), &mut out.view_mut(), false)
            .unwrap_err();
        assert!(matches!(err, FieldError::Layout { op: "density", .. }));
        assert!(matches!(
            field.density_forward(&stream, input.view(), None, false, false),
            Err(FieldError::Layout { .. })
        ));
        assert_eq!(stream.submitted(), 0);
    }

    #[test]
    fn row_major_input_gradient_is_rejected() {
        let mut field = field();
        let stream = Stream::new();
        let input = Matrix::<f32>::zeros(5, 2, MatrixLayout::ColumnMajor);
        let mut out = Matrix::zeros(1, 2, MatrixLayout::ColumnMajor);
        let ctx = field
            .density_forward(&stream, input.view(), Some(&mut out.view_mut()), false, true)
            .unwrap();
        let dl = Matrix::<f32>::zeros(1, 2, MatrixLayout::ColumnMajor);
        let mut dx = Matrix::<f32>::zeros(5, 2, MatrixLayout::RowMajor);
        let submitted = stream.submitted();
        let err = field
            .density_backward(
                &stream,
                &ctx,
                input.view(),
                out.view(),
                dl.view(),
                Some(&mut dx.view_mut()),
                false,
                GradientMode::Overwrite,
            )
            .unwrap_err();
        assert!(matches!(err, FieldError::Layout { op: "density_backward", .. }));
        assert_eq!(stream.submitted(), submitted);
    }
}
