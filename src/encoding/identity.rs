//! Affine pass-through encoding.

use super::{Encoding, PADDING_VALUE, StatelessContext, stateless_context};
use crate::error::Result;
use crate::layout::next_multiple;
use crate::matrix::{MatrixView, MatrixViewMut};
use crate::network::{Context, GradientMode, check_shape};
use crate::stream::Stream;
use serde_json::json;

/// Emits `scale * x + offset` for every input row.
#[derive(Debug, Clone)]
pub struct IdentityEncoding {
    n_dims: usize,
    scale: f32,
    offset: f32,
    padded_output_width: usize,
}

impl IdentityEncoding {
    /// Encodes `n_dims` rows, padding the output to a multiple of `alignment`.
    pub fn new(n_dims: usize, scale: f32, offset: f32, alignment: usize) -> Self {
        Self {
            n_dims,
            scale,
            offset,
            padded_output_width: next_multiple(n_dims, alignment),
        }
    }

    fn encode(&self, input: MatrixView<'_, f32>, output: &mut MatrixViewMut<'_, f32>) -> Result<()> {
        let batch = input.cols();
        check_shape("identity input", input.rows(), batch, self.n_dims, batch)?;
        check_shape(
            "identity output",
            output.rows(),
            output.cols(),
            self.padded_output_width,
            batch,
        )?;
        let (n, scale, offset) = (self.n_dims, self.scale, self.offset);
        output.par_for_each_mut(|r, c, v| {
            *v = if r < n {
                scale * input.get(r, c) + offset
            } else {
                PADDING_VALUE
            };
        });
        Ok(())
    }
}

impl Encoding for IdentityEncoding {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn input_width(&self) -> usize {
        self.n_dims
    }

    fn output_width(&self) -> usize {
        self.n_dims
    }

    fn padded_output_width(&self) -> usize {
        self.padded_output_width
    }

    fn inference(
        &self,
        stream: &Stream,
        _params: &[f32],
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()> {
        stream.record("identity");
        self.encode(input, output)
    }

    fn forward(
        &self,
        stream: &Stream,
        _params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        _prepare_input_gradients: bool,
    ) -> Result<Box<dyn Context>> {
        stream.record("identity");
        if let Some(output) = output {
            self.encode(input, output)?;
        }
        Ok(Box::new(StatelessContext::new(self.name(), input.cols())))
    }

    fn backward(
        &self,
        stream: &Stream,
        ctx: &dyn Context,
        _params: &[f32],
        _gradients: &mut [f32],
        _input: MatrixView<'_, f32>,
        _output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        _mode: GradientMode,
    ) -> Result<()> {
        let batch = stateless_context(ctx, self.name())?.batch();
        let Some(dl_dinput) = dl_dinput else {
            return Ok(());
        };
        check_shape(
            "identity output gradient",
            dl_doutput.rows(),
            dl_doutput.cols(),
            self.padded_output_width,
            batch,
        )?;
        check_shape(
            "identity input gradient",
            dl_dinput.rows(),
            dl_dinput.cols(),
            self.n_dims,
            batch,
        )?;
        stream.record("identity_backward");
        let scale = self.scale;
        dl_dinput.par_for_each_mut(|r, c, v| *v = scale * dl_doutput.get(r, c));
        Ok(())
    }

    fn hyperparams(&self) -> serde_json::Value {
        json!({
            "otype": "Identity",
            "scale": self.scale,
            "offset": self.offset,
            "n_dims_to_encode": self.n_dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Matrix, MatrixLayout};

    #[test]
    fn pads_with_ones() {
        let enc = IdentityEncoding::new(3, 2.0, 0.5, 8);
        assert_eq!(enc.padded_output_width(), 8);
        let stream = Stream::new();
        let input = Matrix::from_fn(3, 2, MatrixLayout::RowMajor, |r, c| (r + c) as f32);
        let mut out = Matrix::zeros(8, 2, MatrixLayout::ColumnMajor);
        enc.inference(&stream, &[], input.view(), &mut out.view_mut())
            .unwrap();
        assert_eq!(out.view().column(1), vec![2.5, 4.5, 6.5, 1.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn backward_scales_gradient() {
        let enc = IdentityEncoding::new(2, 3.0, 0.0, 1);
        let stream = Stream::new();
        let input = Matrix::<f32>::zeros(2, 4, MatrixLayout::ColumnMajor);
        let ctx = enc.forward(&stream, &[], input.view(), None, true).unwrap();
        let dl = Matrix::from_fn(2, 4, MatrixLayout::ColumnMajor, |r, c| (r * 4 + c) as f32);
        let mut dx = Matrix::zeros(2, 4, MatrixLayout::ColumnMajor);
        enc.backward(
            &stream,
            ctx.as_ref(),
            &[],
            &mut [],
            input.view(),
            input.view(),
            dl.view(),
            Some(&mut dx.view_mut()),
            GradientMode::Overwrite,
        )
        .unwrap();
        assert_eq!(dx.get(1, 3), 21.0);
    }
}
