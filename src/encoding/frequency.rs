//! Octave sinusoid encoding.
//!
//! Output row `j` encodes input dimension `j / (2 * n_frequencies)` at octave
//! `k = (j / 2) % n_frequencies` as `sin(2^k * pi * x + phase)`, where the
//! phase alternates between `0` and `pi / 2` so even rows hold the sine and
//! odd rows the cosine.

use super::{Encoding, PADDING_VALUE, StatelessContext, stateless_context};
use crate::error::Result;
use crate::layout::next_multiple;
use crate::matrix::{MatrixView, MatrixViewMut};
use crate::network::{Context, GradientMode, check_shape};
use crate::stream::Stream;
use core::f32::consts::{FRAC_PI_2, PI};
use serde_json::json;

/// Sine/cosine features at `n_frequencies` octaves per input dimension.
#[derive(Debug, Clone)]
pub struct FrequencyEncoding {
    n_dims: usize,
    n_frequencies: usize,
    padded_output_width: usize,
}

#[inline]
fn frequency(k: usize) -> f32 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let k = k as i32;
    2.0_f32.powi(k) * PI
}

impl FrequencyEncoding {
    /// Encodes `n_dims` rows, padding the output to a multiple of `alignment`.
    pub fn new(n_dims: usize, n_frequencies: usize, alignment: usize) -> Self {
        Self {
            n_dims,
            n_frequencies,
            padded_output_width: next_multiple(n_dims * n_frequencies * 2, alignment),
        }
    }

    /// Decomposes output row `j` into `(input dim, octave, phase)`.
    #[inline]
    fn feature(&self, j: usize) -> (usize, usize, f32) {
        let dim = j / (2 * self.n_frequencies);
        let k = (j / 2) % self.n_frequencies;
        let phase = if j % 2 == 1 { FRAC_PI_2 } else { 0.0 };
        (dim, k, phase)
    }

    fn encode(&self, input: MatrixView<'_, f32>, output: &mut MatrixViewMut<'_, f32>) -> Result<()> {
        let batch = input.cols();
        check_shape("frequency input", input.rows(), batch, self.n_dims, batch)?;
        check_shape(
            "frequency output",
            output.rows(),
            output.cols(),
            self.padded_output_width,
            batch,
        )?;
        let n_out = self.output_width();
        output.par_for_each_mut(|j, c, v| {
            *v = if j < n_out {
                let (dim, k, phase) = self.feature(j);
                (frequency(k) * input.get(dim, c) + phase).sin()
            } else {
                PADDING_VALUE
            };
        });
        Ok(())
    }
}

impl Encoding for FrequencyEncoding {
    fn name(&self) -> &'static str {
        "frequency"
    }

    fn input_width(&self) -> usize {
        self.n_dims
    }

    fn output_width(&self) -> usize {
        self.n_dims * self.n_frequencies * 2
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
        stream.record("frequency");
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
        stream.record("frequency");
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
        input: MatrixView<'_, f32>,
        _output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        _mode: GradientMode,
    ) -> Result<()> {
        let batch = stateless_context(ctx, self.name())?.batch();
        let Some(dl_dinput) = dl_dinput else {
            return Ok(());
        };
        check_shape("frequency input", input.rows(), input.cols(), self.n_dims, batch)?;
        check_shape(
            "frequency output gradient",
            dl_doutput.rows(),
            dl_doutput.cols(),
            self.padded_output_width,
            batch,
        )?;
        check_shape(
            "frequency input gradient",
            dl_dinput.rows(),
            dl_dinput.cols(),
            self.n_dims,
            batch,
        )?;
        stream.record("frequency_backward");
        let block = 2 * self.n_frequencies;
        dl_dinput.par_for_each_mut(|dim, c, v| {
            let x = input.get(dim, c);
            *v = (dim * block..(dim + 1) * block)
                .map(|j| {
                    let (_, k, phase) = self.feature(j);
                    let f = frequency(k);
                    dl_doutput.get(j, c) * f * (f * x + phase).cos()
                })
                .sum();
        });
        Ok(())
    }

    fn hyperparams(&self) -> serde_json::Value {
        json!({
            "otype": "Frequency",
            "n_frequencies": self.n_frequencies,
            "n_dims_to_encode": self.n_dims,
        })
    }
}
