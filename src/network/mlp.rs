//! Fully connected head without biases.
//!
//! Weights are stored layer after layer, each as a row-major
//! `(fan_out x fan_in)` block. The output layer always produces the padded
//! output width, so alignment rows carry real (trainable) values exactly like
//! the meaningful ones.

use super::activation::Activation;
use super::{Context, GradientMode, Network, check_shape, downcast_context};
use crate::config::{NetworkConfig, NetworkType};
use crate::error::{FieldError, Result};
use crate::layout::next_multiple;
use crate::matrix::{Matrix, MatrixLayout, MatrixView, MatrixViewMut};
use crate::stream::Stream;
use core::any::Any;
use core::ops::Range;
use rand::{Rng, RngCore};
use rayon::prelude::*;

/// Columns per parameter-gradient reduction chunk.
const GRADIENT_CHUNK: usize = 64;

/// A bias-free multilayer perceptron.
#[derive(Debug, Clone)]
pub struct Mlp {
    otype: NetworkType,
    input_width: usize,
    output_width: usize,
    padded_output_width: usize,
    n_neurons: usize,
    n_hidden_layers: usize,
    activation: Activation,
    output_activation: Activation,
    /// `(fan_out, fan_in)` per weight matrix.
    layers: Vec<(usize, usize)>,
    offsets: Vec<usize>,
    n_params: usize,
}

/// Hidden activations of one forward pass.
#[derive(Debug)]
pub struct MlpContext {
    batch: usize,
    hidden: Vec<Matrix<f32>>,
}

impl Context for MlpContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Mlp {
    /// Builds a network from a config whose input and output widths have been
    /// filled in.
    ///
    /// # Errors
    /// [`FieldError::Config`] if either width is missing or zero.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let input_width = config
            .n_input_dims
            .filter(|&n| n > 0)
            .ok_or_else(|| FieldError::config("network needs n_input_dims"))?;
        let output_width = config
            .n_output_dims
            .filter(|&n| n > 0)
            .ok_or_else(|| FieldError::config("network needs n_output_dims"))?;
        let padded_output_width = next_multiple(output_width, config.otype.alignment());

        let mut layers = Vec::with_capacity(config.n_hidden_layers + 1);
        let mut fan_in = input_width;
        for _ in 0..config.n_hidden_layers {
            layers.push((config.n_neurons, fan_in));
            fan_in = config.n_neurons;
        }
        layers.push((padded_output_width, fan_in));

        let mut offsets = Vec::with_capacity(layers.len());
        let mut n_params = 0;
        for &(out, inp) in &layers {
            offsets.push(n_params);
            n_params += out * inp;
        }

        Ok(Self {
            otype: config.otype,
            input_width,
            output_width,
            padded_output_width,
            n_neurons: config.n_neurons,
            n_hidden_layers: config.n_hidden_layers,
            activation: config.activation,
            output_activation: config.output_activation,
            layers,
            offsets,
            n_params,
        })
    }

    fn weights(&self, layer: usize) -> Range<usize> {
        let (out, inp) = self.layers[layer];
        self.offsets[layer]..self.offsets[layer] + out * inp
    }

    fn activation_of(&self, layer: usize) -> Activation {
        if layer + 1 == self.layers.len() {
            self.output_activation
        } else {
            self.activation
        }
    }

    /// Runs one sample, returning every hidden activation and the output.
    fn forward_sample(&self, params: &[f32], x: &[f32]) -> (Vec<Vec<f32>>, Vec<f32>) {
        let mut hidden = Vec::with_capacity(self.n_hidden_layers);
        let mut current = x.to_vec();
        for layer in 0..self.layers.len() {
            let (out, inp) = self.layers[layer];
            let w = &params[self.weights(layer)];
            let mut next: Vec<f32> = (0..out)
                .map(|o| {
                    w[o * inp..(o + 1) * inp]
                        .iter()
                        .zip(&current)
                        .map(|(a, b)| a * b)
                        .sum()
                })
                .collect();
            self.activation_of(layer).apply_slice(&mut next);
            if layer + 1 < self.layers.len() {
                hidden.push(next.clone());
            }
            current = next;
        }
        (hidden, current)
    }

    /// Backpropagates one sample, accumulating weight gradients into `grad`
    /// when given and returning the input gradient.
    fn backward_sample(
        &self,
        params: &[f32],
        x: &[f32],
        hidden: &[&[f32]],
        y: &[f32],
        dl_dy: &[f32],
        mut grad: Option<&mut [f32]>,
    ) -> Vec<f32> {
        let last = self.layers.len() - 1;
        let mut delta: Vec<f32> = dl_dy
            .iter()
            .zip(y)
            .map(|(g, &v)| g * self.output_activation.derivative_from_output(v))
            .collect();

        for layer in (0..=last).rev() {
            let (out, inp) = self.layers[layer];
            let w = &params[self.weights(layer)];
            let layer_input = if layer == 0 { x } else { hidden[layer - 1] };

            if let Some(grad) = grad.as_deref_mut() {
                let gw = &mut grad[self.weights(layer)];
                for o in 0..out {
                    let d = delta[o];
                    if d != 0.0 {
                        let row = &mut gw[o * inp..(o + 1) * inp];
                        for (g, &a) in row.iter_mut().zip(layer_input) {
                            *g += d * a;
                        }
                    }
                }
            }

            let mut prev = vec![0.0; inp];
            for o in 0..out {
                let d = delta[o];
                if d != 0.0 {
                    for (p, &wv) in prev.iter_mut().zip(&w[o * inp..(o + 1) * inp]) {
                        *p += wv * d;
                    }
                }
            }
            if layer > 0 {
                for (p, &a) in prev.iter_mut().zip(layer_input) {
                    *p *= self.activation.derivative_from_output(a);
                }
            }
            delta = prev;
        }
        delta
    }

    fn check_params(&self, params: &[f32]) -> Result<()> {
        if params.len() == self.n_params {
            Ok(())
        } else {
            Err(FieldError::Parameters {
                expected: self.n_params,
                found: params.len(),
            })
        }
    }

    /// A context captured by a differently shaped network is rejected before
    /// its hidden buffers are sliced.
    fn check_context(&self, ctx: &MlpContext) -> Result<()> {
        let matches = ctx.hidden.len() == self.n_hidden_layers
            && ctx.hidden.iter().all(|h| {
                h.rows() == self.n_neurons
                    && h.cols() == ctx.batch
                    && h.layout() == MatrixLayout::ColumnMajor
            });
        if matches {
            Ok(())
        } else {
            Err(FieldError::Context("mlp"))
        }
    }

    fn run(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        keep_hidden: bool,
    ) -> Result<MlpContext> {
        self.check_params(params)?;
        let batch = input.cols();
        check_shape("mlp input", input.rows(), batch, self.input_width, batch)?;
        if let Some(out) = output.as_deref() {
            check_shape(
                "mlp output",
                out.rows(),
                out.cols(),
                self.padded_output_width,
                batch,
            )?;
        }
        stream.record("mlp");

        let samples = input.par_map_columns(|_, x| self.forward_sample(params, x));

        let mut hidden = Vec::new();
        if keep_hidden {
            hidden = (0..self.n_hidden_layers)
                .map(|l| {
                    let mut m = Matrix::zeros(self.n_neurons, batch, MatrixLayout::ColumnMajor);
                    m.view_mut()
                        .write_columns(&samples.iter().map(|(h, _)| &h[l]).collect::<Vec<_>>());
                    m
                })
                .collect();
        }
        if let Some(out) = output {
            out.write_columns(&samples.iter().map(|(_, y)| y).collect::<Vec<_>>());
        }
        Ok(MlpContext { batch, hidden })
    }
}

impl Network for Mlp {
    fn input_width(&self) -> usize {
        self.input_width
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn padded_output_width(&self) -> usize {
        self.padded_output_width
    }

    fn n_params(&self) -> usize {
        self.n_params
    }

    fn initialize_params(&self, rng: &mut dyn RngCore, params: &mut [f32], scale: f32) {
        for (layer, &(out, inp)) in self.layers.iter().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let bound = scale * (6.0 / (out + inp) as f32).sqrt();
            for w in &mut params[self.weights(layer)] {
                *w = (rng.random::<f32>() * 2.0 - 1.0) * bound;
            }
        }
    }

    fn inference(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()> {
        self.run(stream, params, input, Some(output), false).map(|_| ())
    }

    fn forward(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        _prepare_input_gradients: bool,
    ) -> Result<Box<dyn Context>> {
        Ok(Box::new(self.run(stream, params, input, output, true)?))
    }

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
    ) -> Result<()> {
        let ctx: &MlpContext = downcast_context(ctx, "mlp")?;
        self.check_params(params)?;
        self.check_params(gradients)?;
        let batch = ctx.batch;
        self.check_context(ctx)?;
        check_shape("mlp input", input.rows(), input.cols(), self.input_width, batch)?;
        for (what, view) in [("mlp output", output), ("mlp output gradient", dl_doutput)] {
            check_shape(what, view.rows(), view.cols(), self.padded_output_width, batch)?;
        }
        if let Some(d) = dl_dinput.as_deref() {
            check_shape("mlp input gradient", d.rows(), d.cols(), self.input_width, batch)?;
        }
        let want_params = mode != GradientMode::Ignore;
        if !want_params && dl_dinput.is_none() {
            return Ok(());
        }
        stream.record("mlp_backward");

        let n_chunks = batch.div_ceil(GRADIENT_CHUNK);
        let n = self.n_neurons;
        let chunks: Vec<(Vec<f32>, Vec<Vec<f32>>)> = (0..n_chunks)
            .into_par_iter()
            .map(|chunk| {
                let mut grad = if want_params {
                    vec![0.0; self.n_params]
                } else {
                    Vec::new()
                };
                let cols = chunk * GRADIENT_CHUNK..((chunk + 1) * GRADIENT_CHUNK).min(batch);
                let dx = cols
                    .map(|c| {
                        let x = input.column(c);
                        let hidden: Vec<&[f32]> = ctx
                            .hidden
                            .iter()
                            .map(|h| &h.data()[c * n..(c + 1) * n])
                            .collect();
                        self.backward_sample(
                            params,
                            &x,
                            &hidden,
                            &output.column(c),
                            &dl_doutput.column(c),
                            want_params.then_some(grad.as_mut_slice()),
                        )
                    })
                    .collect();
                (grad, dx)
            })
            .collect();

        if want_params {
            let mut total = vec![0.0; self.n_params];
            for (grad, _) in &chunks {
                for (t, g) in total.iter_mut().zip(grad) {
                    *t += *g;
                }
            }
            mode.apply(gradients, &total);
        }
        if let Some(d) = dl_dinput {
            let columns: Vec<&Vec<f32>> = chunks.iter().flat_map(|(_, dx)| dx).collect();
            d.write_columns(&columns);
        }
        Ok(())
    }

    fn layer_sizes(&self) -> Vec<(usize, usize)> {
        self.layers.clone()
    }

    fn width(&self, _layer: usize) -> usize {
        self.n_neurons
    }

    fn num_forward_activations(&self) -> usize {
        self.n_hidden_layers
    }

    fn forward_activations<'a>(&self, ctx: &'a dyn Context, layer: usize) -> Result<MatrixView<'a, f32>> {
        let ctx: &MlpContext = downcast_context(ctx, "mlp")?;
        ctx.hidden
            .get(layer)
            .map(Matrix::view)
            .ok_or(FieldError::Layer {
                index: layer,
                count: ctx.hidden.len(),
            })
    }

    fn hyperparams(&self) -> serde_json::Value {
        let config = NetworkConfig {
            otype: self.otype,
            n_neurons: self.n_neurons,
            n_hidden_layers: self.n_hidden_layers,
            activation: self.activation,
            output_activation: self.output_activation,
            n_input_dims: Some(self.input_width),
            n_output_dims: Some(self.output_width),
        };
        serde_json::to_value(config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn mlp(hidden: usize, out: usize, otype: NetworkType) -> Mlp {
        let mut cfg = NetworkConfig::new(otype);
        cfg.n_neurons = 4;
        cfg.n_hidden_layers = hidden;
        cfg.activation = Activation::Tanh;
        cfg.n_input_dims = Some(3);
        cfg.n_output_dims = Some(out);
        Mlp::new(&cfg).unwrap()
    }

    #[test]
    fn parameter_count_includes_padding() {
        let net = mlp(2, 3, NetworkType::Cutlass);
        assert_eq!(net.padded_output_width(), 8);
        assert_eq!(net.layer_sizes(), vec![(4, 3), (4, 4), (8, 4)]);
        assert_eq!(net.n_params(), 12 + 16 + 32);
    }

    #[test]
    fn single_layer_is_a_matrix_product() {
        let net = mlp(0, 2, NetworkType::Plain);
        let params = [1.0, 2.0, 3.0, -1.0, 0.5, 0.0];
        let stream = Stream::with_backend(crate::backend::Backend::Cpu);
        let input = Matrix::from_fn(3, 2, MatrixLayout::ColumnMajor, |r, c| (r + c) as f32);
        let mut out = Matrix::zeros(2, 2, MatrixLayout::RowMajor);
        net.inference(&stream, &params, input.view(), &mut out.view_mut())
            .unwrap();
        // column 0 = [0, 1, 2], column 1 = [1, 2, 3]
        assert_eq!(out.get(0, 0), 8.0);
        assert_eq!(out.get(1, 0), 0.5);
        assert_eq!(out.get(0, 1), 14.0);
        assert_eq!(out.get(1, 1), 0.0);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let net = mlp(1, 2, NetworkType::Plain);
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.0; net.n_params()];
        net.initialize_params(&mut rng, &mut params, 1.0);
        let stream = Stream::with_backend(crate::backend::Backend::Cpu);
        let input = Matrix::from_fn(3, 5, MatrixLayout::ColumnMajor, |r, c| {
            0.3 * r as f32 - 0.2 * c as f32 + 0.1
        });
        let loss = |p: &[f32]| {
            let mut out = Matrix::zeros(2, 5, MatrixLayout::ColumnMajor);
            net.inference(&stream, p, input.view(), &mut out.view_mut())
                .unwrap();
            out.data().iter().sum::<f32>()
        };

        let mut out = Matrix::zeros(2, 5, MatrixLayout::ColumnMajor);
        let ctx = net
            .forward(&stream, &params, input.view(), Some(&mut out.view_mut()), true)
            .unwrap();
        let ones = Matrix::from_fn(2, 5, MatrixLayout::ColumnMajor, |_, _| 1.0);
        let mut grads = vec![0.0; net.n_params()];
        let mut dx = Matrix::zeros(3, 5, MatrixLayout::ColumnMajor);
        net.backward(
            &stream,
            ctx.as_ref(),
            &params,
            &mut grads,
            input.view(),
            out.view(),
            ones.view(),
            Some(&mut dx.view_mut()),
            GradientMode::Overwrite,
        )
        .unwrap();

        let h = 1e-2;
        for i in 0..params.len() {
            let mut plus = params.clone();
            plus[i] += h;
            let mut minus = params.clone();
            minus[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
            assert!(
                (numeric - grads[i]).abs() < 1e-2,
                "param {i}: {numeric} vs {}",
                grads[i]
            );
        }
        assert_eq!(net.forward_activations(ctx.as_ref(), 0).unwrap().rows(), 4);
        assert!(net.forward_activations(ctx.as_ref(), 1).is_err());
    }

    #[test]
    fn accumulate_adds_to_existing_gradients() {
        let net = mlp(0, 1, NetworkType::Plain);
        let params = [1.0, 1.0, 1.0];
        let stream = Stream::with_backend(crate::backend::Backend::Cpu);
        let input = Matrix::from_fn(3, 1, MatrixLayout::ColumnMajor, |r, _| r as f32);
        let mut out = Matrix::zeros(1, 1, MatrixLayout::ColumnMajor);
        let ctx = net
            .forward(&stream, &params, input.view(), Some(&mut out.view_mut()), false)
            .unwrap();
        let dl = Matrix::from_fn(1, 1, MatrixLayout::ColumnMajor, |_, _| 1.0);
        let mut grads = vec![10.0; 3];
        net.backward(
            &stream,
            ctx.as_ref(),
            &params,
            &mut grads,
            input.view(),
            out.view(),
            dl.view(),
            None,
            GradientMode::Accumulate,
        )
        .unwrap();
        assert_eq!(grads, vec![10.0, 11.0, 12.0]);
    }
}
