#![allow(dead_code)]

use briny_field::encoding::PADDING_VALUE;
use briny_field::layout::next_multiple;
use briny_field::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde_json::json;

/// Color head padded to 8: direction rows 0..8, uv rows 8..10, padding 10..16.
pub fn cutlass_config() -> NerfFieldConfig {
    NerfFieldConfig::from_json(&json!({
        "n_pos_dims": 3,
        "n_dir_dims": 3,
        "n_extra_dims": 1,
        "dir_offset": 3,
        "pos_encoding": { "otype": "Frequency", "n_frequencies": 2 },
        "dir_encoding": { "otype": "Identity" },
        "density_network": { "otype": "MLP", "n_neurons": 8, "activation": "Tanh" },
        "uv_network": { "otype": "MLP", "n_neurons": 8, "activation": "Tanh" },
        "rgb_network": { "otype": "CutlassMLP", "n_neurons": 8, "activation": "Tanh",
                         "output_activation": "Sigmoid" }
    }))
    .unwrap()
}

/// Every head padded to 16, so the uv head writes past its two live rows.
pub fn fused_config() -> NerfFieldConfig {
    NerfFieldConfig::from_json(&json!({
        "n_pos_dims": 3,
        "n_dir_dims": 3,
        "dir_offset": 3,
        "pos_encoding": { "otype": "Identity" },
        "dir_encoding": { "otype": "Identity" },
        "density_network": { "otype": "FullyFusedMLP", "n_neurons": 16, "activation": "Tanh" },
        "uv_network": { "otype": "FullyFusedMLP", "n_neurons": 16, "activation": "Tanh" },
        "rgb_network": { "otype": "FullyFusedMLP", "n_neurons": 16, "activation": "Tanh" }
    }))
    .unwrap()
}

/// Single linear layers everywhere, no padding in the color path.
pub fn linear_config(uv_network_scale: f32) -> NerfFieldConfig {
    NerfFieldConfig::from_json(&json!({
        "n_pos_dims": 3,
        "n_dir_dims": 2,
        "dir_offset": 3,
        "pos_encoding": { "otype": "Identity" },
        "dir_encoding": { "otype": "Identity" },
        "density_network": { "otype": "MLP", "n_hidden_layers": 0 },
        "uv_network": { "otype": "MLP", "n_hidden_layers": 0 },
        "rgb_network": { "otype": "MLP", "n_hidden_layers": 0 },
        "uv_network_scale": uv_network_scale
    }))
    .unwrap()
}

pub fn field(config: NerfFieldConfig, seed: u64) -> NerfField {
    let mut field = NerfField::new(config).unwrap();
    field.initialize(&mut StdRng::seed_from_u64(seed), 1.0);
    field
}

pub fn random_input(rows: usize, batch: usize, layout: MatrixLayout, seed: u64) -> Matrix<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Matrix::from_fn(rows, batch, layout, |_, _| rng.random_range(-1.0..1.0))
}

pub fn assert_close(a: f32, b: f32, tol: f32, what: &str) {
    assert!((a - b).abs() <= tol, "{what}: {a} vs {b}");
}

/// Trainable per-row scaling, `y_j = w_j * x_j`, for routing tests.
#[derive(Debug)]
pub struct ScaledEncoding {
    n_dims: usize,
    padded: usize,
}

impl ScaledEncoding {
    pub fn new(n_dims: usize, alignment: usize) -> Self {
        Self {
            n_dims,
            padded: next_multiple(n_dims, alignment),
        }
    }
}

#[derive(Debug)]
struct ScaledContext(usize);

impl Context for ScaledContext {
    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

impl Encoding for ScaledEncoding {
    fn name(&self) -> &'static str {
        "scaled"
    }

    fn input_width(&self) -> usize {
        self.n_dims
    }

    fn output_width(&self) -> usize {
        self.n_dims
    }

    fn padded_output_width(&self) -> usize {
        self.padded
    }

    fn n_params(&self) -> usize {
        self.n_dims
    }

    fn initialize_params(&self, _rng: &mut dyn RngCore, params: &mut [f32], scale: f32) {
        for (i, p) in params.iter_mut().enumerate() {
            *p = scale * (1.0 + i as f32);
        }
    }

    fn inference(
        &self,
        _stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()> {
        for c in 0..input.cols() {
            for r in 0..self.padded {
                let v = if r < self.n_dims {
                    params[r] * input.get(r, c)
                } else {
                    PADDING_VALUE
                };
                output.set(r, c, v);
            }
        }
        Ok(())
    }

    fn forward(
        &self,
        stream: &Stream,
        params: &[f32],
        input: MatrixView<'_, f32>,
        output: Option<&mut MatrixViewMut<'_, f32>>,
        _prepare_input_gradients: bool,
    ) -> Result<Box<dyn Context>> {
        if let Some(output) = output {
            self.inference(stream, params, input, output)?;
        }
        Ok(Box::new(ScaledContext(input.cols())))
    }

    fn backward(
        &self,
        _stream: &Stream,
        ctx: &dyn Context,
        params: &[f32],
        gradients: &mut [f32],
        input: MatrixView<'_, f32>,
        _output: MatrixView<'_, f32>,
        dl_doutput: MatrixView<'_, f32>,
        dl_dinput: Option<&mut MatrixViewMut<'_, f32>>,
        mode: GradientMode,
    ) -> Result<()> {
        let ctx: &ScaledContext = briny_field::network::downcast_context(ctx, "scaled")?;
        let computed: Vec<f32> = (0..self.n_dims)
            .map(|r| (0..ctx.0).map(|c| dl_doutput.get(r, c) * input.get(r, c)).sum())
            .collect();
        mode.apply(gradients, &computed);
        if let Some(d) = dl_dinput {
            for c in 0..ctx.0 {
                for r in 0..self.n_dims {
                    d.set(r, c, params[r] * dl_doutput.get(r, c));
                }
            }
        }
        Ok(())
    }

    fn hyperparams(&self) -> serde_json::Value {
        json!({ "otype": "Scaled", "n_dims_to_encode": self.n_dims })
    }
}

/// `linear_config` with a trainable position encoding.
pub fn trainable_field(seed: u64) -> NerfField {
    let config = linear_config(1.0);
    let mut modules = SubModules::from_config(&config).unwrap();
    let alignment = modules.pos_encoding.padded_output_width();
    modules.pos_encoding = Box::new(ScaledEncoding::new(config.n_pos_dims, alignment));
    let mut field = NerfField::from_modules(config, modules).unwrap();
    field.initialize(&mut StdRng::seed_from_u64(seed), 1.0);
    field
}

/// `linear_config` with a trainable direction encoding.
pub fn trainable_dir_field(seed: u64) -> NerfField {
    let config = linear_config(1.0);
    let mut modules = SubModules::from_config(&config).unwrap();
    let alignment = modules.dir_encoding.padded_output_width();
    modules.dir_encoding = Box::new(ScaledEncoding::new(
        config.n_dir_dims + config.n_extra_dims,
        alignment,
    ));
    let mut field = NerfField::from_modules(config, modules).unwrap();
    field.initialize(&mut StdRng::seed_from_u64(seed), 1.0);
    field
}
