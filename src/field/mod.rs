//! The composite neural field.
//!
//! [`NerfField`] wires five sub-modules over one shared parameter arena:
//!
//! ```text
//! input[0 .. n_pos]         -> pos encoding -> density input --+--> density head -> output[3]
//!                                                            |
//!                                                            +--> uv head ----+
//!                                                                             v
//! input[dir_offset .. ]     -> dir encoding -----------------------> [ dir | uv | 0 ] -> color head -> output[0..3]
//! ```
//!
//! The packed color-head input is laid out by
//! [`BufferLayout`](crate::layout::BufferLayout). Every evaluation path runs
//! on a caller-supplied [`Stream`](crate::stream::Stream) and allocates its
//! batch buffers from it.
//!
//! ## Example
//!
//! ```rust
//! use briny_field::prelude::*;
//! use rand::SeedableRng;
//!
//! let config = NerfFieldConfig::from_json_str(r#"{
//!     "n_pos_dims": 3, "n_dir_dims": 3, "dir_offset": 3,
//!     "pos_encoding": { "otype": "Frequency", "n_frequencies": 2 },
//!     "dir_encoding": { "otype": "Identity" },
//!     "density_network": { "otype": "CutlassMLP", "n_neurons": 16 },
//!     "uv_network": { "otype": "CutlassMLP", "n_neurons": 16 },
//!     "rgb_network": { "otype": "CutlassMLP", "n_neurons": 16, "output_activation": "Sigmoid" }
//! }"#).unwrap();
//! let mut field = NerfField::new(config).unwrap();
//! field.initialize(&mut rand::rngs::StdRng::seed_from_u64(0), 1.0);
//!
//! let stream = Stream::new();
//! let input = Matrix::from_fn(6, 8, MatrixLayout::ColumnMajor, |r, c| (r + c) as f32 * 0.1);
//! let mut output = stream.matrix(field.padded_output_width(), 8, MatrixLayout::ColumnMajor);
//! field.inference(&stream, input.view(), &mut output.view_mut(), true).unwrap();
//! stream.synchronize();
//! assert!(output.get(0, 0) > 0.0 && output.get(0, 0) < 1.0);
//! ```

mod backward;
mod density;
mod forward;
mod texture;

pub use density::DensityForwardContext;
pub use forward::NerfForwardContext;

use crate::config::NerfFieldConfig;
use crate::encoding::{Encoding, create_encoding};
use crate::error::{FieldError, Result};
use crate::layout::{
    BufferLayout, OUTPUT_WIDTH, RGB_CHANNELS, UV_CHANNELS, minimum_alignment, pos_encoding_alignment,
};
use crate::matrix::{Matrix, MatrixLayout, MatrixView};
use crate::network::{Network, create_network};
use crate::ops::dispatch;
use crate::params::{InferencePrecision, ModuleId, ParameterBlock, ParameterLayout};
use crate::stream::Stream;
use rand::RngCore;
use serde_json::json;
use std::sync::OnceLock;

/// The five sub-modules of a field, for callers bringing their own variants.
#[derive(Debug)]
pub struct SubModules {
    /// Encodes the leading `n_pos_dims` input rows.
    pub pos_encoding: Box<dyn Encoding>,
    /// Encodes the direction and extra rows.
    pub dir_encoding: Box<dyn Encoding>,
    /// Density head, fed by the position encoding.
    pub density_network: Box<dyn Network>,
    /// Uv latent head, fed by the position encoding.
    pub uv_network: Box<dyn Network>,
    /// Color head, fed by the packed buffer.
    pub rgb_network: Box<dyn Network>,
}

impl SubModules {
    /// Builds the reference variants named by `config`, filling in every
    /// width the composite decides.
    ///
    /// # Errors
    /// [`FieldError::Config`] if `config` is rejected.
    pub fn from_config(config: &NerfFieldConfig) -> Result<Self> {
        config.validate()?;
        let pos_encoding = create_encoding(
            &config.pos_encoding,
            config.n_pos_dims,
            pos_encoding_alignment(&config.density_network),
        );
        let rgb_alignment = minimum_alignment(&config.rgb_network);
        let dir_encoding = create_encoding(
            &config.dir_encoding,
            config.n_dir_dims + config.n_extra_dims,
            rgb_alignment,
        );

        let mut density = config.density_network.clone();
        density.n_input_dims = Some(pos_encoding.padded_output_width());
        density.n_output_dims.get_or_insert(1);
        let density_network = create_network(&density)?;

        let mut uv = config.uv_network.clone();
        uv.n_input_dims = Some(pos_encoding.padded_output_width());
        uv.n_output_dims.get_or_insert(UV_CHANNELS);
        let uv_network = create_network(&uv)?;

        let planned = BufferLayout::plan(
            pos_encoding.padded_output_width(),
            density_network.padded_output_width(),
            dir_encoding.padded_output_width(),
            uv_network.padded_output_width(),
            rgb_alignment,
        );
        let mut rgb = config.rgb_network.clone();
        rgb.n_input_dims = Some(planned.rgb_input_width);
        rgb.n_output_dims = Some(RGB_CHANNELS);
        let rgb_network = create_network(&rgb)?;

        Ok(Self {
            pos_encoding,
            dir_encoding,
            density_network,
            uv_network,
            rgb_network,
        })
    }
}

/// A multi-head neural field: position, direction and extra conditioning in,
/// color and density out.
#[derive(Debug)]
pub struct NerfField {
    config: NerfFieldConfig,
    pos_encoding: Box<dyn Encoding>,
    dir_encoding: Box<dyn Encoding>,
    density_network: Box<dyn Network>,
    uv_network: Box<dyn Network>,
    rgb_network: Box<dyn Network>,
    buffers: BufferLayout,
    parameter_layout: ParameterLayout,
    block: ParameterBlock,
    uv_network_scale: f32,
    uv_grid: OnceLock<Matrix<f32>>,
}

impl NerfField {
    /// Builds a field from its configuration.
    ///
    /// # Errors
    /// [`FieldError::Config`] if the configuration is rejected.
    pub fn new(config: NerfFieldConfig) -> Result<Self> {
        let modules = SubModules::from_config(&config)?;
        Self::from_modules(config, modules)
    }

    /// Builds a field from a JSON configuration such as the one returned by
    /// [`hyperparams`](Self::hyperparams).
    ///
    /// # Errors
    /// [`FieldError::Json`] if the value is not a field configuration and
    /// [`FieldError::Config`] if it is rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Self::new(NerfFieldConfig::from_json(value)?)
    }

    /// Builds a field around caller-supplied sub-modules. Their widths must
    /// chain the way [`SubModules::from_config`] would have chained them.
    ///
    /// # Errors
    /// [`FieldError::Config`] naming the first width that does not chain.
    pub fn from_modules(config: NerfFieldConfig, modules: SubModules) -> Result<Self> {
        let SubModules {
            pos_encoding,
            dir_encoding,
            density_network,
            uv_network,
            rgb_network,
        } = modules;

        let density_input_width = pos_encoding.padded_output_width();
        let buffers = BufferLayout {
            density_input_width,
            density_output_width: density_network.padded_output_width(),
            dir_padded_width: dir_encoding.padded_output_width(),
            uv_padded_width: uv_network.padded_output_width(),
            rgb_input_width: rgb_network.input_width(),
            rgb_output_width: rgb_network.padded_output_width(),
        };

        let chained = [
            ("pos_encoding input", pos_encoding.input_width(), config.n_pos_dims),
            (
                "dir_encoding input",
                dir_encoding.input_width(),
                config.n_dir_dims + config.n_extra_dims,
            ),
            ("density_network input", density_network.input_width(), density_input_width),
            ("uv_network input", uv_network.input_width(), density_input_width),
        ];
        for (what, found, expected) in chained {
            if found != expected {
                return Err(FieldError::config(format!(
                    "{what} is {found} rows, expected {expected}"
                )));
            }
        }
        if config.n_pos_dims > config.input_width() {
            return Err(FieldError::config("position rows exceed the input"));
        }
        if buffers.uv_padded_width < UV_CHANNELS {
            return Err(FieldError::config("uv_network must produce two channels"));
        }
        if buffers.rgb_input_width < buffers.dir_padded_width + buffers.uv_padded_width {
            return Err(FieldError::config(format!(
                "rgb_network input is {} rows, packed buffer needs {}",
                buffers.rgb_input_width,
                buffers.dir_padded_width + buffers.uv_padded_width
            )));
        }
        if buffers.rgb_output_width < RGB_CHANNELS {
            return Err(FieldError::config("rgb_network must produce three channels"));
        }

        let counts = [
            density_network.n_params(),
            uv_network.n_params(),
            rgb_network.n_params(),
            pos_encoding.n_params(),
            dir_encoding.n_params(),
        ];
        let parameter_layout = ParameterLayout::new(counts);
        parameter_layout.validate(counts)?;

        log::debug!(
            "nerf field: density input {}, density output {}, packed color input {} \
             (dir {}, uv {}, padding {:?}), color output {}",
            buffers.density_input_width,
            buffers.density_output_width,
            buffers.rgb_input_width,
            buffers.dir_padded_width,
            buffers.uv_padded_width,
            buffers.padding_rows(),
            buffers.rgb_output_width,
        );
        for (id, range) in parameter_layout.iter() {
            log::debug!("nerf field: {} params {:?}", id.name(), range);
        }

        let block = ParameterBlock::zeros(parameter_layout.total());
        Ok(Self {
            uv_network_scale: config.uv_network_scale,
            config,
            pos_encoding,
            dir_encoding,
            density_network,
            uv_network,
            rgb_network,
            buffers,
            parameter_layout,
            block,
            uv_grid: OnceLock::new(),
        })
    }

    fn counts(&self) -> [usize; 5] {
        [
            self.density_network.n_params(),
            self.uv_network.n_params(),
            self.rgb_network.n_params(),
            self.pos_encoding.n_params(),
            self.dir_encoding.n_params(),
        ]
    }

    /// Values of `id` from the training or the inference copy.
    fn values(&self, id: ModuleId, use_inference_params: bool) -> &[f32] {
        self.block
            .values(self.parameter_layout.range(id), use_inference_params)
    }

    /// Zeroes the rows of a packed color-input (or its gradient) that carry
    /// no data.
    fn fill_unused(&self, stream: &Stream, packed: &mut Matrix<f32>) {
        let padding = self.buffers.padding_rows();
        if !padding.is_empty() {
            dispatch::fill_rows(
                stream,
                &mut packed.slice_rows_mut(padding.start, padding.len()),
                0.0,
            );
        }
    }

    fn check_batch(what: &str, found: usize, batch: usize) -> Result<()> {
        if found == batch {
            Ok(())
        } else {
            Err(FieldError::shape(format!(
                "{what}: batch of {found}, expected {batch}"
            )))
        }
    }

    fn check_rows(what: &str, found: usize, at_least: usize) -> Result<()> {
        if found >= at_least {
            Ok(())
        } else {
            Err(FieldError::shape(format!(
                "{what}: {found} rows, need at least {at_least}"
            )))
        }
    }

    // ---- parameter management ----

    /// Replaces the parameter arena.
    ///
    /// # Errors
    /// [`FieldError::Parameters`] if any of the three buffers has the wrong length.
    pub fn set_params(&mut self, block: ParameterBlock) -> Result<()> {
        block.check_len(self.n_params())?;
        self.parameter_layout.validate(self.counts())?;
        self.block = block;
        Ok(())
    }

    /// Initializes a full-precision buffer module by module, in the same order
    /// and with the same offsets as the parameter arena.
    ///
    /// # Errors
    /// [`FieldError::Parameters`] if `params_full_precision` has the wrong length.
    pub fn initialize_params(
        &self,
        rng: &mut dyn RngCore,
        params_full_precision: &mut [f32],
        scale: f32,
    ) -> Result<()> {
        if params_full_precision.len() != self.n_params() {
            return Err(FieldError::Parameters {
                expected: self.n_params(),
                found: params_full_precision.len(),
            });
        }
        self.fill_initial_params(rng, params_full_precision, scale);
        Ok(())
    }

    /// `params` must span the whole arena.
    fn fill_initial_params(&self, rng: &mut dyn RngCore, params: &mut [f32], scale: f32) {
        for (id, range) in self.parameter_layout.iter() {
            let params = &mut params[range];
            match id {
                ModuleId::DensityNetwork => self.density_network.initialize_params(rng, params, scale),
                ModuleId::UvNetwork => self.uv_network.initialize_params(rng, params, scale),
                ModuleId::RgbNetwork => self.rgb_network.initialize_params(rng, params, scale),
                ModuleId::PosEncoding => self.pos_encoding.initialize_params(rng, params, scale),
                ModuleId::DirEncoding => self.dir_encoding.initialize_params(rng, params, scale),
            }
        }
    }

    /// Initializes the owned arena, refreshes its inference copy and clears
    /// its gradients.
    pub fn initialize(&mut self, rng: &mut dyn RngCore, scale: f32) {
        let mut params = vec![0.0; self.n_params()];
        self.fill_initial_params(rng, &mut params, scale);
        self.block = ParameterBlock::from_params(params, self.config.inference_precision);
    }

    /// Refreshes the inference copy after the training values changed.
    pub fn sync_inference_params(&mut self) {
        self.block.sync_inference_params(self.config.inference_precision);
    }

    /// The parameter arena.
    pub fn parameters(&self) -> &ParameterBlock {
        &self.block
    }

    /// Mutable access to the parameter arena, e.g. for an optimizer step.
    pub fn parameters_mut(&mut self) -> &mut ParameterBlock {
        &mut self.block
    }

    /// The range table of the arena.
    pub fn parameter_layout(&self) -> &ParameterLayout {
        &self.parameter_layout
    }

    /// Training values of one sub-module.
    pub fn module_params(&self, id: ModuleId) -> &[f32] {
        self.values(id, false)
    }

    /// Mutable training values of one sub-module.
    pub fn module_params_mut(&mut self, id: ModuleId) -> &mut [f32] {
        &mut self.block.params[self.parameter_layout.range(id)]
    }

    /// Gradients of one sub-module.
    pub fn module_gradients(&self, id: ModuleId) -> &[f32] {
        &self.block.gradients[self.parameter_layout.range(id)]
    }

    /// Precision of the inference copy.
    pub fn inference_precision(&self) -> InferencePrecision {
        self.config.inference_precision
    }

    // ---- introspection ----

    /// The configuration the field was built from.
    pub fn config(&self) -> &NerfFieldConfig {
        &self.config
    }

    /// Widths of every per-call buffer.
    pub fn buffer_layout(&self) -> &BufferLayout {
        &self.buffers
    }

    /// Total trainable values over all five sub-modules.
    pub fn n_params(&self) -> usize {
        self.counts().iter().sum()
    }

    /// Rows of the output buffer: the color head's padded width, at least four.
    pub fn padded_output_width(&self) -> usize {
        self.buffers.padded_output_width()
    }

    /// Rows of the external input.
    pub fn input_width(&self) -> usize {
        self.config.input_width()
    }

    /// Meaningful output rows: three colors and the density.
    pub fn output_width(&self) -> usize {
        OUTPUT_WIDTH
    }

    /// Extra conditioning rows after the direction.
    pub fn n_extra_dims(&self) -> usize {
        self.config.n_extra_dims
    }

    /// The field has no input alignment requirement of its own.
    pub fn required_input_alignment(&self) -> usize {
        1
    }

    /// Padded rows of the density head output.
    pub fn padded_density_output_width(&self) -> usize {
        self.buffers.density_output_width
    }

    /// Weight matrix shapes of the density, uv and color heads, in that order.
    pub fn layer_sizes(&self) -> Vec<(usize, usize)> {
        let mut layers = self.density_network.layer_sizes();
        layers.extend(self.uv_network.layer_sizes());
        layers.extend(self.rgb_network.layer_sizes());
        layers
    }

    /// Number of addressable activation buffers.
    pub fn num_forward_activations(&self) -> usize {
        self.density_network.num_forward_activations()
            + self.uv_network.num_forward_activations()
            + self.rgb_network.num_forward_activations()
            + 2
    }

    /// Resolves a flat activation index to the buffer it names.
    fn locate(&self, layer: usize) -> Result<Activations> {
        let d = self.density_network.num_forward_activations();
        let u = self.uv_network.num_forward_activations();
        let count = self.num_forward_activations();
        if layer >= count {
            return Err(FieldError::Layer { index: layer, count });
        }
        Ok(match layer {
            0 => Activations::DensityInput,
            l if l < d + 1 => Activations::Density(l - 1),
            l if l < d + u + 1 => Activations::Uv(l - d - 1),
            l if l == d + u + 1 => Activations::PackedInput,
            l => Activations::Rgb(l - d - u - 2),
        })
    }

    /// Rows of flat activation `layer`.
    ///
    /// # Errors
    /// [`FieldError::Layer`] past the last activation.
    pub fn width(&self, layer: usize) -> Result<usize> {
        Ok(match self.locate(layer)? {
            Activations::DensityInput => self.buffers.density_input_width,
            Activations::Density(l) => self.density_network.width(l),
            Activations::Uv(l) => self.uv_network.width(l),
            Activations::PackedInput => self.buffers.rgb_input_width,
            Activations::Rgb(l) => self.rgb_network.width(l),
        })
    }

    /// Flat activation `layer` captured in a forward context.
    ///
    /// # Errors
    /// [`FieldError::Layer`] past the last activation.
    pub fn forward_activations<'a>(
        &self,
        ctx: &'a NerfForwardContext,
        layer: usize,
    ) -> Result<MatrixView<'a, f32>> {
        match self.locate(layer)? {
            Activations::DensityInput => Ok(ctx.density_network_input()),
            Activations::Density(l) => self
                .density_network
                .forward_activations(ctx.density_network_ctx.as_ref(), l),
            Activations::Uv(l) => self
                .uv_network
                .forward_activations(ctx.uv_network_ctx.as_ref(), l),
            Activations::PackedInput => Ok(ctx.rgb_network_input()),
            Activations::Rgb(l) => self
                .rgb_network
                .forward_activations(ctx.rgb_network_ctx.as_ref(), l),
        }
    }

    /// Position encoding.
    pub fn pos_encoding(&self) -> &dyn Encoding {
        self.pos_encoding.as_ref()
    }

    /// Direction encoding.
    pub fn dir_encoding(&self) -> &dyn Encoding {
        self.dir_encoding.as_ref()
    }

    /// Density head.
    pub fn density_network(&self) -> &dyn Network {
        self.density_network.as_ref()
    }

    /// Uv latent head.
    pub fn uv_network(&self) -> &dyn Network {
        self.uv_network.as_ref()
    }

    /// Color head.
    pub fn rgb_network(&self) -> &dyn Network {
        self.rgb_network.as_ref()
    }

    /// Factor applied to the uv band of the color-input gradient.
    pub fn uv_network_scale(&self) -> f32 {
        self.uv_network_scale
    }

    /// Changes the uv gradient factor for subsequent backward passes.
    pub fn set_uv_network_scale(&mut self, scale: f32) {
        self.uv_network_scale = scale;
    }

    /// The effective configuration, with every sub-module's own reflection.
    pub fn hyperparams(&self) -> serde_json::Value {
        let mut density = self.density_network.hyperparams();
        if let Some(obj) = density.as_object_mut() {
            obj.insert(
                "n_output_dims".into(),
                json!(self.density_network.padded_output_width()),
            );
        }
        json!({
            "otype": "NerfNetwork",
            "n_pos_dims": self.config.n_pos_dims,
            "n_dir_dims": self.config.n_dir_dims,
            "n_extra_dims": self.config.n_extra_dims,
            "dir_offset": self.config.dir_offset,
            "pos_encoding": self.pos_encoding.hyperparams(),
            "dir_encoding": self.dir_encoding.hyperparams(),
            "density_network": density,
            "uv_network": self.uv_network.hyperparams(),
            "rgb_network": self.rgb_network.hyperparams(),
            "uv_network_scale": self.uv_network_scale,
            "inference_precision": self.config.inference_precision,
        })
    }
}

enum Activations {
    DensityInput,
    Density(usize),
    Uv(usize),
    PackedInput,
    Rgb(usize),
}

pub(crate) fn require_column_major(op: &'static str, layout: MatrixLayout) -> Result<()> {
    if layout == MatrixLayout::ColumnMajor {
        Ok(())
    } else {
        Err(FieldError::Layout {
            op,
            expected: MatrixLayout::ColumnMajor,
            found: layout,
        })
    }
}
