//! Typed field configuration.
//!
//! A [`NerfFieldConfig`] is the JSON-shaped description of a field: the four
//! dimension counts of the external input plus one sub-config per sub-module.
//! It is immutable once a field has been built from it.
//!
//! ```rust
//! use briny_field::config::NerfFieldConfig;
//!
//! let cfg = NerfFieldConfig::from_json_str(r#"{
//!     "n_pos_dims": 3,
//!     "n_dir_dims": 3,
//!     "dir_offset": 4,
//!     "pos_encoding": { "otype": "Frequency", "n_frequencies": 4 },
//!     "dir_encoding": { "otype": "Identity" },
//!     "density_network": { "otype": "FullyFusedMLP", "n_neurons": 64, "n_hidden_layers": 1 },
//!     "uv_network": { "otype": "FullyFusedMLP", "n_neurons": 64, "n_hidden_layers": 1 },
//!     "rgb_network": { "otype": "FullyFusedMLP", "n_neurons": 64, "n_hidden_layers": 2,
//!                      "output_activation": "Sigmoid" }
//! }"#).unwrap();
//! assert_eq!(cfg.n_extra_dims, 0);
//! assert_eq!(cfg.uv_network_scale, 1.0);
//! ```

use crate::error::{FieldError, Result};
use crate::network::activation::Activation;
use crate::params::InferencePrecision;
use serde::{Deserialize, Serialize};

/// Coordinate encoding variants, tagged by `otype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "otype")]
pub enum EncodingConfig {
    /// `scale * x + offset`, passed through unchanged otherwise.
    Identity {
        /// Multiplier applied to every coordinate.
        #[serde(default = "one")]
        scale: f32,
        /// Added after scaling.
        #[serde(default)]
        offset: f32,
    },
    /// Interleaved `sin`/`cos` features at octave frequencies.
    Frequency {
        /// Number of octaves per input dimension.
        #[serde(default = "default_n_frequencies")]
        n_frequencies: usize,
    },
}

/// Feed-forward network flavours. The name selects the width alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Fused MLP, widths aligned to 16.
    #[serde(rename = "FullyFusedMLP")]
    FullyFused,
    /// Tiled MLP, widths aligned to 8.
    #[serde(rename = "CutlassMLP")]
    Cutlass,
    /// Plain MLP, no alignment requirement.
    #[serde(rename = "MLP")]
    Plain,
}

impl NetworkType {
    /// Width granularity of the network's inputs and outputs.
    pub const fn alignment(self) -> usize {
        match self {
            Self::FullyFused => 16,
            Self::Cutlass => 8,
            Self::Plain => 1,
        }
    }
}

/// Configuration of one feed-forward head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network flavour.
    pub otype: NetworkType,
    /// Width of every hidden layer.
    #[serde(default = "default_n_neurons")]
    pub n_neurons: usize,
    /// Number of hidden layers.
    #[serde(default = "default_n_hidden_layers")]
    pub n_hidden_layers: usize,
    /// Hidden activation.
    #[serde(default)]
    pub activation: Activation,
    /// Output activation.
    #[serde(default = "no_activation")]
    pub output_activation: Activation,
    /// Input width; always overridden by the composite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_input_dims: Option<usize>,
    /// Output width before padding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_output_dims: Option<usize>,
}

impl NetworkConfig {
    /// A network of `otype` with default widths and activations.
    pub fn new(otype: NetworkType) -> Self {
        Self {
            otype,
            n_neurons: default_n_neurons(),
            n_hidden_layers: default_n_hidden_layers(),
            activation: Activation::default(),
            output_activation: Activation::None,
            n_input_dims: None,
            n_output_dims: None,
        }
    }
}

/// Full description of a composite field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NerfFieldConfig {
    /// Leading input rows encoded by the position encoding.
    pub n_pos_dims: usize,
    /// Input rows encoded by the direction encoding.
    pub n_dir_dims: usize,
    /// Extra conditioning rows following the direction, encoded with it.
    #[serde(default)]
    pub n_extra_dims: usize,
    /// First input row of the direction.
    pub dir_offset: usize,
    /// Position encoding.
    pub pos_encoding: EncodingConfig,
    /// Direction encoding.
    pub dir_encoding: EncodingConfig,
    /// Density head.
    pub density_network: NetworkConfig,
    /// Uv latent head.
    pub uv_network: NetworkConfig,
    /// Color head.
    pub rgb_network: NetworkConfig,
    /// Factor applied to the uv band of the color-input gradient.
    #[serde(default = "one")]
    pub uv_network_scale: f32,
    /// Precision of the inference parameter shadow.
    #[serde(default)]
    pub inference_precision: InferencePrecision,
}

impl NerfFieldConfig {
    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    /// [`FieldError::Json`] if the document does not describe a field.
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Converts a parsed JSON value, e.g. one produced by
    /// [`NerfField::hyperparams`](crate::field::NerfField::hyperparams).
    ///
    /// # Errors
    /// [`FieldError::Json`] if the value does not describe a field.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    /// Width of the external input: direction offset plus direction and extra rows.
    pub fn input_width(&self) -> usize {
        self.dir_offset + self.n_dir_dims + self.n_extra_dims
    }

    /// Rejects configurations no field can be built from.
    ///
    /// # Errors
    /// [`FieldError::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.n_pos_dims == 0 {
            return Err(FieldError::config("n_pos_dims must be positive"));
        }
        if self.n_dir_dims + self.n_extra_dims == 0 {
            return Err(FieldError::config("direction encoding has no input rows"));
        }
        if self.n_pos_dims > self.input_width() {
            return Err(FieldError::config(format!(
                "{} position rows exceed the {}-row input",
                self.n_pos_dims,
                self.input_width()
            )));
        }
        if !self.uv_network_scale.is_finite() {
            return Err(FieldError::config("uv_network_scale must be finite"));
        }
        for (name, net) in [
            ("density_network", &self.density_network),
            ("uv_network", &self.uv_network),
            ("rgb_network", &self.rgb_network),
        ] {
            if net.n_hidden_layers > 0 && net.n_neurons == 0 {
                return Err(FieldError::config(format!("{name}: n_neurons must be positive")));
            }
            if net.n_output_dims == Some(0) {
                return Err(FieldError::config(format!("{name}: n_output_dims must be positive")));
            }
        }
        for (name, enc) in [("pos_encoding", &self.pos_encoding), ("dir_encoding", &self.dir_encoding)] {
            if let EncodingConfig::Frequency { n_frequencies: 0 } = enc {
                return Err(FieldError::config(format!("{name}: n_frequencies must be positive")));
            }
        }
        Ok(())
    }
}

const fn one() -> f32 {
    1.0
}

const fn no_activation() -> Activation {
    Activation::None
}

const fn default_n_frequencies() -> usize {
    12
}

const fn default_n_neurons() -> usize {
    64
}

const fn default_n_hidden_layers() -> usize {
    1
}
