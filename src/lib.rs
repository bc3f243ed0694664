//! # `briny_field`
//!
//! A composite multi-head neural field evaluator. A sample's position, view
//! direction and optional extra conditioning rows go in; three color channels
//! and a density come out, with a two-channel uv latent in between.
//!
//! ## Features
//!
//! - **Composite field**: two coordinate encodings and three feed-forward
//!   heads over one shared, tightly packed batch buffer
//! - **Exact gradients**: backward passes route the color and density
//!   gradients back into a single position-encoding gradient
//! - **Reduced paths**: density-only queries and direction-conditioned
//!   texture baking reuse the same sub-modules
//! - **Zero-copy views**: every row band of a batch buffer is a strided view
//!   in either memory ordering
//! - **Parameter snapshots**: a validated `.bfld` format for the shared
//!   parameter arena
//! - **GPU Acceleration**: optional `wgpu` kernels for gradient accumulation
//!
//! ## Example
//!
//! ```rust
//! use briny_field::prelude::*;
//! use rand::SeedableRng;
//!
//! let mut field = NerfField::from_json(&serde_json::json!({
//!     "n_pos_dims": 3, "n_dir_dims": 3, "dir_offset": 3,
//!     "pos_encoding": { "otype": "Frequency", "n_frequencies": 2 },
//!     "dir_encoding": { "otype": "Identity" },
//!     "density_network": { "otype": "MLP", "n_neurons": 8 },
//!     "uv_network": { "otype": "MLP", "n_neurons": 8 },
//!     "rgb_network": { "otype": "MLP", "n_neurons": 8 }
//! })).unwrap();
//! field.initialize(&mut rand::rngs::StdRng::seed_from_u64(3), 1.0);
//!
//! let stream = Stream::new();
//! let input = Matrix::from_fn(6, 4, MatrixLayout::ColumnMajor, |r, c| (r * c) as f32 * 0.05);
//! let mut output = stream.matrix(field.padded_output_width(), 4, MatrixLayout::ColumnMajor);
//! let ctx = field.forward(&stream, input.view(), Some(&mut output.view_mut()), false, false).unwrap();
//!
//! let dl_doutput = Matrix::from_fn(output.rows(), 4, MatrixLayout::ColumnMajor, |_, _| 1.0);
//! field
//!     .backward(&stream, &ctx, input.view(), output.view(), dl_doutput.view(), None, false, GradientMode::Overwrite)
//!     .unwrap();
//! stream.synchronize();
//! assert!(field.parameters().gradients.iter().any(|&g| g != 0.0));
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc
)]
#![deny(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod encoding;
pub mod error;
pub mod field;
pub mod layout;
pub mod matrix;
pub mod network;
pub mod ops;
pub mod params;
pub mod stream;

/// The types most callers need.
pub mod prelude {
    pub use crate::backend::{Backend, get_backend, set_backend};
    pub use crate::config::{EncodingConfig, NerfFieldConfig, NetworkConfig, NetworkType};
    pub use crate::encoding::Encoding;
    pub use crate::error::{FieldError, Result};
    pub use crate::field::{DensityForwardContext, NerfField, NerfForwardContext, SubModules};
    pub use crate::matrix::{Matrix, MatrixLayout, MatrixView, MatrixViewMut};
    pub use crate::network::activation::Activation;
    pub use crate::network::{Context, GradientMode, Network};
    pub use crate::params::{InferencePrecision, ModuleId, ParameterBlock, ParameterLayout};
    pub use crate::stream::Stream;
}
