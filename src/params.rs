//! The shared parameter arena.
//!
//! All five sub-modules of a field draw their trainable values from one flat
//! [`ParameterBlock`]. The block is split into contiguous ranges in the fixed
//! order of [`ModuleId::ORDER`]; the split is computed once by
//! [`ParameterLayout::new`] from each sub-module's own parameter count and
//! every consumer (loading, initialization, gradient routing, checkpoints)
//! reads the same table.

use crate::error::{FieldError, Result};
use core::ops::Range;
use serde::{Deserialize, Serialize};

/// Identifies one of the five sub-modules of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModuleId {
    /// Density head.
    DensityNetwork = 0,
    /// Uv latent head.
    UvNetwork = 1,
    /// Color head.
    RgbNetwork = 2,
    /// Position encoding.
    PosEncoding = 3,
    /// Direction encoding.
    DirEncoding = 4,
}

impl ModuleId {
    /// Order in which sub-module ranges are laid out.
    pub const ORDER: [Self; 5] = [
        Self::DensityNetwork,
        Self::UvNetwork,
        Self::RgbNetwork,
        Self::PosEncoding,
        Self::DirEncoding,
    ];

    /// Position of this module in [`ORDER`](Self::ORDER).
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`index`](Self::index).
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ORDER.get(index).copied()
    }

    /// Configuration key of the module.
    pub const fn name(self) -> &'static str {
        match self {
            Self::DensityNetwork => "density_network",
            Self::UvNetwork => "uv_network",
            Self::RgbNetwork => "rgb_network",
            Self::PosEncoding => "pos_encoding",
            Self::DirEncoding => "dir_encoding",
        }
    }
}

/// Range table of the five sub-modules within the flat arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterLayout {
    ranges: [Range<usize>; 5],
}

impl ParameterLayout {
    /// Lays out `counts` (indexed like [`ModuleId::ORDER`]) back to back.
    pub fn new(counts: [usize; 5]) -> Self {
        let mut offset = 0;
        let ranges = counts.map(|n| {
            let r = offset..offset + n;
            offset += n;
            r
        });
        Self { ranges }
    }

    /// Range of `id` within the arena.
    pub fn range(&self, id: ModuleId) -> Range<usize> {
        self.ranges[id.index()].clone()
    }

    /// Number of values owned by `id`.
    pub fn len_of(&self, id: ModuleId) -> usize {
        self.ranges[id.index()].len()
    }

    /// Total arena length.
    pub fn total(&self) -> usize {
        self.ranges[4].end
    }

    /// Iterates `(module, range)` in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, Range<usize>)> + '_ {
        ModuleId::ORDER.iter().map(|&id| (id, self.range(id)))
    }

    /// Checks that the table still matches the sub-modules' own counts and
    /// that the ranges tile the arena without gaps.
    ///
    /// # Errors
    /// [`FieldError::Parameters`] on the first disagreeing module.
    pub fn validate(&self, counts: [usize; 5]) -> Result<()> {
        let mut offset = 0;
        for (range, expected) in self.ranges.iter().zip(counts) {
            if range.start != offset || range.len() != expected {
                return Err(FieldError::Parameters {
                    expected,
                    found: range.len(),
                });
            }
            offset = range.end;
        }
        Ok(())
    }
}

/// Precision of the inference parameter shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InferencePrecision {
    /// Copy parameters as-is.
    #[default]
    Full,
    /// Round parameters through IEEE half precision.
    Half,
}

/// Owned parameter arena: training values, an inference shadow and a
/// gradient buffer of identical length.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    /// Training-precision parameters.
    pub params: Vec<f32>,
    /// Shadow used when callers ask for inference parameters.
    pub inference_params: Vec<f32>,
    /// Gradient written by backward passes.
    pub gradients: Vec<f32>,
}

impl ParameterBlock {
    /// A zeroed block of `n` values.
    pub fn zeros(n: usize) -> Self {
        Self {
            params: vec![0.0; n],
            inference_params: vec![0.0; n],
            gradients: vec![0.0; n],
        }
    }

    /// Wraps `params`, deriving the shadow and a zero gradient.
    pub fn from_params(params: Vec<f32>, precision: InferencePrecision) -> Self {
        let n = params.len();
        let mut block = Self {
            params,
            inference_params: vec![0.0; n],
            gradients: vec![0.0; n],
        };
        block.sync_inference_params(precision);
        block
    }

    /// Number of values in each of the three buffers.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the block holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Checks the three buffers against an expected length.
    ///
    /// # Errors
    /// [`FieldError::Parameters`] if any buffer disagrees.
    pub fn check_len(&self, expected: usize) -> Result<()> {
        for found in [
            self.params.len(),
            self.inference_params.len(),
            self.gradients.len(),
        ] {
            if found != expected {
                return Err(FieldError::Parameters { expected, found });
            }
        }
        Ok(())
    }

    /// Refreshes the inference shadow from the training values.
    pub fn sync_inference_params(&mut self, precision: InferencePrecision) {
        match precision {
            InferencePrecision::Full => self.inference_params.copy_from_slice(&self.params),
            InferencePrecision::Half => {
                for (dst, &src) in self.inference_params.iter_mut().zip(&self.params) {
                    *dst = half::f16::from_f32(src).to_f32();
                }
            }
        }
    }

    /// The values selected by `use_inference` within `range`.
    pub fn values(&self, range: Range<usize>, use_inference: bool) -> &[f32] {
        if use_inference {
            &self.inference_params[range]
        } else {
            &self.params[range]
        }
    }

    /// Splits out the parameter and gradient slices of one sub-module.
    pub fn split_mut(&mut self, range: Range<usize>, use_inference: bool) -> (&[f32], &mut [f32]) {
        let params = if use_inference {
            &self.inference_params[range.clone()]
        } else {
            &self.params[range.clone()]
        };
        (params, &mut self.gradients[range])
    }
}
