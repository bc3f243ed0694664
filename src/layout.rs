//! Padded widths and the packed color-input layout.
//!
//! The color head consumes one packed buffer per batch:
//!
//! ```text
//! rows 0 .. dir_padded                      direction encoding output
//! rows dir_padded .. dir_padded + uv_padded uv head output (2 live rows)
//! rows dir_padded + 2 .. rgb_input_width    zero padding
//! ```
//!
//! Only the first two uv rows carry data; anything the uv head writes past
//! them is overwritten with zeros together with the alignment tail.

use crate::config::{NetworkConfig, NetworkType};
use core::ops::Range;

/// Number of live channels of the uv latent.
pub const UV_CHANNELS: usize = 2;

/// Number of color channels produced by the color head.
pub const RGB_CHANNELS: usize = 3;

/// Output row holding the density.
pub const DENSITY_CHANNEL: usize = 3;

/// Width of the caller-visible output.
pub const OUTPUT_WIDTH: usize = 4;

/// Output rows holding the uv latent in an extended output.
pub const UV_OUTPUT_CHANNELS: Range<usize> = 4..6;

/// Rounds `value` up to a multiple of `multiple`. A multiple of `0` or `1`
/// leaves `value` unchanged.
///
/// ```rust
/// use briny_field::layout::next_multiple;
/// assert_eq!(next_multiple(19, 16), 32);
/// assert_eq!(next_multiple(16, 16), 16);
/// assert_eq!(next_multiple(5, 1), 5);
/// ```
pub const fn next_multiple(value: usize, multiple: usize) -> usize {
    if multiple <= 1 {
        value
    } else {
        value.div_ceil(multiple) * multiple
    }
}

/// Width granularity a network requires of its inputs and outputs.
pub const fn minimum_alignment(config: &NetworkConfig) -> usize {
    config.otype.alignment()
}

/// Alignment requested of the position encoding, which feeds both the density
/// and the uv head.
pub fn pos_encoding_alignment(density_network: &NetworkConfig) -> usize {
    match density_network.otype {
        NetworkType::FullyFused => 16,
        NetworkType::Cutlass | NetworkType::Plain => 8,
    }
}

/// Widths of every per-call buffer, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Rows of the position encoding output, which is the density/uv input.
    pub density_input_width: usize,
    /// Padded rows of the density head output.
    pub density_output_width: usize,
    /// Padded rows of the direction encoding output.
    pub dir_padded_width: usize,
    /// Padded rows of the uv head output.
    pub uv_padded_width: usize,
    /// Rows of the packed color-head input.
    pub rgb_input_width: usize,
    /// Padded rows of the color head output.
    pub rgb_output_width: usize,
}

impl BufferLayout {
    /// Plans the packed color-input buffer from the measured widths of the
    /// sub-modules, rounding it up to the color head's alignment.
    pub fn plan(
        density_input_width: usize,
        density_output_width: usize,
        dir_padded_width: usize,
        uv_padded_width: usize,
        rgb_alignment: usize,
    ) -> Self {
        Self {
            density_input_width,
            density_output_width,
            dir_padded_width,
            uv_padded_width,
            rgb_input_width: next_multiple(dir_padded_width + uv_padded_width, rgb_alignment),
            rgb_output_width: 0,
        }
    }

    /// Records the color head's padded output width once it has been built.
    #[must_use]
    pub fn with_rgb_output(mut self, rgb_output_width: usize) -> Self {
        self.rgb_output_width = rgb_output_width;
        self
    }

    /// Rows of the packed buffer written by the direction encoding.
    pub fn dir_rows(&self) -> Range<usize> {
        0..self.dir_padded_width
    }

    /// Rows of the packed buffer written by the uv head.
    pub fn uv_rows(&self) -> Range<usize> {
        self.dir_padded_width..self.dir_padded_width + self.uv_padded_width
    }

    /// The two rows of the packed buffer carrying the uv latent.
    pub fn uv_live_rows(&self) -> Range<usize> {
        self.dir_padded_width..self.dir_padded_width + UV_CHANNELS
    }

    /// Rows of the packed buffer that must stay zero.
    pub fn padding_rows(&self) -> Range<usize> {
        self.dir_padded_width + UV_CHANNELS..self.rgb_input_width
    }

    /// Width of the caller-visible output buffer.
    pub fn padded_output_width(&self) -> usize {
        self.rgb_output_width.max(OUTPUT_WIDTH)
    }
}
