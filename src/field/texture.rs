//! Direction-conditioned texture baking.
//!
//! The color head is evaluated over a square uv lattice for one fixed view
//! direction. The density and uv heads are bypassed: the uv band of the packed
//! buffer is filled from a lattice that is generated on first use and cached
//! on the field.

use super::NerfField;
use crate::error::{FieldError, Result};
use crate::layout::UV_CHANNELS;
use crate::matrix::{Matrix, MatrixLayout, MatrixViewMut};
use crate::ops::dispatch;
use crate::params::ModuleId;
use crate::stream::Stream;

impl NerfField {
    /// Renders the color head over a `texture_size x texture_size` uv lattice
    /// as seen from `dir`.
    ///
    /// `output` must have `texture_size^2` columns: sample `i` is texel
    /// `(i mod t, i div t)`. Its leading rows receive the color head's padded
    /// output. Extra conditioning rows are zero. Inference parameters are
    /// always used.
    ///
    /// The lattice is generated once and reused by every later call. Calling
    /// again with a different `texture_size` fails until
    /// [`clear_uv_grid`](Self::clear_uv_grid) is called.
    ///
    /// # Errors
    /// [`FieldError::Shape`] if `dir` does not have `n_dir_dims` values, if
    /// `output` does not fit the texture, or if the cached lattice belongs to
    /// another resolution.
    pub fn uv_to_texture(
        &self,
        stream: &Stream,
        texture_size: usize,
        dir: &[f32],
        output: &mut MatrixViewMut<'_, f32>,
    ) -> Result<()> {
        let batch = texture_size * texture_size;
        if dir.len() != self.config.n_dir_dims {
            return Err(FieldError::shape(format!(
                "texture direction has {} values, expected {}",
                dir.len(),
                self.config.n_dir_dims
            )));
        }
        Self::check_batch("texture output", output.cols(), batch)?;
        Self::check_rows("texture output", output.rows(), self.buffers.rgb_output_width)?;
        self.check_cached_grid(batch)?;

        let b = self.buffers;
        let layout = self.dir_encoding.preferred_output_layout();

        let mut dir_input = stream.matrix(self.dir_encoding.input_width(), batch, MatrixLayout::ColumnMajor);
        dispatch::repeat_vec(stream, dir, &mut dir_input.view_mut());
        let mut rgb_network_input = stream.matrix(b.rgb_input_width, batch, layout);
        self.dir_encoding.inference(
            stream,
            self.values(ModuleId::DirEncoding, true),
            dir_input.view(),
            &mut rgb_network_input.slice_rows_mut(0, b.dir_padded_width),
        )?;

        let grid = self.uv_grid.get_or_init(|| {
            log::debug!("uv texture: generating {texture_size}x{texture_size} lattice");
            let mut grid = stream.matrix(UV_CHANNELS, batch, layout);
            dispatch::generate_uv_grid(stream, texture_size, &mut grid.view_mut());
            grid
        });
        self.check_cached_grid(batch)?;
        dispatch::copy_rows(
            stream,
            grid.view(),
            &mut rgb_network_input.slice_rows_mut(b.dir_padded_width, UV_CHANNELS),
        );
        self.fill_unused(stream, &mut rgb_network_input);

        self.rgb_network.inference(
            stream,
            self.values(ModuleId::RgbNetwork, true),
            rgb_network_input.view(),
            &mut output.slice_rows_mut(0, b.rgb_output_width),
        )
    }

    fn check_cached_grid(&self, batch: usize) -> Result<()> {
        match self.uv_grid.get() {
            Some(grid) if grid.cols() != batch => {
                log::warn!(
                    "uv texture: cached lattice has {} texels, request has {batch}",
                    grid.cols()
                );
                Err(FieldError::shape(format!(
                    "cached uv lattice has {} texels, expected {batch}",
                    grid.cols()
                )))
            }
            _ => Ok(()),
        }
    }

    /// The cached uv lattice, if a texture has been rendered.
    pub fn uv_grid(&self) -> Option<&Matrix<f32>> {
        self.uv_grid.get()
    }

    /// Drops the cached uv lattice so the next texture call regenerates it.
    pub fn clear_uv_grid(&mut self) {
        self.uv_grid.take();
    }
}
