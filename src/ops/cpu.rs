//! Parallel CPU kernels.
//!
//! These are the elementwise kernels the composite field needs between its
//! sub-modules: band fills, copies, accumulation, scaling, broadcasting and
//! the uv lattice. Work is split across the `rayon` pool one lane at a time
//! (a column for column-major buffers, a row for row-major ones), so each
//! element is written by exactly one task and no synchronization is needed.
//!
//! Every kernel accepts strided views, which means they operate directly on
//! row bands of packed buffers produced by
//! [`MatrixViewMut::slice_rows_mut`](crate::matrix::MatrixViewMut::slice_rows_mut).

use crate::matrix::{MatrixView, MatrixViewMut};
use rayon::prelude::*;

/// Sets every element of `dst` to `value`.
pub fn fill(dst: &mut MatrixViewMut<'_, f32>, value: f32) {
    dst.fill(value);
}

/// Copies `src` into `dst` element by element. Orderings may differ.
///
/// # Panics
/// Panics if the shapes differ.
pub fn copy(src: MatrixView<'_, f32>, dst: &mut MatrixViewMut<'_, f32>) {
    assert_same_shape("copy", src, dst);
    dst.par_for_each_mut(|r, c, v| *v = src.get(r, c));
}

/// Computes `dst += scale * src`.
///
/// # Panics
/// Panics if the shapes differ.
pub fn add_scaled(src: MatrixView<'_, f32>, dst: &mut MatrixViewMut<'_, f32>, scale: f32) {
    assert_same_shape("add", src, dst);
    dst.par_for_each_mut(|r, c, v| *v += scale * src.get(r, c));
}

/// Multiplies every element of `dst` by `scale`.
pub fn scale(dst: &mut MatrixViewMut<'_, f32>, scale: f32) {
    dst.par_lanes_mut()
        .for_each(|lane| lane.iter_mut().for_each(|v| *v *= scale));
}

/// Broadcasts `values` into the leading rows of every column of `dst`.
///
/// Rows past `values.len()` are left untouched.
pub fn repeat_vec(values: &[f32], dst: &mut MatrixViewMut<'_, f32>) {
    let n = values.len();
    dst.par_for_each_mut(|r, _, v| {
        if r < n {
            *v = values[r];
        }
    });
}

/// Writes the uv lattice of a `texture_size x texture_size` texture into a
/// two-row `dst`: sample `i` receives `(i mod t, i div t) / t`.
///
/// # Panics
/// Panics if `dst` does not have two rows and `t * t` columns.
pub fn uv_grid(texture_size: usize, dst: &mut MatrixViewMut<'_, f32>) {
    assert_eq!(dst.rows(), 2, "uv grid needs a two-row target");
    assert_eq!(
        dst.cols(),
        texture_size * texture_size,
        "uv grid target is not texture_size^2 wide"
    );
    #[allow(clippy::cast_precision_loss)]
    let size = texture_size as f32;
    dst.par_for_each_mut(|r, c, v| {
        #[allow(clippy::cast_precision_loss)]
        let coord = if r == 0 {
            (c % texture_size) as f32
        } else {
            (c / texture_size) as f32
        };
        *v = coord / size;
    });
}

fn assert_same_shape(op: &str, src: MatrixView<'_, f32>, dst: &MatrixViewMut<'_, f32>) {
    assert!(
        src.rows() == dst.rows() && src.cols() == dst.cols(),
        "{op}: {}x{} source does not match {}x{} target",
        src.rows(),
        src.cols(),
        dst.rows(),
        dst.cols()
    );
}
