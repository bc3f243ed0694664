//! Operation Dispatch Layer
//!
//! Every kernel submission goes through here. The stream's backend picks the
//! implementation: when it is [`Backend::Wgpu`](crate::backend::Backend::Wgpu) and the operands are dense the
//! GPU path is tried first, and anything the GPU cannot take (strided bands,
//! missing adapter, oversized buffers) falls back to [`cpu`](super::cpu).
//!
//! Each call is recorded on the stream so submission order is observable in
//! trace logs.

use super::cpu;
#[cfg(feature = "wgpu")]
use crate::backend::Backend;
use crate::matrix::{MatrixView, MatrixViewMut};
use crate::stream::Stream;

/// Sets every element of `dst` to `value`.
pub fn fill_rows(stream: &Stream, dst: &mut MatrixViewMut<'_, f32>, value: f32) {
    stream.record("fill_rows");
    cpu::fill(dst, value);
}

/// Copies `src` into `dst`. Orderings may differ.
pub fn copy_rows(stream: &Stream, src: MatrixView<'_, f32>, dst: &mut MatrixViewMut<'_, f32>) {
    stream.record("copy_rows");
    cpu::copy(src, dst);
}

/// Accumulates `src` into `dst` on the CPU. Orderings may differ.
pub fn add_rows(stream: &Stream, src: MatrixView<'_, f32>, dst: &mut MatrixViewMut<'_, f32>) {
    stream.record("add_rows");
    cpu::add_scaled(src, dst, 1.0);
}

/// Broadcasts one sample into every column of `dst`.
pub fn repeat_vec(stream: &Stream, values: &[f32], dst: &mut MatrixViewMut<'_, f32>) {
    stream.record("repeat_vec");
    cpu::repeat_vec(values, dst);
}

/// Writes the uv lattice of a square texture into a two-row `dst`.
pub fn generate_uv_grid(stream: &Stream, texture_size: usize, dst: &mut MatrixViewMut<'_, f32>) {
    stream.record("generate_uv_grid");
    cpu::uv_grid(texture_size, dst);
}

/// Accumulates `src` into `dst`.
///
/// # Behavior
/// Attempts WGPU → CPU when both views are dense and share an ordering.
pub fn add_gradient(stream: &Stream, src: MatrixView<'_, f32>, dst: &mut MatrixViewMut<'_, f32>) {
    stream.record("add_gradient");
    #[cfg(feature = "wgpu")]
    if stream.backend() == Backend::Wgpu && src.layout() == dst.layout() {
        if let (Some(s), Some(d)) = (src.as_slice(), dst.as_mut_slice()) {
            if super::wgpu::wgpu_add_gradient(d, s, 1.0) {
                return;
            }
        }
    }
    cpu::add_scaled(src, dst, 1.0);
}

/// Multiplies every element of `dst` by `scale`.
///
/// # Behavior
/// Attempts WGPU → CPU when the view is dense.
pub fn scale_gradient(stream: &Stream, dst: &mut MatrixViewMut<'_, f32>, scale: f32) {
    stream.record("scale_gradient");
    #[cfg(feature = "wgpu")]
    if stream.backend() == Backend::Wgpu {
        if let Some(d) = dst.as_mut_slice() {
            if super::wgpu::wgpu_scale_gradient(d, scale) {
                return;
            }
        }
    }
    cpu::scale(dst, scale);
}
