//! # Kernel Dispatch
//!
//! The elementwise kernels the composite field runs between its sub-modules.
//!
//! ## Submodules
//!
//! - [`cpu`]: `rayon`-parallel CPU kernels, also the fallback for every op
//! - [`wgpu`] *(opt-in)*: WGSL compute pipelines for the gradient kernels
//! - [`dispatch`]: backend selection per [`Stream`](crate::stream::Stream)
//!
//! ## Feature Flags
//!
//! - `wgpu`: enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
