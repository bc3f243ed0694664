//! Backend selection module.
//!
//! This module defines the available execution backends for the field
//! evaluator and provides functions to set and get the current default.
//!
//! # Supported Backends
//!
//! - `Cpu`: pure Rust backend, kernels parallelised with `rayon` (default).
//! - `Wgpu`: GPU-accelerated elementwise kernels using `wgpu` (if compiled in).
//!
//! The default is stored globally using an `AtomicU8`. A [`Stream`](crate::stream::Stream)
//! captures the default when it is created, so switching the global backend never
//! affects a queue that already has work submitted to it.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated backend using `wgpu`.
    ///
    /// Without the `wgpu` feature every kernel silently runs on the CPU.
    Wgpu = 1,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Internal global state for the default backend.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend new streams dispatch to.
///
/// # Example
/// ```
/// use briny_field::backend::{set_backend, get_backend, Backend};
/// set_backend(Backend::Wgpu);
/// assert_eq!(get_backend(), Backend::Wgpu);
/// set_backend(Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the backend new streams dispatch to.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
