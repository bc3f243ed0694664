//! Pointwise activation functions.
//!
//! Derivatives are expressed in terms of the activation's *output*, so the
//! backward pass only needs the post-activation values kept in the forward
//! context.

use serde::{Deserialize, Serialize};

/// Pointwise nonlinearity applied after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    /// Identity.
    None,
    /// `max(0, x)`.
    #[default]
    ReLU,
    /// `1 / (1 + e^-x)`.
    Sigmoid,
    /// `e^x`.
    Exponential,
    /// `tanh(x)`.
    Tanh,
    /// `ln(1 + e^x)`.
    Softplus,
}

impl Activation {
    /// Applies the activation to `x`.
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::None => x,
            Self::ReLU => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Exponential => x.exp(),
            Self::Tanh => x.tanh(),
            Self::Softplus => {
                // ln(1 + e^x) overflows for large x; it is x to f32 precision there.
                if x > 15.0 { x } else { x.exp().ln_1p() }
            }
        }
    }

    /// Derivative at the pre-activation point whose output is `y`.
    #[inline]
    pub fn derivative_from_output(self, y: f32) -> f32 {
        match self {
            Self::None => 1.0,
            Self::ReLU => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Sigmoid => y * (1.0 - y),
            Self::Exponential => y,
            Self::Tanh => 1.0 - y * y,
            Self::Softplus => 1.0 - (-y).exp(),
        }
    }

    /// Applies the activation in place.
    pub fn apply_slice(self, values: &mut [f32]) {
        if self != Self::None {
            values.iter_mut().for_each(|v| *v = self.apply(*v));
        }
    }
}
