//! Driving electric field.

use std::{ f64::consts::TAU, sync::Arc };

/// Gaussian-enveloped, optionally chirped, sinusoidal pulse along the field
/// direction. All quantities in atomic units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Pulse {
    /// Peak amplitude.
    pub E0: f64,
    /// Carrier frequency (ordinary, not angular).
    pub f: f64,
    /// Envelope width: `exp(-t²/σ²)`.
    pub sigma: f64,
    /// Linear chirp rate.
    pub chirp: f64,
    /// Carrier-envelope phase.
    pub phase: f64,
}

impl Pulse {
    pub fn at(&self, t: f64) -> f64 {
        self.E0
            * (-t.powi(2) / self.sigma.powi(2)).exp()
            * (TAU * self.f * t * (1.0 + self.chirp * t) + self.phase).sin()
    }
}

/// Heap-allocated field shape `E(t)`.
pub type FieldFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Scalar field amplitude along the field direction as a function of time.
#[derive(Clone)]
pub enum Field {
    Pulse(Pulse),
    Custom(FieldFn),
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pulse(p) => write!(f, "Pulse({:?})", p),
            Self::Custom(_) => write!(f, "Custom(...)"),
        }
    }
}

impl From<Pulse> for Field {
    fn from(p: Pulse) -> Self { Self::Pulse(p) }
}

impl Field {
    pub fn zero() -> Self { Self::Custom(Arc::new(|_| 0.0)) }

    pub fn at(&self, t: f64) -> f64 {
        match self {
            Self::Pulse(p) => p.at(t),
            Self::Custom(f) => f(t),
        }
    }
}
