//! Band-structure evaluators: energies, dipole matrix elements, band-basis
//! velocities, and Berry curvature along a k-path.
//!
//! The solver sees a [`System`] only through [`BandEvaluator`]; the two
//! concrete evaluators differ in how the eigenvectors are obtained.

use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use crate::{
    config::ModelConfig,
    error::{ Error, Result },
};

pub mod analytic;
pub mod numeric;
pub use analytic::{ AnalyticSystem, BiTe, DVectorModel };
pub use numeric::{ MatrixHamiltonian, NumericSystem };

/// Energy splittings below this are treated as degenerate; interband dipoles
/// and curvature contributions are set to zero there.
pub const DEGENERACY_TOL: f64 = 1e-10;

/// Band quantities at every point of a k-path, band index ordered by
/// increasing energy.
#[derive(Clone, Debug, PartialEq)]
pub struct PathEigensystem {
    /// Band energies, shape `(Nk, n)`.
    pub energies: nd::Array2<f64>,
    /// Dipole matrix elements `(d_x, d_y)`, each shape `(Nk, n, n)`. The
    /// diagonal holds the Berry connection.
    pub dipole: [nd::Array3<C64>; 2],
    /// Band-basis matrix elements of `(∂h/∂k_x, ∂h/∂k_y)`, each shape
    /// `(Nk, n, n)`.
    pub velocity: [nd::Array3<C64>; 2],
    /// Berry curvature, shape `(Nk, n)`.
    pub curvature: nd::Array2<f64>,
}

impl PathEigensystem {
    pub fn zeros(nk: usize, n: usize) -> Self {
        Self {
            energies: nd::Array2::zeros((nk, n)),
            dipole: [nd::Array3::zeros((nk, n, n)), nd::Array3::zeros((nk, n, n))],
            velocity: [nd::Array3::zeros((nk, n, n)), nd::Array3::zeros((nk, n, n))],
            curvature: nd::Array2::zeros((nk, n)),
        }
    }

    pub fn n_points(&self) -> usize { self.energies.shape()[0] }

    pub fn n_bands(&self) -> usize { self.energies.shape()[1] }

    /// Dipole matrix elements projected on `dir`.
    pub fn dipole_along(&self, dir: [f64; 2]) -> nd::Array3<C64> {
        &self.dipole[0] * dir[0] + &self.dipole[1] * dir[1]
    }

    /// Velocity matrix elements projected on `dir`.
    pub fn velocity_along(&self, dir: [f64; 2]) -> nd::Array3<C64> {
        &self.velocity[0] * dir[0] + &self.velocity[1] * dir[1]
    }
}

/// Source of band quantities for the equations of motion.
pub trait BandEvaluator: Send + Sync {
    fn n_bands(&self) -> usize;

    /// Evaluate at every point of `kpoints`, shape `(Nk, 2)`.
    fn eigensystem(&self, kpoints: nd::ArrayView2<f64>)
        -> Result<PathEigensystem>;
}

/// Fill in the interband dipoles and Berry curvature of point `k` from the
/// band energies and velocity matrices already stored there.
///
/// `d_nm = i v_nm / (e_m - e_n)` for `n ≠ m`, and
/// `Ω_n = -2 Im Σ_{m≠n} v^x_nm v^y_mn / (e_n - e_m)²`.
pub(crate) fn interband_from_velocity(eig: &mut PathEigensystem, k: usize) {
    let n = eig.n_bands();
    for a in 0..n {
        let mut omega = 0.0;
        for b in 0..n {
            if a == b { continue; }
            let de = eig.energies[[k, b]] - eig.energies[[k, a]];
            if de.abs() < DEGENERACY_TOL {
                eig.dipole[0][[k, a, b]] = C64::zero();
                eig.dipole[1][[k, a, b]] = C64::zero();
                continue;
            }
            let vx = eig.velocity[0][[k, a, b]];
            let vy = eig.velocity[1][[k, a, b]];
            eig.dipole[0][[k, a, b]] = C64::i() * vx / de;
            eig.dipole[1][[k, a, b]] = C64::i() * vy / de;
            omega += -2.0 * (vx * eig.velocity[1][[k, b, a]]).im / de.powi(2);
        }
        eig.curvature[[k, a]] = omega;
    }
}

/// Band-structure model of a run.
pub enum System {
    /// Closed-form two-band evaluator.
    Ana(AnalyticSystem),
    /// Numerically diagonalized evaluator.
    Num(NumericSystem),
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "System::{}(n = {})", self.label(), self.n_bands())
    }
}

impl System {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ana(_) => "ana",
            Self::Num(_) => "num",
        }
    }

    pub fn evaluator(&self) -> &dyn BandEvaluator {
        match self {
            Self::Ana(s) => s,
            Self::Num(s) => s,
        }
    }

    pub fn n_bands(&self) -> usize { self.evaluator().n_bands() }

    /// Build the BiTe-type model described by a parameter file.
    pub fn from_config(model: &ModelConfig) -> Result<Self> {
        let bite = BiTe {
            C0: model.C0,
            C2: model.C2,
            A: model.A,
            R: model.R,
            mz: model.mz,
        };
        match model.evaluator.as_str() {
            "ana" => Ok(Self::Ana(AnalyticSystem::new(bite))),
            "num" => Ok(Self::Num(NumericSystem::new(bite, model.gauge_idx)?)),
            other => Err(Error::config(format!(
                "unknown evaluator '{}'; valid names are [\"ana\", \"num\"]",
                other,
            ))),
        }
    }
}
