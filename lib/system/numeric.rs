//! Evaluators for arbitrary `n × n` Bloch Hamiltonians, diagonalized
//! numerically at every k-point.

use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use num_complex::Complex64 as C64;
use rayon::prelude::*;
use crate::error::{ Error, Result };
use super::{ BandEvaluator, PathEigensystem, interband_from_velocity };

/// Step used for finite-difference k-derivatives.
pub const FD_STEP: f64 = 1e-5;

/// Bloch Hamiltonian `h(k)` as a Hermitian matrix.
pub trait MatrixHamiltonian: Send + Sync {
    fn n_bands(&self) -> usize;

    fn h(&self, kx: f64, ky: f64) -> nd::Array2<C64>;

    /// `[∂h/∂k_x, ∂h/∂k_y]`; central differences unless overridden.
    fn dh(&self, kx: f64, ky: f64) -> [nd::Array2<C64>; 2] {
        let dx = (self.h(kx + FD_STEP, ky) - self.h(kx - FD_STEP, ky))
            / (2.0 * FD_STEP);
        let dy = (self.h(kx, ky + FD_STEP) - self.h(kx, ky - FD_STEP))
            / (2.0 * FD_STEP);
        [dx, dy]
    }
}

/// Numerically diagonalized evaluator.
///
/// Eigenvectors are fixed to a smooth gauge by making component `gauge_idx`
/// real and positive; intraband Berry connections are then obtained from
/// central differences of the gauge-fixed eigenvectors.
pub struct NumericSystem {
    hamiltonian: Box<dyn MatrixHamiltonian>,
    gauge_idx: usize,
}

impl NumericSystem {
    pub fn new<H>(hamiltonian: H, gauge_idx: usize) -> Result<Self>
    where H: MatrixHamiltonian + 'static
    {
        if gauge_idx >= hamiltonian.n_bands() {
            return Err(Error::config(format!(
                "gauge index {} out of range for {} bands",
                gauge_idx, hamiltonian.n_bands(),
            )));
        }
        Ok(Self { hamiltonian: Box::new(hamiltonian), gauge_idx })
    }

    /// Eigenvalues and gauge-fixed eigenvectors (columns) at `(kx, ky)`.
    fn diagonalize(&self, kx: f64, ky: f64)
        -> Result<(nd::Array1<f64>, nd::Array2<C64>)>
    {
        let (e, mut U) = self.hamiltonian.h(kx, ky).eigh(UPLO::Lower)?;
        for mut col in U.columns_mut() {
            let r = col[self.gauge_idx];
            if r.norm() > 1e-14 {
                let phase = r.conj() / r.norm();
                col.mapv_inplace(|z| z * phase);
            }
        }
        Ok((e, U))
    }

    /// `i ⟨u_n|∂u_n⟩` along `(ex, ey)` for every band.
    fn connection(
        &self,
        kx: f64,
        ky: f64,
        U: &nd::Array2<C64>,
        ex: f64,
        ey: f64,
    ) -> Result<nd::Array1<f64>>
    {
        let (_, Up) = self.diagonalize(kx + ex * FD_STEP, ky + ey * FD_STEP)?;
        let (_, Um) = self.diagonalize(kx - ex * FD_STEP, ky - ey * FD_STEP)?;
        let dU = (Up - Um) / (2.0 * FD_STEP);
        let conn = U.columns().into_iter().zip(dU.columns())
            .map(|(u, du)| {
                let overlap: C64
                    = u.iter().zip(du.iter()).map(|(a, b)| a.conj() * b).sum();
                -overlap.im
            })
            .collect();
        Ok(conn)
    }

    fn point(&self, kx: f64, ky: f64) -> Result<PointData> {
        let (e, U) = self.diagonalize(kx, ky)?;
        let Ud = U.t().mapv(|z| z.conj());
        let [dhx, dhy] = self.hamiltonian.dh(kx, ky);
        let vx = Ud.dot(&dhx).dot(&U);
        let vy = Ud.dot(&dhy).dot(&U);
        let ax = self.connection(kx, ky, &U, 1.0, 0.0)?;
        let ay = self.connection(kx, ky, &U, 0.0, 1.0)?;
        Ok(PointData { e, v: [vx, vy], a: [ax, ay] })
    }
}

struct PointData {
    e: nd::Array1<f64>,
    v: [nd::Array2<C64>; 2],
    a: [nd::Array1<f64>; 2],
}

impl BandEvaluator for NumericSystem {
    fn n_bands(&self) -> usize { self.hamiltonian.n_bands() }

    fn eigensystem(&self, kpoints: nd::ArrayView2<f64>)
        -> Result<PathEigensystem>
    {
        let nk = kpoints.shape()[0];
        let n = self.n_bands();
        let points: Vec<PointData>
            = (0..nk).into_par_iter()
            .map(|k| self.point(kpoints[[k, 0]], kpoints[[k, 1]]))
            .collect::<Result<Vec<PointData>>>()?;
        let mut eig = PathEigensystem::zeros(nk, n);
        for (k, p) in points.into_iter().enumerate() {
            eig.energies.row_mut(k).assign(&p.e);
            for c in 0..2 {
                eig.velocity[c].slice_mut(nd::s![k, .., ..]).assign(&p.v[c]);
                for b in 0..n {
                    eig.dipole[c][[k, b, b]] = C64::from(p.a[c][b]);
                }
            }
            interband_from_velocity(&mut eig, k);
        }
        Ok(eig)
    }
}
