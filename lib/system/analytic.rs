//! Closed-form two-band models `h(k) = h0(k) + d(k)·σ`.

use ndarray as nd;
use num_complex::Complex64 as C64;
use crate::error::Result;
use super::{
    BandEvaluator,
    MatrixHamiltonian,
    PathEigensystem,
    interband_from_velocity,
};

/// Two-band Hamiltonian given by its scalar part and d-vector.
pub trait DVectorModel: Send + Sync {
    /// `(h0, d)` at `(kx, ky)`.
    fn eval(&self, kx: f64, ky: f64) -> (f64, [f64; 3]);

    /// `(∇h0, [∂d/∂k_x, ∂d/∂k_y])` at `(kx, ky)`.
    fn grad(&self, kx: f64, ky: f64) -> ([f64; 2], [[f64; 3]; 2]);
}

/// Surface-state model of Bi₂Te₃ with hexagonal warping:
/// ```text
/// h0 = C0 + C2 (kx² + ky²)
/// d  = (A ky, -A kx, mz + 2R (kx³ - 3 kx ky²))
/// ```
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BiTe {
    pub C0: f64,
    pub C2: f64,
    pub A: f64,
    pub R: f64,
    pub mz: f64,
}

impl DVectorModel for BiTe {
    fn eval(&self, kx: f64, ky: f64) -> (f64, [f64; 3]) {
        let h0 = self.C0 + self.C2 * (kx.powi(2) + ky.powi(2));
        let d = [
            self.A * ky,
            -self.A * kx,
            self.mz + 2.0 * self.R * (kx.powi(3) - 3.0 * kx * ky.powi(2)),
        ];
        (h0, d)
    }

    fn grad(&self, kx: f64, ky: f64) -> ([f64; 2], [[f64; 3]; 2]) {
        let gh0 = [2.0 * self.C2 * kx, 2.0 * self.C2 * ky];
        let gd = [
            [0.0, -self.A, 6.0 * self.R * (kx.powi(2) - ky.powi(2))],
            [self.A, 0.0, -12.0 * self.R * kx * ky],
        ];
        (gh0, gd)
    }
}

fn pauli_matrix(h0: f64, d: [f64; 3]) -> nd::Array2<C64> {
    nd::array![
        [C64::from(h0 + d[2]), C64::new(d[0], -d[1])],
        [C64::new(d[0], d[1]), C64::from(h0 - d[2])],
    ]
}

impl MatrixHamiltonian for BiTe {
    fn n_bands(&self) -> usize { 2 }

    fn h(&self, kx: f64, ky: f64) -> nd::Array2<C64> {
        let (h0, d) = self.eval(kx, ky);
        pauli_matrix(h0, d)
    }

    fn dh(&self, kx: f64, ky: f64) -> [nd::Array2<C64>; 2] {
        let (gh0, gd) = self.grad(kx, ky);
        [pauli_matrix(gh0[0], gd[0]), pauli_matrix(gh0[1], gd[1])]
    }
}

/// Evaluator for a [`DVectorModel`] using the closed-form eigenvectors
/// ```text
/// u_v = (-e^{-iφ} sin θ/2, cos θ/2)
/// u_c = (cos θ/2, e^{iφ} sin θ/2)
/// ```
/// where `d = |d| (sin θ cos φ, sin θ sin φ, cos θ)`. Intraband Berry
/// connections are `±φ' sin²(θ/2)`.
pub struct AnalyticSystem {
    model: Box<dyn DVectorModel>,
}

impl AnalyticSystem {
    pub fn new<M>(model: M) -> Self
    where M: DVectorModel + 'static
    {
        Self { model: Box::new(model) }
    }

    fn fill_point(&self, eig: &mut PathEigensystem, k: usize, kx: f64, ky: f64) {
        let (h0, d) = self.model.eval(kx, ky);
        let (gh0, gd) = self.model.grad(kx, ky);
        let dnorm = (d[0].powi(2) + d[1].powi(2) + d[2].powi(2)).sqrt();
        eig.energies[[k, 0]] = h0 - dnorm;
        eig.energies[[k, 1]] = h0 + dnorm;

        let cos_theta = if dnorm > 0.0 { d[2] / dnorm } else { 1.0 };
        let theta = cos_theta.clamp(-1.0, 1.0).acos();
        let phi = d[1].atan2(d[0]);
        let (s, c) = (theta / 2.0).sin_cos();
        let u: [[C64; 2]; 2] = [
            [-C64::from_polar(s, -phi), C64::from(c)],
            [C64::from(c), C64::from_polar(s, phi)],
        ];

        let rho2 = d[0].powi(2) + d[1].powi(2);
        for a in 0..2 {
            let dh = pauli_matrix(gh0[a], gd[a]);
            for n in 0..2 {
                for m in 0..2 {
                    let mut v = C64::from(0.0);
                    for i in 0..2 {
                        for j in 0..2 {
                            v += u[n][i].conj() * dh[[i, j]] * u[m][j];
                        }
                    }
                    eig.velocity[a][[k, n, m]] = v;
                }
            }
            let dphi = if rho2 > 1e-30 {
                (d[0] * gd[a][1] - d[1] * gd[a][0]) / rho2
            } else {
                0.0
            };
            let conn = dphi * s.powi(2);
            eig.dipole[a][[k, 0, 0]] = C64::from(conn);
            eig.dipole[a][[k, 1, 1]] = C64::from(-conn);
        }
        interband_from_velocity(eig, k);
    }
}

impl BandEvaluator for AnalyticSystem {
    fn n_bands(&self) -> usize { 2 }

    fn eigensystem(&self, kpoints: nd::ArrayView2<f64>)
        -> Result<PathEigensystem>
    {
        let nk = kpoints.shape()[0];
        let mut eig = PathEigensystem::zeros(nk, 2);
        for (k, p) in kpoints.outer_iter().enumerate() {
            self.fill_point(&mut eig, k, p[0], p[1]);
        }
        Ok(eig)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn dirac_cone_dipoles() {
        // massless Dirac cone: |d_x| = 1/(2|k|) along ky = 0
        let model = BiTe { C0: 0.0, C2: 0.0, A: 0.1, R: 0.0, mz: 0.0 };
        let sys = AnalyticSystem::new(model);
        let kx = 0.02;
        let eig = sys.eigensystem(nd::array![[kx, 0.0]].view()).unwrap();
        assert_abs_diff_eq!(eig.energies[[0, 1]], 0.1 * kx, epsilon = 1e-15);
        assert_abs_diff_eq!(eig.dipole[1][[0, 0, 1]].norm(), 0.5 / kx, epsilon = 1e-10);
        assert_abs_diff_eq!(eig.dipole[0][[0, 0, 1]].norm(), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(eig.curvature[[0, 0]], 0.0, epsilon = 1e-12);
        let ana = eig.dipole[0][[0, 0, 1]];
        assert_abs_diff_eq!(ana.norm(), eig.dipole[0][[0, 1, 0]].norm(), epsilon = 1e-12);
    }

    #[test]
    fn dipoles_are_hermitian() {
        let model = BiTe { C0: 0.01, C2: 3.0, A: 0.2, R: 2.0, mz: 0.005 };
        let sys = AnalyticSystem::new(model);
        let eig = sys.eigensystem(nd::array![[0.03, -0.01]].view()).unwrap();
        for c in 0..2 {
            let d = &eig.dipole[c];
            assert_abs_diff_eq!(d[[0, 0, 1]].re, d[[0, 1, 0]].re, epsilon = 1e-12);
            assert_abs_diff_eq!(d[[0, 0, 1]].im, -d[[0, 1, 0]].im, epsilon = 1e-12);
        }
        // gapped: curvature of the two bands is opposite
        assert_abs_diff_eq!(
            eig.curvature[[0, 0]], -eig.curvature[[0, 1]], epsilon = 1e-9);
    }
}
