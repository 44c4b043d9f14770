//! Right-hand sides of the semiconductor Bloch equations.
//!
//! The state of one k-path is a flat complex vector holding the `n × n`
//! density matrix of every point in row-major `(k, i, j)` order, followed by
//! the vector potential `A`. In the band basis,
//! ```text
//! dρ_ij/dt = -i (e_i - e_j) ρ_ij + i E Σ_m (d_mi ρ_mj - ρ_im d_jm)
//!            - γ2 ρ_ij                     (i ≠ j)
//!            - γ1 (ρ_ii - ρ⁰_ii)           (i = j)
//! dA/dt    = -E
//! ```
//! with `d` the dipole matrix projected on the field direction. In the length
//! gauge the band quantities are fixed and the field additionally drifts the
//! state along the path, `+ E (ρ[k+1] - ρ[k-1]) / (2 dk)`; in the velocity
//! gauge there is no drift and the band quantities are re-evaluated at
//! `k + A ê` at every call.
//!
//! Which of the four (gauge, band model) combinations is used is decided once
//! by [`RhsBuilder::new`].

use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use tracing::warn;
use crate::{
    config::{ BandSolver, Gauge, Params },
    error::{ Error, Result },
    field::Field,
    mesh::KMesh,
    system::{ BandEvaluator, PathEigensystem, System },
};

/// Time derivative of a path's state vector.
pub trait Derivative {
    /// Length of the state vector.
    fn dim(&self) -> usize;

    /// Number of complex entries per k-point (`n²`).
    fn block(&self) -> usize;

    /// Write `dy/dt` at `(t, y)` into `out`.
    fn eval(&self, t: f64, y: nd::ArrayView1<C64>, out: nd::ArrayViewMut1<C64>);

    fn call(&self, t: f64, y: &nd::Array1<C64>) -> nd::Array1<C64> {
        let mut out: nd::Array1<C64> = nd::Array1::zeros(self.dim());
        self.eval(t, y.view(), out.view_mut());
        out
    }
}

/// Band-basis terms at a single k-point, without drift.
type LocalTerms = fn(
    e: nd::ArrayView1<f64>,
    d: nd::ArrayView2<C64>,
    rho: nd::ArrayView1<C64>,
    rho0: nd::ArrayView1<C64>,
    E: f64,
    gamma: (f64, f64),
    out: nd::ArrayViewMut1<C64>,
);

fn local_two_band(
    e: nd::ArrayView1<f64>,
    d: nd::ArrayView2<C64>,
    rho: nd::ArrayView1<C64>,
    rho0: nd::ArrayView1<C64>,
    E: f64,
    gamma: (f64, f64),
    mut out: nd::ArrayViewMut1<C64>,
)
{
    let (g1, g2) = gamma;
    let w = d[[0, 1]] * E;
    let wd = (d[[0, 0]] - d[[1, 1]]) * E;
    let ecv = e[1] - e[0];
    let pump = 2.0 * (w * rho[1]).im;
    out[0] = C64::from(pump) - g1 * (rho[0] - rho0[0]);
    out[1]
        = (C64::i() * (ecv + wd) - g2) * rho[1]
        - C64::i() * w.conj() * (rho[0] - rho[3]);
    out[2] = out[1].conj();
    out[3] = C64::from(-pump) - g1 * (rho[3] - rho0[3]);
}

fn local_n_band(
    e: nd::ArrayView1<f64>,
    d: nd::ArrayView2<C64>,
    rho: nd::ArrayView1<C64>,
    rho0: nd::ArrayView1<C64>,
    E: f64,
    gamma: (f64, f64),
    mut out: nd::ArrayViewMut1<C64>,
)
{
    let (g1, g2) = gamma;
    let n = e.len();
    let iE = C64::i() * E;
    for i in 0..n {
        for j in 0..n {
            let mut coupling = C64::zero();
            for m in 0..n {
                coupling += d[[m, i]] * rho[m * n + j] - rho[i * n + m] * d[[j, m]];
            }
            let free = -C64::i() * (e[i] - e[j]) * rho[i * n + j];
            let damping = if i == j {
                g1 * (rho[i * n + j] - rho0[i * n + j])
            } else {
                g2 * rho[i * n + j]
            };
            out[i * n + j] = free + iE * coupling - damping;
        }
    }
}

/// Equilibrium density matrices of a path: Fermi-Dirac occupations when
/// `temperature > 1e-5`, otherwise fully occupied below `e_fermi`. The
/// trailing vector potential is zero.
pub fn initial_state(
    energies: nd::ArrayView2<f64>,
    e_fermi: f64,
    temperature: f64,
) -> nd::Array1<C64>
{
    let (nk, n) = energies.dim();
    let mut y: nd::Array1<C64> = nd::Array1::zeros(nk * n * n + 1);
    for k in 0..nk {
        for b in 0..n {
            let e = energies[[k, b]];
            let occ = if temperature > 1e-5 {
                1.0 / (((e - e_fermi) / temperature).exp() + 1.0)
            } else if e < e_fermi {
                1.0
            } else {
                0.0
            };
            y[k * n * n + b * n + b] = C64::from(occ);
        }
    }
    y
}

/// Shared settings of every path's right-hand side.
struct Common {
    field: Field,
    e_dir: [f64; 2],
    gamma: (f64, f64),
    n: usize,
    nk: usize,
    y0: nd::Array1<C64>,
    local: LocalTerms,
}

impl Common {
    fn dim(&self) -> usize { self.nk * self.n * self.n + 1 }

    fn apply_local(
        &self,
        E: f64,
        eig_e: nd::ArrayView2<f64>,
        dipole: &nd::Array3<C64>,
        y: nd::ArrayView1<C64>,
        out: &mut nd::ArrayViewMut1<C64>,
    ) {
        let m = self.n * self.n;
        for k in 0..self.nk {
            let r = s![k * m..(k + 1) * m];
            (self.local)(
                eig_e.row(k),
                dipole.slice(s![k, .., ..]),
                y.slice(r),
                self.y0.slice(r),
                E,
                self.gamma,
                out.slice_mut(r),
            );
        }
    }
}

/// Fixed band quantities and field-driven drift along the path.
struct LengthGauge {
    common: Common,
    energies: nd::Array2<f64>,
    dipole: nd::Array3<C64>,
    dk: f64,
}

impl Derivative for LengthGauge {
    fn dim(&self) -> usize { self.common.dim() }

    fn block(&self) -> usize { self.common.n * self.common.n }

    fn eval(
        &self,
        t: f64,
        y: nd::ArrayView1<C64>,
        mut out: nd::ArrayViewMut1<C64>,
    ) {
        let E = self.common.field.at(t);
        self.common.apply_local(E, self.energies.view(), &self.dipole, y, &mut out);
        let m = self.block();
        let nk = self.common.nk;
        let D = E / (2.0 * self.dk);
        for k in 0..nk {
            let kp = (k + 1) % nk;
            let km = (k + nk - 1) % nk;
            for c in 0..m {
                out[k * m + c] += D * (y[kp * m + c] - y[km * m + c]);
            }
        }
        out[nk * m] = C64::from(-E);
    }
}

/// Band quantities re-evaluated at the shifted momenta `k + A ê`.
struct VelocityGauge<'a> {
    common: Common,
    evaluator: &'a dyn BandEvaluator,
    kpath: nd::Array2<f64>,
}

impl<'a> VelocityGauge<'a> {
    fn shifted(&self, A: f64) -> Result<PathEigensystem> {
        let mut k = self.kpath.clone();
        k.column_mut(0).mapv_inplace(|kx| kx + A * self.common.e_dir[0]);
        k.column_mut(1).mapv_inplace(|ky| ky + A * self.common.e_dir[1]);
        self.evaluator.eigensystem(k.view())
    }
}

impl<'a> Derivative for VelocityGauge<'a> {
    fn dim(&self) -> usize { self.common.dim() }

    fn block(&self) -> usize { self.common.n * self.common.n }

    fn eval(
        &self,
        t: f64,
        y: nd::ArrayView1<C64>,
        mut out: nd::ArrayViewMut1<C64>,
    ) {
        let E = self.common.field.at(t);
        let last = self.dim() - 1;
        match self.shifted(y[last].re) {
            Ok(eig) => {
                let dipole = eig.dipole_along(self.common.e_dir);
                self.common.apply_local(
                    E, eig.energies.view(), &dipole, y, &mut out);
            },
            Err(err) => {
                warn!("band evaluation failed at t = {:e}: {}", t, err);
                out.fill(C64::new(f64::NAN, f64::NAN));
            },
        }
        out[last] = C64::from(-E);
    }
}

/// Selects the right-hand side for a run and instantiates it per path.
pub struct RhsBuilder<'a> {
    evaluator: &'a dyn BandEvaluator,
    field: Field,
    gauge: Gauge,
    local: LocalTerms,
    n: usize,
    gamma: (f64, f64),
    e_fermi: f64,
    temperature: f64,
    e_dir: [f64; 2],
    dk: f64,
}

impl<'a> RhsBuilder<'a> {
    /// Fails if the two-band equations are requested for a system with a
    /// different number of bands.
    pub fn new(
        params: &Params,
        mesh: &KMesh,
        system: &'a System,
        field: Field,
    ) -> Result<Self>
    {
        let n = system.n_bands();
        let local: LocalTerms = match params.solver {
            BandSolver::TwoBand if n != 2 => {
                return Err(Error::config(format!(
                    "the 2band solver needs a two-band system, got {} bands",
                    n,
                )));
            },
            BandSolver::TwoBand => local_two_band,
            BandSolver::NBand => local_n_band,
        };
        Ok(Self {
            evaluator: system.evaluator(),
            field,
            gauge: params.gauge,
            local,
            n,
            gamma: (params.gamma1(), params.gamma2()),
            e_fermi: params.e_fermi,
            temperature: params.temperature,
            e_dir: mesh.e_dir,
            dk: mesh.dk,
        })
    }

    pub fn n_bands(&self) -> usize { self.n }

    /// Right-hand side and initial state for one path, given the band
    /// quantities at its unshifted points.
    pub fn for_path(&self, kpath: nd::ArrayView2<f64>, eig: &PathEigensystem)
        -> (Box<dyn Derivative + 'a>, nd::Array1<C64>)
    {
        let y0 = initial_state(eig.energies.view(), self.e_fermi, self.temperature);
        let common = Common {
            field: self.field.clone(),
            e_dir: self.e_dir,
            gamma: self.gamma,
            n: self.n,
            nk: kpath.shape()[0],
            y0: y0.clone(),
            local: self.local,
        };
        let rhs: Box<dyn Derivative + 'a> = match self.gauge {
            Gauge::Length => Box::new(LengthGauge {
                energies: eig.energies.clone(),
                dipole: eig.dipole_along(self.e_dir),
                dk: self.dk,
                common,
            }),
            Gauge::Velocity => Box::new(VelocityGauge {
                common,
                evaluator: self.evaluator,
                kpath: kpath.to_owned(),
            }),
        };
        (rhs, y0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{
        field::Pulse,
        mesh::rect_mesh,
        system::{ AnalyticSystem, BiTe },
    };

    fn system() -> System {
        System::Ana(AnalyticSystem::new(
            BiTe { C0: 0.0, C2: 0.0, A: 0.19732, R: 0.0, mz: 0.0 }
        ))
    }

    fn random_state(dim: usize) -> nd::Array1<C64> {
        // deterministic, Hermitian per block
        let mut y: nd::Array1<C64> = nd::Array1::from_shape_fn(dim, |i| {
            C64::new((0.37 * i as f64).sin(), (0.91 * i as f64).cos())
        });
        for k in 0..(dim - 1) / 4 {
            y[4 * k] = C64::from(y[4 * k].re);
            y[4 * k + 3] = C64::from(y[4 * k + 3].re);
            y[4 * k + 2] = y[4 * k + 1].conj();
        }
        y[dim - 1] = C64::from(0.01);
        y
    }

    #[test]
    fn two_band_matches_n_band() {
        let sys = system();
        let mesh = rect_mesh(6, 1, 0.5, 0.1, 0.2);
        let field: Field = Pulse { E0: 1e-3, f: 1e-3, sigma: 400.0, chirp: 0.0, phase: 0.4 }.into();
        for gauge in [Gauge::Length, Gauge::Velocity] {
            let mut outs = Vec::new();
            for solver in [BandSolver::TwoBand, BandSolver::NBand] {
                let mut builder = RhsBuilder::new(
                    &test_params(solver, gauge), &mesh, &sys, field.clone()).unwrap();
                builder.gamma = (0.01, 0.03);
                let kpath = mesh.path(0);
                let eig = sys.evaluator().eigensystem(kpath).unwrap();
                let (rhs, y0) = builder.for_path(kpath, &eig);
                let y = random_state(y0.len());
                outs.push(rhs.call(25.0, &y));
            }
            for (a, b) in outs[0].iter().zip(outs[1].iter()) {
                assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-12);
                assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn zero_field_equilibrium_is_stationary() {
        let sys = system();
        let mesh = rect_mesh(5, 2, 0.5, 0.1, 0.0);
        for gauge in [Gauge::Length, Gauge::Velocity] {
            let params = test_params(BandSolver::TwoBand, gauge);
            let builder = RhsBuilder::new(&params, &mesh, &sys, Field::zero()).unwrap();
            let kpath = mesh.path(1);
            let eig = sys.evaluator().eigensystem(kpath).unwrap();
            let (rhs, y0) = builder.for_path(kpath, &eig);
            let dy = rhs.call(0.0, &y0);
            assert!(dy.iter().all(|z| z.norm() < 1e-15));
        }
    }

    #[test]
    fn two_band_rejects_other_band_counts() {
        use crate::system::{ MatrixHamiltonian, NumericSystem };
        struct Three;
        impl MatrixHamiltonian for Three {
            fn n_bands(&self) -> usize { 3 }
            fn h(&self, _kx: f64, _ky: f64) -> nd::Array2<C64> {
                nd::Array2::eye(3)
            }
        }
        let sys = System::Num(NumericSystem::new(Three, 0).unwrap());
        let mesh = rect_mesh(3, 1, 0.5, 0.1, 0.0);
        let params = test_params(BandSolver::TwoBand, Gauge::Length);
        assert!(matches!(
            RhsBuilder::new(&params, &mesh, &sys, Field::zero()),
            Err(Error::Config(_)),
        ));
    }

    #[test]
    fn thermal_initial_state() {
        let e = nd::array![[-0.1, 0.1], [-0.05, 0.05]];
        let cold = initial_state(e.view(), 0.0, 0.0);
        assert_eq!(cold.len(), 9);
        assert_eq!(cold[0], C64::from(1.0));
        assert_eq!(cold[3], C64::from(0.0));
        let hot = initial_state(e.view(), 0.0, 0.05);
        assert_abs_diff_eq!(hot[0].re + hot[3].re, 1.0, epsilon = 1e-14);
        assert!(hot[3].re > 0.0);
    }

    pub(crate) fn test_params(solver: BandSolver, gauge: Gauge) -> Params {
        crate::solver::test::small_params(solver, gauge)
    }
}
