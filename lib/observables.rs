//! Per-timestep observables and the time-domain result containers.
//!
//! With `ρ` the stored band-basis density matrix of a point, `v` and `d` the
//! band-basis velocity and dipole matrices projected on a direction, and `Ω`
//! the Berry curvature:
//! ```text
//! j       = -Σ_k Σ_nm Re(ρ_nm v_nm)          exact current
//! P       =  Σ_k Σ_{n≠m} Re(ρ_nm d_nm)       interband polarization
//! j_intra = -Σ_k Σ_n ρ_nn v_nn               intraband current
//! j_anom  = -E Σ_k ρ_nn Ω_n                  anomalous current (ortho, per band)
//! j_deph  =  P / T2                          dephasing current
//! ```
//! Up to terms of second order in the field, `j = j_intra + dP/dt + j_deph`.
//! Sums cover the locally owned paths; the k-point weight is applied once
//! after the sub-group reduction.

use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use crate::{
    config::{ Gauge, Params },
    error::Result,
    group::ProcessGroup,
    mesh::KMesh,
    system::{ BandEvaluator, PathEigensystem },
};

/// Band-basis operators of a path, projected on the field and orthogonal
/// directions.
struct Operators {
    v_dir: nd::Array3<C64>,
    v_ort: nd::Array3<C64>,
    d_dir: nd::Array3<C64>,
    d_ort: nd::Array3<C64>,
    curvature: nd::Array2<f64>,
}

impl Operators {
    fn new(eig: &PathEigensystem, e_dir: [f64; 2], e_ort: [f64; 2]) -> Self {
        Self {
            v_dir: eig.velocity_along(e_dir),
            v_ort: eig.velocity_along(e_ort),
            d_dir: eig.dipole_along(e_dir),
            d_ort: eig.dipole_along(e_ort),
            curvature: eig.curvature.clone(),
        }
    }
}

/// Observable values of one path at one time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathCurrents {
    pub j_E_dir: f64,
    pub j_ortho: f64,
    pub P_E_dir: f64,
    pub P_ortho: f64,
    pub j_intra_E_dir: f64,
    pub j_intra_ortho: f64,
    pub j_anom_ortho: Vec<f64>,
}

/// Evaluates the observables of a single path.
pub struct CurrentCalculator<'a> {
    evaluator: &'a dyn BandEvaluator,
    kpath: nd::Array2<f64>,
    e_dir: [f64; 2],
    e_ort: [f64; 2],
    n: usize,
    split: bool,
    /// Length gauge: operators at the fixed path points.
    fixed: Option<Operators>,
}

impl<'a> CurrentCalculator<'a> {
    pub fn new(
        params: &Params,
        mesh: &KMesh,
        evaluator: &'a dyn BandEvaluator,
        kpath: nd::ArrayView2<f64>,
        eig: &PathEigensystem,
    ) -> Self
    {
        let fixed = match params.gauge {
            Gauge::Length => Some(Operators::new(eig, mesh.e_dir, mesh.e_ort)),
            Gauge::Velocity => None,
        };
        Self {
            evaluator,
            kpath: kpath.to_owned(),
            e_dir: mesh.e_dir,
            e_ort: mesh.e_ort,
            n: eig.n_bands(),
            split: params.split_current,
            fixed,
        }
    }

    /// Observables of state `y` under field `E`. In the velocity gauge the
    /// band quantities are evaluated at `k + A ê`.
    pub fn currents(&self, y: &nd::Array1<C64>, E: f64) -> Result<PathCurrents> {
        let shifted: Operators;
        let ops = match &self.fixed {
            Some(ops) => ops,
            None => {
                let A = y[y.len() - 1].re;
                let mut k = self.kpath.clone();
                k.column_mut(0).mapv_inplace(|kx| kx + A * self.e_dir[0]);
                k.column_mut(1).mapv_inplace(|ky| ky + A * self.e_dir[1]);
                let eig = self.evaluator.eigensystem(k.view())?;
                shifted = Operators::new(&eig, self.e_dir, self.e_ort);
                &shifted
            },
        };
        let n = self.n;
        let nk = self.kpath.nrows();
        let mut out = PathCurrents {
            j_anom_ortho: vec![0.0; n],
            ..PathCurrents::default()
        };
        for k in 0..nk {
            let rho = y.slice(s![k * n * n..(k + 1) * n * n]);
            for a in 0..n {
                for b in 0..n {
                    let r = rho[a * n + b];
                    out.j_E_dir -= (r * ops.v_dir[[k, a, b]]).re;
                    out.j_ortho -= (r * ops.v_ort[[k, a, b]]).re;
                    if !self.split { continue; }
                    if a == b {
                        out.j_intra_E_dir -= r.re * ops.v_dir[[k, a, a]].re;
                        out.j_intra_ortho -= r.re * ops.v_ort[[k, a, a]].re;
                        out.j_anom_ortho[a] -= E * r.re * ops.curvature[[k, a]];
                    } else {
                        out.P_E_dir += (r * ops.d_dir[[k, a, b]]).re;
                        out.P_ortho += (r * ops.d_ort[[k, a, b]]).re;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Split-current time series and the sums derived from them.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitCurrents {
    pub P_E_dir: nd::Array1<f64>,
    pub P_ortho: nd::Array1<f64>,
    pub j_intra_E_dir: nd::Array1<f64>,
    pub j_intra_ortho: nd::Array1<f64>,
    /// Shape `(Nt, n)`.
    pub j_anom_ortho: nd::Array2<f64>,
    pub dtP_E_dir: nd::Array1<f64>,
    pub dtP_ortho: nd::Array1<f64>,
    pub j_intra_plus_dtP_E_dir: nd::Array1<f64>,
    pub j_intra_plus_dtP_ortho: nd::Array1<f64>,
    pub j_anom_ortho_full: nd::Array1<f64>,
    pub j_intra_plus_anom_ortho: nd::Array1<f64>,
    pub j_deph_E_dir: nd::Array1<f64>,
    pub j_deph_ortho: nd::Array1<f64>,
}

impl SplitCurrents {
    fn new(Nt: usize, n: usize) -> Self {
        let z = || nd::Array1::zeros(Nt);
        Self {
            P_E_dir: z(),
            P_ortho: z(),
            j_intra_E_dir: z(),
            j_intra_ortho: z(),
            j_anom_ortho: nd::Array2::zeros((Nt, n)),
            dtP_E_dir: z(),
            dtP_ortho: z(),
            j_intra_plus_dtP_E_dir: z(),
            j_intra_plus_dtP_ortho: z(),
            j_anom_ortho_full: z(),
            j_intra_plus_anom_ortho: z(),
            j_deph_E_dir: z(),
            j_deph_ortho: z(),
        }
    }
}

/// Density matrices of every point at selected output steps.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshots {
    steps: Vec<usize>,
    /// Time of each snapshot.
    pub t: nd::Array1<f64>,
    /// Shape `(points per path, paths, snapshots, n, n)`.
    pub rho: nd::Array5<C64>,
}

impl Snapshots {
    fn new(params: &Params, mesh: &KMesh, n: usize) -> Self {
        let steps = params.dm_steps();
        let t = steps.iter().map(|ti| params.time(*ti)).collect();
        let rho = nd::Array5::zeros(
            (mesh.points_per_path(), mesh.n_paths(), steps.len(), n, n));
        Self { steps, t, rho }
    }
}

/// Copy the per-point blocks of state `y` into `dest[k, a, b]`.
fn unpack_state(y: &nd::Array1<C64>, mut dest: nd::ArrayViewMut3<C64>) {
    let (nk, n, _) = dest.dim();
    for k in 0..nk {
        for a in 0..n {
            for b in 0..n {
                dest[[k, a, b]] = y[k * n * n + a * n + b];
            }
        }
    }
}

/// Time-domain results of one parameter combination.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeContainers {
    pub t: nd::Array1<f64>,
    pub E_field: nd::Array1<f64>,
    pub A_field: nd::Array1<f64>,
    pub j_E_dir: nd::Array1<f64>,
    pub j_ortho: nd::Array1<f64>,
    pub split: Option<SplitCurrents>,
    /// Density matrices, shape `(points per path, paths, Nt, n, n)`.
    pub solution: Option<nd::Array5<C64>>,
    pub snapshots: Option<Snapshots>,
    /// For each path, one past the output step at which it was cut short,
    /// zero if it completed.
    pub truncated_at: nd::Array1<f64>,
    time_written: bool,
}

impl TimeContainers {
    pub fn new(params: &Params, mesh: &KMesh, n: usize) -> Self {
        let Nt = params.Nt;
        let solution = params.save_full.then(|| {
            nd::Array5::zeros(
                (mesh.points_per_path(), mesh.n_paths(), Nt, n, n))
        });
        Self {
            t: nd::Array1::zeros(Nt),
            E_field: nd::Array1::zeros(Nt),
            A_field: nd::Array1::zeros(Nt),
            j_E_dir: nd::Array1::zeros(Nt),
            j_ortho: nd::Array1::zeros(Nt),
            split: params.split_current.then(|| SplitCurrents::new(Nt, n)),
            solution,
            snapshots: (!params.dm_times.is_empty())
                .then(|| Snapshots::new(params, mesh, n)),
            truncated_at: nd::Array1::zeros(mesh.n_paths()),
            time_written: false,
        }
    }

    pub fn Nt(&self) -> usize { self.t.len() }

    /// Whether the time axis and fields still need to be written.
    pub fn needs_time_axis(&self) -> bool { !self.time_written }

    /// Called once the first path has been integrated.
    pub fn lock_time_axis(&mut self) { self.time_written = true; }

    pub fn record_time(&mut self, ti: usize, t: f64, E: f64, A: f64) {
        if self.time_written { return; }
        self.t[ti] = t;
        self.E_field[ti] = E;
        self.A_field[ti] = A;
    }

    pub fn add_currents(&mut self, ti: usize, c: &PathCurrents) {
        self.j_E_dir[ti] += c.j_E_dir;
        self.j_ortho[ti] += c.j_ortho;
        if let Some(sp) = self.split.as_mut() {
            sp.P_E_dir[ti] += c.P_E_dir;
            sp.P_ortho[ti] += c.P_ortho;
            sp.j_intra_E_dir[ti] += c.j_intra_E_dir;
            sp.j_intra_ortho[ti] += c.j_intra_ortho;
            sp.j_anom_ortho.row_mut(ti).iter_mut().zip(c.j_anom_ortho.iter())
                .for_each(|(acc, x)| { *acc += x; });
        }
    }

    /// Store the state of `path` at output step `ti` in the full solution
    /// and in every snapshot taken at that step.
    pub fn store_solution(&mut self, path: usize, ti: usize, y: &nd::Array1<C64>) {
        if let Some(sol) = self.solution.as_mut() {
            unpack_state(y, sol.slice_mut(s![.., path, ti, .., ..]));
        }
        if let Some(snap) = self.snapshots.as_mut() {
            for (i, step) in snap.steps.iter().enumerate() {
                if *step == ti {
                    unpack_state(y, snap.rho.slice_mut(s![.., path, i, .., ..]));
                }
            }
        }
    }

    pub fn mark_truncated(&mut self, path: usize, steps_done: usize) {
        self.truncated_at[path] = (steps_done + 1) as f64;
    }

    /// Indices of the paths that were cut short.
    pub fn truncated_paths(&self) -> Vec<usize> {
        self.truncated_at.iter().enumerate()
            .filter(|(_, s)| **s > 0.0)
            .map(|(j, _)| j)
            .collect()
    }

    /// Sum the per-process contributions across `group`. The time axis and
    /// fields are identical on every member and are not reduced.
    pub fn reduce<G>(&mut self, group: &G)
    where G: ProcessGroup
    {
        group.sum_array(&mut self.j_E_dir);
        group.sum_array(&mut self.j_ortho);
        if let Some(sp) = self.split.as_mut() {
            group.sum_array(&mut sp.P_E_dir);
            group.sum_array(&mut sp.P_ortho);
            group.sum_array(&mut sp.j_intra_E_dir);
            group.sum_array(&mut sp.j_intra_ortho);
            group.sum_array(&mut sp.j_anom_ortho);
        }
        if let Some(sol) = self.solution.as_mut() {
            group.sum_complex_array(sol);
        }
        if let Some(snap) = self.snapshots.as_mut() {
            group.sum_complex_array(&mut snap.rho);
        }
        group.sum_array(&mut self.truncated_at);
    }

    /// Apply the k-point weight and compute the derived series; `gamma2` is
    /// the interband dephasing rate.
    pub fn finalize(&mut self, kweight: f64, gamma2: f64) {
        self.j_E_dir *= kweight;
        self.j_ortho *= kweight;
        let t = self.t.clone();
        if let Some(sp) = self.split.as_mut() {
            sp.P_E_dir *= kweight;
            sp.P_ortho *= kweight;
            sp.j_intra_E_dir *= kweight;
            sp.j_intra_ortho *= kweight;
            sp.j_anom_ortho *= kweight;
            sp.dtP_E_dir = diff(&t, &sp.P_E_dir);
            sp.dtP_ortho = diff(&t, &sp.P_ortho);
            sp.j_intra_plus_dtP_E_dir = &sp.j_intra_E_dir + &sp.dtP_E_dir;
            sp.j_intra_plus_dtP_ortho = &sp.j_intra_ortho + &sp.dtP_ortho;
            sp.j_anom_ortho_full = sp.j_anom_ortho.sum_axis(nd::Axis(1));
            sp.j_intra_plus_anom_ortho = &sp.j_intra_ortho + &sp.j_anom_ortho_full;
            sp.j_deph_E_dir = &sp.P_E_dir * gamma2;
            sp.j_deph_ortho = &sp.P_ortho * gamma2;
        }
    }
}

/// Centered difference quotient `(y[i+1] - y[i-1]) / (x[i+1] - x[i-1])`
/// with periodic wrap-around at the ends.
pub fn diff(x: &nd::Array1<f64>, y: &nd::Array1<f64>) -> nd::Array1<f64> {
    let n = x.len();
    if n < 3 { return nd::Array1::zeros(n); }
    nd::Array1::from_shape_fn(n, |i| {
        let (p, m) = ((i + 1) % n, (i + n - 1) % n);
        (y[p] - y[m]) / (x[p] - x[m])
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn diff_of_line_is_slope_inside() {
        let x = nd::Array1::linspace(0.0, 1.0, 11);
        let y = x.mapv(|v| 3.0 * v + 1.0);
        let d = diff(&x, &y);
        for v in d.slice(s![1..10]).iter() {
            assert_abs_diff_eq!(*v, 3.0, epsilon = 1e-12);
        }
    }
}
