//! Integration of the Bloch equations for one parameter combination.

use std::time::Instant;
use tracing::{ debug, info, warn };
use crate::{
    config::Params,
    error::Result,
    field::Field,
    fourier::FrequencyContainers,
    group::ProcessGroup,
    integrate::make_integrator,
    mesh::{ KMesh, make_bz },
    observables::{ CurrentCalculator, TimeContainers },
    rhs::RhsBuilder,
    system::System,
};

/// Finished time- and frequency-domain results of one combination.
#[derive(Clone, Debug)]
pub struct RunResult {
    pub params: Params,
    pub time: TimeContainers,
    pub freq: FrequencyContainers,
}

/// Run one combination with the Gaussian pulse of `params`.
///
/// `paths` are the mesh paths owned by this process; contributions are
/// summed over `group`, which must hold every owner of the combination.
pub fn run_sbe<G>(
    params: &Params,
    system: &System,
    paths: &[usize],
    group: &G,
) -> Result<RunResult>
where G: ProcessGroup
{
    run_sbe_with_field(params, system, Field::from(params.pulse), paths, group)
}

/// Like [`run_sbe`], driven by an arbitrary field.
pub fn run_sbe_with_field<G>(
    params: &Params,
    system: &System,
    field: Field,
    paths: &[usize],
    group: &G,
) -> Result<RunResult>
where G: ProcessGroup
{
    let mesh = make_bz(params)?;
    let builder = RhsBuilder::new(params, &mesh, system, field.clone())?;
    let mut T = TimeContainers::new(params, &mesh, builder.n_bands());
    info!(
        "{}: {} system, {} local paths of {} points, Nt = {}",
        params.header(), system.label(), paths.len(),
        mesh.points_per_path(), params.Nt,
    );

    let start = Instant::now();
    for &j in paths.iter() {
        integrate_path(params, &mesh, system, &builder, &field, j, &mut T);
    }
    info!("{}: paths done in {:.2?}", params.header(), start.elapsed());

    T.reduce(group);
    T.finalize(mesh.kweight, params.gamma2());
    let truncated = T.truncated_paths();
    if !truncated.is_empty() && group.rank() == 0 {
        warn!("{}: truncated paths {:?}", params.header(), truncated);
    }
    let W = FrequencyContainers::from_time(params, &T);
    Ok(RunResult { params: params.clone(), time: T, freq: W })
}

fn integrate_path(
    params: &Params,
    mesh: &KMesh,
    system: &System,
    builder: &RhsBuilder,
    field: &Field,
    j: usize,
    T: &mut TimeContainers,
) {
    let Nt = params.Nt;
    let kpath = mesh.path(j);
    let eig = match system.evaluator().eigensystem(kpath) {
        Ok(eig) => eig,
        Err(err) => {
            warn!("path {}: band evaluation failed: {}", j, err);
            T.mark_truncated(j, 0);
            return;
        },
    };
    let (rhs, y0) = builder.for_path(kpath, &eig);
    let calc = CurrentCalculator::new(
        params, mesh, system.evaluator(), kpath, &eig);
    let mut integrator = make_integrator(params.method, params.dt);
    integrator.reset(params.time(0), y0);

    let report = (Nt / 20).max(1);
    let mut complete = true;
    for ti in 0..Nt {
        let t = params.time(ti);
        let y = integrator.state();
        let E = field.at(t);
        T.record_time(ti, t, E, y[y.len() - 1].re);
        T.store_solution(j, ti, y);
        match calc.currents(y, E) {
            Ok(c) => { T.add_currents(ti, &c); },
            Err(err) => {
                warn!("path {}: observables failed at step {}: {}", j, ti, err);
                T.mark_truncated(j, ti);
                complete = false;
                break;
            },
        }
        if ti % report == 0 {
            debug!("path {}: {:.0}%", j, 100.0 * ti as f64 / Nt as f64);
        }
        if ti + 1 == Nt { break; }
        if !integrator.advance(rhs.as_ref(), params.time(ti + 1)) {
            warn!("path {}: integration failed after step {}", j, ti);
            T.mark_truncated(j, ti);
            complete = false;
            break;
        }
    }
    // a truncated path leaves the rest of the time axis to the next one
    if complete { T.lock_time_axis(); }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::{
        config::{ BandSolver, BzGeometry, Gauge, Method, WindowFunction },
        field::Pulse,
        group::SerialGroup,
        system::{ AnalyticSystem, BiTe, MatrixHamiltonian, NumericSystem },
    };
    use num_complex::Complex64 as C64;

    /// Small rectangular run in atomic units.
    pub(crate) fn small_params(solver: BandSolver, gauge: Gauge) -> Params {
        Params {
            bz: BzGeometry::Rectangle {
                length_e_dir: 0.2,
                length_ortho: 0.05,
                angle: 0.0,
            },
            Nk1: 8,
            Nk2: 2,
            pulse: Pulse { E0: 5e-4, f: 1.5e-3, sigma: 300.0, chirp: 0.0, phase: 0.0 },
            T1: 1000.0,
            T2: 100.0,
            e_fermi: 0.0,
            temperature: 0.0,
            t0: -800.0,
            dt: 2.0,
            Nt: 801,
            gauge,
            solver,
            method: Method::Rk4,
            split_current: true,
            save_full: false,
            dm_times: Vec::new(),
            point_parallel: false,
            window: WindowFunction::Gaussian,
            gaussian_window_width: 400.0,
            factor_freq_resolution: 1,
            index: 0,
            scan: Vec::new(),
        }
    }

    pub(crate) fn small_system() -> System {
        System::Ana(AnalyticSystem::new(
            BiTe { C0: 0.0, C2: 0.0, A: 0.1, R: 0.0, mz: 0.01 }
        ))
    }

    #[test]
    fn zero_field_gives_zero_current() {
        let sys = small_system();
        for gauge in [Gauge::Length, Gauge::Velocity] {
            let mut params = small_params(BandSolver::TwoBand, gauge);
            params.Nt = 51;
            params.pulse.E0 = 0.0;
            let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
            assert!(res.time.j_E_dir.iter().all(|j| j.abs() < 1e-14));
            assert!(res.time.j_ortho.iter().all(|j| j.abs() < 1e-14));
            assert!(res.time.truncated_paths().is_empty());
        }
    }

    #[test]
    fn time_axis_matches_grid() {
        let sys = small_system();
        let mut params = small_params(BandSolver::TwoBand, Gauge::Length);
        params.Nt = 21;
        let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
        for (ti, t) in res.time.t.iter().enumerate() {
            assert_abs_diff_eq!(*t, params.time(ti), epsilon = 1e-12);
        }
        assert_eq!(res.freq.freq.len(), 21);
        // A = -∫E dt starts at zero
        assert_eq!(res.time.A_field[0], 0.0);
    }

    #[test]
    fn pulse_drives_current_and_full_solution_is_kept() {
        let sys = small_system();
        let mut params = small_params(BandSolver::TwoBand, Gauge::Length);
        params.save_full = true;
        let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
        let jmax = res.time.j_E_dir.iter().fold(0.0_f64, |m, j| m.max(j.abs()));
        assert!(jmax > 0.0);
        let sol = res.time.solution.as_ref().unwrap();
        assert_eq!(sol.dim(), (8, 2, 801, 2, 2));
        for k in 0..8 {
            for j in 0..2 {
                assert_abs_diff_eq!(sol[[k, j, 0, 0, 0]].re, 1.0, epsilon = 1e-15);
                assert_abs_diff_eq!(sol[[k, j, 0, 1, 1]].re, 0.0, epsilon = 1e-15);
            }
        }
        let sp = res.time.split.as_ref().unwrap();
        let full = sp.j_anom_ortho.sum_axis(ndarray::Axis(1));
        assert_eq!(full, sp.j_anom_ortho_full);
    }

    #[test]
    fn dm_snapshots_match_full_solution() {
        let sys = small_system();
        let mut params = small_params(BandSolver::TwoBand, Gauge::Velocity);
        params.Nt = 101;
        params.save_full = true;
        params.dm_times = vec![params.time(0), params.time(60) - 0.5];
        let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
        let snap = res.time.snapshots.as_ref().unwrap();
        let sol = res.time.solution.as_ref().unwrap();
        assert_eq!(snap.rho.dim(), (8, 2, 2, 2, 2));
        assert_abs_diff_eq!(snap.t[1], params.time(60), epsilon = 1e-12);
        for (i, ti) in [0, 60].into_iter().enumerate() {
            for k in 0..8 {
                for j in 0..2 {
                    assert_eq!(
                        snap.rho.slice(ndarray::s![k, j, i, .., ..]),
                        sol.slice(ndarray::s![k, j, ti, .., ..]),
                    );
                }
            }
        }
    }

    // relative L2 distance over the interior of the grid
    fn interior_distance(a: &ndarray::Array1<f64>, b: &ndarray::Array1<f64>) -> f64 {
        let n = a.len();
        let (mut num, mut den) = (0.0, 0.0);
        for i in 1..n - 1 {
            num += (a[i] - b[i]).powi(2);
            den += a[i].powi(2);
        }
        (num / den).sqrt()
    }

    #[test]
    fn weak_field_current_is_intraband_plus_polarization() {
        let sys = small_system();
        for gauge in [Gauge::Length, Gauge::Velocity] {
            let mut params = small_params(BandSolver::TwoBand, gauge);
            params.pulse.E0 = 1e-7;
            let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
            let sp = res.time.split.as_ref().unwrap();
            let balance = &sp.j_intra_plus_dtP_E_dir + &sp.j_deph_E_dir;
            let err = interior_distance(&res.time.j_E_dir, &balance);
            assert!(err < 1e-2, "{:?}: relative deviation {}", gauge, err);
            let P = sp.P_E_dir[400];
            assert!(P != 0.0);
            assert_abs_diff_eq!(
                sp.j_deph_E_dir[400], P / params.T2, epsilon = 1e-12 * P.abs());
        }
    }

    /// Two bands whose Hamiltonian is malformed on the upper half of the
    /// zone, so that diagonalization fails there.
    struct BrokenAbove;

    impl MatrixHamiltonian for BrokenAbove {
        fn n_bands(&self) -> usize { 2 }

        fn h(&self, kx: f64, ky: f64) -> ndarray::Array2<C64> {
            if ky > 0.0 { return ndarray::Array2::zeros((2, 3)); }
            let t = C64::new(0.1 * kx, 0.1 * ky);
            ndarray::array![[C64::from(-0.02), t], [t.conj(), C64::from(0.02)]]
        }
    }

    #[test]
    fn failed_band_evaluation_truncates_the_path() {
        let sys = System::Num(NumericSystem::new(BrokenAbove, 0).unwrap());
        let mut params = small_params(BandSolver::TwoBand, Gauge::Length);
        params.Nt = 201;
        let res = run_sbe(&params, &sys, &[0, 1], &SerialGroup).unwrap();
        assert_eq!(res.time.truncated_paths().len(), 1);
        assert_eq!(res.time.truncated_at.sum(), 1.0);
        assert!(res.time.j_E_dir.iter().all(|j| j.is_finite()));
        assert!(res.time.j_E_dir.iter().any(|j| *j != 0.0));
        assert_abs_diff_eq!(res.time.t[200], params.time(200), epsilon = 1e-12);
    }
}
