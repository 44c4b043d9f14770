//! Time integration of a path's state vector between output times.
//!
//! [`Rk4`] takes exactly one classic fourth-order Runge-Kutta step per output
//! interval. [`Adaptive`] runs a variable-step, second-order multistep scheme
//! underneath the output grid, with internal steps no longer than the output
//! step and landing exactly on every output time:
//! - [`Method::Adams`]: Adams-Bashforth/Adams-Moulton predictor-corrector
//!   (PECE), started with Heun's method;
//! - [`Method::Bdf`]: backward differentiation (BDF2, started with backward
//!   Euler), with the implicit corrector solved by simplified Newton
//!   iteration on a block-diagonal finite-difference Jacobian.
//!
//! Step sizes are controlled on the weighted RMS norm of the local error
//! estimate. The history of the multistep schemes carries over from one
//! output interval to the next.

use ndarray::{ self as nd, s };
use ndarray_linalg::{ Factorize, LUFactorized, Solve };
use num_complex::Complex64 as C64;
use crate::{
    config::Method,
    rhs::Derivative,
};

/// Relative tolerance of the adaptive schemes.
pub const RTOL: f64 = 1e-6;

/// Absolute tolerance of the adaptive schemes.
pub const ATOL: f64 = 1e-12;

/// Maximum number of internal steps per output interval.
pub const MAX_SUBSTEPS: usize = 500;

/// Smallest allowed internal step, relative to the output step.
pub const MIN_STEP_FACTOR: f64 = 1e-10;

/// Advances a state vector to successive output times.
pub trait Integrator {
    /// Start a new trajectory at `(t0, y0)`, discarding any history.
    fn reset(&mut self, t0: f64, y0: nd::Array1<C64>);

    /// Advance the state to `t_target`. Returns `false` if the scheme gave up;
    /// the state is then left at the last successful internal step.
    fn advance(&mut self, rhs: &dyn Derivative, t_target: f64) -> bool;

    fn state(&self) -> &nd::Array1<C64>;

    fn time(&self) -> f64;
}

/// Construct the integrator for `method` with output step `dt`.
pub fn make_integrator(method: Method, dt: f64) -> Box<dyn Integrator> {
    match method {
        Method::Rk4 => Box::new(Rk4::new(dt)),
        Method::Adams => Box::new(Adaptive::new(Scheme::Adams, dt)),
        Method::Bdf => Box::new(Adaptive::new(Scheme::Bdf, dt)),
    }
}

/* RK4 ************************************************************************/

/// Classic four-stage Runge-Kutta.
#[derive(Clone, Debug)]
pub struct Rk4 {
    t: f64,
    y: nd::Array1<C64>,
}

impl Rk4 {
    pub fn new(_dt: f64) -> Self { Self { t: 0.0, y: nd::Array1::zeros(0) } }
}

/// A single fourth-order Runge-Kutta step of size `h`.
pub fn rk4_step(
    rhs: &dyn Derivative,
    t: f64,
    y: &nd::Array1<C64>,
    h: f64,
) -> nd::Array1<C64>
{
    let k1: nd::Array1<C64>;
    let k2: nd::Array1<C64>;
    let k3: nd::Array1<C64>;
    let k4: nd::Array1<C64>;
    k1 = rhs.call(t, y);
    k2 = rhs.call(t + h / 2.0, &(&k1 * (h / 2.0) + y));
    k3 = rhs.call(t + h / 2.0, &(&k2 * (h / 2.0) + y));
    k4 = rhs.call(t + h, &(&k3 * h + y));
    (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0) + y
}

impl Integrator for Rk4 {
    fn reset(&mut self, t0: f64, y0: nd::Array1<C64>) {
        self.t = t0;
        self.y = y0;
    }

    fn advance(&mut self, rhs: &dyn Derivative, t_target: f64) -> bool {
        let h = t_target - self.t;
        if h != 0.0 {
            self.y = rk4_step(rhs, self.t, &self.y, h);
        }
        self.t = t_target;
        self.y.iter().all(|z| z.re.is_finite() && z.im.is_finite())
    }

    fn state(&self) -> &nd::Array1<C64> { &self.y }

    fn time(&self) -> f64 { self.t }
}

/* Adaptive multistep *********************************************************/

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    Adams,
    Bdf,
}

/// Weighted RMS norm of `err` relative to the tolerances at `y0` and `y1`;
/// non-finite entries give `+∞`.
pub fn error_norm(
    err: &nd::Array1<C64>,
    y0: &nd::Array1<C64>,
    y1: &nd::Array1<C64>,
) -> f64
{
    let n = err.len().max(1) as f64;
    let sq: f64
        = err.iter().zip(y0.iter().zip(y1.iter()))
        .map(|(e, (a, b))| {
            let w = ATOL + RTOL * a.norm().max(b.norm());
            (e.norm() / w).powi(2)
        })
        .sum();
    let norm = (sq / n).sqrt();
    if norm.is_finite() { norm } else { f64::INFINITY }
}

/// Accepted point kept for the next multistep step.
#[derive(Clone, Debug)]
struct History {
    h: f64,
    y: nd::Array1<C64>,
    f: nd::Array1<C64>,
}

/// LU factors of the Newton iteration matrix `I - βh J`, one per k-point.
struct NewtonMatrix {
    beta_h: f64,
    blocks: Vec<LUFactorized<nd::OwnedRepr<f64>>>,
}

/// Variable-step second-order multistep integrator.
pub struct Adaptive {
    scheme: Scheme,
    h_max: f64,
    t: f64,
    y: nd::Array1<C64>,
    f: Option<nd::Array1<C64>>,
    prev: Option<History>,
    h: f64,
    jacobian: Option<Vec<nd::Array2<f64>>>,
    newton: Option<NewtonMatrix>,
}

enum Attempt {
    Accepted { y: nd::Array1<C64>, f: nd::Array1<C64>, err: f64 },
    Rejected { err: f64 },
    NoConvergence,
}

impl Adaptive {
    pub fn new(scheme: Scheme, dt: f64) -> Self {
        Self {
            scheme,
            h_max: dt.abs(),
            t: 0.0,
            y: nd::Array1::zeros(0),
            f: None,
            prev: None,
            h: 0.1 * dt.abs(),
            jacobian: None,
            newton: None,
        }
    }

    fn step_factor(err: f64) -> f64 {
        if err == 0.0 {
            2.0
        } else {
            (0.9 * err.powf(-1.0 / 3.0)).clamp(0.2, 2.0)
        }
    }

    // AB2 (variable step) predictor, or explicit Euler without history
    fn predict(&self, f: &nd::Array1<C64>, h: f64) -> nd::Array1<C64> {
        match &self.prev {
            Some(prev) => {
                let w = h / prev.h;
                (f * (1.0 + w / 2.0) - &prev.f * (w / 2.0)) * h + &self.y
            },
            None => f * h + &self.y,
        }
    }

    fn attempt_adams(
        &mut self,
        rhs: &dyn Derivative,
        f: &nd::Array1<C64>,
        h: f64,
    ) -> Attempt
    {
        let yp = self.predict(f, h);
        let fp = rhs.call(self.t + h, &yp);
        let yc = (f + &fp) * (h / 2.0) + &self.y;
        let coef = if self.prev.is_some() { 1.0 / 6.0 } else { 0.5 };
        let err = coef * error_norm(&(&yc - &yp), &self.y, &yc);
        if err <= 1.0 {
            let fc = rhs.call(self.t + h, &yc);
            Attempt::Accepted { y: yc, f: fc, err }
        } else {
            Attempt::Rejected { err }
        }
    }

    /// Real `2m × 2m` Jacobian blocks of the local terms at `(t, y)`, by
    /// perturbing one component of every k-point at once. Couplings between
    /// neighboring points cancel in the difference.
    fn compute_jacobian(
        rhs: &dyn Derivative,
        t: f64,
        y: &nd::Array1<C64>,
        f: &nd::Array1<C64>,
    ) -> Vec<nd::Array2<f64>>
    {
        let m = rhs.block();
        let nk = (y.len() - 1) / m;
        let mut blocks: Vec<nd::Array2<f64>>
            = (0..nk).map(|_| nd::Array2::zeros((2 * m, 2 * m))).collect();
        let delta = 1e-7;
        for c in 0..m {
            for part in 0..2 {
                let dz = if part == 0 { C64::new(delta, 0.0) } else { C64::new(0.0, delta) };
                let mut yp = y.clone();
                for k in 0..nk { yp[k * m + c] += dz; }
                let fp = rhs.call(t, &yp);
                for (k, block) in blocks.iter_mut().enumerate() {
                    for r in 0..m {
                        let df = (fp[k * m + r] - f[k * m + r]) / delta;
                        block[[2 * r, 2 * c + part]] = df.re;
                        block[[2 * r + 1, 2 * c + part]] = df.im;
                    }
                }
            }
        }
        blocks
    }

    fn factorize(jacobian: &[nd::Array2<f64>], beta_h: f64)
        -> Option<NewtonMatrix>
    {
        let blocks: Option<Vec<_>>
            = jacobian.iter()
            .map(|J| {
                let n = J.nrows();
                let M: nd::Array2<f64> = nd::Array2::eye(n) - J * beta_h;
                M.factorize().ok()
            })
            .collect();
        blocks.map(|blocks| NewtonMatrix { beta_h, blocks })
    }

    fn newton_solve(&self, residual: &nd::Array1<C64>, m: usize)
        -> Option<nd::Array1<C64>>
    {
        let newton = self.newton.as_ref()?;
        let mut delta: nd::Array1<C64> = nd::Array1::zeros(residual.len());
        for (k, lu) in newton.blocks.iter().enumerate() {
            let b: nd::Array1<f64>
                = residual.slice(s![k * m..(k + 1) * m]).iter()
                .flat_map(|z| [z.re, z.im])
                .collect();
            let x = lu.solve(&b).ok()?;
            for r in 0..m {
                delta[k * m + r] = C64::new(x[2 * r], x[2 * r + 1]);
            }
        }
        let last = residual.len() - 1;
        delta[last] = residual[last];
        Some(delta)
    }

    fn attempt_bdf(
        &mut self,
        rhs: &dyn Derivative,
        f: &nd::Array1<C64>,
        h: f64,
    ) -> Attempt
    {
        let m = rhs.block();
        let (psi, beta, coef) = match &self.prev {
            Some(prev) => {
                let w = h / prev.h;
                let a1 = (1.0 + w).powi(2) / (1.0 + 2.0 * w);
                let a2 = w.powi(2) / (1.0 + 2.0 * w);
                let beta = (1.0 + w) / (1.0 + 2.0 * w);
                (&self.y * a1 - &prev.y * a2, beta, 8.0 / 23.0)
            },
            None => (self.y.clone(), 1.0, 0.5),
        };
        let beta_h = beta * h;
        if self.jacobian.is_none() {
            self.jacobian = Some(Self::compute_jacobian(rhs, self.t, &self.y, f));
            self.newton = None;
        }
        let refactor = match &self.newton {
            Some(nm) => (nm.beta_h - beta_h).abs() > 1e-12 * beta_h.abs(),
            None => true,
        };
        if refactor {
            self.newton = self.jacobian.as_deref()
                .and_then(|J| Self::factorize(J, beta_h));
        }
        if self.newton.is_none() { return Attempt::NoConvergence; }

        let t1 = self.t + h;
        let yp = self.predict(f, h);
        let mut z = yp.clone();
        let mut fz: nd::Array1<C64>;
        let mut converged = false;
        for _ in 0..4 {
            fz = rhs.call(t1, &z);
            let residual = &fz * beta_h + &psi - &z;
            let Some(delta) = self.newton_solve(&residual, m)
                else { return Attempt::NoConvergence; };
            z = z + &delta;
            if error_norm(&delta, &self.y, &z) <= 0.05 {
                converged = true;
                break;
            }
        }
        if !converged { return Attempt::NoConvergence; }
        let err = coef * error_norm(&(&z - &yp), &self.y, &z);
        if err <= 1.0 {
            let fz = rhs.call(t1, &z);
            Attempt::Accepted { y: z, f: fz, err }
        } else {
            Attempt::Rejected { err }
        }
    }
}

impl Integrator for Adaptive {
    fn reset(&mut self, t0: f64, y0: nd::Array1<C64>) {
        self.t = t0;
        self.y = y0;
        self.f = None;
        self.prev = None;
        self.h = 0.1 * self.h_max;
        self.jacobian = None;
        self.newton = None;
    }

    fn advance(&mut self, rhs: &dyn Derivative, t_target: f64) -> bool {
        let h_min = MIN_STEP_FACTOR * self.h_max;
        let mut substeps: usize = 0;
        let mut fresh_jacobian = false;
        while t_target - self.t > h_min {
            if substeps >= MAX_SUBSTEPS { return false; }
            let f = match self.f.take() {
                Some(f) => f,
                None => rhs.call(self.t, &self.y),
            };
            let remaining = t_target - self.t;
            let proposal = self.h.min(self.h_max);
            let landing = proposal >= remaining;
            let h = if landing { remaining } else { proposal };
            let attempt = match self.scheme {
                Scheme::Adams => self.attempt_adams(rhs, &f, h),
                Scheme::Bdf => self.attempt_bdf(rhs, &f, h),
            };
            match attempt {
                Attempt::Accepted { y, f: f_new, err } => {
                    let y_old = std::mem::replace(&mut self.y, y);
                    self.prev = Some(History { h, y: y_old, f });
                    self.f = Some(f_new);
                    self.t = if landing { t_target } else { self.t + h };
                    let next = h * Self::step_factor(err);
                    self.h = if landing { next.max(proposal) } else { next };
                    fresh_jacobian = false;
                    substeps += 1;
                },
                Attempt::Rejected { err } => {
                    self.f = Some(f);
                    self.h = h * Self::step_factor(err).min(0.9);
                },
                Attempt::NoConvergence => {
                    self.f = Some(f);
                    if fresh_jacobian {
                        self.h = h / 4.0;
                    } else {
                        self.jacobian = None;
                        fresh_jacobian = true;
                    }
                },
            }
            if self.h < h_min { return false; }
        }
        self.t = t_target;
        true
    }

    fn state(&self) -> &nd::Array1<C64> { &self.y }

    fn time(&self) -> f64 { self.t }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Decoupled damped oscillators, one 2×2 "band" block per point plus a
    /// driven trailing entry.
    struct Oscillators { nk: usize, omega: f64, gamma: f64 }

    impl Derivative for Oscillators {
        fn dim(&self) -> usize { 4 * self.nk + 1 }

        fn block(&self) -> usize { 4 }

        fn eval(
            &self,
            t: f64,
            y: nd::ArrayView1<C64>,
            mut out: nd::ArrayViewMut1<C64>,
        ) {
            for i in 0..4 * self.nk {
                let w = self.omega * (1 + i % 3) as f64;
                out[i] = (C64::i() * w - self.gamma) * y[i];
            }
            out[4 * self.nk] = C64::from(-t.cos());
        }
    }

    fn exact(sys: &Oscillators, y0: &nd::Array1<C64>, t: f64) -> nd::Array1<C64> {
        let mut y = y0.clone();
        for i in 0..4 * sys.nk {
            let w = sys.omega * (1 + i % 3) as f64;
            y[i] = y0[i] * ((C64::i() * w - sys.gamma) * t).exp();
        }
        y[4 * sys.nk] = y0[4 * sys.nk] - t.sin();
        y
    }

    fn run(integrator: &mut dyn Integrator, sys: &Oscillators, dt: f64, nt: usize)
        -> nd::Array1<f64>
    {
        let y0: nd::Array1<C64>
            = nd::Array1::from_shape_fn(sys.dim(), |i| C64::new(1.0, 0.1 * i as f64));
        integrator.reset(0.0, y0.clone());
        for ti in 1..=nt {
            assert!(integrator.advance(sys, ti as f64 * dt));
        }
        assert_abs_diff_eq!(integrator.time(), nt as f64 * dt, epsilon = 1e-12);
        let err = integrator.state() - &exact(sys, &y0, nt as f64 * dt);
        nd::Array1::from_iter(err.iter().map(|z| z.norm()))
    }

    #[test]
    fn all_methods_converge() {
        let sys = Oscillators { nk: 3, omega: 1.0, gamma: 0.1 };
        for method in [Method::Rk4, Method::Adams, Method::Bdf] {
            let mut integrator = make_integrator(method, 0.05);
            let err = run(integrator.as_mut(), &sys, 0.05, 100);
            let max = err.iter().cloned().fold(0.0, f64::max);
            assert!(max < 5e-3, "{:?}: error {:e}", method, max);
        }
    }

    struct Blowup;

    impl Derivative for Blowup {
        fn dim(&self) -> usize { 5 }

        fn block(&self) -> usize { 4 }

        fn eval(
            &self,
            t: f64,
            _y: nd::ArrayView1<C64>,
            mut out: nd::ArrayViewMut1<C64>,
        ) {
            let v = if t > 0.15 { f64::NAN } else { 1.0 };
            out.fill(C64::from(v));
        }
    }

    #[test]
    fn non_finite_rates_report_failure() {
        for method in [Method::Rk4, Method::Adams, Method::Bdf] {
            let mut integrator = make_integrator(method, 0.1);
            integrator.reset(0.0, nd::Array1::zeros(5));
            assert!(integrator.advance(&Blowup, 0.1), "{:?}", method);
            assert!(!integrator.advance(&Blowup, 0.2), "{:?}", method);
        }
    }
}
