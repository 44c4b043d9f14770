//! Discrete Fourier transforms on the symmetric time grid, window functions,
//! and the frequency-domain result containers.

use std::f64::consts::PI;
use ndarray::{ self as nd, s };
use num_complex::Complex64 as C64;
use rustfft::FftPlanner;
use crate::{
    config::{ Params, WindowFunction },
    observables::TimeContainers,
    units::c_au,
};

/// Cyclic shift so that the zero-frequency entry moves to the centre.
pub fn fftshift<T>(x: &nd::Array1<T>) -> nd::Array1<T>
where T: Clone
{
    roll(x, x.len() / 2)
}

/// Inverse of [`fftshift`].
pub fn ifftshift<T>(x: &nd::Array1<T>) -> nd::Array1<T>
where T: Clone
{
    let n = x.len();
    roll(x, n - n / 2)
}

fn roll<T>(x: &nd::Array1<T>, shift: usize) -> nd::Array1<T>
where T: Clone
{
    let n = x.len();
    if n == 0 { return x.clone(); }
    nd::Array1::from_shape_fn(n, |i| x[(i + n - shift % n) % n].clone())
}

/// Sample frequencies of an `n`-point transform with spacing `d`, in FFT
/// order.
pub fn fftfreq(n: usize, d: f64) -> nd::Array1<f64> {
    let scale = 1.0 / (n as f64 * d);
    nd::Array1::from_shape_fn(n, |i| {
        if i < n.div_ceil(2) { i as f64 * scale } else { (i as f64 - n as f64) * scale }
    })
}

fn transform(x: &nd::Array1<C64>, inverse: bool) -> nd::Array1<C64> {
    let n = x.len();
    let mut buf: Vec<C64> = ifftshift(x).to_vec();
    let mut planner = FftPlanner::<f64>::new();
    if inverse {
        planner.plan_fft_inverse(n).process(&mut buf);
        buf.iter_mut().for_each(|z| { *z /= n as f64; });
    } else {
        planner.plan_fft_forward(n).process(&mut buf);
    }
    fftshift(&nd::Array1::from(buf))
}

/// `(dt/√(2π)) fftshift(fft(ifftshift(x)))`.
pub fn fourier(dt: f64, x: &nd::Array1<C64>) -> nd::Array1<C64> {
    transform(x, false) * C64::from(dt / (2.0 * PI).sqrt())
}

/// `(√(2π)/dt) fftshift(ifft(ifftshift(x)))`; inverse of [`fourier`].
pub fn ifourier(dt: f64, x: &nd::Array1<C64>) -> nd::Array1<C64> {
    transform(x, true) * C64::from((2.0 * PI).sqrt() / dt)
}

/* windows ********************************************************************/

pub fn gaussian_window(t: &nd::Array1<f64>, width: f64) -> nd::Array1<f64> {
    t.mapv(|tk| (-(tk / width).powi(2)).exp())
}

pub fn hann_window(t: &nd::Array1<f64>) -> nd::Array1<f64> {
    let (t_first, t_last) = (t[0], t[t.len() - 1]);
    let center = 0.5 * (t_first + t_last);
    let span = t_last - t_first;
    t.mapv(|tk| (PI * (tk - center) / span).cos().powi(2))
}

/// Piecewise-cubic Parzen window over the full time span.
pub fn parzen_window(t: &nd::Array1<f64>) -> nd::Array1<f64> {
    let n = t.len();
    let (t_first, t_last) = (t[0], t[n - 1]);
    let center = 0.5 * (t_first + t_last);
    let half = 0.5 * (t_last - t_first);
    let mut w = t.mapv(|tk| {
        let r = ((tk - center) / half).abs();
        if r <= 0.5 {
            1.0 - 6.0 * r.powi(2) * (1.0 - r)
        } else {
            2.0 * (1.0 - r).max(0.0).powi(3)
        }
    });
    w[n / 2] = 1.0;
    w
}

/// Window selected by the run settings.
pub fn window(params: &Params, t: &nd::Array1<f64>) -> nd::Array1<f64> {
    match params.window {
        WindowFunction::Gaussian => gaussian_window(t, params.gaussian_window_width),
        WindowFunction::Hann => hann_window(t),
        WindowFunction::Parzen => parzen_window(t),
    }
}

/* spectra ********************************************************************/

/// Emission intensity `f² |x̂(f)|² / (3c³)`.
pub fn intensity(freq: &nd::Array1<f64>, xw: &nd::Array1<C64>) -> nd::Array1<f64> {
    let prefac = 1.0 / (3.0 * c_au.powi(3));
    nd::Array1::from_shape_fn(freq.len(), |i| {
        prefac * freq[i].powi(2) * xw[i].norm_sqr()
    })
}

/// Spectrum of one windowed observable.
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    pub jw: nd::Array1<C64>,
    pub Iw: nd::Array1<f64>,
}

/// Transforms time series on a fixed grid, zero-padded to the frequency
/// resolution of the run.
pub struct SpectralAnalyzer {
    dt: f64,
    n_fft: usize,
    freq: nd::Array1<f64>,
}

impl SpectralAnalyzer {
    pub fn new(dt: f64, Nt: usize, factor: usize) -> Self {
        let n_fft = (Nt - 1) * factor + 1;
        let freq = fftshift(&fftfreq(n_fft, dt));
        Self { dt, n_fft, freq }
    }

    pub fn freq(&self) -> &nd::Array1<f64> { &self.freq }

    /// Centre `x` in a zero array of the padded length.
    fn pad(&self, x: nd::ArrayView1<f64>) -> nd::Array1<C64> {
        let nt = x.len();
        let offset = (self.n_fft - nt) / 2;
        let mut padded = nd::Array1::zeros(self.n_fft);
        padded.slice_mut(s![offset..offset + nt])
            .zip_mut_with(&x, |p, xk| { *p = C64::from(*xk); });
        padded
    }

    /// Transform without a window.
    pub fn transform(&self, x: nd::ArrayView1<f64>) -> nd::Array1<C64> {
        fourier(self.dt, &self.pad(x))
    }

    pub fn spectrum(&self, x: nd::ArrayView1<f64>, window: &nd::Array1<f64>)
        -> Spectrum
    {
        let windowed = &x * window;
        let jw = self.transform(windowed.view());
        let Iw = intensity(&self.freq, &jw);
        Spectrum { jw, Iw }
    }
}

/// Spectra of the split-current observables.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitSpectra {
    pub P_E_dir: Spectrum,
    pub P_ortho: Spectrum,
    pub j_intra_E_dir: Spectrum,
    pub j_intra_ortho: Spectrum,
    pub dtP_E_dir: Spectrum,
    pub dtP_ortho: Spectrum,
    pub j_intra_plus_dtP_E_dir: Spectrum,
    pub j_intra_plus_dtP_ortho: Spectrum,
    pub j_anom_ortho_full: Spectrum,
    pub j_intra_plus_anom_ortho: Spectrum,
    pub j_deph_E_dir: Spectrum,
    pub j_deph_ortho: Spectrum,
}

/// Frequency-domain results of one parameter combination.
#[derive(Clone, Debug, PartialEq)]
pub struct FrequencyContainers {
    pub freq: nd::Array1<f64>,
    /// Exact currents under the configured window.
    pub j_E_dir: Spectrum,
    pub j_ortho: Spectrum,
    pub j_E_dir_hann: Spectrum,
    pub j_ortho_hann: Spectrum,
    pub j_E_dir_parzen: Spectrum,
    pub j_ortho_parzen: Spectrum,
    pub E_field: nd::Array1<C64>,
    pub A_field: nd::Array1<C64>,
    pub split: Option<SplitSpectra>,
}

impl FrequencyContainers {
    /// Compute every spectrum of a reduced and finalized time series.
    pub fn from_time(params: &Params, T: &TimeContainers) -> Self {
        let an = SpectralAnalyzer::new(params.dt, T.Nt(), params.factor_freq_resolution);
        let w = window(params, &T.t);
        let hann = hann_window(&T.t);
        let parzen = parzen_window(&T.t);
        let split = T.split.as_ref().map(|sp| SplitSpectra {
            P_E_dir: an.spectrum(sp.P_E_dir.view(), &w),
            P_ortho: an.spectrum(sp.P_ortho.view(), &w),
            j_intra_E_dir: an.spectrum(sp.j_intra_E_dir.view(), &w),
            j_intra_ortho: an.spectrum(sp.j_intra_ortho.view(), &w),
            dtP_E_dir: an.spectrum(sp.dtP_E_dir.view(), &w),
            dtP_ortho: an.spectrum(sp.dtP_ortho.view(), &w),
            j_intra_plus_dtP_E_dir: an.spectrum(sp.j_intra_plus_dtP_E_dir.view(), &w),
            j_intra_plus_dtP_ortho: an.spectrum(sp.j_intra_plus_dtP_ortho.view(), &w),
            j_anom_ortho_full: an.spectrum(sp.j_anom_ortho_full.view(), &w),
            j_intra_plus_anom_ortho: an.spectrum(sp.j_intra_plus_anom_ortho.view(), &w),
            j_deph_E_dir: an.spectrum(sp.j_deph_E_dir.view(), &w),
            j_deph_ortho: an.spectrum(sp.j_deph_ortho.view(), &w),
        });
        Self {
            j_E_dir: an.spectrum(T.j_E_dir.view(), &w),
            j_ortho: an.spectrum(T.j_ortho.view(), &w),
            j_E_dir_hann: an.spectrum(T.j_E_dir.view(), &hann),
            j_ortho_hann: an.spectrum(T.j_ortho.view(), &hann),
            j_E_dir_parzen: an.spectrum(T.j_E_dir.view(), &parzen),
            j_ortho_parzen: an.spectrum(T.j_ortho.view(), &parzen),
            E_field: an.transform(T.E_field.view()),
            A_field: an.transform(T.A_field.view()),
            split,
            freq: an.freq,
        }
    }

    /// Total emission intensity `I_E_dir + I_ortho` under the configured
    /// window.
    pub fn total_intensity(&self) -> nd::Array1<f64> {
        &self.j_E_dir.Iw + &self.j_ortho.Iw
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn shifts_are_inverse() {
        for n in [5, 6] {
            let x = nd::Array1::from_shape_fn(n, |i| i as f64);
            assert_eq!(ifftshift(&fftshift(&x)), x);
        }
        let x = nd::array![0.0, 1.0, 2.0, -2.0, -1.0];
        assert_eq!(fftshift(&x), nd::array![-2.0, -1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn frequencies_match_fft_order() {
        let f = fftfreq(4, 0.5);
        assert_eq!(f, nd::array![0.0, 0.5, -1.0, -0.5]);
        let f = fftfreq(5, 1.0);
        assert_eq!(f, nd::array![0.0, 0.2, 0.4, -0.4, -0.2]);
    }

    #[test]
    fn fourier_round_trip() {
        let dt = 0.1;
        let x: nd::Array1<C64> = nd::Array1::from_shape_fn(65, |i| {
            let t = (i as f64 - 32.0) * dt;
            C64::new((-t * t).exp() * (3.0 * t).cos(), 0.1 * t)
        });
        let back = ifourier(dt, &fourier(dt, &x));
        for (a, b) in x.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-12);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-12);
        }
    }

    #[test]
    fn gaussian_transform_is_gaussian() {
        // exp(-t²/2) is its own transform under the unitary convention
        let dt = 0.05;
        let nt = 801;
        let t = nd::Array1::from_shape_fn(nt, |i| (i as f64 - 400.0) * dt);
        let an = SpectralAnalyzer::new(dt, nt, 1);
        let xw = an.transform(t.mapv(|tk| (-tk * tk / 2.0).exp()).view());
        for (f, z) in an.freq().iter().zip(xw.iter()) {
            let w = 2.0 * PI * f;
            assert_abs_diff_eq!(z.norm(), (-w * w / 2.0).exp(), epsilon = 1e-8);
        }
    }

    #[test]
    fn windows_peak_at_centre() {
        let t = nd::Array1::linspace(-10.0, 10.0, 21);
        let hann = hann_window(&t);
        let parzen = parzen_window(&t);
        assert_abs_diff_eq!(hann[10], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(hann[0], 0.0, epsilon = 1e-15);
        assert_eq!(parzen[10], 1.0);
        assert_abs_diff_eq!(parzen[0], 0.0, epsilon = 1e-15);
        assert_abs_diff_eq!(parzen[5], 0.25, epsilon = 1e-15);
        for i in 0..21 {
            assert_abs_diff_eq!(parzen[i], parzen[20 - i], epsilon = 1e-15);
        }
    }

    #[test]
    fn parzen_centre_is_one_for_even_length() {
        let t = nd::Array1::linspace(-9.5, 9.5, 20);
        let parzen = parzen_window(&t);
        assert_eq!(parzen[10], 1.0);
        assert!(parzen[9] < 1.0 && parzen[11] < 1.0);
    }

    #[test]
    fn padding_refines_frequency_axis() {
        let an = SpectralAnalyzer::new(0.5, 11, 4);
        assert_eq!(an.freq().len(), 41);
        assert_abs_diff_eq!(an.freq()[21] - an.freq()[20], 1.0 / (41.0 * 0.5), epsilon = 1e-15);
    }
}
