//! Run configuration: TOML parameter files, parameter scans, and the per-
//! combination [`Params`] consumed by the solver.
//!
//! Values in the parameter file are given in lab units (fs, eV, MV/cm, THz, Å
//! and 1/Å) and converted once to atomic units when a [`Params`] is built.
//! Any entry in the `[field]`, `[damping]`, or `[occupation]` tables may be
//! given as a list, in which case the run covers the Cartesian product of all
//! such lists; the last scanned entry varies fastest.

use std::{ fmt, path::Path, str::FromStr };
use indexmap::IndexMap;
use serde::Deserialize;
use crate::{
    error::{ Error, Result },
    field::Pulse,
    units::*,
};

/// A parameter that is either fixed or scanned over a list of values.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scan {
    Value(f64),
    List(Vec<f64>),
}

impl Scan {
    fn values(&self) -> Vec<f64> {
        match self {
            Self::Value(x) => vec![*x],
            Self::List(v) => v.clone(),
        }
    }

    fn is_scanned(&self) -> bool { matches!(self, Self::List(_)) }
}

impl From<f64> for Scan {
    fn from(x: f64) -> Self { Self::Value(x) }
}

macro_rules! named_enum {
    (
        $( #[$meta:meta] )*
        $name:ident { $( $var:ident => $label:literal ),+ $(,)? }
    ) => {
        $( #[$meta] )*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $name { $( $var ),+ }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[ $( $label ),+ ];

            pub fn label(&self) -> &'static str {
                match self { $( Self::$var => $label ),+ }
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $( $label => Ok(Self::$var), )+
                    other => Err(Error::config(format!(
                        "unknown {} '{}'; valid names are {:?}",
                        stringify!($name), other, Self::NAMES,
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    }
}

named_enum!(
    /// Gauge in which the light-matter coupling is expressed.
    Gauge { Length => "length", Velocity => "velocity" }
);

named_enum!(
    /// Band model of the equations of motion.
    BandSolver { TwoBand => "2band", NBand => "nband" }
);

named_enum!(
    /// Time-integration scheme.
    Method { Bdf => "bdf", Adams => "adams", Rk4 => "rk4" }
);

named_enum!(
    /// Window applied to time series before Fourier transformation.
    WindowFunction { Gaussian => "gaussian", Hann => "hann", Parzen => "parzen" }
);

named_enum!(
    /// High-symmetry direction of a hexagonal zone along which paths run.
    Alignment { K => "K", M => "M" }
);

/// Brillouin-zone geometry, in atomic units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BzGeometry {
    Hexagon {
        /// Lattice constant.
        a: f64,
        align: Alignment,
    },
    Rectangle {
        /// Extent of each path along the field direction.
        length_e_dir: f64,
        /// Extent of the path set orthogonal to the field.
        length_ortho: f64,
        /// Angle of the field direction with the x axis (radians).
        angle: f64,
    },
}

/// All settings of a single parameter combination, in atomic units.
///
/// Immutable for the duration of a run; see [`crate::mesh::KMesh`] for the
/// quantities derived from the geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    pub bz: BzGeometry,
    pub Nk1: usize,
    pub Nk2: usize,
    pub pulse: Pulse,
    pub T1: f64,
    pub T2: f64,
    pub e_fermi: f64,
    pub temperature: f64,
    pub t0: f64,
    pub dt: f64,
    pub Nt: usize,
    pub gauge: Gauge,
    pub solver: BandSolver,
    pub method: Method,
    pub split_current: bool,
    pub save_full: bool,
    /// Times at which density-matrix snapshots are kept.
    pub dm_times: Vec<f64>,
    pub point_parallel: bool,
    pub window: WindowFunction,
    pub gaussian_window_width: f64,
    pub factor_freq_resolution: usize,
    /// Position of this combination in the full scan.
    pub index: usize,
    /// Scanned parameter names and values (lab units) of this combination.
    pub scan: Vec<(&'static str, f64)>,
}

impl Params {
    pub fn gamma1(&self) -> f64 { 1.0 / self.T1 }

    pub fn gamma2(&self) -> f64 { 1.0 / self.T2 }

    /// Time of output step `ti`.
    pub fn time(&self, ti: usize) -> f64 { self.t0 + ti as f64 * self.dt }

    /// Output step of each snapshot time: the first step at or after it,
    /// clamped to the grid.
    pub fn dm_steps(&self) -> Vec<usize> {
        self.dm_times.iter()
            .map(|t| {
                let x = ((t - self.t0) / self.dt - 1e-9).ceil().max(0.0);
                (x as usize).min(self.Nt - 1)
            })
            .collect()
    }

    /// File-name prefix unique to this combination.
    pub fn header(&self) -> String {
        let mut header = format!(
            "{}_{}_{}_",
            self.gauge, self.solver, self.method,
        );
        for (name, value) in self.scan.iter() {
            header.push_str(&format!("{}={:.4e}_", name, value));
        }
        header
    }

    /// Check the settings that don't depend on the band system.
    pub fn validate(&self) -> Result<()> {
        if self.Nk1 == 0 || self.Nk2 == 0 {
            return Err(Error::config("Nk1 and Nk2 must be positive"));
        }
        if self.dt <= 0.0 {
            return Err(Error::config("time step must be positive"));
        }
        if self.Nt < 2 {
            return Err(Error::config("time grid needs at least two points"));
        }
        if self.T1 <= 0.0 || self.T2 <= 0.0 {
            return Err(Error::config("damping times must be positive"));
        }
        if self.factor_freq_resolution == 0 {
            return Err(Error::config(
                "frequency resolution factor must be at least 1"));
        }
        if self.point_parallel && self.gauge != Gauge::Velocity {
            return Err(Error::config(
                "parallelization over k-points requires the velocity gauge"));
        }
        if let BzGeometry::Hexagon { a, .. } = self.bz {
            if a <= 0.0 {
                return Err(Error::config("lattice constant must be positive"));
            }
        }
        Ok(())
    }
}

/* TOML layout ****************************************************************/

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BzConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub Nk1: usize,
    pub Nk2: usize,
    /// Lattice constant in Å (hexagon).
    pub a: Option<f64>,
    /// `"K"` or `"M"` (hexagon).
    pub align: Option<String>,
    /// Path length along the field in 1/Å (rectangle).
    pub length_e_dir: Option<f64>,
    /// Path-set width orthogonal to the field in 1/Å (rectangle).
    pub length_ortho: Option<f64>,
    /// Field angle in degrees (rectangle).
    #[serde(default)]
    pub angle: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    /// MV/cm
    pub E0: Scan,
    /// THz
    pub f: Scan,
    /// fs
    pub sigma: Scan,
    /// THz
    #[serde(default = "zero_scan")]
    pub chirp: Scan,
    /// rad
    #[serde(default = "zero_scan")]
    pub phase: Scan,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DampingConfig {
    /// Occupation relaxation time in fs.
    #[serde(default = "default_T1")]
    pub T1: Scan,
    /// Dephasing time in fs.
    #[serde(default = "default_T2")]
    pub T2: Scan,
}

impl Default for DampingConfig {
    fn default() -> Self { Self { T1: default_T1(), T2: default_T2() } }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OccupationConfig {
    /// eV
    #[serde(default = "zero_scan")]
    pub e_fermi: Scan,
    /// eV
    #[serde(default = "zero_scan")]
    pub temperature: Scan,
}

impl Default for OccupationConfig {
    fn default() -> Self {
        Self { e_fermi: zero_scan(), temperature: zero_scan() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeConfig {
    /// Start time in fs; the grid runs to `-t0`.
    pub t0: f64,
    /// Output step in fs.
    pub dt: f64,
    /// Number of output steps; defaults to `floor(2|t0| / dt)`.
    pub Nt: Option<usize>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    #[serde(default = "default_gauge")]
    pub gauge: String,
    #[serde(default = "default_solver")]
    pub solver: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub split_current: bool,
    #[serde(default)]
    pub parallelize_over_points: bool,
    /// Restrict the run to these combination indices.
    pub combinations: Option<Vec<usize>>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            gauge: default_gauge(),
            solver: default_solver(),
            method: default_method(),
            split_current: false,
            parallelize_over_points: false,
            combinations: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub save_full: bool,
    /// Density-matrix snapshot times in fs.
    #[serde(default)]
    pub dm_times: Vec<f64>,
    #[serde(default = "default_true")]
    pub save_screening: bool,
    #[serde(default = "default_window")]
    pub window: String,
    /// Gaussian window width in fs; defaults to the pulse width.
    pub gaussian_window_width: Option<f64>,
    #[serde(default = "default_factor")]
    pub factor_freq_resolution: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_full: false,
            dm_times: Vec::new(),
            save_screening: true,
            window: default_window(),
            gaussian_window_width: None,
            factor_freq_resolution: default_factor(),
        }
    }
}

/// Band-structure model; coefficients in atomic units.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// `"ana"` or `"num"`.
    #[serde(default = "default_evaluator")]
    pub evaluator: String,
    #[serde(default)]
    pub C0: f64,
    #[serde(default)]
    pub C2: f64,
    pub A: f64,
    #[serde(default)]
    pub R: f64,
    #[serde(default)]
    pub mz: f64,
    /// Eigenvector component fixed real and positive (`"num"` only).
    #[serde(default)]
    pub gauge_idx: usize,
}

/// Contents of a parameter file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub bz: BzConfig,
    pub field: FieldConfig,
    #[serde(default)]
    pub damping: DampingConfig,
    #[serde(default)]
    pub occupation: OccupationConfig,
    pub time: TimeConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub output: OutputConfig,
    pub model: ModelConfig,
}

fn zero_scan() -> Scan { Scan::Value(0.0) }
fn default_T1() -> Scan { Scan::Value(1000.0) }
fn default_T2() -> Scan { Scan::Value(1.0) }
fn default_gauge() -> String { "length".into() }
fn default_solver() -> String { "2band".into() }
fn default_method() -> String { "bdf".into() }
fn default_window() -> String { "gaussian".into() }
fn default_factor() -> usize { 1 }
fn default_true() -> bool { true }
fn default_evaluator() -> String { "ana".into() }

impl FromStr for RunConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> { Ok(toml::from_str(s)?) }
}

impl RunConfig {
    /// Read and parse a TOML parameter file.
    pub fn load<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        std::fs::read_to_string(path)?.parse()
    }

    /// All scannable entries in fixed order, with their values.
    pub fn scan_table(&self) -> IndexMap<&'static str, &Scan> {
        let mut table: IndexMap<&'static str, &Scan> = IndexMap::new();
        table.insert("E0", &self.field.E0);
        table.insert("f", &self.field.f);
        table.insert("sigma", &self.field.sigma);
        table.insert("chirp", &self.field.chirp);
        table.insert("phase", &self.field.phase);
        table.insert("T1", &self.damping.T1);
        table.insert("T2", &self.damping.T2);
        table.insert("e_fermi", &self.occupation.e_fermi);
        table.insert("temperature", &self.occupation.temperature);
        table
    }

    /// Total size of the Cartesian product of scanned values.
    pub fn n_combinations(&self) -> usize {
        self.scan_table().values().map(|s| s.values().len()).product()
    }

    /// Combination indices to be run, in order.
    pub fn selected_combinations(&self) -> Result<Vec<usize>> {
        let total = self.n_combinations();
        match &self.solver.combinations {
            Some(list) => {
                if let Some(bad) = list.iter().find(|i| **i >= total) {
                    return Err(Error::config(format!(
                        "requested combination {} but only {} exist",
                        bad, total,
                    )));
                }
                Ok(list.clone())
            },
            None => Ok((0..total).collect()),
        }
    }

    /// Values of every scannable entry (lab units) for combination `index`,
    /// unravelled in C order.
    pub fn combination(&self, index: usize) -> IndexMap<&'static str, f64> {
        let table = self.scan_table();
        let sizes: Vec<usize>
            = table.values().map(|s| s.values().len()).collect();
        let mut rem = index;
        let mut idx = vec![0; sizes.len()];
        for (k, n) in sizes.iter().enumerate().rev() {
            idx[k] = rem % n;
            rem /= n;
        }
        table.iter().zip(idx)
            .map(|((name, scan), i)| (*name, scan.values()[i]))
            .collect()
    }

    /// Build the atomic-unit [`Params`] of combination `index`.
    pub fn params(&self, index: usize) -> Result<Params> {
        if index >= self.n_combinations() {
            return Err(Error::config(format!(
                "combination {} out of range", index)));
        }
        let values = self.combination(index);
        let table = self.scan_table();
        let scan: Vec<(&'static str, f64)>
            = values.iter()
            .filter(|(name, _)| table[*name].is_scanned())
            .map(|(name, v)| (*name, *v))
            .collect();

        let bz = match self.bz.kind.as_str() {
            "hexagon" => {
                let a = self.bz.a.ok_or_else(|| {
                    Error::config("hexagonal zone requires a lattice constant")
                })?;
                let align: Alignment
                    = self.bz.align.as_deref().unwrap_or("K").parse()?;
                BzGeometry::Hexagon { a: a * as_to_au, align }
            },
            "rectangle" => {
                let (Some(le), Some(lo))
                    = (self.bz.length_e_dir, self.bz.length_ortho)
                else {
                    return Err(Error::config(
                        "rectangular zone requires length_e_dir and \
                        length_ortho"
                    ));
                };
                BzGeometry::Rectangle {
                    length_e_dir: inv_as_to_au(le),
                    length_ortho: inv_as_to_au(lo),
                    angle: self.bz.angle.to_radians(),
                }
            },
            other => {
                return Err(Error::config(format!(
                    "unknown zone type '{}'; valid names are \
                    [\"hexagon\", \"rectangle\"]",
                    other,
                )));
            },
        };

        let pulse = Pulse {
            E0: values["E0"] * MVpcm_to_au,
            f: values["f"] * THz_to_au,
            sigma: values["sigma"] * fs_to_au,
            chirp: values["chirp"] * THz_to_au,
            phase: values["phase"],
        };
        let t0 = self.time.t0 * fs_to_au;
        let dt = self.time.dt * fs_to_au;
        let Nt = self.time.Nt
            .unwrap_or_else(|| (2.0 * self.time.t0.abs() / self.time.dt) as usize);
        let window: WindowFunction = self.output.window.parse()?;
        let gaussian_window_width = self.output.gaussian_window_width
            .map(|w| w * fs_to_au)
            .unwrap_or(pulse.sigma);

        let params = Params {
            bz,
            Nk1: self.bz.Nk1,
            Nk2: self.bz.Nk2,
            pulse,
            T1: values["T1"] * fs_to_au,
            T2: values["T2"] * fs_to_au,
            e_fermi: values["e_fermi"] * eV_to_au,
            temperature: values["temperature"] * eV_to_au,
            t0,
            dt,
            Nt,
            gauge: self.solver.gauge.parse()?,
            solver: self.solver.solver.parse()?,
            method: self.solver.method.parse()?,
            split_current: self.solver.split_current,
            save_full: self.output.save_full,
            dm_times: self.output.dm_times.iter().map(|t| t * fs_to_au).collect(),
            point_parallel: self.solver.parallelize_over_points,
            window,
            gaussian_window_width,
            factor_freq_resolution: self.output.factor_freq_resolution,
            index,
            scan,
        };
        params.validate()?;
        Ok(params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    const TOML: &str = r#"
        [bz]
        type = "rectangle"
        Nk1 = 20
        Nk2 = 2
        length_e_dir = 4.6
        length_ortho = 0.38

        [field]
        E0 = [1.0, 5.0]
        f = 25
        sigma = [40.0, 50.0, 60.0]

        [time]
        t0 = -500
        dt = 0.01

        [model]
        A = 0.19732
    "#;

    #[test]
    fn scans_unravel_in_c_order() {
        let config: RunConfig = TOML.parse().unwrap();
        assert_eq!(config.n_combinations(), 6);
        let c = config.combination(4);
        assert_eq!(c["E0"], 5.0);
        assert_eq!(c["sigma"], 50.0);
        let p = config.params(4).unwrap();
        assert_eq!(p.scan, vec![("E0", 5.0), ("sigma", 50.0)]);
        assert_eq!(p.Nt, 100_000);
        assert_relative_eq!(p.pulse.sigma, 50.0 * fs_to_au);
        assert_eq!(p.gauge, Gauge::Length);
        assert_eq!(p.method, Method::Bdf);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let mut config: RunConfig = TOML.parse().unwrap();
        config.solver.gauge = "coulomb".into();
        assert!(matches!(config.params(0), Err(Error::Config(_))));
        config.solver.gauge = "length".into();
        config.solver.parallelize_over_points = true;
        assert!(matches!(config.params(0), Err(Error::Config(_))));
    }

    #[test]
    fn snapshot_times_round_up_to_the_grid() {
        let mut config: RunConfig = TOML.parse().unwrap();
        config.output.dm_times = vec![-600.0, -500.0, 0.005, 0.01, 1000.0];
        let p = config.params(0).unwrap();
        assert_eq!(p.dm_steps(), vec![0, 0, 50_001, 50_001, 99_999]);
    }

    #[test]
    fn explicit_combination_list() {
        let mut config: RunConfig = TOML.parse().unwrap();
        config.solver.combinations = Some(vec![1, 5]);
        assert_eq!(config.selected_combinations().unwrap(), vec![1, 5]);
        config.solver.combinations = Some(vec![6]);
        assert!(config.selected_combinations().is_err());
    }
}
