//! Conversion factors from lab units to Hartree atomic units.

/// Femtoseconds to atomic time units.
pub const fs_to_au: f64 = 41.341_373_335_18;

/// Electron volts to Hartree.
pub const eV_to_au: f64 = 0.036_749_322_175_65;

/// MV/cm to atomic units of electric field.
pub const MVpcm_to_au: f64 = 0.000_194_469_038_1;

/// Terahertz to atomic units of (ordinary) frequency.
pub const THz_to_au: f64 = 2.418_884_326_585_7e-5;

/// Ångström to Bohr radii.
pub const as_to_au: f64 = 1.889_726_124_626;

/// Speed of light in atomic units.
pub const c_au: f64 = 137.036;

/// Inverse-length conversion, 1/Å to 1/Bohr.
pub fn inv_as_to_au(k: f64) -> f64 { k / as_to_au }
