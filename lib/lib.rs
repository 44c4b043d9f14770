#![allow(dead_code, non_snake_case, non_upper_case_globals)]

//! Semiconductor Bloch equations on a Brillouin-zone mesh, integrated in
//! parallel over parameter combinations and k-paths.

pub mod error;
pub mod units;
pub mod config;
pub mod field;
pub mod mesh;
pub mod partition;
pub mod group;
pub mod system;
pub mod rhs;
pub mod integrate;
pub mod observables;
pub mod fourier;
pub mod solver;
pub mod screening;
pub mod output;
pub mod driver;

pub use error::{ Error, Result };
