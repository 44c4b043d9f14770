//! Collection of the emission intensities of every parameter combination
//! onto a single process.

use ndarray as nd;
use crate::{
    error::{ Error, Result },
    group::ProcessGroup,
    solver::RunResult,
};

/// Intensities of all combinations on a common frequency axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Screening {
    pub freq: nd::Array1<f64>,
    /// Combination indices, one per row.
    pub combinations: nd::Array1<u64>,
    /// Scanned parameter names.
    pub names: Vec<String>,
    /// Scanned parameter values (lab units), shape `(C, names)`.
    pub values: nd::Array2<f64>,
    /// Shape `(C, n_freq)`.
    pub I_E_dir: nd::Array2<f64>,
    pub I_ortho: nd::Array2<f64>,
}

/// Sum-reduce the intensities held by `runs` across `world`.
///
/// `selected` lists every combination of the run in row order; each
/// combination must appear in the `runs` of exactly one process. Every
/// member of `world` must call this with the same `selected`, `names` and
/// `n_freq`.
pub fn gather<G>(
    world: &G,
    selected: &[usize],
    names: &[&str],
    n_freq: usize,
    runs: &[RunResult],
) -> Result<Screening>
where G: ProcessGroup
{
    let C = selected.len();
    let mut freq: nd::Array2<f64> = nd::Array2::zeros((C, n_freq));
    let mut values: nd::Array2<f64> = nd::Array2::zeros((C, names.len()));
    let mut I_E_dir: nd::Array2<f64> = nd::Array2::zeros((C, n_freq));
    let mut I_ortho: nd::Array2<f64> = nd::Array2::zeros((C, n_freq));
    // [rows filled, rows with a mismatched axis length]
    let mut counts: nd::Array1<f64> = nd::Array1::zeros(2);

    for run in runs.iter() {
        let Some(row) = selected.iter().position(|c| *c == run.params.index) else {
            continue;
        };
        counts[0] += 1.0;
        if run.freq.freq.len() != n_freq {
            counts[1] += 1.0;
            continue;
        }
        freq.row_mut(row).assign(&run.freq.freq);
        I_E_dir.row_mut(row).assign(&run.freq.j_E_dir.Iw);
        I_ortho.row_mut(row).assign(&run.freq.j_ortho.Iw);
        for (col, (_, v)) in run.params.scan.iter().enumerate().take(names.len()) {
            values[[row, col]] = *v;
        }
    }

    world.sum_array(&mut freq);
    world.sum_array(&mut values);
    world.sum_array(&mut I_E_dir);
    world.sum_array(&mut I_ortho);
    world.sum_array(&mut counts);

    if counts[1] > 0.0 {
        return Err(Error::consistency(format!(
            "{} combinations have a frequency axis of the wrong length \
            (expected {})",
            counts[1], n_freq,
        )));
    }
    if counts[0] != C as f64 {
        return Err(Error::consistency(format!(
            "expected {} combinations in screening, found {}",
            C, counts[0],
        )));
    }
    let axis = freq.row(0).to_owned();
    for (row, f) in freq.outer_iter().enumerate() {
        let agree = f.iter().zip(axis.iter())
            .all(|(a, b)| (a - b).abs() <= 1e-12 * b.abs().max(1.0));
        if !agree {
            return Err(Error::consistency(format!(
                "frequency axis of combination {} differs from combination {}",
                selected[row], selected[0],
            )));
        }
    }
    Ok(Screening {
        freq: axis,
        combinations: selected.iter().map(|c| *c as u64).collect(),
        names: names.iter().map(|s| s.to_string()).collect(),
        values,
        I_E_dir,
        I_ortho,
    })
}
