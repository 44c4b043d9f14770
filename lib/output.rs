//! Destinations for finished runs.

use std::{
    fs::{ self, File },
    io::Write,
    path::{ Path, PathBuf },
};
use ndarray_npy::NpzWriter;
use crate::{
    error::Result,
    fourier::{ Spectrum, SplitSpectra },
    observables::SplitCurrents,
    screening::Screening,
    solver::RunResult,
};

/// Write a set of named arrays to a `.npz` file.
///
/// Evaluates to `Result<(), WriteNpzError>`; failure to create the file is
/// propagated with `?` from the enclosing function.
#[macro_export]
macro_rules! write_npz {
    ( $path:expr, arrays: { $( $name:expr => $arr:expr ),* $(,)? } ) => {
        {
            let mut npz = ::ndarray_npy::NpzWriter::new(::std::fs::File::create($path)?);
            $( npz.add_array($name, $arr)?; )*
            npz.finish().map(|_| ())
        }
    }
}

/// Receives the results of every combination written by this process, and
/// the screening summary on rank 0.
pub trait OutputSink {
    fn write_run(&mut self, run: &RunResult) -> Result<()>;

    fn write_screening(&mut self, screening: &Screening) -> Result<()>;
}

/// Writes `.npz` files into a directory.
#[derive(Clone, Debug)]
pub struct NpzSink {
    outdir: PathBuf,
}

impl NpzSink {
    /// Creates `outdir` if it doesn't exist.
    pub fn new<P>(outdir: P) -> Result<Self>
    where P: AsRef<Path>
    {
        let outdir = outdir.as_ref().to_path_buf();
        fs::create_dir_all(&outdir)?;
        Ok(Self { outdir })
    }

    pub fn outdir(&self) -> &Path { &self.outdir }

    fn write_params(&self, run: &RunResult) -> Result<()> {
        let p = &run.params;
        let mut file = File::create(
            self.outdir.join(format!("{}params.txt", p.header())))?;
        writeln!(file, "{:#?}", p)?;
        writeln!(file, "truncated paths: {:?}", run.time.truncated_paths())?;
        Ok(())
    }
}

fn add_split_time(npz: &mut NpzWriter<File>, sp: &SplitCurrents) -> Result<()> {
    npz.add_array("P_E_dir", &sp.P_E_dir)?;
    npz.add_array("P_ortho", &sp.P_ortho)?;
    npz.add_array("j_intra_E_dir", &sp.j_intra_E_dir)?;
    npz.add_array("j_intra_ortho", &sp.j_intra_ortho)?;
    npz.add_array("j_anom_ortho", &sp.j_anom_ortho)?;
    npz.add_array("dtP_E_dir", &sp.dtP_E_dir)?;
    npz.add_array("dtP_ortho", &sp.dtP_ortho)?;
    npz.add_array("j_intra_plus_dtP_E_dir", &sp.j_intra_plus_dtP_E_dir)?;
    npz.add_array("j_intra_plus_dtP_ortho", &sp.j_intra_plus_dtP_ortho)?;
    npz.add_array("j_anom_ortho_full", &sp.j_anom_ortho_full)?;
    npz.add_array("j_intra_plus_anom_ortho", &sp.j_intra_plus_anom_ortho)?;
    npz.add_array("j_deph_E_dir", &sp.j_deph_E_dir)?;
    npz.add_array("j_deph_ortho", &sp.j_deph_ortho)?;
    Ok(())
}

fn add_spectrum(npz: &mut NpzWriter<File>, name: &str, sp: &Spectrum)
    -> Result<()>
{
    npz.add_array(format!("{}_w", name), &sp.jw)?;
    npz.add_array(format!("I_{}", name), &sp.Iw)?;
    Ok(())
}

fn add_split_freq(npz: &mut NpzWriter<File>, sp: &SplitSpectra) -> Result<()> {
    add_spectrum(npz, "P_E_dir", &sp.P_E_dir)?;
    add_spectrum(npz, "P_ortho", &sp.P_ortho)?;
    add_spectrum(npz, "j_intra_E_dir", &sp.j_intra_E_dir)?;
    add_spectrum(npz, "j_intra_ortho", &sp.j_intra_ortho)?;
    add_spectrum(npz, "dtP_E_dir", &sp.dtP_E_dir)?;
    add_spectrum(npz, "dtP_ortho", &sp.dtP_ortho)?;
    add_spectrum(npz, "j_intra_plus_dtP_E_dir", &sp.j_intra_plus_dtP_E_dir)?;
    add_spectrum(npz, "j_intra_plus_dtP_ortho", &sp.j_intra_plus_dtP_ortho)?;
    add_spectrum(npz, "j_anom_ortho_full", &sp.j_anom_ortho_full)?;
    add_spectrum(npz, "j_intra_plus_anom_ortho", &sp.j_intra_plus_anom_ortho)?;
    add_spectrum(npz, "j_deph_E_dir", &sp.j_deph_E_dir)?;
    add_spectrum(npz, "j_deph_ortho", &sp.j_deph_ortho)?;
    Ok(())
}

impl OutputSink for NpzSink {
    fn write_run(&mut self, run: &RunResult) -> Result<()> {
        let header = run.params.header();
        let T = &run.time;
        let W = &run.freq;

        let mut npz = NpzWriter::new(
            File::create(self.outdir.join(format!("{}time_data.npz", header)))?);
        npz.add_array("t", &T.t)?;
        npz.add_array("E_field", &T.E_field)?;
        npz.add_array("A_field", &T.A_field)?;
        npz.add_array("j_E_dir", &T.j_E_dir)?;
        npz.add_array("j_ortho", &T.j_ortho)?;
        npz.add_array("truncated_at", &T.truncated_at)?;
        if let Some(sp) = T.split.as_ref() { add_split_time(&mut npz, sp)?; }
        npz.finish()?;

        let mut npz = NpzWriter::new(
            File::create(self.outdir.join(format!("{}frequency_data.npz", header)))?);
        npz.add_array("freq", &W.freq)?;
        add_spectrum(&mut npz, "j_E_dir", &W.j_E_dir)?;
        add_spectrum(&mut npz, "j_ortho", &W.j_ortho)?;
        add_spectrum(&mut npz, "j_E_dir_hann", &W.j_E_dir_hann)?;
        add_spectrum(&mut npz, "j_ortho_hann", &W.j_ortho_hann)?;
        add_spectrum(&mut npz, "j_E_dir_parzen", &W.j_E_dir_parzen)?;
        add_spectrum(&mut npz, "j_ortho_parzen", &W.j_ortho_parzen)?;
        npz.add_array("E_field_w", &W.E_field)?;
        npz.add_array("A_field_w", &W.A_field)?;
        if let Some(sp) = W.split.as_ref() { add_split_freq(&mut npz, sp)?; }
        npz.finish()?;

        if let Some(sol) = T.solution.as_ref() {
            write_npz!(
                self.outdir.join(format!("{}full_solution.npz", header)),
                arrays: {
                    "t" => &T.t,
                    "solution" => sol,
                }
            )?;
        }
        if let Some(snap) = T.snapshots.as_ref() {
            write_npz!(
                self.outdir.join(format!("{}time_matrix.npz", header)),
                arrays: {
                    "t_dm" => &snap.t,
                    "dm" => &snap.rho,
                    "A_field" => &T.A_field,
                }
            )?;
        }
        self.write_params(run)
    }

    fn write_screening(&mut self, screening: &Screening) -> Result<()> {
        write_npz!(
            self.outdir.join("screening.npz"),
            arrays: {
                "freq" => &screening.freq,
                "combinations" => &screening.combinations,
                "values" => &screening.values,
                "I_E_dir" => &screening.I_E_dir,
                "I_ortho" => &screening.I_ortho,
            }
        )?;
        let mut file = File::create(self.outdir.join("screening_names.txt"))?;
        writeln!(file, "{}", screening.names.join(" "))?;
        Ok(())
    }
}

/// Keeps everything in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub runs: Vec<RunResult>,
    pub screening: Option<Screening>,
}

impl OutputSink for MemorySink {
    fn write_run(&mut self, run: &RunResult) -> Result<()> {
        self.runs.push(run.clone());
        Ok(())
    }

    fn write_screening(&mut self, screening: &Screening) -> Result<()> {
        self.screening = Some(screening.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::env;
    use crate::{
        config::{ BandSolver, Gauge },
        group::SerialGroup,
        solver::{ run_sbe, test::{ small_params, small_system } },
    };

    #[test]
    fn npz_files_are_written() {
        let outdir = env::temp_dir().join("bloch-sim-npz-sink-test");
        let mut sink = NpzSink::new(&outdir).unwrap();
        let mut params = small_params(BandSolver::TwoBand, Gauge::Length);
        params.Nt = 11;
        params.save_full = true;
        params.dm_times = vec![params.time(4)];
        let run = run_sbe(&params, &small_system(), &[0, 1], &SerialGroup).unwrap();
        sink.write_run(&run).unwrap();
        let header = params.header();
        for name in [
            "time_data.npz", "frequency_data.npz", "full_solution.npz",
            "time_matrix.npz", "params.txt",
        ] {
            assert!(outdir.join(format!("{}{}", header, name)).is_file());
        }
        fs::remove_dir_all(&outdir).unwrap();
    }
}
