//! Top-level orchestration of a parameter scan over a process group.

use tracing::{ info, warn };
use crate::{
    config::{ Params, RunConfig },
    error::{ Error, Result },
    group::ProcessGroup,
    output::OutputSink,
    partition::{ Assignment, PlanRequest, plan },
    screening,
    solver::run_sbe,
    system::System,
};

/// Run every selected combination of `config` over `world`.
///
/// All parameter sets are built and checked before any integration, so
/// configuration errors are raised identically on every rank. Finished runs
/// are handed to `sink` by the writing rank of each sub-group; when enabled,
/// the screening summary is handed to `sink` on world rank 0.
///
/// A failure on any process is agreed on by the whole group: the process
/// that saw it returns its error, every other one returns
/// [`Error::Aborted`].
pub fn sbe_solver<G, S>(
    system: &System,
    config: &RunConfig,
    world: &G,
    sink: &mut S,
) -> Result<Assignment>
where
    G: ProcessGroup,
    S: OutputSink,
{
    let selected = config.selected_combinations()?;
    let all_params: Vec<Params>
        = selected.iter()
        .map(|i| config.params(*i))
        .collect::<Result<Vec<Params>>>()?;
    let Some(first) = all_params.first() else {
        return Err(Error::config("no parameter combinations selected"));
    };

    let plan = plan(PlanRequest {
        group_size: world.size(),
        combinations: selected.len(),
        paths: first.Nk2,
        points: first.Nk1,
        point_parallel: first.point_parallel,
        explicit_list: config.solver.combinations.is_some(),
    })?;
    if world.rank() == 0 {
        info!(
            "{} processes, {} combinations, {} paths: {:?} with {} sub-groups",
            world.size(), selected.len(), first.Nk2, plan.mode, plan.sub_groups(),
        );
    }
    let assignment = plan.assignment(world.rank());
    let sub = world.split(assignment.color, world.rank());

    let mut written = Vec::new();
    let mut failure: Option<Error> = None;
    for pos in assignment.combinations.iter() {
        let params = &all_params[*pos];
        let outcome = run_sbe(params, system, &assignment.paths, &sub)
            .and_then(|mut run| {
                if assignment.is_writer() {
                    sink.write_run(&run)?;
                    run.time.solution = None;
                    written.push(run);
                }
                Ok(())
            });
        // the sub-group moves on to its next combination together
        if sub.any(outcome.is_err()) {
            failure = Some(outcome.err().unwrap_or_else(|| {
                Error::aborted(format!(
                    "another process of sub-group {} failed", assignment.color))
            }));
            break;
        }
    }
    if world.any(failure.is_some()) {
        let err = failure.unwrap_or_else(|| {
            Error::aborted("another process of the run failed")
        });
        warn!("rank {}: stopping: {}", world.rank(), err);
        return Err(err);
    }

    if config.output.save_screening && selected.len() > 1 {
        let names: Vec<&str> = first.scan.iter().map(|(name, _)| *name).collect();
        let n_freq = (first.Nt - 1) * first.factor_freq_resolution + 1;
        let screening = screening::gather(world, &selected, &names, n_freq, &written)?;
        if world.rank() == 0 {
            info!("writing screening of {} combinations", selected.len());
            sink.write_screening(&screening)?;
        }
    }
    Ok(assignment)
}
