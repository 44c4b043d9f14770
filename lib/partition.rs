//! Assignment of parameter combinations and k-paths to the processes of a
//! group.
//!
//! Modes are tried in priority order:
//! 1. *Combined*: more processes than both paths and combinations. The group
//!    is split into `S / Nk2` sub-groups, each owning a strided subset of the
//!    combinations; within a sub-group every process owns a single path.
//! 2. *Parameter-parallel*: at least as many combinations as paths (or an
//!    explicit list of combinations). Each process owns a contiguous block of
//!    combinations and integrates every path of them on its own.
//! 3. *Point-parallel*: each k-point is its own path; points are split across
//!    the whole group, which shares every combination.
//! 4. *Path-parallel*: paths are split across the whole group, which shares
//!    every combination.

use std::ops::Range;
use crate::error::{ Error, Result };

/// Inputs to the planner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PlanRequest {
    /// Number of processes in the group.
    pub group_size: usize,
    /// Number of parameter combinations to run.
    pub combinations: usize,
    /// Number of k-paths (Nk2).
    pub paths: usize,
    /// Number of points per path (Nk1).
    pub points: usize,
    pub point_parallel: bool,
    /// Whether the combinations were listed explicitly.
    pub explicit_list: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PartitionMode {
    Combined {
        /// Number of sub-groups, `S / Nk2`.
        params_sets: usize,
    },
    ParameterParallel,
    PointParallel,
    PathParallel,
}

impl PartitionMode {
    /// Whether a single combination's observables are spread over several
    /// processes and need to be reduced.
    pub fn shares_combinations(&self) -> bool {
        !matches!(self, Self::ParameterParallel)
    }
}

/// The planner's decision for a whole group.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub request: PlanRequest,
    pub mode: PartitionMode,
}

/// Work owned by one process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    pub rank: usize,
    pub mode: PartitionMode,
    /// Sub-group id; processes with the same color reduce together.
    pub color: usize,
    /// Rank within the sub-group.
    pub sub_rank: usize,
    /// Owned positions in the combination list.
    pub combinations: Vec<usize>,
    /// Owned path indices; for point parallelism, indices into the
    /// flattened point list.
    pub paths: Vec<usize>,
}

impl Assignment {
    /// Whether this process writes the results of its combinations.
    pub fn is_writer(&self) -> bool { self.sub_rank == 0 }
}

/// Contiguous block of `0..n` owned by `rank` out of `size`, with the
/// remainder going to the lowest ranks.
pub fn block_range(n: usize, size: usize, rank: usize) -> Range<usize> {
    let base = n / size;
    let rem = n % size;
    let start = rank * base + rank.min(rem);
    let len = base + usize::from(rank < rem);
    start..start + len
}

/// Group sizes `k · Nk2` that admit a combined partition of `combinations`
/// combinations.
pub fn combined_candidates(combinations: usize, paths: usize) -> Vec<usize> {
    (2..=combinations)
        .filter(|k| combinations % k == 0)
        .map(|k| k * paths)
        .collect()
}

/// Choose a partition mode for the group.
pub fn plan(request: PlanRequest) -> Result<Plan> {
    let PlanRequest {
        group_size: S,
        combinations: C,
        paths: Nk2,
        point_parallel,
        explicit_list,
        ..
    } = request;
    if S == 0 || Nk2 == 0 {
        return Err(Error::config("empty process group or path set"));
    }
    let mode = if S > Nk2 && S > C && !point_parallel {
        if S % Nk2 == 0 && C % (S / Nk2) == 0 && S <= C * Nk2 {
            PartitionMode::Combined { params_sets: S / Nk2 }
        } else {
            return Err(Error::Partition {
                group_size: S,
                candidates: combined_candidates(C, Nk2),
            });
        }
    } else if (C >= Nk2 || explicit_list) && !point_parallel {
        PartitionMode::ParameterParallel
    } else if point_parallel {
        PartitionMode::PointParallel
    } else {
        PartitionMode::PathParallel
    };
    Ok(Plan { request, mode })
}

impl Plan {
    /// Number of sub-groups the group splits into.
    pub fn sub_groups(&self) -> usize {
        match self.mode {
            PartitionMode::Combined { params_sets } => params_sets,
            PartitionMode::ParameterParallel => self.request.group_size,
            PartitionMode::PointParallel | PartitionMode::PathParallel => 1,
        }
    }

    /// Work owned by `rank`.
    pub fn assignment(&self, rank: usize) -> Assignment {
        let PlanRequest {
            group_size: S,
            combinations: C,
            paths: Nk2,
            points: Nk1,
            ..
        } = self.request;
        match self.mode {
            PartitionMode::Combined { params_sets } => Assignment {
                rank,
                mode: self.mode,
                color: rank / Nk2,
                sub_rank: rank % Nk2,
                combinations: (rank / Nk2..C).step_by(params_sets).collect(),
                paths: vec![rank % Nk2],
            },
            PartitionMode::ParameterParallel => Assignment {
                rank,
                mode: self.mode,
                color: rank,
                sub_rank: 0,
                combinations: block_range(C, S, rank).collect(),
                paths: (0..Nk2).collect(),
            },
            PartitionMode::PointParallel => Assignment {
                rank,
                mode: self.mode,
                color: 0,
                sub_rank: rank,
                combinations: (0..C).collect(),
                paths: block_range(Nk1 * Nk2, S, rank).collect(),
            },
            PartitionMode::PathParallel => Assignment {
                rank,
                mode: self.mode,
                color: 0,
                sub_rank: rank,
                combinations: (0..C).collect(),
                paths: block_range(Nk2, S, rank).collect(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(S: usize, C: usize, Nk2: usize) -> PlanRequest {
        PlanRequest {
            group_size: S,
            combinations: C,
            paths: Nk2,
            points: 10,
            point_parallel: false,
            explicit_list: false,
        }
    }

    #[test]
    fn combined_mode() {
        let plan = plan(request(4, 8, 2)).unwrap();
        assert_eq!(plan.mode, PartitionMode::Combined { params_sets: 2 });
        assert_eq!(plan.sub_groups(), 2);
        let a: Vec<Assignment> = (0..4).map(|r| plan.assignment(r)).collect();
        assert_eq!(a[0].combinations, vec![0, 2, 4, 6]);
        assert_eq!(a[1].combinations, vec![0, 2, 4, 6]);
        assert_eq!(a[2].combinations, vec![1, 3, 5, 7]);
        assert_eq!(a[3].paths, vec![1]);
        assert_eq!(a[3].color, 1);
        assert!(a[2].is_writer() && !a[3].is_writer());
    }

    #[test]
    fn combined_mode_unsatisfiable() {
        match plan(request(8, 3, 2)) {
            Err(Error::Partition { group_size, candidates }) => {
                assert_eq!(group_size, 8);
                assert_eq!(candidates, vec![6]);
            },
            other => panic!("expected partition error, got {:?}", other),
        }
    }

    #[test]
    fn parameter_parallel_blocks() {
        let plan = plan(request(3, 7, 2)).unwrap();
        assert_eq!(plan.mode, PartitionMode::ParameterParallel);
        let owned: Vec<Vec<usize>>
            = (0..3).map(|r| plan.assignment(r).combinations).collect();
        assert_eq!(owned, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
        assert!((0..3).all(|r| plan.assignment(r).is_writer()));
        assert_eq!(plan.assignment(1).paths, vec![0, 1]);
    }

    #[test]
    fn path_parallel_covers_paths() {
        let plan = plan(request(3, 1, 8)).unwrap();
        assert_eq!(plan.mode, PartitionMode::PathParallel);
        let mut all: Vec<usize>
            = (0..3).flat_map(|r| plan.assignment(r).paths).collect();
        all.sort();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
        assert!(plan.assignment(0).is_writer());
        assert!(!plan.assignment(2).is_writer());
    }

    #[test]
    fn point_parallel_splits_points() {
        let mut req = request(4, 1, 2);
        req.point_parallel = true;
        let plan = plan(req).unwrap();
        assert_eq!(plan.mode, PartitionMode::PointParallel);
        assert_eq!(plan.assignment(3).paths, (15..20).collect::<Vec<_>>());
    }

    #[test]
    fn explicit_list_forces_parameter_parallel() {
        let mut req = request(2, 1, 4);
        req.explicit_list = true;
        assert_eq!(plan(req).unwrap().mode, PartitionMode::ParameterParallel);
    }
}
