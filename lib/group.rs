//! Process-group runtime: a fixed set of independent ranks that coordinate
//! only through collective operations.
//!
//! Three implementations are provided: [`SerialGroup`] (one rank),
//! [`LocalGroup`] (one OS thread per rank), and, with the `mpi` feature,
//! [`MpiGroup`].

use std::{
    sync::{
        atomic::{ AtomicBool, Ordering },
        Arc, Condvar, Mutex, MutexGuard, Weak,
    },
    thread,
};
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;

/// Collective operations available to the solver.
///
/// Every member of a group must call each collective in the same order.
pub trait ProcessGroup: Sized {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Partition the group by `color`; members of a new group are ordered by
    /// `key`, then by their rank in `self`.
    fn split(&self, color: usize, key: usize) -> Self;

    fn barrier(&self);

    /// Element-wise sum of `data` across the group, left in every member's
    /// `data`.
    fn sum_in_place(&self, data: &mut [f64]);

    /// Whether `flag` is set on any member. Every member learns the same
    /// answer, so all of them can leave a collective sequence together.
    fn any(&self, flag: bool) -> bool {
        let mut count = [if flag { 1.0 } else { 0.0 }];
        self.sum_in_place(&mut count);
        count[0] > 0.0
    }

    /// Sum-reduce a real array of any shape.
    fn sum_array<D>(&self, array: &mut nd::Array<f64, D>)
    where D: nd::Dimension
    {
        if self.size() == 1 { return; }
        match array.as_slice_mut() {
            Some(slice) => self.sum_in_place(slice),
            None => {
                let mut flat: Vec<f64> = array.iter().copied().collect();
                self.sum_in_place(&mut flat);
                array.iter_mut().zip(flat).for_each(|(a, s)| { *a = s; });
            },
        }
    }

    /// Sum-reduce a complex array of any shape.
    fn sum_complex_array<D>(&self, array: &mut nd::Array<C64, D>)
    where D: nd::Dimension
    {
        if self.size() == 1 { return; }
        let mut flat: Vec<f64>
            = array.iter().flat_map(|z| [z.re, z.im]).collect();
        self.sum_in_place(&mut flat);
        array.iter_mut().zip(flat.chunks_exact(2))
            .for_each(|(a, s)| { *a = C64::new(s[0], s[1]); });
    }
}

/* Serial *********************************************************************/

/// Group of a single process.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialGroup;

impl ProcessGroup for SerialGroup {
    fn rank(&self) -> usize { 0 }

    fn size(&self) -> usize { 1 }

    fn split(&self, _color: usize, _key: usize) -> Self { Self }

    fn barrier(&self) { }

    fn sum_in_place(&self, _data: &mut [f64]) { }
}

/* Threads ********************************************************************/

enum Contribution {
    Sum(Vec<f64>),
    Split { color: usize, key: usize },
}

enum Outcome {
    Sum(Vec<f64>),
    /// For each parent rank: new rank and the shared state of its new group.
    Split(Vec<(usize, Arc<Rendezvous>)>),
}

struct Round {
    slots: Vec<Option<Contribution>>,
    arrived: usize,
    generation: u64,
    outcome: Option<Arc<Outcome>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Every rendezvous created under one [`LocalGroup::run`], including those of
/// split sub-groups. Aborting the family wakes every waiting rank.
struct Family {
    aborted: AtomicBool,
    members: Mutex<Vec<Weak<Rendezvous>>>,
}

impl Family {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            aborted: AtomicBool::new(false),
            members: Mutex::new(Vec::new()),
        })
    }

    fn is_aborted(&self) -> bool { self.aborted.load(Ordering::SeqCst) }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        // release the registry before taking any round lock; rounds register
        // new members while locked
        let members: Vec<Arc<Rendezvous>>
            = lock(&self.members).iter().filter_map(Weak::upgrade).collect();
        for shared in members.iter() {
            let _round = lock(&shared.round);
            shared.done.notify_all();
        }
    }
}

/// Marks the family aborted if its rank unwinds.
struct AbortOnPanic(Arc<Family>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() { self.0.abort(); }
    }
}

/// Meeting point of all members of one group. Each collective is a round:
/// every member deposits a contribution, the last to arrive computes the
/// outcome, and everyone reads it before the next round can complete.
struct Rendezvous {
    size: usize,
    round: Mutex<Round>,
    done: Condvar,
    family: Arc<Family>,
}

impl Rendezvous {
    fn new(size: usize, family: Arc<Family>) -> Arc<Self> {
        let shared = Arc::new(Self {
            size,
            round: Mutex::new(Round {
                slots: (0..size).map(|_| None).collect(),
                arrived: 0,
                generation: 0,
                outcome: None,
            }),
            done: Condvar::new(),
            family: family.clone(),
        });
        lock(&family.members).push(Arc::downgrade(&shared));
        shared
    }

    /// Panics if a rank of the family panicked before the round completed.
    fn exchange(&self, rank: usize, contribution: Contribution)
        -> Arc<Outcome>
    {
        let mut round = lock(&self.round);
        round.slots[rank] = Some(contribution);
        round.arrived += 1;
        if round.arrived == self.size {
            let slots: Vec<Contribution>
                = round.slots.iter_mut().filter_map(Option::take).collect();
            round.outcome = Some(Arc::new(self.resolve(slots)));
            round.arrived = 0;
            round.generation = round.generation.wrapping_add(1);
            self.done.notify_all();
        } else {
            let generation = round.generation;
            while round.generation == generation && !self.family.is_aborted() {
                round = self.done.wait(round)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if round.generation == generation {
                drop(round);
                panic!("rank {} left a collective after a peer rank panicked", rank);
            }
        }
        round.outcome.clone()
            .unwrap_or_else(|| Arc::new(Outcome::Sum(Vec::new())))
    }

    // sums are taken in rank order so that results don't depend on arrival
    // order
    fn resolve(&self, slots: Vec<Contribution>) -> Outcome {
        match slots.first() {
            Some(Contribution::Split { .. }) => {
                // (color, key, parent rank)
                let mut requests: Vec<(usize, usize, usize)>
                    = slots.iter().enumerate()
                    .map(|(rank, c)| match c {
                        Contribution::Split { color, key } => (*color, *key, rank),
                        Contribution::Sum(_) => (usize::MAX, 0, rank),
                    })
                    .collect();
                requests.sort_unstable();
                let mut placement: Vec<Option<(usize, Arc<Rendezvous>)>>
                    = (0..slots.len()).map(|_| None).collect();
                for (_, members) in requests.iter()
                    .group_by(|r| r.0).into_iter()
                {
                    let members: Vec<usize> = members.map(|r| r.2).collect();
                    let shared = Rendezvous::new(members.len(), self.family.clone());
                    for (new_rank, parent) in members.into_iter().enumerate() {
                        placement[parent] = Some((new_rank, shared.clone()));
                    }
                }
                Outcome::Split(placement.into_iter().flatten().collect())
            },
            _ => {
                let len = slots.iter()
                    .map(|c| match c {
                        Contribution::Sum(v) => v.len(),
                        Contribution::Split { .. } => 0,
                    })
                    .max()
                    .unwrap_or(0);
                let mut acc = vec![0.0; len];
                for c in slots.iter() {
                    if let Contribution::Sum(v) = c {
                        acc.iter_mut().zip(v).for_each(|(a, x)| { *a += x; });
                    }
                }
                Outcome::Sum(acc)
            },
        }
    }
}

/// Group of OS threads within a single process, one per rank.
///
/// Ranks share nothing but the collective rendezvous; all problem data is
/// owned by the rank that created it.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalGroup {{ rank: {}, size: {} }}", self.rank, self.shared.size)
    }
}

impl LocalGroup {
    /// Run `f` on `size` ranks, each on its own thread, and collect the
    /// per-rank results in rank order.
    ///
    /// A panic on any rank releases the ranks blocked in collectives and is
    /// propagated to the caller.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalGroup) -> R + Sync,
        R: Send,
    {
        let family = Family::new();
        let shared = Rendezvous::new(size.max(1), family.clone());
        thread::scope(|scope| {
            let handles: Vec<_>
                = (0..size.max(1))
                .map(|rank| {
                    let group = LocalGroup { rank, shared: shared.clone() };
                    let f = &f;
                    let guard = AbortOnPanic(family.clone());
                    thread::Builder::new()
                        .name(format!("rank-{}", rank))
                        .spawn_scoped(scope, move || {
                            let _guard = guard;
                            f(group)
                        })
                })
                .collect();
            handles.into_iter()
                .map(|h| match h {
                    Ok(handle) => match handle.join() {
                        Ok(r) => r,
                        Err(e) => std::panic::resume_unwind(e),
                    },
                    Err(e) => panic!("failed to spawn rank thread: {}", e),
                })
                .collect()
        })
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize { self.rank }

    fn size(&self) -> usize { self.shared.size }

    fn split(&self, color: usize, key: usize) -> Self {
        let outcome = self.shared.exchange(
            self.rank, Contribution::Split { color, key });
        match outcome.as_ref() {
            Outcome::Split(placement) => {
                let (rank, shared) = &placement[self.rank];
                Self { rank: *rank, shared: shared.clone() }
            },
            Outcome::Sum(_) => unreachable!("collectives called out of order"),
        }
    }

    fn barrier(&self) {
        self.shared.exchange(self.rank, Contribution::Sum(Vec::new()));
    }

    fn sum_in_place(&self, data: &mut [f64]) {
        if self.shared.size == 1 { return; }
        let outcome = self.shared.exchange(
            self.rank, Contribution::Sum(data.to_vec()));
        match outcome.as_ref() {
            Outcome::Sum(acc) => data.copy_from_slice(&acc[..data.len()]),
            Outcome::Split(_) => unreachable!("collectives called out of order"),
        }
    }
}

/* MPI ************************************************************************/

#[cfg(feature = "mpi")]
pub use self::mpi_group::MpiGroup;

#[cfg(feature = "mpi")]
mod mpi_group {
    use mpi::{
        collective::SystemOperation,
        topology::{ Color, SimpleCommunicator },
        traits::*,
    };
    use super::ProcessGroup;

    /// Group backed by an MPI communicator.
    pub struct MpiGroup {
        comm: SimpleCommunicator,
    }

    impl MpiGroup {
        pub fn new(comm: SimpleCommunicator) -> Self { Self { comm } }
    }

    impl ProcessGroup for MpiGroup {
        fn rank(&self) -> usize { self.comm.rank() as usize }

        fn size(&self) -> usize { self.comm.size() as usize }

        fn split(&self, color: usize, key: usize) -> Self {
            let comm = self.comm
                .split_by_color_with_key(
                    Color::with_value(color as i32), key as i32)
                .unwrap_or_else(|| self.comm.duplicate());
            Self { comm }
        }

        fn barrier(&self) { self.comm.barrier(); }

        fn sum_in_place(&self, data: &mut [f64]) {
            let send: Vec<f64> = data.to_vec();
            self.comm.all_reduce_into(&send[..], data, SystemOperation::sum());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serial_reduction_is_identity() {
        let mut a = nd::array![[1.0, -2.0], [3.5, 0.25]];
        let b = a.clone();
        SerialGroup.sum_array(&mut a);
        assert_eq!(a, b);
        let group = LocalGroup::run(1, |g| {
            let mut z = nd::array![C64::new(1.0, 2.0), C64::new(-3.0, 0.5)];
            g.sum_complex_array(&mut z);
            z
        });
        assert_eq!(group[0], nd::array![C64::new(1.0, 2.0), C64::new(-3.0, 0.5)]);
    }

    #[test]
    fn threads_sum_and_split() {
        let results = LocalGroup::run(4, |g| {
            let mut data = vec![g.rank() as f64, 1.0];
            g.sum_in_place(&mut data);
            let sub = g.split(g.rank() / 2, g.rank());
            let mut part = [g.rank() as f64];
            sub.sum_in_place(&mut part);
            sub.barrier();
            g.barrier();
            (data, sub.rank(), sub.size(), part[0])
        });
        for (rank, (data, sub_rank, sub_size, part)) in results.iter().enumerate() {
            assert_eq!(data, &vec![6.0, 4.0]);
            assert_eq!(*sub_rank, rank % 2);
            assert_eq!(*sub_size, 2);
            let expected = if rank < 2 { 1.0 } else { 5.0 };
            assert_eq!(*part, expected);
        }
    }

    #[test]
    fn any_flag_reaches_every_rank() {
        let results = LocalGroup::run(3, |g| (g.any(g.rank() == 2), g.any(false)));
        assert_eq!(results, vec![(true, false); 3]);
        assert!(SerialGroup.any(true));
    }

    #[test]
    fn panicking_rank_releases_its_peers() {
        let outcome = std::panic::catch_unwind(|| {
            LocalGroup::run(3, |g| {
                let sub = g.split(g.rank() % 2, g.rank());
                if g.rank() == 0 { panic!("rank 0 gives up"); }
                sub.barrier();
                g.barrier();
            })
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn split_orders_by_key() {
        let results = LocalGroup::run(3, |g| {
            let sub = g.split(0, 10 - g.rank());
            sub.rank()
        });
        assert_eq!(results, vec![2, 1, 0]);
    }
}
