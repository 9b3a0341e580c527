//! Batch Scheduler
//!
//! Partitions the subproblem names into fixed-size batches, assigns every subproblem to the
//! rank `global_index % world_size`, and produces reproducible randomized batch visitation
//! orders for the separation loop.
//!

use crate::rand_xoshiro::rand_core::RngCore;
use crate::util::{deterministic_rng, DeterministicRng, SubProblemName};
use serde::{Deserialize, Serialize};

/// an ordered group of subproblem names, processed together to amortize synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: usize,
    pub subproblem_names: Vec<SubProblemName>,
}

/// the fixed partition of the subproblem set, identical on every rank for the lifetime of
/// the run; built once from data that is already identical everywhere and broadcast from
/// rank 0 as a consistency guarantee
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCollection {
    pub batches: Vec<Batch>,
}

impl BatchCollection {
    /// split the name list into contiguous groups of `batch_size`; the last group may be
    /// smaller; `batch_size == 0` produces a single batch containing everything
    pub fn build(subproblem_names: &[SubProblemName], batch_size: usize) -> Self {
        let effective_size = if batch_size == 0 {
            subproblem_names.len().max(1)
        } else {
            batch_size
        };
        let batches = subproblem_names
            .chunks(effective_size)
            .enumerate()
            .map(|(batch_id, chunk)| Batch {
                batch_id,
                subproblem_names: chunk.to_vec(),
            })
            .collect();
        let collection = Self { batches };
        collection.sanity_check(subproblem_names);
        collection
    }

    pub fn number_of_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batch(&self, batch_id: usize) -> &Batch {
        &self.batches[batch_id]
    }

    /// every subproblem name in batch order; this is the global index order used for rank
    /// assignment
    pub fn flattened_names(&self) -> Vec<SubProblemName> {
        self.batches
            .iter()
            .flat_map(|batch| batch.subproblem_names.iter().cloned())
            .collect()
    }

    /// the partition must cover the input exactly once, dropping or duplicating nothing
    pub fn sanity_check(&self, subproblem_names: &[SubProblemName]) {
        let flattened = self.flattened_names();
        assert_eq!(
            flattened.len(),
            subproblem_names.len(),
            "batches must partition the subproblem set"
        );
        for (name, expected) in flattened.iter().zip(subproblem_names.iter()) {
            assert_eq!(name, expected, "batches must keep the input order");
        }
        for (batch_id, batch) in self.batches.iter().enumerate() {
            assert_eq!(batch.batch_id, batch_id, "batch ids must be contiguous");
            assert!(!batch.subproblem_names.is_empty(), "empty batch forbidden");
        }
    }
}

/// owning rank of a subproblem: round-robin over its global index
pub fn owning_rank(global_index: usize, world_size: usize) -> usize {
    global_index % world_size
}

/// reproducible pseudo-random batch visitation orders, drawn by rank 0 once per outer
/// iteration and broadcast so every rank walks the batches identically
#[derive(Debug)]
pub struct BatchShuffler {
    number_of_batches: usize,
    rng: DeterministicRng,
}

impl BatchShuffler {
    pub fn new(number_of_batches: usize, seed: u64) -> Self {
        Self {
            number_of_batches,
            rng: deterministic_rng(seed),
        }
    }

    /// a full permutation of the batch indices, rotated so that iteration begins at
    /// `start_batch % number_of_batches`
    pub fn cyclic_order(&mut self, start_batch: usize) -> Vec<usize> {
        let n = self.number_of_batches;
        assert!(n > 0, "cannot shuffle an empty batch collection");
        let mut order: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = (self.rng.next_u64() as usize) % (i + 1);
            order.swap(i, j);
        }
        let start = start_batch % n;
        let position = order
            .iter()
            .position(|&batch_id| batch_id == start)
            .expect("a full permutation contains every batch id");
        order.rotate_left(position);
        order
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn names(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("sub_{index:03}")).collect()
    }

    #[test]
    fn batch_partition_complete_for_all_sizes() {
        // cargo test batch_partition_complete_for_all_sizes -- --nocapture
        for count in [1, 2, 5, 7, 16] {
            for batch_size in [0, 1, 2, 3, 5, 16, 100] {
                let input = names(count);
                let collection = BatchCollection::build(&input, batch_size);
                assert_eq!(collection.flattened_names(), input);
                if batch_size == 0 {
                    assert_eq!(collection.number_of_batches(), 1);
                } else {
                    assert_eq!(
                        collection.number_of_batches(),
                        (count + batch_size - 1) / batch_size
                    );
                }
            }
        }
    }

    #[test]
    fn batch_scenario_two_batches_three_ranks() {
        // 4 subproblems, batch size 2, world size 3: owners are [0, 1, 2, 0]
        let collection = BatchCollection::build(&names(4), 2);
        assert_eq!(collection.number_of_batches(), 2);
        assert_eq!(collection.batch(0).subproblem_names.len(), 2);
        assert_eq!(collection.batch(1).subproblem_names.len(), 2);
        let owners: Vec<usize> = (0..4).map(|index| owning_rank(index, 3)).collect();
        assert_eq!(owners, vec![0, 1, 2, 0]);
    }

    #[test]
    fn batch_assignment_covers_every_rank_slot() {
        for world_size in 1..6 {
            for count in 1..20 {
                let mut per_rank = vec![0usize; world_size];
                for index in 0..count {
                    let rank = owning_rank(index, world_size);
                    assert!(rank < world_size);
                    per_rank[rank] += 1;
                }
                assert_eq!(per_rank.iter().sum::<usize>(), count);
                // round robin keeps the loads within one of each other
                let min = per_rank.iter().min().unwrap();
                let max = per_rank.iter().max().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn batch_cyclic_order_is_rotated_permutation() {
        for n in [1, 2, 3, 8, 13] {
            let mut shuffler = BatchShuffler::new(n, 99);
            for start in 0..2 * n {
                let order = shuffler.cyclic_order(start);
                assert_eq!(order.len(), n);
                assert_eq!(order[0], start % n);
                let unique: BTreeSet<usize> = order.iter().copied().collect();
                assert_eq!(unique.len(), n, "not a permutation: {order:?}");
                assert!(order.iter().all(|&batch_id| batch_id < n));
            }
        }
    }

    #[test]
    fn batch_cyclic_order_reproducible_across_ranks() {
        let mut shuffler_1 = BatchShuffler::new(10, 1234);
        let mut shuffler_2 = BatchShuffler::new(10, 1234);
        for start in 0..10 {
            assert_eq!(shuffler_1.cyclic_order(start), shuffler_2.cyclic_order(start));
        }
        // a different seed gives a different trajectory somewhere
        let mut shuffler_3 = BatchShuffler::new(10, 5678);
        let trajectories_differ = (0..10)
            .any(|start| BatchShuffler::new(10, 1234).cyclic_order(start) != shuffler_3.cyclic_order(start));
        assert!(trajectories_differ);
    }
}
