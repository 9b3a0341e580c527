//! Collective Channel
//!
//! Thin abstraction over a fixed-size process group with deterministic rank 0 as coordinator.
//!
//! All collectives are blocking and synchronous: every rank in the group must invoke the same
//! collective call the same number of times in the same order, otherwise the group deadlocks.
//! A conditional collective call whose condition could differ between ranks is a correctness
//! bug; conditions derived from an all-reduced verdict are fine because every rank shares them.
//!

use crate::batch::BatchCollection;
use crate::parking_lot::{Condvar, Mutex};
use crate::util::{Point, SubProblemDataMap};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

pub trait CollectiveChannel: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// block until every rank reached this point
    fn barrier(&self);

    /// replace `point` on every rank with the root's value
    fn broadcast_point(&self, point: &mut Point, root: usize);
    fn broadcast_value(&self, value: &mut f64, root: usize);
    fn broadcast_values(&self, values: &mut Vec<f64>, root: usize);
    fn broadcast_flag(&self, flag: &mut bool, root: usize);
    fn broadcast_order(&self, order: &mut Vec<usize>, root: usize);
    fn broadcast_count(&self, count: &mut usize, root: usize);
    /// consistency guarantee after initialization: every rank already built the identical
    /// collection, the broadcast only enforces it
    fn broadcast_batches(&self, batches: &mut BatchCollection, root: usize);

    /// sum of `value` over all ranks; meaningful on `root`, implementations may return the
    /// reduced value on the other ranks as well
    fn reduce_sum(&self, value: f64, root: usize) -> f64;

    /// logical AND of `value` over all ranks, returned to every rank
    fn all_reduce_and(&self, value: bool) -> bool;

    /// collect the per-rank cut maps on `root` in rank order; the other ranks receive an
    /// empty vector
    fn gather_cut_maps(&self, local: SubProblemDataMap, root: usize) -> Vec<SubProblemDataMap>;
}

/// the coordinator rank of every run
pub const ROOT_RANK: usize = 0;

/// a group of one: every collective degenerates to the identity, which is exactly the
/// sequential launch of the algorithm
#[derive(Debug, Clone, Default)]
pub struct SoloChannel;

impl CollectiveChannel for SoloChannel {
    fn rank(&self) -> usize { 0 }
    fn world_size(&self) -> usize { 1 }
    fn barrier(&self) {}
    fn broadcast_point(&self, _point: &mut Point, _root: usize) {}
    fn broadcast_value(&self, _value: &mut f64, _root: usize) {}
    fn broadcast_values(&self, _values: &mut Vec<f64>, _root: usize) {}
    fn broadcast_flag(&self, _flag: &mut bool, _root: usize) {}
    fn broadcast_order(&self, _order: &mut Vec<usize>, _root: usize) {}
    fn broadcast_count(&self, _count: &mut usize, _root: usize) {}
    fn broadcast_batches(&self, _batches: &mut BatchCollection, _root: usize) {}
    fn reduce_sum(&self, value: f64, _root: usize) -> f64 { value }
    fn all_reduce_and(&self, value: bool) -> bool { value }
    fn gather_cut_maps(&self, local: SubProblemDataMap, _root: usize) -> Vec<SubProblemDataMap> {
        vec![local]
    }
}

/// shared slot of the in-flight collective round; the lockstep calling discipline guarantees
/// at most one collective is in flight per group at any time, so a single slot suffices
#[derive(Debug, Default)]
struct GroupState {
    /// per-rank payloads of the round being assembled
    deposits: Vec<Option<Value>>,
    deposited: usize,
    /// combined payload once every rank deposited; cleared by the last taker
    result: Option<Value>,
    takers_remaining: usize,
}

/// in-process collective group: one instance per rank, all sharing the same state;
/// used for single-machine SPMD simulation and for the tests
pub struct LocalCollective {
    rank: usize,
    world: usize,
    state: Arc<Mutex<GroupState>>,
    condvar: Arc<Condvar>,
}

impl LocalCollective {
    /// create the channels of a full group; hand exactly one to each rank
    pub fn new_group(world: usize) -> Vec<Arc<LocalCollective>> {
        assert!(world > 0, "empty group forbidden");
        let state = Arc::new(Mutex::new(GroupState {
            deposits: (0..world).map(|_| None).collect(),
            ..GroupState::default()
        }));
        let condvar = Arc::new(Condvar::new());
        (0..world)
            .map(|rank| {
                Arc::new(Self {
                    rank,
                    world,
                    state: state.clone(),
                    condvar: condvar.clone(),
                })
            })
            .collect()
    }

    /// the single synchronization primitive: every rank deposits a payload, the last one
    /// combines them in rank order and publishes the result, every rank takes it, the last
    /// taker resets the slot for the next round
    fn exchange(&self, payload: Value, combine: impl FnOnce(Vec<Value>) -> Value) -> Value {
        let mut state = self.state.lock();
        // wait for the previous round to be fully drained
        while state.result.is_some() {
            self.condvar.wait(&mut state);
        }
        assert!(
            state.deposits[self.rank].is_none(),
            "rank {} issued a collective call out of lockstep",
            self.rank
        );
        state.deposits[self.rank] = Some(payload);
        state.deposited += 1;
        if state.deposited == self.world {
            let payloads: Vec<Value> = state
                .deposits
                .iter_mut()
                .map(|slot| slot.take().expect("every rank deposited"))
                .collect();
            state.result = Some(combine(payloads));
            state.takers_remaining = self.world;
            self.condvar.notify_all();
        } else {
            while state.result.is_none() {
                self.condvar.wait(&mut state);
            }
        }
        let result = state.result.clone().expect("result published");
        state.takers_remaining -= 1;
        if state.takers_remaining == 0 {
            state.result = None;
            state.deposited = 0;
            self.condvar.notify_all();
        }
        result
    }

    fn broadcast_serde<T: Serialize + DeserializeOwned>(&self, data: &mut T, root: usize) {
        let payload = if self.rank == root {
            serde_json::to_value(&*data).expect("collective payloads are plain data")
        } else {
            Value::Null
        };
        let result = self.exchange(payload, move |mut payloads| payloads.swap_remove(root));
        *data = serde_json::from_value(result).expect("root published a payload of this type");
    }
}

impl CollectiveChannel for LocalCollective {
    fn rank(&self) -> usize { self.rank }
    fn world_size(&self) -> usize { self.world }

    fn barrier(&self) {
        self.exchange(Value::Null, |_| Value::Null);
    }

    fn broadcast_point(&self, point: &mut Point, root: usize) {
        self.broadcast_serde(point, root);
    }
    fn broadcast_value(&self, value: &mut f64, root: usize) {
        self.broadcast_serde(value, root);
    }
    fn broadcast_values(&self, values: &mut Vec<f64>, root: usize) {
        self.broadcast_serde(values, root);
    }
    fn broadcast_flag(&self, flag: &mut bool, root: usize) {
        self.broadcast_serde(flag, root);
    }
    fn broadcast_order(&self, order: &mut Vec<usize>, root: usize) {
        self.broadcast_serde(order, root);
    }
    fn broadcast_count(&self, count: &mut usize, root: usize) {
        self.broadcast_serde(count, root);
    }
    fn broadcast_batches(&self, batches: &mut BatchCollection, root: usize) {
        self.broadcast_serde(batches, root);
    }

    fn reduce_sum(&self, value: f64, _root: usize) -> f64 {
        let result = self.exchange(json!(value), |payloads| {
            let sum: f64 = payloads
                .iter()
                .map(|payload| payload.as_f64().expect("reduce_sum payloads are numbers"))
                .sum();
            json!(sum)
        });
        result.as_f64().expect("reduce_sum publishes a number")
    }

    fn all_reduce_and(&self, value: bool) -> bool {
        let result = self.exchange(json!(value), |payloads| {
            let verdict = payloads
                .iter()
                .all(|payload| payload.as_bool().expect("all_reduce_and payloads are booleans"));
            json!(verdict)
        });
        result.as_bool().expect("all_reduce_and publishes a boolean")
    }

    fn gather_cut_maps(&self, local: SubProblemDataMap, root: usize) -> Vec<SubProblemDataMap> {
        let payload = serde_json::to_value(&local).expect("cut maps are plain data");
        let result = self.exchange(payload, Value::Array);
        if self.rank == root {
            serde_json::from_value(result).expect("every rank deposited a cut map")
        } else {
            vec![]
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::util::point_of;

    fn spawn_group<F>(world: usize, body: F)
    where
        F: Fn(Arc<LocalCollective>) + Send + Sync,
    {
        let channels = LocalCollective::new_group(world);
        std::thread::scope(|scope| {
            for channel in channels {
                scope.spawn(|| body(channel));
            }
        });
    }

    #[test]
    fn collective_broadcast_point_from_root() {
        // cargo test collective_broadcast_point_from_root -- --nocapture
        spawn_group(4, |channel| {
            let mut point = if channel.rank() == 0 {
                point_of(&[("x", 1.5), ("y", -2.)])
            } else {
                Point::new()
            };
            channel.broadcast_point(&mut point, 0);
            assert_eq!(point, point_of(&[("x", 1.5), ("y", -2.)]));
        });
    }

    #[test]
    fn collective_all_reduce_and_spots_single_failure() {
        spawn_group(3, |channel| {
            let ok = channel.rank() != 1;
            assert!(!channel.all_reduce_and(ok));
            // and a round where everyone succeeds
            assert!(channel.all_reduce_and(true));
        });
    }

    #[test]
    fn collective_reduce_sum_over_ranks() {
        spawn_group(4, |channel| {
            let sum = channel.reduce_sum(channel.rank() as f64 + 1., 0);
            assert_eq!(sum, 10.);
        });
    }

    #[test]
    fn collective_gather_preserves_rank_order() {
        spawn_group(3, |channel| {
            let mut local = SubProblemDataMap::new();
            local.insert(
                format!("sub_{}", channel.rank()),
                crate::util::SubProblemData {
                    subproblem_cost: channel.rank() as f64,
                    subgradient: Point::new(),
                    status: crate::util::SolveStatus::Optimal,
                    simplex_iterations: 0,
                    subproblem_timer: 0.,
                },
            );
            let gathered = channel.gather_cut_maps(local, 0);
            if channel.rank() == 0 {
                assert_eq!(gathered.len(), 3);
                for (rank, map) in gathered.iter().enumerate() {
                    assert!(map.contains_key(&format!("sub_{rank}")));
                    assert_eq!(map[&format!("sub_{rank}")].subproblem_cost, rank as f64);
                }
            } else {
                assert!(gathered.is_empty());
            }
        });
    }

    #[test]
    fn collective_lockstep_rounds_back_to_back() {
        // many rounds without barriers in between must not interleave
        spawn_group(4, |channel| {
            for round in 0..50 {
                let sum = channel.reduce_sum(round as f64, 0);
                assert_eq!(sum, 4. * round as f64);
                let mut flag = channel.rank() == 0 && round % 2 == 0;
                channel.broadcast_flag(&mut flag, 0);
                assert_eq!(flag, round % 2 == 0);
            }
            channel.barrier();
        });
    }

    #[test]
    fn collective_solo_channel_is_identity() {
        let channel = SoloChannel;
        assert_eq!(channel.world_size(), 1);
        assert!(channel.all_reduce_and(true));
        assert!(!channel.all_reduce_and(false));
        assert_eq!(channel.reduce_sum(2.5, 0), 2.5);
        let gathered = channel.gather_cut_maps(SubProblemDataMap::new(), 0);
        assert_eq!(gathered.len(), 1);
    }
}
