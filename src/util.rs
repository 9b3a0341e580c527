//! Common Utilities
//!
//! This module defines the shared data model of the decomposition: trial points, per-subproblem
//! cut records, the coordinator-owned iteration state and the run options.
//!

use crate::rand_xoshiro::rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// a candidate point: mapping from candidate-variable name to its current value;
/// the ordered map gives every rank the same iteration order over keys
pub type Point = BTreeMap<String, f64>;

/// subproblem names are plain strings resolved once at initialization
pub type SubProblemName = String;

/// use Xoshiro256StarStar for deterministic random number generator
pub type DeterministicRng = rand_xoshiro::Xoshiro256StarStar;

pub fn deterministic_rng(seed: u64) -> DeterministicRng {
    DeterministicRng::seed_from_u64(seed)
}

/// status reported by the master and subproblem solvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    NumericalError,
}

/// why a run stopped; `Empty` while the run is still going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppingCriterion {
    Empty,
    Timelimit,
    AbsoluteGap,
    RelativeGap,
    MaxIterations,
    ExceptionRaised,
}

/// one cut record produced by a worker and consumed exactly once by cut aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProblemData {
    /// optimal cost of the subproblem fixed at the cut point
    pub subproblem_cost: f64,
    /// subgradient with respect to each candidate variable (the dual of the fixation)
    pub subgradient: Point,
    /// solver status of the last solve
    pub status: SolveStatus,
    /// simplex iterations spent on the last solve
    pub simplex_iterations: usize,
    /// wall time of the last solve in seconds
    pub subproblem_timer: f64,
}

/// cut records of one rank for one iteration, keyed by subproblem name
pub type SubProblemDataMap = BTreeMap<SubProblemName, SubProblemData>;

/// the three live points of an iteration; a fresh record is produced each iteration and
/// consumed by the next, so no rank ever mutates a shared point in place
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrialPoints {
    /// the previous accepted cut point
    pub x_in: Point,
    /// the master's current trial solution
    pub x_out: Point,
    /// the stabilized point actually sent to the subproblems
    pub x_cut: Point,
}

/// convex combination of the candidate point and the previous cut point, keyed like `x_out`
pub fn stabilized_point(x_in: &Point, x_out: &Point, separation_param: f64) -> Point {
    assert_eq!(
        x_in.len(),
        x_out.len(),
        "trial points must share the same key set"
    );
    let mut x_cut = Point::new();
    for (name, &out_value) in x_out.iter() {
        let in_value = *x_in
            .get(name)
            .expect("trial points must share the same key set");
        x_cut.insert(
            name.clone(),
            separation_param * out_value + (1. - separation_param) * in_value,
        );
    }
    x_cut
}

impl TrialPoints {
    /// first iteration: the candidate point is accepted as-is
    pub fn reset_to(&mut self, x_out: Point) {
        self.x_in = x_out.clone();
        self.x_cut = x_out.clone();
        self.x_out = x_out;
    }

    /// later iterations: the previous cut point becomes `x_in` and the new cut point moves
    /// towards the candidate by `separation_param`
    pub fn advance(&mut self, x_out: Point, separation_param: f64) {
        self.x_in = std::mem::take(&mut self.x_cut);
        self.x_cut = stabilized_point(&self.x_in, &x_out, separation_param);
        self.x_out = x_out;
    }
}

/// iterative state owned by rank 0; the other ranks only ever see the broadcast stop and
/// relaxation flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationState {
    /// iteration counter (in the batched variant, one per separation round)
    pub it: usize,
    /// iteration that produced the best upper bound
    pub best_it: usize,
    /// lower bound: objective of the relaxed master
    pub lb: f64,
    /// upper bound of the current iteration
    pub ub: f64,
    /// best upper bound seen so far
    pub best_ub: f64,
    /// fixed (investment) part of the current upper bound
    pub invest_cost: f64,
    /// summed subproblem cost of the current iteration
    pub subproblem_cost: f64,
    /// set once the stopping criterion holds; terminal
    pub stop: bool,
    pub stopping_criterion: StoppingCriterion,
    /// whether the master currently runs with integrality relaxed
    pub is_in_initial_relaxation: bool,
    /// wall time since the run started, in seconds
    pub elapsed_time: f64,
    /// wall time of the last master solve
    pub master_time: f64,
    /// wall time of the last subproblem sweep (max over ranks is not needed, the
    /// coordinator measures its own sweep which spans the gather)
    pub subproblems_walltime: f64,
    /// per-iteration cpu time summed over all ranks
    pub subproblems_cumulative_cpu_time: f64,
    /// how many subproblem solves have been paid for so far
    pub cumulative_subproblems_solved: usize,
}

impl Default for IterationState {
    fn default() -> Self {
        Self {
            it: 0,
            best_it: 0,
            lb: -1e20,
            ub: 1e20,
            best_ub: 1e20,
            invest_cost: 0.,
            subproblem_cost: 0.,
            stop: false,
            stopping_criterion: StoppingCriterion::Empty,
            is_in_initial_relaxation: false,
            elapsed_time: 0.,
            master_time: 0.,
            subproblems_walltime: 0.,
            subproblems_cumulative_cpu_time: 0.,
            cumulative_subproblems_solved: 0,
        }
    }
}

/// snapshot handed over by the restart collaborator when resuming a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// the state at the last persisted iteration
    pub state: IterationState,
    /// iterations already spent before this run
    pub iterations_before_resume: usize,
    /// subproblem solves already paid for before this run
    pub subproblems_solved_before_resume: usize,
}

/// user input run options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BendersOptions {
    /// how many subproblems one batch holds; 0 puts everything in a single batch
    #[serde(default = "benders_default_options::batch_size")]
    pub batch_size: usize,
    /// in/out stabilization: weight of the candidate point in the cut point
    #[serde(default = "benders_default_options::separation_param")]
    pub separation_param: f64,
    /// stop once `best_ub - lb` drops to this value
    #[serde(default = "benders_default_options::absolute_gap")]
    pub absolute_gap: f64,
    /// stop once `(best_ub - lb) / |best_ub|` drops to this value
    #[serde(default = "benders_default_options::relative_gap")]
    pub relative_gap: f64,
    /// relative gap at which an initially relaxed master switches to integer
    #[serde(default = "benders_default_options::relaxed_gap")]
    pub relaxed_gap: f64,
    /// maximum number of iterations; 0 means unbounded
    #[serde(default)]
    pub max_iterations: usize,
    /// wall-time limit in seconds, checked by rank 0 only
    #[serde(default = "benders_default_options::time_limit")]
    pub time_limit: f64,
    /// start with integrality constraints deactivated
    #[serde(default)]
    pub initial_relaxation: bool,
    /// seed of the batch permutation generator
    #[serde(default = "benders_default_options::shuffle_seed")]
    pub shuffle_seed: u64,
    /// state handed over by the restart collaborator, if any
    #[serde(default)]
    pub resume: Option<ResumeSnapshot>,
}

pub mod benders_default_options {
    pub fn batch_size() -> usize { 0 }  // by default a single batch holds every subproblem
    pub fn separation_param() -> f64 { 0.5 }
    pub fn absolute_gap() -> f64 { 1e-4 }
    pub fn relative_gap() -> f64 { 1e-6 }
    pub fn relaxed_gap() -> f64 { 1e-2 }
    pub fn time_limit() -> f64 { 1e12 }
    pub fn shuffle_seed() -> u64 { 0x0b1a_5c0d }
}

impl Default for BendersOptions {
    fn default() -> Self {
        serde_json::from_value(json!({})).unwrap()
    }
}

impl BendersOptions {
    /// `separation_param` outside (0, 1] would either freeze or overshoot the cut point
    pub fn sanity_check(&self) {
        assert!(
            self.separation_param > 0. && self.separation_param <= 1.,
            "invalid separation_param {}",
            self.separation_param
        );
        assert!(self.absolute_gap >= 0., "invalid absolute_gap {}", self.absolute_gap);
        assert!(self.relative_gap >= 0., "invalid relative_gap {}", self.relative_gap);
    }
}

/// build a point from name/value pairs; handy in tests and examples
pub fn point_of(pairs: &[(&str, f64)]) -> Point {
    pairs.iter().map(|(name, value)| (name.to_string(), *value)).collect()
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn util_stabilized_point_moves_towards_candidate() {
        // cargo test util_stabilized_point_moves_towards_candidate -- --nocapture
        let x_in = point_of(&[("a", 0.), ("b", 4.)]);
        let x_out = point_of(&[("a", 2.), ("b", 0.)]);
        let x_cut = stabilized_point(&x_in, &x_out, 0.5);
        assert_eq!(x_cut, point_of(&[("a", 1.), ("b", 2.)]));
        let x_cut = stabilized_point(&x_in, &x_out, 1.);
        assert_eq!(x_cut, x_out);
    }

    #[test]
    fn util_trial_points_first_iteration_accepts_candidate() {
        let mut trial = TrialPoints::default();
        trial.reset_to(point_of(&[("a", 3.)]));
        assert_eq!(trial.x_in, trial.x_out);
        assert_eq!(trial.x_cut, trial.x_out);
    }

    #[test]
    fn util_trial_points_advance_keeps_key_set() {
        let mut trial = TrialPoints::default();
        trial.reset_to(point_of(&[("a", 0.), ("b", 0.)]));
        trial.advance(point_of(&[("a", 8.), ("b", 2.)]), 0.25);
        assert_eq!(trial.x_in, point_of(&[("a", 0.), ("b", 0.)]));
        assert_eq!(trial.x_cut, point_of(&[("a", 2.), ("b", 0.5)]));
        // the previous cut point becomes x_in on the next advance
        trial.advance(point_of(&[("a", 8.), ("b", 2.)]), 0.25);
        assert_eq!(trial.x_in, point_of(&[("a", 2.), ("b", 0.5)]));
        for point in [&trial.x_in, &trial.x_out, &trial.x_cut] {
            assert_eq!(point.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        }
    }

    #[test]
    #[should_panic(expected = "same key set")]
    fn util_stabilized_point_rejects_diverging_keys() {
        let x_in = point_of(&[("a", 0.)]);
        let x_out = point_of(&[("b", 1.)]);
        stabilized_point(&x_in, &x_out, 0.5);
    }

    #[test]
    fn util_default_options_from_empty_json() {
        let options = BendersOptions::default();
        assert_eq!(options.batch_size, 0);
        assert_eq!(options.separation_param, 0.5);
        assert!(options.resume.is_none());
        options.sanity_check();
    }

    #[test]
    fn util_deterministic_rng_reproducible() {
        use crate::rand_xoshiro::rand_core::RngCore;
        let mut rng_1 = deterministic_rng(42);
        let mut rng_2 = deterministic_rng(42);
        for _ in 0..16 {
            assert_eq!(rng_1.next_u64(), rng_2.next_u64());
        }
    }
}
