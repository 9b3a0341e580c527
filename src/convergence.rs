//! Convergence Tracker
//!
//! Rank 0 owns the iterative state and evaluates the stopping criterion once per outer
//! iteration; the stop flag is the single piece of state broadcast to terminate every
//! rank's loop in lock-step. The relaxed-to-integer transition is one-way.
//!

use crate::util::{BendersOptions, IterationState, StoppingCriterion};

#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    pub state: IterationState,
    absolute_gap: f64,
    relative_gap: f64,
    relaxed_gap: f64,
    max_iterations: usize,
    time_limit: f64,
    iterations_before_resume: usize,
}

impl ConvergenceTracker {
    pub fn new(options: &BendersOptions) -> Self {
        let (state, iterations_before_resume, solved_before_resume) = match options.resume.as_ref() {
            Some(snapshot) => (
                snapshot.state.clone(),
                snapshot.iterations_before_resume,
                snapshot.subproblems_solved_before_resume,
            ),
            None => (IterationState::default(), 0, 0),
        };
        let mut tracker = Self {
            state,
            absolute_gap: options.absolute_gap,
            relative_gap: options.relative_gap,
            relaxed_gap: options.relaxed_gap,
            max_iterations: options.max_iterations,
            time_limit: options.time_limit,
            iterations_before_resume,
        };
        // a resumed run starts a fresh loop but keeps the inherited bounds; the local
        // iteration counter restarts and the paid-for iterations live in the offset
        tracker.state.it = 0;
        tracker.state.stop = false;
        tracker.state.stopping_criterion = StoppingCriterion::Empty;
        tracker.state.cumulative_subproblems_solved = solved_before_resume;
        tracker
    }

    /// iteration count including the iterations paid for before a resume
    pub fn total_iterations(&self) -> usize {
        self.state.it + self.iterations_before_resume
    }

    pub fn absolute_gap(&self) -> f64 {
        self.state.best_ub - self.state.lb
    }

    pub fn relative_gap(&self) -> f64 {
        self.absolute_gap() / self.state.best_ub.abs().max(f64::EPSILON)
    }

    /// keep the best bound and remember which iteration produced it
    pub fn update_best_ub(&mut self) {
        if self.state.ub < self.state.best_ub {
            self.state.best_ub = self.state.ub;
            self.state.best_it = self.state.it;
        }
    }

    pub fn max_iterations_reached(&self) -> bool {
        self.max_iterations > 0 && self.state.it >= self.max_iterations
    }

    pub fn time_limit_reached(&self, elapsed: f64) -> bool {
        elapsed > self.time_limit
    }

    /// evaluate the stopping criterion; gap-based stops are suspended while the master
    /// still runs relaxed, where they trigger the integer switch instead
    pub fn should_stop(&self, elapsed: f64) -> StoppingCriterion {
        if self.time_limit_reached(elapsed) {
            return StoppingCriterion::Timelimit;
        }
        if self.max_iterations_reached() {
            return StoppingCriterion::MaxIterations;
        }
        if !self.state.is_in_initial_relaxation {
            if self.absolute_gap() <= self.absolute_gap {
                return StoppingCriterion::AbsoluteGap;
            }
            if self.relative_gap() <= self.relative_gap {
                return StoppingCriterion::RelativeGap;
            }
        }
        StoppingCriterion::Empty
    }

    /// mark the state as stopped with the given criterion; terminal
    pub fn stop_with(&mut self, criterion: StoppingCriterion) {
        self.state.stop = true;
        self.state.stopping_criterion = criterion;
    }

    /// whether the switch-to-integer condition holds: the relaxed master already closed
    /// most of the gap
    pub fn should_switch_to_integer(&self) -> bool {
        self.state.is_in_initial_relaxation && self.relative_gap() <= self.relaxed_gap
    }

    pub fn set_data_pre_relaxation(&mut self) {
        self.state.is_in_initial_relaxation = true;
    }

    /// leaving the relaxation: relaxed bounds are no longer valid for the integer master
    pub fn reset_data_post_relaxation(&mut self) {
        self.state.is_in_initial_relaxation = false;
        let defaults = IterationState::default();
        self.state.lb = defaults.lb;
        self.state.ub = defaults.ub;
        self.state.best_ub = defaults.best_ub;
        self.state.best_it = 0;
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::util::ResumeSnapshot;

    fn tracker_with(options: BendersOptions) -> ConvergenceTracker {
        ConvergenceTracker::new(&options)
    }

    #[test]
    fn convergence_best_ub_keeps_best_iteration() {
        // cargo test convergence_best_ub_keeps_best_iteration -- --nocapture
        let mut tracker = tracker_with(BendersOptions::default());
        tracker.state.it = 3;
        tracker.state.ub = 100.;
        tracker.update_best_ub();
        assert_eq!(tracker.state.best_ub, 100.);
        assert_eq!(tracker.state.best_it, 3);
        tracker.state.it = 4;
        tracker.state.ub = 120.;
        tracker.update_best_ub();
        // a worse bound changes nothing
        assert_eq!(tracker.state.best_ub, 100.);
        assert_eq!(tracker.state.best_it, 3);
        tracker.state.it = 5;
        tracker.state.ub = 90.;
        tracker.update_best_ub();
        assert_eq!(tracker.state.best_ub, 90.);
        assert_eq!(tracker.state.best_it, 5);
    }

    #[test]
    fn convergence_criterion_precedence() {
        let mut options = BendersOptions::default();
        options.time_limit = 100.;
        options.max_iterations = 10;
        options.absolute_gap = 1.;
        let mut tracker = tracker_with(options);
        tracker.state.lb = 0.;
        tracker.state.best_ub = 0.5;
        tracker.state.it = 10;
        // the time limit wins over everything else
        assert_eq!(tracker.should_stop(101.), StoppingCriterion::Timelimit);
        assert_eq!(tracker.should_stop(1.), StoppingCriterion::MaxIterations);
        tracker.state.it = 5;
        assert_eq!(tracker.should_stop(1.), StoppingCriterion::AbsoluteGap);
        tracker.state.best_ub = 100.;
        assert_eq!(tracker.should_stop(1.), StoppingCriterion::Empty);
    }

    #[test]
    fn convergence_gap_stop_suspended_while_relaxed() {
        let mut options = BendersOptions::default();
        options.absolute_gap = 1.;
        options.relaxed_gap = 1e-2;
        let mut tracker = tracker_with(options);
        tracker.set_data_pre_relaxation();
        tracker.state.lb = 99.9;
        tracker.state.best_ub = 100.;
        assert_eq!(tracker.should_stop(0.), StoppingCriterion::Empty);
        assert!(tracker.should_switch_to_integer());
        // leaving the relaxation resets the bounds and re-arms the gap criteria
        tracker.reset_data_post_relaxation();
        assert!(!tracker.state.is_in_initial_relaxation);
        assert!(!tracker.should_switch_to_integer());
        assert!(tracker.absolute_gap() > 1e19);
    }

    #[test]
    fn convergence_zero_max_iterations_means_unbounded() {
        let mut tracker = tracker_with(BendersOptions::default());
        tracker.state.it = 1_000_000;
        assert!(!tracker.max_iterations_reached());
    }

    #[test]
    fn convergence_resume_keeps_bounds_and_offsets() {
        let mut state = IterationState::default();
        state.it = 7;
        state.lb = 10.;
        state.best_ub = 20.;
        state.stop = true;
        state.stopping_criterion = StoppingCriterion::Timelimit;
        let mut options = BendersOptions::default();
        options.resume = Some(ResumeSnapshot {
            state,
            iterations_before_resume: 7,
            subproblems_solved_before_resume: 140,
        });
        let tracker = tracker_with(options);
        // the inherited stop flag and local counter are cleared, the bounds and the
        // offsets survive
        assert!(!tracker.state.stop);
        assert_eq!(tracker.state.it, 0);
        assert_eq!(tracker.state.stopping_criterion, StoppingCriterion::Empty);
        assert_eq!(tracker.state.lb, 10.);
        assert_eq!(tracker.state.best_ub, 20.);
        assert_eq!(tracker.total_iterations(), 7);
        assert_eq!(tracker.state.cumulative_subproblems_solved, 140);
    }
}
