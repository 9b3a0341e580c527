//! Subproblem Worker
//!
//! One worker owns one optimization subproblem instance and exposes the fix-trial / solve /
//! extract-cut operations the iteration engine needs. Collaborator failures are returned as
//! values and handled by the failure-detection protocol; they never crash the process.
//!

use crate::error::{ConfigError, SolveError};
use crate::master::MasterProblem;
use crate::util::{Point, SolveStatus, SubProblemData, SubProblemName};
use std::time::Instant;

/// the solve capability required from each local subproblem instance; the underlying
/// linear solve is an external collaborator and stays opaque to the engine
pub trait SubproblemSolver: Send {
    /// constrain the coupling variables to the given trial values
    fn fix_to(&mut self, point: &Point) -> Result<(), SolveError>;

    /// solve the fixed subproblem
    fn solve(&mut self) -> Result<SolveStatus, SolveError>;

    /// optimal cost; valid only after a successful solve
    fn value(&self) -> f64;

    /// subgradient with respect to the coupling variables; valid only after a successful solve
    fn subgradient(&self) -> Point;

    /// simplex iterations of the last solve, when the collaborator reports them
    fn simplex_iterations(&self) -> usize {
        0
    }
}

/// a locally owned subproblem with its bookkeeping
pub struct SubproblemWorker {
    pub name: SubProblemName,
    /// global index of this subproblem, shared by every rank; indexes the
    /// under-approximation vector
    pub subproblem_id: usize,
    solver: Box<dyn SubproblemSolver>,
}

impl SubproblemWorker {
    pub fn new(name: SubProblemName, subproblem_id: usize, solver: Box<dyn SubproblemSolver>) -> Self {
        Self {
            name,
            subproblem_id,
            solver,
        }
    }

    /// fix at the cut point, solve and extract one cut record
    pub fn solve_at(&mut self, x_cut: &Point) -> Result<SubProblemData, SolveError> {
        let timer = Instant::now();
        self.solver.fix_to(x_cut)?;
        let status = self.solver.solve()?;
        if status != SolveStatus::Optimal {
            return Err(SolveError::SubproblemStatus {
                name: self.name.clone(),
                status,
            });
        }
        Ok(SubProblemData {
            subproblem_cost: self.solver.value(),
            subgradient: self.solver.subgradient(),
            status,
            simplex_iterations: self.solver.simplex_iterations(),
            subproblem_timer: timer.elapsed().as_secs_f64(),
        })
    }
}

/// builds the master and the named subproblems of a run; the name list must be derived
/// deterministically so every rank computes the identical partition
pub trait ProblemProvider: Send + Sync {
    fn subproblem_names(&self) -> Vec<SubProblemName>;
    fn build_master(&self) -> Result<Box<dyn MasterProblem>, ConfigError>;
    fn build_subproblem(&self, name: &str) -> Result<Box<dyn SubproblemSolver>, ConfigError>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::util::point_of;

    /// a scripted subproblem for engine and aggregation tests: cost and subgradient are
    /// affine in the fixed point
    pub struct AffineSubproblem {
        pub name: String,
        pub base_cost: f64,
        pub gradient: Point,
        fixed: Point,
    }

    impl AffineSubproblem {
        pub fn new(name: &str, base_cost: f64, gradient: Point) -> Self {
            Self {
                name: name.to_string(),
                base_cost,
                gradient,
                fixed: Point::new(),
            }
        }
    }

    impl SubproblemSolver for AffineSubproblem {
        fn fix_to(&mut self, point: &Point) -> Result<(), SolveError> {
            self.fixed = point.clone();
            Ok(())
        }
        fn solve(&mut self) -> Result<SolveStatus, SolveError> {
            Ok(SolveStatus::Optimal)
        }
        fn value(&self) -> f64 {
            self.base_cost
                + self
                    .gradient
                    .iter()
                    .map(|(name, coefficient)| coefficient * self.fixed.get(name).copied().unwrap_or(0.))
                    .sum::<f64>()
        }
        fn subgradient(&self) -> Point {
            self.gradient.clone()
        }
        fn simplex_iterations(&self) -> usize {
            1
        }
    }

    /// always fails; exercises the failure-detection protocol
    pub struct FailingSubproblem {
        pub name: String,
    }

    impl SubproblemSolver for FailingSubproblem {
        fn fix_to(&mut self, _point: &Point) -> Result<(), SolveError> {
            Err(SolveError::InfeasibleFixation {
                name: self.name.clone(),
            })
        }
        fn solve(&mut self) -> Result<SolveStatus, SolveError> {
            Err(SolveError::SubproblemStatus {
                name: self.name.clone(),
                status: SolveStatus::NumericalError,
            })
        }
        fn value(&self) -> f64 {
            unreachable!("a failing subproblem never solves")
        }
        fn subgradient(&self) -> Point {
            unreachable!("a failing subproblem never solves")
        }
    }

    #[test]
    fn subproblem_worker_extracts_cut_record() {
        // cargo test subproblem_worker_extracts_cut_record -- --nocapture
        let solver = AffineSubproblem::new("sub_a", 10., point_of(&[("x", -2.)]));
        let mut worker = SubproblemWorker::new("sub_a".to_string(), 0, Box::new(solver));
        let data = worker.solve_at(&point_of(&[("x", 3.)])).unwrap();
        assert_eq!(data.subproblem_cost, 4.);
        assert_eq!(data.subgradient, point_of(&[("x", -2.)]));
        assert_eq!(data.status, SolveStatus::Optimal);
        assert_eq!(data.simplex_iterations, 1);
    }

    #[test]
    fn subproblem_worker_surfaces_infeasible_fixation() {
        let solver = FailingSubproblem {
            name: "sub_bad".to_string(),
        };
        let mut worker = SubproblemWorker::new("sub_bad".to_string(), 0, Box::new(solver));
        let error = worker.solve_at(&Point::new()).unwrap_err();
        assert!(matches!(error, SolveError::InfeasibleFixation { .. }));
    }
}
