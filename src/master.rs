//! Master Problem
//!
//! The outer optimization over the candidate variables plus one epigraph variable per
//! subproblem. The engine only sees the `MasterProblem` trait; `LpMaster` is the reference
//! implementation backed by the dense simplex, with a small branch-and-bound wrapper for
//! integer candidates.
//!

use crate::error::SolveError;
use crate::simplex::{self, LinearProgram};
use crate::util::{Point, SolveStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// one investment candidate of the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    /// objective coefficient: cost per invested unit
    pub unit_cost: f64,
    /// upper bound of the invested capacity; the lower bound is zero
    pub max_value: f64,
    /// whether the invested capacity must be integral
    #[serde(default)]
    pub integer: bool,
}

/// what one master solve hands back to the engine
#[derive(Debug, Clone)]
pub struct MasterSolution {
    /// objective of the master: the lower bound of the run
    pub objective: f64,
    /// the candidate trial point `x_out`
    pub trial_point: Point,
    /// current under-approximation `alpha_i` of every subproblem cost, by subproblem id
    pub epigraph_values: Vec<f64>,
}

/// collaborator contract of the master problem
pub trait MasterProblem: Send {
    fn solve(&mut self) -> Result<MasterSolution, SolveError>;

    /// add the outer-approximation row `alpha_i >= cost + subgradient . (x - cut_point)`
    fn add_cut(&mut self, subproblem_id: usize, cost: f64, subgradient: &Point, cut_point: &Point);

    fn activate_integrality(&mut self);
    fn deactivate_integrality(&mut self);

    /// objective coefficients of the candidate variables
    fn objective_coefficients(&self) -> Point;

    /// fixed (investment) cost of a candidate point
    fn invest_cost(&self, point: &Point) -> f64 {
        let coefficients = self.objective_coefficients();
        point
            .iter()
            .map(|(name, value)| coefficients.get(name).copied().unwrap_or(0.) * value)
            .sum()
    }
}

/// a stored outer-approximation row `alpha_i >= subgradient . x + rhs`
#[derive(Debug, Clone)]
struct StoredCut {
    subproblem_id: usize,
    subgradient: Point,
    rhs: f64,
}

impl StoredCut {
    fn height_at(&self, point: &Point) -> f64 {
        self.rhs
            + self
                .subgradient
                .iter()
                .map(|(name, coefficient)| coefficient * point.get(name).copied().unwrap_or(0.))
                .sum::<f64>()
    }
}

/// reference master: candidates with box bounds, one epigraph variable per subproblem,
/// accumulated cuts, solved with the dense simplex
pub struct LpMaster {
    candidates: Vec<Candidate>,
    column_of: BTreeMap<String, usize>,
    subproblem_count: usize,
    /// initial lower bound of each epigraph variable, before any cut exists
    epigraph_floor: f64,
    cuts: Vec<StoredCut>,
    integrality_active: bool,
    max_simplex_iterations: usize,
}

const BRANCH_NODE_LIMIT: usize = 10_000;
const INTEGRALITY_TOL: f64 = 1e-6;

impl LpMaster {
    pub fn new(candidates: Vec<Candidate>, subproblem_count: usize, epigraph_floor: f64) -> Self {
        let mut column_of = BTreeMap::new();
        for (column, candidate) in candidates.iter().enumerate() {
            assert!(
                candidate.max_value >= 0.,
                "candidate `{}` has a negative capacity bound",
                candidate.name
            );
            let previous = column_of.insert(candidate.name.clone(), column);
            assert!(previous.is_none(), "duplicate candidate `{}`", candidate.name);
        }
        Self {
            candidates,
            column_of,
            subproblem_count,
            epigraph_floor,
            cuts: vec![],
            integrality_active: false,
            max_simplex_iterations: 100_000,
        }
    }

    pub fn cut_count(&self) -> usize {
        self.cuts.len()
    }

    /// solve the linear relaxation under extra bound rows `row . x <= rhs`
    fn solve_relaxation(&self, extra_rows: &[(Vec<f64>, f64)]) -> Result<MasterSolution, SolveError> {
        let candidate_count = self.candidates.len();
        let variable_count = candidate_count + self.subproblem_count;
        let mut objective = vec![0.; variable_count];
        for (column, candidate) in self.candidates.iter().enumerate() {
            objective[column] = candidate.unit_cost;
        }
        for shift in 0..self.subproblem_count {
            // epigraph variables enter shifted by the floor so they stay nonnegative
            objective[candidate_count + shift] = 1.;
        }

        let mut constraints = vec![];
        let mut rhs = vec![];
        for (column, candidate) in self.candidates.iter().enumerate() {
            let mut row = vec![0.; variable_count];
            row[column] = 1.;
            constraints.push(row);
            rhs.push(candidate.max_value);
        }
        for cut in self.cuts.iter() {
            let mut row = vec![0.; variable_count];
            for (name, &coefficient) in cut.subgradient.iter() {
                if let Some(&column) = self.column_of.get(name) {
                    row[column] = coefficient;
                }
            }
            row[candidate_count + cut.subproblem_id] = -1.;
            constraints.push(row);
            rhs.push(self.epigraph_floor - cut.rhs);
        }
        for (extra_row, extra_rhs) in extra_rows.iter() {
            let mut row = extra_row.clone();
            row.resize(variable_count, 0.);
            constraints.push(row);
            rhs.push(*extra_rhs);
        }

        let outcome = simplex::solve(
            &LinearProgram {
                objective,
                constraints,
                rhs,
            },
            self.max_simplex_iterations,
        );
        if outcome.status != SolveStatus::Optimal {
            return Err(SolveError::MasterStatus {
                status: outcome.status,
            });
        }
        let mut trial_point = Point::new();
        for (column, candidate) in self.candidates.iter().enumerate() {
            trial_point.insert(candidate.name.clone(), outcome.point[column]);
        }
        let epigraph_values: Vec<f64> = (0..self.subproblem_count)
            .map(|shift| outcome.point[candidate_count + shift] + self.epigraph_floor)
            .collect();
        Ok(MasterSolution {
            objective: outcome.objective + self.subproblem_count as f64 * self.epigraph_floor,
            trial_point,
            epigraph_values,
        })
    }

    fn fractional_integer_candidate(&self, solution: &MasterSolution) -> Option<(usize, f64)> {
        for (column, candidate) in self.candidates.iter().enumerate() {
            if !candidate.integer {
                continue;
            }
            let value = solution.trial_point[&candidate.name];
            if (value - value.round()).abs() > INTEGRALITY_TOL {
                return Some((column, value));
            }
        }
        None
    }

    /// depth-first branch and bound over the integer candidates, bounded by the relaxation
    fn solve_integer(&self) -> Result<MasterSolution, SolveError> {
        let mut stack: Vec<Vec<(Vec<f64>, f64)>> = vec![vec![]];
        let mut incumbent: Option<MasterSolution> = None;
        let mut explored = 0;
        while let Some(extra_rows) = stack.pop() {
            explored += 1;
            if explored > BRANCH_NODE_LIMIT {
                return Err(SolveError::MasterStatus {
                    status: SolveStatus::NumericalError,
                });
            }
            let solution = match self.solve_relaxation(&extra_rows) {
                Ok(solution) => solution,
                Err(SolveError::MasterStatus {
                    status: SolveStatus::Infeasible,
                }) => continue,
                Err(error) => return Err(error),
            };
            if let Some(best) = incumbent.as_ref() {
                if solution.objective >= best.objective - 1e-9 {
                    continue;
                }
            }
            match self.fractional_integer_candidate(&solution) {
                None => incumbent = Some(solution),
                Some((column, value)) => {
                    let variable_count = self.candidates.len() + self.subproblem_count;
                    let mut down_row = vec![0.; variable_count];
                    down_row[column] = 1.;
                    let mut down = extra_rows.clone();
                    down.push((down_row, value.floor()));
                    let mut up_row = vec![0.; variable_count];
                    up_row[column] = -1.;
                    let mut up = extra_rows.clone();
                    up.push((up_row, -value.ceil()));
                    stack.push(down);
                    stack.push(up);
                }
            }
        }
        incumbent.ok_or(SolveError::MasterStatus {
            status: SolveStatus::Infeasible,
        })
    }
}

impl MasterProblem for LpMaster {
    fn solve(&mut self) -> Result<MasterSolution, SolveError> {
        let has_integer_candidates = self.candidates.iter().any(|candidate| candidate.integer);
        if self.integrality_active && has_integer_candidates {
            self.solve_integer()
        } else {
            self.solve_relaxation(&[])
        }
    }

    fn add_cut(&mut self, subproblem_id: usize, cost: f64, subgradient: &Point, cut_point: &Point) {
        assert!(
            subproblem_id < self.subproblem_count,
            "cut for unknown subproblem id {subproblem_id}"
        );
        let offset: f64 = subgradient
            .iter()
            .map(|(name, coefficient)| coefficient * cut_point.get(name).copied().unwrap_or(0.))
            .sum();
        let cut = StoredCut {
            subproblem_id,
            subgradient: subgradient.clone(),
            rhs: cost - offset,
        };
        debug!(
            "new cut for subproblem {}: height {} at the cut point",
            subproblem_id,
            cut.height_at(cut_point)
        );
        self.cuts.push(cut);
    }

    fn activate_integrality(&mut self) {
        self.integrality_active = true;
    }

    fn deactivate_integrality(&mut self) {
        self.integrality_active = false;
    }

    fn objective_coefficients(&self) -> Point {
        self.candidates
            .iter()
            .map(|candidate| (candidate.name.clone(), candidate.unit_cost))
            .collect()
    }
}
