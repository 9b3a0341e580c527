//! Dense Tableau Simplex
//!
//! A small two-phase primal simplex for the reference master problem. Solves
//! `min c.x  s.t.  A x <= b, x >= 0` where `b` may be negative (such rows are flipped and
//! given an artificial variable in phase one). Bland's rule on both the entering and the
//! leaving choice keeps the pivoting finite on degenerate tableaus.
//!

use crate::util::SolveStatus;

const EPS: f64 = 1e-9;
const FEASIBILITY_TOL: f64 = 1e-7;

/// a linear program in `min c.x, A x <= b, x >= 0` form
#[derive(Debug, Clone)]
pub struct LinearProgram {
    pub objective: Vec<f64>,
    pub constraints: Vec<Vec<f64>>,
    pub rhs: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SimplexOutcome {
    pub status: SolveStatus,
    pub point: Vec<f64>,
    pub objective: f64,
    pub iterations: usize,
}

struct Tableau {
    rows: Vec<Vec<f64>>,
    /// reduced-cost row; the last cell holds minus the current objective
    reduced: Vec<f64>,
    basis: Vec<usize>,
    /// rows found redundant after phase one are skipped by the ratio test
    active: Vec<bool>,
    columns: usize,
    /// first artificial column; artificial columns never re-enter the basis
    artificial_start: usize,
}

impl Tableau {
    fn rhs_column(&self) -> usize {
        self.columns
    }

    fn pivot(&mut self, pivot_row: usize, pivot_column: usize) {
        let pivot_value = self.rows[pivot_row][pivot_column];
        debug_assert!(pivot_value.abs() > EPS, "degenerate pivot value");
        let scale = 1. / pivot_value;
        for cell in self.rows[pivot_row].iter_mut() {
            *cell *= scale;
        }
        let pivot_row_values = self.rows[pivot_row].clone();
        for (row_index, row) in self.rows.iter_mut().enumerate() {
            if row_index == pivot_row {
                continue;
            }
            let factor = row[pivot_column];
            if factor.abs() > EPS {
                for (cell, &pivot_cell) in row.iter_mut().zip(pivot_row_values.iter()) {
                    *cell -= factor * pivot_cell;
                }
            }
        }
        let factor = self.reduced[pivot_column];
        if factor.abs() > EPS {
            for (cell, &pivot_cell) in self.reduced.iter_mut().zip(pivot_row_values.iter()) {
                *cell -= factor * pivot_cell;
            }
        }
        self.basis[pivot_row] = pivot_column;
    }

    /// Bland's rule: the lowest-index improving column among the allowed ones
    fn entering_column(&self, allow_artificial: bool) -> Option<usize> {
        let limit = if allow_artificial { self.columns } else { self.artificial_start };
        (0..limit).find(|&column| self.reduced[column] < -EPS)
    }

    /// minimum-ratio test, ties broken by the lowest basis column index
    fn leaving_row(&self, entering: usize) -> Option<usize> {
        let rhs = self.rhs_column();
        let mut best: Option<(usize, f64)> = None;
        for (row_index, row) in self.rows.iter().enumerate() {
            if !self.active[row_index] {
                continue;
            }
            let coefficient = row[entering];
            if coefficient > EPS {
                let ratio = row[rhs] / coefficient;
                let better = match best {
                    None => true,
                    Some((best_row, best_ratio)) => {
                        ratio < best_ratio - EPS
                            || (ratio < best_ratio + EPS && self.basis[row_index] < self.basis[best_row])
                    }
                };
                if better {
                    best = Some((row_index, ratio));
                }
            }
        }
        best.map(|(row_index, _)| row_index)
    }

    /// pivot until the reduced costs are nonnegative
    fn optimize(&mut self, allow_artificial: bool, max_iterations: usize, iterations: &mut usize) -> SolveStatus {
        while *iterations < max_iterations {
            let entering = match self.entering_column(allow_artificial) {
                Some(column) => column,
                None => return SolveStatus::Optimal,
            };
            let leaving = match self.leaving_row(entering) {
                Some(row) => row,
                None => return SolveStatus::Unbounded,
            };
            self.pivot(leaving, entering);
            *iterations += 1;
        }
        SolveStatus::NumericalError
    }
}

/// solve a linear program; `max_iterations` bounds the total pivot count over both phases
pub fn solve(lp: &LinearProgram, max_iterations: usize) -> SimplexOutcome {
    let structural = lp.objective.len();
    let row_count = lp.constraints.len();
    assert_eq!(lp.rhs.len(), row_count, "one rhs entry per constraint row");

    // flip negative-rhs rows so that every row starts with a nonnegative rhs; flipped rows
    // get a surplus column and an artificial basis column
    let mut flipped = vec![false; row_count];
    let artificial_rows: Vec<usize> = (0..row_count).filter(|&row| lp.rhs[row] < 0.).collect();
    for &row in artificial_rows.iter() {
        flipped[row] = true;
    }
    let artificial_start = structural + row_count;
    let columns = artificial_start + artificial_rows.len();

    let mut rows = Vec::with_capacity(row_count);
    let mut basis = Vec::with_capacity(row_count);
    let mut next_artificial = artificial_start;
    for row_index in 0..row_count {
        assert_eq!(
            lp.constraints[row_index].len(),
            structural,
            "constraint rows must match the objective length"
        );
        let sign = if flipped[row_index] { -1. } else { 1. };
        let mut row = vec![0.; columns + 1];
        for (column, &coefficient) in lp.constraints[row_index].iter().enumerate() {
            row[column] = sign * coefficient;
        }
        // slack for kept rows, surplus for flipped rows
        row[structural + row_index] = sign;
        row[columns] = sign * lp.rhs[row_index];
        if flipped[row_index] {
            row[next_artificial] = 1.;
            basis.push(next_artificial);
            next_artificial += 1;
        } else {
            basis.push(structural + row_index);
        }
        rows.push(row);
    }

    let mut tableau = Tableau {
        rows,
        reduced: vec![0.; columns + 1],
        basis,
        active: vec![true; row_count],
        columns,
        artificial_start,
    };
    let mut iterations = 0;

    // phase one: minimize the sum of artificial variables
    if !artificial_rows.is_empty() {
        for column in artificial_start..columns {
            tableau.reduced[column] = 1.;
        }
        for row_index in 0..row_count {
            if tableau.basis[row_index] >= artificial_start {
                let row = tableau.rows[row_index].clone();
                for (cell, &row_cell) in tableau.reduced.iter_mut().zip(row.iter()) {
                    *cell -= row_cell;
                }
            }
        }
        let status = tableau.optimize(true, max_iterations, &mut iterations);
        if status != SolveStatus::Optimal {
            return SimplexOutcome {
                status: if status == SolveStatus::Unbounded { SolveStatus::NumericalError } else { status },
                point: vec![0.; structural],
                objective: 0.,
                iterations,
            };
        }
        let infeasibility = -tableau.reduced[tableau.rhs_column()];
        if infeasibility > FEASIBILITY_TOL {
            return SimplexOutcome {
                status: SolveStatus::Infeasible,
                point: vec![0.; structural],
                objective: 0.,
                iterations,
            };
        }
        // drive surviving artificial variables out of the basis; a row that offers no
        // pivot column is redundant and leaves the ratio test
        for row_index in 0..row_count {
            if tableau.basis[row_index] >= artificial_start {
                let pivot_column = (0..artificial_start)
                    .find(|&column| tableau.rows[row_index][column].abs() > EPS);
                match pivot_column {
                    Some(column) => tableau.pivot(row_index, column),
                    None => tableau.active[row_index] = false,
                }
            }
        }
    }

    // phase two: restore the true objective over the current basis
    tableau.reduced = vec![0.; columns + 1];
    for (column, &cost) in lp.objective.iter().enumerate() {
        tableau.reduced[column] = cost;
    }
    for row_index in 0..row_count {
        let basis_column = tableau.basis[row_index];
        if basis_column < structural {
            let cost = lp.objective[basis_column];
            if cost.abs() > EPS {
                let row = tableau.rows[row_index].clone();
                for (cell, &row_cell) in tableau.reduced.iter_mut().zip(row.iter()) {
                    *cell -= cost * row_cell;
                }
            }
        }
    }
    let status = tableau.optimize(false, max_iterations, &mut iterations);
    if status != SolveStatus::Optimal {
        return SimplexOutcome {
            status,
            point: vec![0.; structural],
            objective: 0.,
            iterations,
        };
    }

    let rhs = tableau.rhs_column();
    let mut point = vec![0.; structural];
    for (row_index, &basis_column) in tableau.basis.iter().enumerate() {
        if basis_column < structural {
            point[basis_column] = tableau.rows[row_index][rhs];
        }
    }
    SimplexOutcome {
        status: SolveStatus::Optimal,
        point,
        objective: -tableau.reduced[rhs],
        iterations,
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn solve_default(lp: &LinearProgram) -> SimplexOutcome {
        solve(lp, 10_000)
    }

    #[test]
    fn simplex_bounded_vertex() {
        // cargo test simplex_bounded_vertex -- --nocapture
        // min -2x - y  s.t.  x + y <= 2, x <= 1  ->  x = 1, y = 1, objective -3
        let lp = LinearProgram {
            objective: vec![-2., -1.],
            constraints: vec![vec![1., 1.], vec![1., 0.]],
            rhs: vec![2., 1.],
        };
        let outcome = solve_default(&lp);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.objective + 3.).abs() < 1e-6);
        assert!((outcome.point[0] - 1.).abs() < 1e-6);
        assert!((outcome.point[1] - 1.).abs() < 1e-6);
    }

    #[test]
    fn simplex_degenerate_objective_on_a_face() {
        // min -x - y  s.t.  x + y <= 1: the whole face is optimal, the value is -1
        let lp = LinearProgram {
            objective: vec![-1., -1.],
            constraints: vec![vec![1., 1.]],
            rhs: vec![1.],
        };
        let outcome = solve_default(&lp);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.objective + 1.).abs() < 1e-6);
        assert!((outcome.point[0] + outcome.point[1] - 1.).abs() < 1e-6);
    }

    #[test]
    fn simplex_negative_rhs_needs_phase_one() {
        // min x  s.t.  x >= 2  (written as -x <= -2)  ->  x = 2
        let lp = LinearProgram {
            objective: vec![1.],
            constraints: vec![vec![-1.]],
            rhs: vec![-2.],
        };
        let outcome = solve_default(&lp);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.objective - 2.).abs() < 1e-6);
        assert!((outcome.point[0] - 2.).abs() < 1e-6);
    }

    #[test]
    fn simplex_detects_infeasible_rows() {
        // x <= 1 and x >= 2 cannot hold together
        let lp = LinearProgram {
            objective: vec![0.],
            constraints: vec![vec![1.], vec![-1.]],
            rhs: vec![1., -2.],
        };
        assert_eq!(solve_default(&lp).status, SolveStatus::Infeasible);
    }

    #[test]
    fn simplex_detects_unbounded_direction() {
        // min -x with no constraint on x
        let lp = LinearProgram {
            objective: vec![-1.],
            constraints: vec![],
            rhs: vec![],
        };
        assert_eq!(solve_default(&lp).status, SolveStatus::Unbounded);
    }

    #[test]
    fn simplex_epigraph_shape_like_the_master() {
        // min x + t  s.t.  t >= 50 - 10x (one optimality cut), x <= 10
        // the kink sits at x = 5 where the cut hits zero: objective 5
        let lp = LinearProgram {
            objective: vec![1., 1.],
            constraints: vec![vec![-10., -1.], vec![1., 0.]],
            rhs: vec![-50., 10.],
        };
        let outcome = solve_default(&lp);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.objective - 5.).abs() < 1e-6, "objective {}", outcome.objective);
        assert!((outcome.point[0] - 5.).abs() < 1e-6);
        assert!(outcome.point[1].abs() < 1e-6);
    }

    #[test]
    fn simplex_two_cuts_pick_the_upper_envelope() {
        // min t  s.t.  t >= 4 - x, t >= x  with x <= 4: optimum at the crossing x = 2, t = 2
        let lp = LinearProgram {
            objective: vec![0., 1.],
            constraints: vec![vec![-1., -1.], vec![1., -1.], vec![1., 0.]],
            rhs: vec![-4., 0., 4.],
        };
        let outcome = solve_default(&lp);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((outcome.objective - 2.).abs() < 1e-6, "objective {}", outcome.objective);
        assert!((outcome.point[0] - 2.).abs() < 1e-6);
        assert!((outcome.point[1] - 2.).abs() < 1e-6);
    }
}
