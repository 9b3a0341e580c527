//! Cut Aggregation
//!
//! Builds the per-rank cut records at the stabilized point, evaluates them at the candidate
//! point to detect mispricing against the master's under-approximations, accumulates the
//! per-rank gap contribution, and feeds the gathered cuts into the master on rank 0.
//!

use crate::error::SolveError;
use crate::master::MasterProblem;
use crate::subproblem::SubproblemWorker;
use crate::util::{Point, SubProblemData, SubProblemDataMap, TrialPoints};
use std::collections::BTreeMap;

/// value of a cut taken at the cut point, evaluated at the candidate point:
/// `cost + subgradient . (x_out - x_cut)`
pub fn cut_value_at_candidate(data: &SubProblemData, x_cut: &Point, x_out: &Point) -> f64 {
    let mut value = data.subproblem_cost;
    for (name, &cut_value) in x_cut.iter() {
        let out_value = x_out.get(name).copied().unwrap_or(cut_value);
        let coefficient = data.subgradient.get(name).copied().unwrap_or(0.);
        value += coefficient * (out_value - cut_value);
    }
    value
}

/// what one rank learned from solving a group of its subproblems
#[derive(Debug, Clone, Default)]
pub struct LocalCutBuild {
    pub data: SubProblemDataMap,
    /// summed `(cost - alpha_i)` of the solved subproblems
    pub gap_contribution: f64,
    /// true while no solved subproblem contradicted its under-approximation at the
    /// candidate point; a violated cut flips this to false, which ends the separation loop
    /// so the master can absorb the new cuts
    pub no_violated_cut: bool,
    /// summed wall time of the local solves
    pub cpu_time: f64,
}

/// solve the given workers at the current cut point and build their cut records; `scope`
/// restricts the sweep to the named subproblems (one batch), `None` sweeps everything.
/// Any collaborator failure is returned so the caller can fold it into its success flag.
pub fn build_local_cuts(
    workers: &mut [SubproblemWorker],
    scope: Option<&[String]>,
    trial: &TrialPoints,
    alpha: &[f64],
) -> Result<LocalCutBuild, SolveError> {
    let mut build = LocalCutBuild {
        no_violated_cut: true,
        ..LocalCutBuild::default()
    };
    for worker in workers.iter_mut() {
        if let Some(names) = scope {
            if !names.contains(&worker.name) {
                continue;
            }
        }
        let data = worker.solve_at(&trial.x_cut)?;
        let under_approximation = alpha[worker.subproblem_id];
        build.gap_contribution += data.subproblem_cost - under_approximation;
        let cut_value = cut_value_at_candidate(&data, &trial.x_cut, &trial.x_out);
        if under_approximation < cut_value {
            build.no_violated_cut = false;
        }
        build.cpu_time += data.subproblem_timer;
        build.data.insert(worker.name.clone(), data);
    }
    Ok(build)
}

/// rank-0 side of the aggregation: accumulate the total subproblem cost of the gathered
/// collection, then add every cut to the master
pub fn apply_gathered_cuts(
    master: &mut dyn MasterProblem,
    gathered: &[SubProblemDataMap],
    subproblem_id_of: &BTreeMap<String, usize>,
    x_cut: &Point,
) -> f64 {
    let mut total_cost = 0.;
    for data_map in gathered.iter() {
        for data in data_map.values() {
            total_cost += data.subproblem_cost;
        }
    }
    for data_map in gathered.iter() {
        for (name, data) in data_map.iter() {
            let subproblem_id = *subproblem_id_of
                .get(name)
                .expect("gathered cuts refer to known subproblems");
            master.add_cut(subproblem_id, data.subproblem_cost, &data.subgradient, x_cut);
        }
    }
    total_cost
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::subproblem::tests::AffineSubproblem;
    use crate::util::{point_of, SolveStatus};

    fn affine_worker(name: &str, id: usize, base_cost: f64, slope: f64) -> SubproblemWorker {
        SubproblemWorker::new(
            name.to_string(),
            id,
            Box::new(AffineSubproblem::new(name, base_cost, point_of(&[("x", slope)]))),
        )
    }

    fn trial_at(x_cut: f64, x_out: f64) -> TrialPoints {
        TrialPoints {
            x_in: point_of(&[("x", x_cut)]),
            x_out: point_of(&[("x", x_out)]),
            x_cut: point_of(&[("x", x_cut)]),
        }
    }

    #[test]
    fn cuts_value_at_candidate_extrapolates_along_subgradient() {
        // cargo test cuts_value_at_candidate_extrapolates_along_subgradient -- --nocapture
        let data = SubProblemData {
            subproblem_cost: 30.,
            subgradient: point_of(&[("x", -10.)]),
            status: SolveStatus::Optimal,
            simplex_iterations: 0,
            subproblem_timer: 0.,
        };
        let value = cut_value_at_candidate(&data, &point_of(&[("x", 2.)]), &point_of(&[("x", 5.)]));
        assert_eq!(value, 0.);
        let value = cut_value_at_candidate(&data, &point_of(&[("x", 2.)]), &point_of(&[("x", 2.)]));
        assert_eq!(value, 30.);
    }

    #[test]
    fn cuts_misprice_false_only_when_no_cut_exceeds_alpha() {
        // cost at x_cut = 3 is 20 - 2 * 3 = 14; at x_out = 3 the cut value equals the cost
        let mut workers = vec![affine_worker("sub_a", 0, 20., -2.)];
        let trial = trial_at(3., 3.);
        // alpha at exactly the cut value: not violated
        let build = build_local_cuts(&mut workers, None, &trial, &[14.]).unwrap();
        assert!(build.no_violated_cut);
        assert_eq!(build.gap_contribution, 0.);
        // alpha below the cut value: violated
        let build = build_local_cuts(&mut workers, None, &trial, &[10.]).unwrap();
        assert!(!build.no_violated_cut);
        assert_eq!(build.gap_contribution, 4.);
        // alpha above the cut value: still not violated
        let build = build_local_cuts(&mut workers, None, &trial, &[20.]).unwrap();
        assert!(build.no_violated_cut);
    }

    #[test]
    fn cuts_misprice_spots_a_single_offender() {
        let mut workers = vec![
            affine_worker("sub_a", 0, 10., -1.),
            affine_worker("sub_b", 1, 10., -1.),
            affine_worker("sub_c", 2, 10., -1.),
        ];
        let trial = trial_at(2., 2.);
        // every cost is 8; only sub_b's alpha underestimates
        let build = build_local_cuts(&mut workers, None, &trial, &[8., 7.5, 8.]).unwrap();
        assert!(!build.no_violated_cut);
    }

    #[test]
    fn cuts_gap_contribution_independent_of_grouping() {
        let alphas = [1., 2., 3., 4.];
        let trial = trial_at(1., 1.);
        let mut make_workers = || {
            vec![
                affine_worker("sub_0", 0, 10., -1.),
                affine_worker("sub_1", 1, 11., -2.),
                affine_worker("sub_2", 2, 12., -3.),
                affine_worker("sub_3", 3, 13., -4.),
            ]
        };
        let full = build_local_cuts(&mut make_workers(), None, &trial, &alphas).unwrap();
        // the same sweep split into two batches contributes the same total
        let first_batch = ["sub_0".to_string(), "sub_2".to_string()];
        let second_batch = ["sub_1".to_string(), "sub_3".to_string()];
        let part_1 = build_local_cuts(&mut make_workers(), Some(&first_batch), &trial, &alphas).unwrap();
        let part_2 = build_local_cuts(&mut make_workers(), Some(&second_batch), &trial, &alphas).unwrap();
        assert_eq!(part_1.data.len(), 2);
        assert_eq!(part_2.data.len(), 2);
        assert!((part_1.gap_contribution + part_2.gap_contribution - full.gap_contribution).abs() < 1e-12);
    }

    #[test]
    fn cuts_apply_gathered_accumulates_and_feeds_master() {
        use crate::master::{Candidate, LpMaster, MasterProblem};
        let mut master = LpMaster::new(
            vec![Candidate {
                name: "x".to_string(),
                unit_cost: 1.,
                max_value: 10.,
                integer: false,
            }],
            2,
            0.,
        );
        let mut subproblem_id_of = BTreeMap::new();
        subproblem_id_of.insert("sub_a".to_string(), 0);
        subproblem_id_of.insert("sub_b".to_string(), 1);
        let mut rank_0 = SubProblemDataMap::new();
        rank_0.insert(
            "sub_a".to_string(),
            SubProblemData {
                subproblem_cost: 30.,
                subgradient: point_of(&[("x", -10.)]),
                status: SolveStatus::Optimal,
                simplex_iterations: 3,
                subproblem_timer: 0.,
            },
        );
        let mut rank_1 = SubProblemDataMap::new();
        rank_1.insert(
            "sub_b".to_string(),
            SubProblemData {
                subproblem_cost: 12.,
                subgradient: point_of(&[("x", -4.)]),
                status: SolveStatus::Optimal,
                simplex_iterations: 2,
                subproblem_timer: 0.,
            },
        );
        let total = apply_gathered_cuts(
            &mut master,
            &[rank_0, rank_1],
            &subproblem_id_of,
            &point_of(&[("x", 0.)]),
        );
        assert_eq!(total, 42.);
        assert_eq!(master.cut_count(), 2);
        // the new cuts push the master off the origin
        let solution = master.solve().unwrap();
        assert!(solution.objective > 0.);
    }
}
