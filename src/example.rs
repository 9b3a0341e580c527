//! Example Instances
//!
//! Synthetic capacity-expansion instances for demos, benchmarks and tests. Candidates are
//! capacity investments; each subproblem is one operating scenario whose recourse cost is
//! the unserved demand priced at a penalty. The scenario cost is piecewise linear and
//! convex in the investments, so the subproblem solves analytically with an exact
//! subgradient and no external solver is needed.
//!

use crate::error::{ConfigError, SolveError};
use crate::master::{Candidate, LpMaster, MasterProblem};
use crate::subproblem::{ProblemProvider, SubproblemSolver};
use crate::util::{Point, SolveStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// one operating scenario: a demand profile against the existing supply, plus the fraction
/// of each candidate's invested capacity that is usable in this scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub demand: Vec<f64>,
    pub base_supply: Vec<f64>,
    pub candidate_availability: BTreeMap<String, f64>,
}

/// a full instance: investment candidates plus the scenarios coupling to them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionInstance {
    pub candidates: Vec<Candidate>,
    pub scenarios: Vec<Scenario>,
    /// penalty per unit of unserved demand
    #[serde(default = "default_unserved_energy_cost")]
    pub unserved_energy_cost: f64,
    /// initial lower bound of every scenario's epigraph variable
    #[serde(default)]
    pub epigraph_floor: f64,
}

pub fn default_unserved_energy_cost() -> f64 {
    1000.
}

impl ExpansionInstance {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let instance: Self = serde_json::from_str(content)?;
        instance.sanity_check();
        Ok(instance)
    }

    pub fn sanity_check(&self) {
        assert!(!self.scenarios.is_empty(), "at least one scenario required");
        for scenario in self.scenarios.iter() {
            assert_eq!(
                scenario.demand.len(),
                scenario.base_supply.len(),
                "scenario `{}` must pair every demand step with a supply step",
                scenario.name
            );
        }
        assert!(self.unserved_energy_cost > 0., "the unserved energy penalty must be positive");
    }
}

/// analytic scenario subproblem: cost(x) = penalty * sum_t max(0, demand_t - supply_t - sum_k avail_k x_k)
pub struct ScenarioSubproblem {
    scenario: Scenario,
    unserved_energy_cost: f64,
    fixed: Option<Point>,
    /// per-step shortfall of the last solve
    shortfalls: Vec<f64>,
}

impl ScenarioSubproblem {
    pub fn new(scenario: Scenario, unserved_energy_cost: f64) -> Self {
        Self {
            scenario,
            unserved_energy_cost,
            fixed: None,
            shortfalls: vec![],
        }
    }

    fn invested_supply(&self, point: &Point) -> f64 {
        self.scenario
            .candidate_availability
            .iter()
            .map(|(name, availability)| availability * point.get(name).copied().unwrap_or(0.))
            .sum()
    }
}

impl SubproblemSolver for ScenarioSubproblem {
    fn fix_to(&mut self, point: &Point) -> Result<(), SolveError> {
        // a negative invested capacity makes the dispatch infeasible
        for (name, &value) in point.iter() {
            if value < 0. {
                debug!("scenario `{}`: candidate `{name}` fixed at {value}", self.scenario.name);
                return Err(SolveError::InfeasibleFixation {
                    name: self.scenario.name.clone(),
                });
            }
        }
        self.fixed = Some(point.clone());
        Ok(())
    }

    fn solve(&mut self) -> Result<SolveStatus, SolveError> {
        let point = self.fixed.as_ref().ok_or_else(|| SolveError::Numerical {
            name: self.scenario.name.clone(),
            message: "solve called before fix_to".to_string(),
        })?;
        let invested = self.invested_supply(point);
        self.shortfalls = self
            .scenario
            .demand
            .iter()
            .zip(self.scenario.base_supply.iter())
            .map(|(demand, supply)| (demand - supply - invested).max(0.))
            .collect();
        Ok(SolveStatus::Optimal)
    }

    fn value(&self) -> f64 {
        self.unserved_energy_cost * self.shortfalls.iter().sum::<f64>()
    }

    fn subgradient(&self) -> Point {
        // every step still short contributes -penalty * availability to the subgradient
        let binding_steps = self.shortfalls.iter().filter(|&&shortfall| shortfall > 0.).count() as f64;
        self.scenario
            .candidate_availability
            .iter()
            .map(|(name, availability)| {
                (name.clone(), -self.unserved_energy_cost * availability * binding_steps)
            })
            .collect()
    }

    fn simplex_iterations(&self) -> usize {
        self.shortfalls.len()
    }
}

impl ProblemProvider for ExpansionInstance {
    fn subproblem_names(&self) -> Vec<String> {
        self.scenarios.iter().map(|scenario| scenario.name.clone()).collect()
    }

    fn build_master(&self) -> Result<Box<dyn MasterProblem>, ConfigError> {
        Ok(Box::new(LpMaster::new(
            self.candidates.clone(),
            self.scenarios.len(),
            self.epigraph_floor,
        )))
    }

    fn build_subproblem(&self, name: &str) -> Result<Box<dyn SubproblemSolver>, ConfigError> {
        let scenario = self
            .scenarios
            .iter()
            .find(|scenario| scenario.name == name)
            .ok_or_else(|| ConfigError::UnknownSubproblem {
                name: name.to_string(),
            })?;
        Ok(Box::new(ScenarioSubproblem::new(
            scenario.clone(),
            self.unserved_energy_cost,
        )))
    }
}

/// the smallest interesting instance: one candidate, two scenarios, optimum at x = 5 with
/// total cost 5 (the tight scenario pins the investment, the mild one is already served)
pub fn two_scenario_example() -> ExpansionInstance {
    let candidate = Candidate {
        name: "line_upgrade".to_string(),
        unit_cost: 1.,
        max_value: 10.,
        integer: false,
    };
    let availability: BTreeMap<String, f64> =
        [("line_upgrade".to_string(), 1.)].into_iter().collect();
    ExpansionInstance {
        candidates: vec![candidate],
        scenarios: vec![
            Scenario {
                name: "peak_winter".to_string(),
                demand: vec![15.],
                base_supply: vec![10.],
                candidate_availability: availability.clone(),
            },
            Scenario {
                name: "mild_autumn".to_string(),
                demand: vec![12.],
                base_supply: vec![10.],
                candidate_availability: availability,
            },
        ],
        unserved_energy_cost: 10.,
        epigraph_floor: 0.,
    }
}

/// a reproducible random instance for benchmarks
pub fn random_instance(seed: u64, candidate_count: usize, scenario_count: usize, step_count: usize) -> ExpansionInstance {
    let mut rng = StdRng::seed_from_u64(seed);
    let candidates: Vec<Candidate> = (0..candidate_count)
        .map(|index| Candidate {
            name: format!("candidate_{index:02}"),
            unit_cost: rng.gen_range(1.0..5.0),
            max_value: rng.gen_range(5.0..20.0),
            integer: false,
        })
        .collect();
    let scenarios: Vec<Scenario> = (0..scenario_count)
        .map(|index| {
            let candidate_availability: BTreeMap<String, f64> = candidates
                .iter()
                .map(|candidate| (candidate.name.clone(), rng.gen_range(0.2..1.0)))
                .collect();
            let demand: Vec<f64> = (0..step_count).map(|_| rng.gen_range(50.0..100.0)).collect();
            let base_supply: Vec<f64> = demand.iter().map(|d| d - rng.gen_range(0.0..20.0)).collect();
            Scenario {
                name: format!("scenario_{index:03}"),
                demand,
                base_supply,
                candidate_availability,
            }
        })
        .collect();
    ExpansionInstance {
        candidates,
        scenarios,
        unserved_energy_cost: 100.,
        epigraph_floor: 0.,
    }
}
