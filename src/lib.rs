extern crate rand_xoshiro;
extern crate parking_lot;
extern crate serde;
#[macro_use] extern crate serde_json;
extern crate chrono;
extern crate derivative;
extern crate rand;
extern crate thiserror;
#[macro_use] extern crate log;

pub mod util;
pub mod error;
pub mod collective;
pub mod batch;
pub mod subproblem;
pub mod simplex;
pub mod master;
pub mod cuts;
pub mod convergence;
pub mod trace;
pub mod engine;
pub mod example;

use engine::{run_local_group, BendersSummary};
use error::EngineError;
use subproblem::ProblemProvider;
use util::BendersOptions;

/// solve an instance sequentially with the plain (full-sweep) engine
pub fn solve_sequential(provider: &dyn ProblemProvider, options: &BendersOptions) -> Result<BendersSummary, EngineError> {
    run_local_group(provider, options, 1, false, None)
}

/// solve an instance sequentially with the batched separation engine
pub fn solve_sequential_by_batch(provider: &dyn ProblemProvider, options: &BendersOptions) -> Result<BendersSummary, EngineError> {
    run_local_group(provider, options, 1, true, None)
}
