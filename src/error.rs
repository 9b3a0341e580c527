//! Error Taxonomy
//!
//! Solve failures are recovered at the rank boundary and surfaced through the failure-detection
//! protocol; only configuration failures abort a run before the collective loop begins.
//!

use crate::util::SolveStatus;
use thiserror::Error;

/// a local solve failure; caught by the owning rank, converted into its success flag and
/// never allowed to crash the process
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    #[error("fixing subproblem `{name}` at the trial point makes it infeasible")]
    InfeasibleFixation { name: String },
    #[error("subproblem `{name}` finished with status {status:?}")]
    SubproblemStatus { name: String, status: SolveStatus },
    #[error("master problem finished with status {status:?}")]
    MasterStatus { status: SolveStatus },
    #[error("numerical failure in `{name}`: {message}")]
    Numerical { name: String, message: String },
}

/// a setup failure, fatal before the first collective call
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown subproblem `{name}`")]
    UnknownSubproblem { name: String },
    #[error("world size {world_size} exceeds the {subproblem_count} subproblems plus the master rank")]
    WorldTooLarge { world_size: usize, subproblem_count: usize },
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed instance: {0}")]
    Instance(#[from] serde_json::Error),
}

/// what a finished run can report besides a regular stop
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a rank reported a solve failure; the run stopped at the iteration boundary")]
    GroupFailure,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// exit codes of the `cutplane` binary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// normal convergence or time-limit stop
    Success = 0,
    /// setup failure before the collective loop
    ConfigFailure = 1,
    /// at least one rank reported an unrecoverable solve failure
    GroupFailure = 2,
}

impl ExitCode {
    pub fn from_engine_error(error: &EngineError) -> Self {
        match error {
            EngineError::GroupFailure => ExitCode::GroupFailure,
            EngineError::Config(_) => ExitCode::ConfigFailure,
        }
    }
}
