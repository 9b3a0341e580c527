//! Iteration Trace
//!
//! Rank 0 hands the trace one snapshot record per outer iteration and a closing summary;
//! the trace never influences control flow. Records go to an optional JSON-lines file and
//! stay available in memory for callers that want to inspect a finished run.
//!

use crate::chrono::Local;
use crate::util::{IterationState, Point, StoppingCriterion};
use serde::Serialize;
use std::fs::File;
use std::io::Write;

/// snapshot of one outer iteration
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub it: usize,
    /// iteration count including a resumed run's offset
    pub total_it: usize,
    pub lb: f64,
    pub ub: f64,
    pub best_ub: f64,
    pub absolute_gap: f64,
    pub relative_gap: f64,
    pub elapsed_time: f64,
    pub master_time: f64,
    pub subproblems_walltime: f64,
    pub subproblems_cumulative_cpu_time: f64,
    pub cumulative_subproblems_solved: usize,
    pub is_in_initial_relaxation: bool,
    /// candidate values at the stabilized point of this iteration
    pub candidates: Point,
    pub timestamp: String,
}

impl IterationRecord {
    pub fn from_state(state: &IterationState, total_it: usize, candidates: Point) -> Self {
        Self {
            it: state.it,
            total_it,
            lb: state.lb,
            ub: state.ub,
            best_ub: state.best_ub,
            absolute_gap: state.best_ub - state.lb,
            relative_gap: (state.best_ub - state.lb) / state.best_ub.abs().max(f64::EPSILON),
            elapsed_time: state.elapsed_time,
            master_time: state.master_time,
            subproblems_walltime: state.subproblems_walltime,
            subproblems_cumulative_cpu_time: state.subproblems_cumulative_cpu_time,
            cumulative_subproblems_solved: state.cumulative_subproblems_solved,
            is_in_initial_relaxation: state.is_in_initial_relaxation,
            candidates,
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

#[derive(Debug)]
pub struct TraceWriter {
    /// save to file if applicable
    file: Option<File>,
    /// all records of the run
    pub records: Vec<IterationRecord>,
    closed: bool,
}

impl TraceWriter {
    /// a trace that keeps records in memory only; every non-coordinator rank uses this
    pub fn disabled() -> Self {
        Self {
            file: None,
            records: vec![],
            closed: false,
        }
    }

    pub fn new(path: Option<&str>) -> std::io::Result<Self> {
        let file = match path {
            Some(path) => Some(File::create(path)?),
            None => None,
        };
        Ok(Self {
            file,
            records: vec![],
            closed: false,
        })
    }

    /// append one iteration snapshot
    pub fn record(&mut self, record: IterationRecord) {
        assert!(!self.closed, "the trace is closed");
        if let Some(file) = self.file.as_mut() {
            let line = serde_json::to_string(&record).expect("trace records are plain data");
            // a failed trace write must not stop the run
            if let Err(error) = writeln!(file, "{line}") {
                warn!("failed to write a trace record: {error}");
            }
        }
        self.records.push(record);
    }

    /// write the closing summary; the trace is unusable afterwards
    pub fn close(&mut self, state: &IterationState, criterion: StoppingCriterion, best_point: &Point) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(file) = self.file.as_mut() {
            let summary = json!({
                "finished": {
                    "it": state.it,
                    "best_it": state.best_it,
                    "lb": state.lb,
                    "best_ub": state.best_ub,
                    "stopping_criterion": criterion,
                    "elapsed_time": state.elapsed_time,
                    "best_candidates": best_point,
                    "timestamp": Local::now().to_rfc3339(),
                }
            });
            if let Err(error) = writeln!(file, "{summary}") {
                warn!("failed to write the trace summary: {error}");
            }
        }
    }
}
