//! Distributed Iteration Engine
//!
//! The top-level control loop of the decomposition. Rank 0 exclusively owns and solves the
//! master problem and the global convergence state; every rank owns a disjoint set of
//! subproblems; each iteration exchanges only small messages over the collective channel.
//!
//! Two separation schemes share the engine's step methods: [`FullSweep`] solves every
//! subproblem once per outer iteration, [`BatchSweep`] consumes randomly permuted batches
//! and leaves a sweep early once the observed cut contributions cover the remaining gap.
//!
//! Every rank must walk through the identical sequence of collective calls; conditions
//! that guard collectives are therefore always derived from all-reduced verdicts or from
//! broadcast values, never from rank-local data.
//!

use crate::batch::{owning_rank, BatchCollection, BatchShuffler};
use crate::collective::{CollectiveChannel, LocalCollective, SoloChannel, ROOT_RANK};
use crate::convergence::ConvergenceTracker;
use crate::cuts::{apply_gathered_cuts, build_local_cuts, LocalCutBuild};
use crate::derivative::Derivative;
use crate::error::{ConfigError, EngineError};
use crate::master::MasterProblem;
use crate::subproblem::{ProblemProvider, SubproblemWorker};
use crate::trace::{IterationRecord, TraceWriter};
use crate::util::{BendersOptions, IterationState, Point, StoppingCriterion, TrialPoints};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// what a finished run reports; fully meaningful on the coordinator rank
#[derive(Debug, Clone, Serialize)]
pub struct BendersSummary {
    pub lb: f64,
    pub best_ub: f64,
    pub best_it: usize,
    pub iterations: usize,
    pub stopping_criterion: StoppingCriterion,
    pub best_point: Point,
    pub elapsed_time: f64,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct BendersEngine {
    #[derivative(Debug = "ignore")]
    channel: Arc<dyn CollectiveChannel>,
    options: BendersOptions,
    /// the master problem, owned by the coordinator rank only
    #[derivative(Debug = "ignore")]
    master: Option<Box<dyn MasterProblem>>,
    /// the subproblems this rank owns
    #[derivative(Debug = "ignore")]
    workers: Vec<SubproblemWorker>,
    /// every subproblem name in global index order, identical on all ranks
    subproblem_names: Vec<String>,
    subproblem_id_of: BTreeMap<String, usize>,
    batches: BatchCollection,
    tracker: ConvergenceTracker,
    trial: TrialPoints,
    /// the master's latest candidate point, staged for broadcast
    x_out: Point,
    /// per-subproblem under-approximation, broadcast from the coordinator
    alpha: Vec<f64>,
    best_point: Point,
    exception_raised: bool,
    #[derivative(Debug = "ignore")]
    trace: TraceWriter,
    run_start: Instant,
    elapsed_offset: f64,
}

impl BendersEngine {
    /// build a rank's engine; performs no collective call so that setup failures abort the
    /// process before the group starts synchronizing
    pub fn new(
        channel: Arc<dyn CollectiveChannel>,
        provider: &dyn ProblemProvider,
        options: BendersOptions,
        trace: TraceWriter,
    ) -> Result<Self, ConfigError> {
        options.sanity_check();
        let subproblem_names = provider.subproblem_names();
        let world_size = channel.world_size();
        if world_size > subproblem_names.len() + 1 {
            return Err(ConfigError::WorldTooLarge {
                world_size,
                subproblem_count: subproblem_names.len(),
            });
        }
        let batches = BatchCollection::build(&subproblem_names, options.batch_size);
        let rank = channel.rank();
        let mut subproblem_id_of = BTreeMap::new();
        let mut workers = vec![];
        for (subproblem_id, name) in subproblem_names.iter().enumerate() {
            subproblem_id_of.insert(name.clone(), subproblem_id);
            if owning_rank(subproblem_id, world_size) == rank {
                workers.push(SubproblemWorker::new(
                    name.clone(),
                    subproblem_id,
                    provider.build_subproblem(name)?,
                ));
            }
        }
        let master = if rank == ROOT_RANK {
            Some(provider.build_master()?)
        } else {
            None
        };
        let tracker = ConvergenceTracker::new(&options);
        let elapsed_offset = tracker.state.elapsed_time;
        let alpha = vec![0.; subproblem_names.len()];
        Ok(Self {
            channel,
            options,
            master,
            workers,
            subproblem_names,
            subproblem_id_of,
            batches,
            tracker,
            trial: TrialPoints::default(),
            x_out: Point::new(),
            alpha,
            best_point: Point::new(),
            exception_raised: false,
            trace,
            run_start: Instant::now(),
            elapsed_offset,
        })
    }

    pub fn state(&self) -> &IterationState {
        &self.tracker.state
    }

    pub fn number_of_batches(&self) -> usize {
        self.batches.number_of_batches()
    }

    pub fn local_worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn summary(&self) -> BendersSummary {
        BendersSummary {
            lb: self.tracker.state.lb,
            best_ub: self.tracker.state.best_ub,
            best_it: self.tracker.state.best_it,
            iterations: self.tracker.total_iterations(),
            stopping_criterion: self.tracker.state.stopping_criterion,
            best_point: self.best_point.clone(),
            elapsed_time: self.tracker.state.elapsed_time,
        }
    }

    fn is_coordinator(&self) -> bool {
        self.channel.rank() == ROOT_RANK
    }

    fn elapsed(&self) -> f64 {
        self.elapsed_offset + self.run_start.elapsed().as_secs_f64()
    }

    fn master_mut(&mut self) -> &mut dyn MasterProblem {
        self.master
            .as_mut()
            .expect("only the coordinator touches the master")
            .as_mut()
    }

    /// everything that happens before the first iteration
    fn pre_run(&mut self) {
        self.run_start = Instant::now();
        // the collection was built from identical inputs everywhere; the broadcast turns
        // that assumption into a guarantee
        let mut batches = self.batches.clone();
        self.channel.broadcast_batches(&mut batches, ROOT_RANK);
        self.batches = batches;
        if self.is_coordinator() && self.options.initial_relaxation {
            info!("starting with a relaxed master");
            self.master_mut().deactivate_integrality();
            self.tracker.set_data_pre_relaxation();
        }
        self.channel.barrier();
    }

    /// fold a local success flag into the group verdict
    fn check_group_failure(&mut self, local_success: bool) {
        let group_success = self.channel.all_reduce_and(local_success);
        if !group_success {
            self.exception_raised = true;
        }
    }

    /// coordinator: handle the integer switch, then solve the master inside the error
    /// boundary; stages the candidate point and the under-approximations
    fn solve_master_step(&mut self) -> bool {
        if !self.is_coordinator() {
            return true;
        }
        if self.tracker.should_switch_to_integer() {
            info!(
                "relaxed gap closed at iteration {}, activating integrality",
                self.tracker.total_iterations()
            );
            self.master_mut().activate_integrality();
            self.tracker.reset_data_post_relaxation();
        }
        debug!("solving master at iteration {}", self.tracker.total_iterations());
        let timer = Instant::now();
        match self.master_mut().solve() {
            Ok(solution) => {
                self.tracker.state.master_time = timer.elapsed().as_secs_f64();
                self.tracker.state.lb = solution.objective;
                self.x_out = solution.trial_point;
                self.alpha = solution.epigraph_values;
                true
            }
            Err(error) => {
                warn!("exception raised: {error}");
                false
            }
        }
    }

    /// broadcast the candidate point and the relaxation flag
    fn broadcast_candidate(&mut self) {
        self.channel.broadcast_point(&mut self.x_out, ROOT_RANK);
        let mut relaxed = self.tracker.state.is_in_initial_relaxation;
        self.channel.broadcast_flag(&mut relaxed, ROOT_RANK);
        self.tracker.state.is_in_initial_relaxation = relaxed;
    }

    fn broadcast_alpha(&mut self) {
        self.channel.broadcast_values(&mut self.alpha, ROOT_RANK);
    }

    /// compute the stabilized cut point; the result is identical on every rank, the
    /// broadcast enforces it
    fn advance_trial_and_broadcast_cut(&mut self) {
        let x_out = self.x_out.clone();
        if self.tracker.state.it <= 1 {
            self.trial.reset_to(x_out);
        } else {
            self.trial.advance(x_out, self.options.separation_param);
        }
        self.channel.broadcast_point(&mut self.trial.x_cut, ROOT_RANK);
    }

    /// solve the owned subproblems (restricted to `scope` when separating one batch)
    /// inside the error boundary
    fn sweep_local_cuts(&mut self, scope: Option<&[String]>) -> (LocalCutBuild, bool) {
        match build_local_cuts(&mut self.workers, scope, &self.trial, &self.alpha) {
            Ok(build) => (build, true),
            Err(error) => {
                warn!("exception raised: {error}");
                (LocalCutBuild::default(), false)
            }
        }
    }

    /// full-sweep exchange: gather every cut to the coordinator, feed the master and
    /// refresh the per-iteration cost bookkeeping
    fn exchange_and_apply_full(&mut self, build: LocalCutBuild, sweep_timer: Instant) {
        let cpu_time = build.cpu_time;
        let gathered = self.channel.gather_cut_maps(build.data, ROOT_RANK);
        let cumulative_cpu = self.channel.reduce_sum(cpu_time, ROOT_RANK);
        if self.is_coordinator() {
            let x_cut = self.trial.x_cut.clone();
            let master = self
                .master
                .as_mut()
                .expect("only the coordinator touches the master")
                .as_mut();
            let total_cost = apply_gathered_cuts(master, &gathered, &self.subproblem_id_of, &x_cut);
            self.tracker.state.subproblem_cost = total_cost;
            self.tracker.state.subproblems_cumulative_cpu_time = cumulative_cpu;
            self.tracker.state.subproblems_walltime = sweep_timer.elapsed().as_secs_f64();
            self.tracker.state.cumulative_subproblems_solved += self.subproblem_names.len();
        }
    }

    /// coordinator: close the iteration's bounds and evaluate the stopping criterion
    fn update_best_solution_and_stop(&mut self) {
        if !self.is_coordinator() {
            return;
        }
        self.update_best_solution();
        self.tracker.state.elapsed_time = self.elapsed();
        let criterion = self.tracker.should_stop(self.tracker.state.elapsed_time);
        if criterion != StoppingCriterion::Empty {
            info!("stopping: {criterion:?}");
            self.tracker.stop_with(criterion);
        }
    }

    /// coordinator: upper bound of the current iteration from the cut point
    fn update_best_solution(&mut self) {
        let invest_cost = {
            let x_cut = &self.trial.x_cut;
            self.master
                .as_ref()
                .expect("only the coordinator touches the master")
                .invest_cost(x_cut)
        };
        self.tracker.state.invest_cost = invest_cost;
        self.tracker.state.ub = invest_cost + self.tracker.state.subproblem_cost;
        self.tracker.update_best_ub();
        if self.tracker.state.best_it == self.tracker.state.it {
            self.best_point = self.trial.x_cut.clone();
        }
    }

    /// every iteration ends here: fold the group failure into the stop flag and broadcast
    /// it so no rank diverges on whether to continue looping
    fn finalize_iteration_flags(&mut self) {
        if self.exception_raised {
            self.tracker.stop_with(StoppingCriterion::ExceptionRaised);
        }
        let mut stop = self.tracker.state.stop;
        self.channel.broadcast_flag(&mut stop, ROOT_RANK);
        self.tracker.state.stop = stop;
    }

    fn record_trace(&mut self) {
        if self.is_coordinator() {
            self.trace.record(IterationRecord::from_state(
                &self.tracker.state,
                self.tracker.total_iterations(),
                self.trial.x_cut.clone(),
            ));
        }
    }

    /// cooperative teardown: the trace is closed and every rank meets the final barrier
    /// before a failure is surfaced, so no partial output is left behind
    fn post_run(&mut self) -> Result<(), EngineError> {
        if self.is_coordinator() {
            let state = self.tracker.state.clone();
            self.trace.close(&state, state.stopping_criterion, &self.best_point);
        }
        self.channel.barrier();
        if self.exception_raised {
            Err(EngineError::GroupFailure)
        } else {
            Ok(())
        }
    }
}

/// how the engine visits its subproblems each outer iteration
pub trait SeparationScheme {
    fn name(&self) -> &'static str;
    fn run(&mut self, engine: &mut BendersEngine) -> Result<(), EngineError>;
}

/// plain variant: one cut round over every subproblem per outer iteration
#[derive(Debug, Default)]
pub struct FullSweep {}

impl FullSweep {
    pub fn new() -> Self {
        Self {}
    }
}

impl SeparationScheme for FullSweep {
    fn name(&self) -> &'static str {
        "full-sweep"
    }

    fn run(&mut self, engine: &mut BendersEngine) -> Result<(), EngineError> {
        engine.pre_run();
        while !engine.tracker.state.stop {
            engine.tracker.state.it += 1;
            let success = engine.solve_master_step();
            engine.check_group_failure(success);
            if !engine.exception_raised {
                engine.broadcast_candidate();
                engine.advance_trial_and_broadcast_cut();
                let sweep_timer = Instant::now();
                let (build, success) = engine.sweep_local_cuts(None);
                engine.check_group_failure(success);
                if !engine.exception_raised {
                    engine.exchange_and_apply_full(build, sweep_timer);
                    engine.update_best_solution_and_stop();
                }
            }
            engine.finalize_iteration_flags();
            engine.record_trace();
        }
        engine.post_run()
    }
}

/// batched variant: an inner separation loop consumes randomly permuted batches and stops
/// early once the observed cut contributions cover the remaining tolerance
#[derive(Debug)]
pub struct BatchSweep {
    shuffler: BatchShuffler,
    permutation: Vec<usize>,
    /// cursor into the permutation, wraps cyclically across rounds
    first_unsolved_batch: usize,
    /// start of the next iteration's permutation
    current_batch_id: usize,
    /// batches consumed by the last round without exhausting the tolerance
    batch_counter: usize,
    /// true while no solved subproblem separated a violated cut at the candidate point;
    /// the inner loop keeps pushing the cut point towards the candidate while this holds
    misprice: bool,
    remaining_epsilon: f64,
}

impl BatchSweep {
    pub fn new(number_of_batches: usize, shuffle_seed: u64) -> Self {
        Self {
            shuffler: BatchShuffler::new(number_of_batches, shuffle_seed),
            permutation: vec![],
            first_unsolved_batch: 0,
            current_batch_id: 0,
            batch_counter: 0,
            misprice: true,
            remaining_epsilon: 0.,
        }
    }

    fn update_remaining_epsilon(&mut self, engine: &mut BendersEngine) {
        if engine.is_coordinator() {
            // re-price the tolerance by the investment the cut-point displacement already
            // carries; accumulated over every candidate
            let coefficients = engine.master_mut().objective_coefficients();
            let mut epsilon = engine.options.absolute_gap;
            for (name, &cut_value) in engine.trial.x_cut.iter() {
                let out_value = engine.trial.x_out.get(name).copied().unwrap_or(cut_value);
                let coefficient = coefficients.get(name).copied().unwrap_or(0.);
                epsilon -= coefficient * (cut_value - out_value);
            }
            self.remaining_epsilon = epsilon;
        }
        engine.channel.broadcast_value(&mut self.remaining_epsilon, ROOT_RANK);
    }

    fn separation_loop(&mut self, engine: &mut BendersEngine) {
        let number_of_batches = engine.number_of_batches();
        self.misprice = true;
        self.first_unsolved_batch = 0;
        self.batch_counter = 0;
        while self.misprice
            && self.batch_counter < number_of_batches
            && !engine.exception_raised
            && !engine.tracker.max_iterations_reached()
        {
            engine.tracker.state.it += 1;
            engine.advance_trial_and_broadcast_cut();
            self.update_remaining_epsilon(engine);
            self.solve_batches(engine);
        }
    }

    fn solve_batches(&mut self, engine: &mut BendersEngine) {
        let number_of_batches = engine.number_of_batches();
        self.batch_counter = 0;
        if engine.is_coordinator() {
            engine.tracker.state.subproblem_cost = 0.;
            engine.tracker.state.subproblems_cumulative_cpu_time = 0.;
        }
        let sweep_timer = Instant::now();
        while self.batch_counter < number_of_batches {
            let batch_id = self.permutation[self.first_unsolved_batch % number_of_batches];
            self.first_unsolved_batch += 1;
            self.current_batch_id = batch_id + 1;
            let batch_names = engine.batches.batch(batch_id).subproblem_names.clone();
            let (build, success) = engine.sweep_local_cuts(Some(&batch_names));
            engine.check_group_failure(success);
            if engine.exception_raised {
                // the verdict is shared, every rank leaves the sweep here together
                break;
            }
            self.misprice = engine
                .channel
                .all_reduce_and(self.misprice && build.no_violated_cut);
            let cpu_time = build.cpu_time;
            let gap_contribution = build.gap_contribution;
            let gathered = engine.channel.gather_cut_maps(build.data, ROOT_RANK);
            let contribution = engine.channel.reduce_sum(gap_contribution, ROOT_RANK);
            let cumulative_cpu = engine.channel.reduce_sum(cpu_time, ROOT_RANK);
            if engine.is_coordinator() {
                let x_cut = engine.trial.x_cut.clone();
                let master = engine
                    .master
                    .as_mut()
                    .expect("only the coordinator touches the master")
                    .as_mut();
                let total_cost =
                    apply_gathered_cuts(master, &gathered, &engine.subproblem_id_of, &x_cut);
                engine.tracker.state.subproblem_cost += total_cost;
                engine.tracker.state.subproblems_cumulative_cpu_time += cumulative_cpu;
                engine.tracker.state.cumulative_subproblems_solved += batch_names.len();
                self.remaining_epsilon -= contribution;
            }
            engine.channel.broadcast_value(&mut self.remaining_epsilon, ROOT_RANK);
            if self.remaining_epsilon > 0. {
                self.batch_counter += 1;
            } else {
                break;
            }
        }
        if engine.is_coordinator() {
            engine.tracker.state.subproblems_walltime = sweep_timer.elapsed().as_secs_f64();
        }
    }
}

impl SeparationScheme for BatchSweep {
    fn name(&self) -> &'static str {
        "batch-sweep"
    }

    fn run(&mut self, engine: &mut BendersEngine) -> Result<(), EngineError> {
        engine.pre_run();
        let number_of_batches = engine.number_of_batches();
        self.batch_counter = 0;
        while self.batch_counter < number_of_batches && !engine.tracker.state.stop {
            let success = engine.solve_master_step();
            if engine.is_coordinator() && success {
                self.permutation = self.shuffler.cyclic_order(self.current_batch_id);
            }
            engine.check_group_failure(success);
            if !engine.exception_raised {
                engine.broadcast_candidate();
                engine.broadcast_alpha();
                engine.channel.broadcast_order(&mut self.permutation, ROOT_RANK);
                self.separation_loop(engine);
            }
            if engine.is_coordinator() {
                engine.tracker.state.elapsed_time = engine.elapsed();
                if engine.tracker.time_limit_reached(engine.tracker.state.elapsed_time) {
                    engine.tracker.stop_with(StoppingCriterion::Timelimit);
                } else if engine.tracker.max_iterations_reached() {
                    engine.tracker.stop_with(StoppingCriterion::MaxIterations);
                }
            }
            engine.finalize_iteration_flags();
            engine.channel.broadcast_count(&mut self.batch_counter, ROOT_RANK);
            if engine.is_coordinator() && self.batch_counter >= number_of_batches {
                // a full sweep stayed under the tolerance: the candidate is certified
                engine.update_best_solution();
            }
            engine.record_trace();
        }
        if engine.is_coordinator()
            && !engine.exception_raised
            && self.batch_counter >= number_of_batches
            && !engine.tracker.state.stop
        {
            engine.tracker.stop_with(StoppingCriterion::AbsoluteGap);
            engine.tracker.state.elapsed_time = engine.elapsed();
        }
        engine.post_run()
    }
}

/// build the scheme a run asked for
pub fn make_scheme(by_batch: bool, number_of_batches: usize, shuffle_seed: u64) -> Box<dyn SeparationScheme> {
    if by_batch {
        Box::new(BatchSweep::new(number_of_batches, shuffle_seed))
    } else {
        Box::new(FullSweep::new())
    }
}

/// run a prepared engine: initialization barrier, the scheme's loop, closing barrier
pub fn launch(engine: &mut BendersEngine, scheme: &mut dyn SeparationScheme) -> Result<BendersSummary, EngineError> {
    info!(
        "rank {} of {} starting the {} engine with {} local subproblems",
        engine.channel.rank(),
        engine.channel.world_size(),
        scheme.name(),
        engine.local_worker_count()
    );
    engine.channel.barrier();
    let result = scheme.run(engine);
    engine.channel.barrier();
    result.map(|_| engine.summary())
}

/// solve an instance inside this process: sequentially for `world_size <= 1`, otherwise
/// as an SPMD group of rank threads over the in-process collective channel. Every engine
/// is built before the first collective call so setup failures cannot deadlock the group.
pub fn run_local_group(
    provider: &dyn ProblemProvider,
    options: &BendersOptions,
    world_size: usize,
    by_batch: bool,
    trace_path: Option<&str>,
) -> Result<BendersSummary, EngineError> {
    if world_size <= 1 {
        let trace = TraceWriter::new(trace_path).map_err(ConfigError::Io)?;
        let mut engine = BendersEngine::new(Arc::new(SoloChannel), provider, options.clone(), trace)?;
        let mut scheme = make_scheme(by_batch, engine.number_of_batches(), options.shuffle_seed);
        return launch(&mut engine, scheme.as_mut());
    }
    let mut engines = vec![];
    for (rank, channel) in LocalCollective::new_group(world_size).into_iter().enumerate() {
        let trace = if rank == ROOT_RANK {
            TraceWriter::new(trace_path).map_err(ConfigError::Io)?
        } else {
            TraceWriter::disabled()
        };
        let channel: Arc<dyn CollectiveChannel> = channel;
        engines.push(BendersEngine::new(channel, provider, options.clone(), trace)?);
    }
    let shuffle_seed = options.shuffle_seed;
    std::thread::scope(|scope| {
        let mut handles = vec![];
        for mut engine in engines.into_iter() {
            handles.push(scope.spawn(move || {
                let mut scheme = make_scheme(by_batch, engine.number_of_batches(), shuffle_seed);
                launch(&mut engine, scheme.as_mut())
            }));
        }
        let mut results = vec![];
        for handle in handles {
            results.push(handle.join().expect("a rank thread panicked"));
        }
        // the coordinator's verdict carries the summary; any rank's failure fails the run
        let mut iterator = results.into_iter();
        let coordinator_result = iterator.next().expect("the group has a coordinator");
        for result in iterator {
            result?;
        }
        coordinator_result
    })
}
